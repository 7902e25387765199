//! LoRA Router: input-conditioned routing over low-rank adapters
//!
//! A library for routed LoRA layers (router and router-mixer gating over the
//! rank components of an adapter) and the experiment tooling around them:
//! fine-tune launch, per-benchmark evaluation sweeps and checksummed results.

pub mod error;
pub mod lora;
pub mod run;
pub mod storage;

pub use error::{Error, Result};
pub use lora::{LoraConfig, LoraModel, RoutedLinear, RoutingMode, RoutingWeights};
pub use run::{Benchmark, EvalSweep, Pipeline, PipelineConfig};
pub use storage::ResultStore;
