//! Routed LoRA: low-rank adapters whose rank directions are selected or
//! mixed per input
//!
//! A routed adapter keeps the usual frozen `W` plus low-rank `B·A` update, and
//! adds a small gate that decides, for each input, how the low-rank
//! components combine. With the router off this is plain LoRA.

mod config;
mod layer;
mod model;
pub mod router;

pub use config::{BiasMode, LoraConfig, ModuleMatcher, TargetModules};
pub use layer::{Linear, RoutedLinear};
pub use model::{BaseModel, LoraModel, Module, ParameterReport, ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE};
pub use router::{softmax, AdapterMixture, RoutingMode, RoutingWeights};
