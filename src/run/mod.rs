//! Experiment orchestration: drive the external fine-tuning and evaluation
//! programs for one routed-adapter run

pub mod command;
pub mod config;
pub mod pipeline;
pub mod runner;
pub mod sweep;

pub use command::{dreambooth_command, eval_command, finetune_command, ProgramCommand};
pub use config::{
    format_target_modules, parse_target_modules, DreamBoothArgs, EvalArgs, FinetuneArgs, Launcher,
    PipelineConfig, RunLayout,
};
pub use pipeline::{Pipeline, Stage, RUN_CONFIG_FILE};
pub use runner::{CommandRunner, DryRunRunner, ProcessRunner, RunStatus};
pub use sweep::{adapter_weights_present, Benchmark, DatasetOutcome, EvalSweep, SweepEntry, SweepReport};
