//! Error type shared by the adapter layers and the run driver

/// Errors produced by lora-router
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Shape mismatch in {context}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        got: (usize, usize),
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Target modules {0} not found in the base model")]
    TargetModulesNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Routed adapters have no input-independent weight delta (mode {0})")]
    InputDependentDelta(String),

    #[error("Adapter weights not found at {0}")]
    MissingAdapterWeights(String),

    #[error("Training program failed: {0}")]
    TrainingFailed(String),

    #[error("Unknown benchmark dataset: {0}")]
    UnknownBenchmark(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid target module pattern: {0}")]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
