//! Run configuration: hyperparameters, program locations and derived paths
//!
//! A [`PipelineConfig`] is loaded from JSON (every field has a default, so a
//! partial file works), then overridden from the environment and finally from
//! CLI flags. [`RunLayout`] turns it into concrete output/results directories.

use super::sweep::Benchmark;
use crate::error::{Error, Result};
use crate::lora::{LoraConfig, RoutingMode, TargetModules};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Device-selection variable pinning the run to one accelerator
pub const DEVICE_ENV: &str = "CUDA_VISIBLE_DEVICES";
pub const BASE_MODEL_ENV: &str = "BASE_MODEL";
pub const MODEL_NAME_ENV: &str = "MODEL_NAME";

/// Where the external programs live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Launcher {
    /// Interpreter for the fine-tune and evaluation scripts
    pub python: String,
    /// Launcher for the diffusion trainer
    pub accelerate: String,
    pub finetune_script: PathBuf,
    pub eval_script: PathBuf,
    pub dreambooth_script: PathBuf,
    /// Working directory for every invocation
    pub working_dir: Option<PathBuf>,
}

impl Default for Launcher {
    fn default() -> Self {
        Self {
            python: "python".into(),
            accelerate: "accelerate".into(),
            finetune_script: "finetune.py".into(),
            eval_script: "commonsense_evaluate.py".into(),
            dreambooth_script: "train_dreambooth_lora_sdxl.py".into(),
            working_dir: None,
        }
    }
}

/// Flags for the PEFT fine-tuning program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneArgs {
    pub base_model: String,
    pub data_path: String,
    /// Defaults to the layout's output dir
    pub output_dir: Option<PathBuf>,
    pub batch_size: u32,
    pub micro_batch_size: u32,
    pub num_epochs: u32,
    pub learning_rate: f64,
    pub cutoff_len: u32,
    pub val_set_size: u32,
    pub eval_step: u32,
    pub save_step: u32,
    pub adapter_name: String,
    pub lora_r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f64,
    pub target_modules: Vec<String>,
    pub routing: RoutingMode,
    pub use_gradient_checkpointing: bool,
}

impl Default for FinetuneArgs {
    fn default() -> Self {
        Self {
            base_model: "yahma/llama-7b-hf".into(),
            data_path: "commonsense_170k.json".into(),
            output_dir: None,
            batch_size: 16,
            micro_batch_size: 16,
            num_epochs: 3,
            learning_rate: 2e-4,
            cutoff_len: 256,
            val_set_size: 120,
            eval_step: 80,
            save_step: 80,
            adapter_name: "lora".into(),
            lora_r: 32,
            lora_alpha: 64.0,
            lora_dropout: 0.05,
            target_modules: ["q_proj", "k_proj", "v_proj", "up_proj", "down_proj"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            routing: RoutingMode::Router,
            use_gradient_checkpointing: true,
        }
    }
}

impl FinetuneArgs {
    /// Adapter configuration these flags describe
    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            r: self.lora_r,
            lora_alpha: self.lora_alpha,
            lora_dropout: self.lora_dropout,
            target_modules: TargetModules::Names(self.target_modules.clone()),
            routing: self.routing,
            ..LoraConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.micro_batch_size == 0 || self.batch_size % self.micro_batch_size != 0 {
            return Err(Error::InvalidConfig(format!(
                "batch_size {} must be a positive multiple of micro_batch_size {}",
                self.batch_size, self.micro_batch_size
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig("learning_rate must be positive".into()));
        }
        self.lora_config().validate()
    }
}

/// Flags for the DreamBooth LoRA diffusion trainer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamBoothArgs {
    pub model_name: String,
    pub instance_data_dir: PathBuf,
    pub vae_path: String,
    pub output_dir: PathBuf,
    pub mixed_precision: String,
    pub instance_prompt: String,
    pub validation_prompt: String,
    pub resolution: u32,
    pub train_batch_size: u32,
    pub gradient_accumulation_steps: u32,
    pub learning_rate: f64,
    pub lr_scheduler: String,
    pub lr_warmup_steps: u32,
    pub max_train_steps: u32,
    pub validation_epochs: u32,
    pub seed: u64,
    pub use_lora_router: bool,
}

impl Default for DreamBoothArgs {
    fn default() -> Self {
        Self {
            model_name: "stabilityai/stable-diffusion-xl-base-1.0".into(),
            instance_data_dir: "dog".into(),
            vae_path: "madebyollin/sdxl-vae-fp16-fix".into(),
            output_dir: "lora-trained-xl".into(),
            mixed_precision: "fp16".into(),
            instance_prompt: "a photo of sks dog".into(),
            validation_prompt: "A photo of sks dog in a bucket".into(),
            resolution: 1024,
            train_batch_size: 1,
            gradient_accumulation_steps: 4,
            learning_rate: 1e-4,
            lr_scheduler: "constant".into(),
            lr_warmup_steps: 0,
            max_train_steps: 500,
            validation_epochs: 25,
            seed: 0,
            use_lora_router: false,
        }
    }
}

/// Flags shared by every evaluation invocation of a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalArgs {
    /// Model label understood by the evaluation program
    pub model: String,
    /// Adapter label understood by the evaluation program
    pub adapter: String,
    pub batch_size: u32,
    /// Defaults to the fine-tune base model
    pub base_model: Option<String>,
    /// Defaults to the fine-tune output dir
    pub lora_weights: Option<PathBuf>,
    /// Defaults to the layout's results dir
    pub save_dir: Option<PathBuf>,
    pub datasets: Vec<Benchmark>,
}

impl Default for EvalArgs {
    fn default() -> Self {
        Self {
            model: "LLaMA-7B".into(),
            adapter: "LoRA".into(),
            batch_size: 1,
            base_model: None,
            lora_weights: None,
            save_dir: None,
            datasets: Benchmark::ALL.to_vec(),
        }
    }
}

/// Everything one fine-tune + evaluation run needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Value for `CUDA_VISIBLE_DEVICES`
    pub device: Option<String>,
    pub trained_root: PathBuf,
    pub results_root: PathBuf,
    pub launcher: Launcher,
    pub finetune: FinetuneArgs,
    pub eval: EvalArgs,
    pub dreambooth: DreamBoothArgs,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device: Some("0".into()),
            trained_root: "trained_models".into(),
            results_root: "experiment".into(),
            launcher: Launcher::default(),
            finetune: FinetuneArgs::default(),
            eval: EvalArgs::default(),
            dreambooth: DreamBoothArgs::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        info!("Loaded run config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(device) = non_empty(DEVICE_ENV) {
            self.device = Some(device);
        }
        if let Some(model) = non_empty(BASE_MODEL_ENV) {
            self.finetune.base_model = model;
        }
        if let Some(model) = non_empty(MODEL_NAME_ENV) {
            self.dreambooth.model_name = model;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.finetune.validate()?;
        if self.eval.datasets.is_empty() {
            return Err(Error::InvalidConfig("eval.datasets is empty".into()));
        }
        Ok(())
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout::new(self)
    }
}

/// Concrete directories of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    /// `{model}-{adapter}-r{r}-a{alpha}[-router|-mixer]`
    pub tag: String,
    pub output_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl RunLayout {
    pub fn new(config: &PipelineConfig) -> Self {
        let ft = &config.finetune;
        let mut tag = format!(
            "{}-{}-r{}-a{}",
            config.eval.model, config.eval.adapter, ft.lora_r, ft.lora_alpha
        );
        if ft.routing != RoutingMode::Off {
            tag.push('-');
            tag.push_str(ft.routing.as_str());
        }
        let output_dir = ft.output_dir.clone().unwrap_or_else(|| config.trained_root.join(&tag));
        let results_dir = config.eval.save_dir.clone().unwrap_or_else(|| config.results_root.join(&tag));
        Self { tag, output_dir, results_dir }
    }

    /// Create both directories
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        std::fs::create_dir_all(&self.results_dir)?;
        Ok(())
    }
}

/// Render a module list the way the fine-tune script expects it
pub fn format_target_modules(modules: &[String]) -> String {
    let quoted: Vec<String> = modules.iter().map(|m| format!("\"{}\"", m)).collect();
    format!("[{}]", quoted.join(", "))
}

/// Parse a string-encoded module list: JSON, Python-quoted or comma-separated
pub fn parse_target_modules(encoded: &str) -> Result<Vec<String>> {
    let trimmed = encoded.trim();
    let modules: Vec<String> = if trimmed.starts_with('[') {
        match serde_json::from_str::<Vec<String>>(trimmed) {
            Ok(list) => list,
            Err(_) => serde_json::from_str::<Vec<String>>(&trimmed.replace('\'', "\""))
                .unwrap_or_else(|_| split_list(trimmed.trim_start_matches('[').trim_end_matches(']'))),
        }
    } else {
        split_list(trimmed)
    };
    let modules: Vec<String> = modules.into_iter().map(|m| m.trim().to_string()).filter(|m| !m.is_empty()).collect();
    if modules.is_empty() {
        return Err(Error::InvalidConfig(format!("no target modules in '{}'", encoded)));
    }
    Ok(modules)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|m| m.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_target_module_round_trip() {
        let modules = FinetuneArgs::default().target_modules;
        let encoded = format_target_modules(&modules);
        assert_eq!(encoded, r#"["q_proj", "k_proj", "v_proj", "up_proj", "down_proj"]"#);
        assert_eq!(parse_target_modules(&encoded).unwrap(), modules);
    }

    #[test]
    fn test_parse_target_module_forms() {
        let expected = vec!["q_proj".to_string(), "v_proj".to_string()];
        assert_eq!(parse_target_modules("['q_proj', 'v_proj']").unwrap(), expected);
        assert_eq!(parse_target_modules("q_proj, v_proj").unwrap(), expected);
        assert_eq!(parse_target_modules("[q_proj,v_proj]").unwrap(), expected);
        assert!(parse_target_modules("[]").is_err());
        assert!(parse_target_modules("  ").is_err());
    }

    #[test]
    fn test_layout_tag() {
        let mut config = PipelineConfig::default();
        let layout = config.layout();
        assert_eq!(layout.tag, "LLaMA-7B-LoRA-r32-a64-router");
        assert_eq!(layout.output_dir, PathBuf::from("trained_models/LLaMA-7B-LoRA-r32-a64-router"));
        assert_eq!(layout.results_dir, PathBuf::from("experiment/LLaMA-7B-LoRA-r32-a64-router"));

        config.finetune.routing = RoutingMode::Off;
        config.finetune.output_dir = Some("/tmp/custom".into());
        let layout = config.layout();
        assert_eq!(layout.tag, "LLaMA-7B-LoRA-r32-a64");
        assert_eq!(layout.output_dir, PathBuf::from("/tmp/custom"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            [(DEVICE_ENV, "3"), (BASE_MODEL_ENV, "huggyllama/llama-13b"), (MODEL_NAME_ENV, "  ")].into();
        let mut config = PipelineConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.device.as_deref(), Some("3"));
        assert_eq!(config.finetune.base_model, "huggyllama/llama-13b");
        assert_eq!(config.dreambooth.model_name, DreamBoothArgs::default().model_name);
    }

    #[test]
    fn test_partial_config_file() {
        let json = r#"{"finetune": {"lora_r": 16, "routing": "mixer"}, "eval": {"datasets": ["boolq", "ARC-Easy"]}}"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.finetune.lora_r, 16);
        assert_eq!(config.finetune.lora_alpha, 64.0);
        assert_eq!(config.finetune.routing, RoutingMode::Mixer);
        assert_eq!(config.eval.datasets, vec![Benchmark::BoolQ, Benchmark::ArcEasy]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("lora-router-config-{}.json", uuid::Uuid::new_v4()));
        let config = PipelineConfig::default();
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_validate_batch_sizes() {
        let mut config = PipelineConfig::default();
        config.finetune.micro_batch_size = 5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
