//! LoRA model: inject routed adapters into a named-module base model
//!
//! Provides lifecycle management over the adapted model: module replacement,
//! train/eval switching, adapter enable/disable, trainable-parameter
//! accounting, and saving/loading the adapter-only checkpoint.

use super::config::{BiasMode, LoraConfig};
use super::layer::{Linear, RoutedLinear};
use crate::error::{Error, Result};
use log::{info, warn};
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.json";

/// A frozen base model: module path -> dense layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseModel {
    modules: BTreeMap<String, Linear>,
}

impl BaseModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, module: Linear) {
        self.modules.insert(name.into(), module);
    }

    pub fn get(&self, name: &str) -> Option<&Linear> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Random decoder stack with LLaMA-style projection names
    pub fn llama_like<R: Rng>(layers: usize, hidden: usize, intermediate: usize, rng: &mut R) -> Self {
        let mut model = Self::new();
        for i in 0..layers {
            let prefix = format!("model.layers.{}", i);
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                model.insert(format!("{}.self_attn.{}", prefix, proj), Linear::random(hidden, hidden, false, rng));
            }
            for proj in ["gate_proj", "up_proj"] {
                model.insert(format!("{}.mlp.{}", prefix, proj), Linear::random(hidden, intermediate, false, rng));
            }
            model.insert(format!("{}.mlp.down_proj", prefix), Linear::random(intermediate, hidden, false, rng));
        }
        model
    }
}

/// A module of the adapted model
#[derive(Debug, Clone)]
pub enum Module {
    Plain(Linear),
    Adapted(RoutedLinear),
}

impl Module {
    fn bias_len(&self) -> usize {
        let bias = match self {
            Module::Plain(l) => &l.bias,
            Module::Adapted(l) => &l.base.bias,
        };
        bias.as_ref().map_or(0, |b| b.len())
    }
}

/// Trainable vs total parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterReport {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterReport {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

/// Serialized matrix in an adapter checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl StoredTensor {
    fn from_matrix(m: &DMatrix<f64>) -> Self {
        Self { rows: m.nrows(), cols: m.ncols(), data: m.as_slice().to_vec() }
    }

    fn into_matrix(self, key: &str, expected: (usize, usize)) -> Result<DMatrix<f64>> {
        if (self.rows, self.cols) != expected || self.data.len() != self.rows * self.cols {
            warn!("tensor '{}' is {}x{}, expected {:?}", key, self.rows, self.cols, expected);
            return Err(Error::ShapeMismatch {
                context: "adapter checkpoint tensor",
                expected,
                got: (self.rows, self.cols),
            });
        }
        Ok(DMatrix::from_vec(self.rows, self.cols, self.data))
    }
}

/// Init seed for the adapter on `module`, so same-shaped modules start apart
fn module_seed(seed: u64, module: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(module.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Base model with routed LoRA adapters on the target modules
#[derive(Debug, Clone)]
pub struct LoraModel {
    config: LoraConfig,
    modules: BTreeMap<String, Module>,
}

impl LoraModel {
    /// Replace every module matching `config.target_modules` with a [`RoutedLinear`]
    pub fn new(base: BaseModel, config: LoraConfig) -> Result<Self> {
        config.validate()?;
        let matcher = config.target_modules.matcher()?;
        let mut modules = BTreeMap::new();
        let mut adapted = 0usize;
        for (name, linear) in base.modules {
            let module = if matcher.matches(&name) {
                adapted += 1;
                let seed = module_seed(config.seed, &name);
                Module::Adapted(RoutedLinear::with_seed(linear, &config, seed)?)
            } else {
                Module::Plain(linear)
            };
            modules.insert(name, module);
        }
        if adapted == 0 {
            return Err(Error::TargetModulesNotFound(config.target_modules.to_string()));
        }
        info!(
            "Injected {} adapters (r={}, alpha={}, routing={}) into {} modules",
            adapted,
            config.r,
            config.lora_alpha,
            config.routing,
            modules.len()
        );
        Ok(Self { config, modules })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Module> {
        self.modules.get_mut(name)
    }

    /// Paths of the adapted modules, in order
    pub fn adapted_modules(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|(_, m)| matches!(m, Module::Adapted(_)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn adapted_mut(&mut self) -> impl Iterator<Item = &mut RoutedLinear> {
        self.modules.values_mut().filter_map(|m| match m {
            Module::Adapted(layer) => Some(layer),
            Module::Plain(_) => None,
        })
    }

    /// Run one module on `x` (tokens × in_features)
    pub fn forward(&mut self, name: &str, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        match self.modules.get_mut(name) {
            Some(Module::Plain(linear)) => linear.forward(x),
            Some(Module::Adapted(layer)) => layer.forward(x),
            None => Err(Error::ModuleNotFound(name.to_string())),
        }
    }

    pub fn train(&mut self) -> Result<()> {
        for layer in self.adapted_mut() {
            layer.train()?;
        }
        Ok(())
    }

    pub fn eval(&mut self) -> Result<()> {
        for layer in self.adapted_mut() {
            layer.eval()?;
        }
        Ok(())
    }

    fn set_adapter_layers(&mut self, enabled: bool) -> Result<()> {
        for layer in self.adapted_mut() {
            layer.set_disabled(!enabled)?;
        }
        Ok(())
    }

    pub fn enable_adapter_layers(&mut self) -> Result<()> {
        self.set_adapter_layers(true)
    }

    pub fn disable_adapter_layers(&mut self) -> Result<()> {
        self.set_adapter_layers(false)
    }

    /// Only adapter tensors train; biases follow [`BiasMode`]
    pub fn trainable_parameters(&self) -> ParameterReport {
        let mut trainable = 0usize;
        let mut total = 0usize;
        for module in self.modules.values() {
            let bias = module.bias_len();
            match module {
                Module::Plain(linear) => {
                    total += linear.num_parameters();
                    if self.config.bias == BiasMode::All {
                        trainable += bias;
                    }
                }
                Module::Adapted(layer) => {
                    let lora = layer.mixture.num_parameters();
                    total += layer.base.num_parameters() + lora;
                    trainable += lora;
                    if self.config.bias != BiasMode::None {
                        trainable += bias;
                    }
                }
            }
        }
        ParameterReport { trainable, total }
    }

    /// Config as a JSON object, optionally flagged for inference
    pub fn config_as_dict(&self, inference: bool) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(&self.config)?;
        if inference {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("inference_mode".into(), serde_json::Value::Bool(true));
            }
        }
        Ok(value)
    }

    fn adapter_state(&self) -> BTreeMap<String, StoredTensor> {
        let mut state = BTreeMap::new();
        for (name, module) in &self.modules {
            if let Module::Adapted(layer) = module {
                let m = &layer.mixture;
                state.insert(format!("{}.lora_A.weight", name), StoredTensor::from_matrix(&m.lora_a));
                state.insert(format!("{}.lora_B.weight", name), StoredTensor::from_matrix(&m.lora_b));
                if let Some(r) = &m.lora_r {
                    state.insert(format!("{}.lora_R.weight", name), StoredTensor::from_matrix(r));
                }
            }
        }
        state
    }

    /// Write `adapter_config.json` and the adapter-only weights to `dir`
    pub fn save_pretrained(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let config = serde_json::to_string_pretty(&self.config_as_dict(true)?)?;
        std::fs::write(dir.join(ADAPTER_CONFIG_FILE), config)?;
        let weights = serde_json::to_string(&self.adapter_state())?;
        std::fs::write(dir.join(ADAPTER_WEIGHTS_FILE), weights)?;
        info!("Saved {} adapters to {}", self.adapted_modules().len(), dir.display());
        Ok(())
    }

    /// Load adapter weights saved by [`save_pretrained`](Self::save_pretrained)
    pub fn load_adapter(&mut self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        let saved: LoraConfig = serde_json::from_str(&std::fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE))?)?;
        if saved.r != self.config.r || saved.routing != self.config.routing || saved.heads != self.config.heads {
            return Err(Error::InvalidConfig(format!(
                "checkpoint has r={} routing={} heads={}, model has r={} routing={} heads={}",
                saved.r, saved.routing, saved.heads, self.config.r, self.config.routing, self.config.heads
            )));
        }
        let mut state: BTreeMap<String, StoredTensor> =
            serde_json::from_str(&std::fs::read_to_string(dir.join(ADAPTER_WEIGHTS_FILE))?)?;

        let mut take = |key: String, expected: (usize, usize)| -> Result<DMatrix<f64>> {
            let tensor = state
                .remove(&key)
                .ok_or_else(|| Error::InvalidConfig(format!("missing tensor '{}'", key)))?;
            tensor.into_matrix(&key, expected)
        };
        // Resolve every tensor before touching the model
        let mut staged = Vec::new();
        for (name, module) in &self.modules {
            if let Module::Adapted(layer) = module {
                let m = &layer.mixture;
                let a = take(format!("{}.lora_A.weight", name), m.lora_a.shape())?;
                let b = take(format!("{}.lora_B.weight", name), m.lora_b.shape())?;
                let r = match m.lora_r.as_ref().map(|r| r.shape()) {
                    Some(shape) => Some(take(format!("{}.lora_R.weight", name), shape)?),
                    None => None,
                };
                staged.push((name.clone(), a, b, r));
            }
        }

        let loaded = staged.len();
        for (name, a, b, r) in staged {
            if let Some(Module::Adapted(layer)) = self.modules.get_mut(&name) {
                let was_merged = layer.is_merged();
                layer.unmerge()?;
                let m = &mut layer.mixture;
                m.lora_a = a;
                m.lora_b = b;
                m.lora_r = r;
                if was_merged {
                    layer.merge()?;
                }
            }
        }
        info!("Loaded {} adapters from {}", loaded, dir.display());
        Ok(())
    }
}
