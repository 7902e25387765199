//! LoRA configuration: rank, scaling, routing and which modules to adapt

use super::router::RoutingMode;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which base-model modules receive an adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    /// Suffix match against module paths, e.g. `["q_proj", "v_proj"]`
    Names(Vec<String>),
    /// Full-match regular expression over module paths
    Pattern(String),
}

impl Default for TargetModules {
    fn default() -> Self {
        TargetModules::Names(vec!["q_proj".into(), "v_proj".into()])
    }
}

impl fmt::Display for TargetModules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetModules::Names(names) => write!(f, "{:?}", names),
            TargetModules::Pattern(p) => write!(f, "/{}/", p),
        }
    }
}

impl TargetModules {
    pub fn matcher(&self) -> Result<ModuleMatcher> {
        Ok(match self {
            TargetModules::Names(names) => ModuleMatcher::Suffix(names.clone()),
            TargetModules::Pattern(p) => ModuleMatcher::Regex(Regex::new(&format!("^(?:{})$", p))?),
        })
    }
}

/// Compiled form of [`TargetModules`]
#[derive(Debug, Clone)]
pub enum ModuleMatcher {
    Suffix(Vec<String>),
    Regex(Regex),
}

impl ModuleMatcher {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            ModuleMatcher::Suffix(names) => names.iter().any(|n| key.ends_with(n.as_str())),
            ModuleMatcher::Regex(re) => re.is_match(key),
        }
    }
}

/// Which biases are trainable alongside the adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasMode {
    #[default]
    None,
    All,
    LoraOnly,
}

/// Configuration of a routed LoRA model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    /// Adapter rank
    pub r: usize,
    pub lora_alpha: f64,
    /// Dropout applied to the adapter input while training
    pub lora_dropout: f64,
    pub target_modules: TargetModules,
    /// Base weights are stored (fan_in, fan_out)
    pub fan_in_fan_out: bool,
    /// Fold the adapter into the base weight when switching to eval
    pub merge_weights: bool,
    pub bias: BiasMode,
    pub routing: RoutingMode,
    /// Feature chunks sharing one adapter
    pub heads: usize,
    pub inference_mode: bool,
    /// Seed for adapter initialisation and dropout masks
    pub seed: u64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            lora_alpha: 16.0,
            lora_dropout: 0.0,
            target_modules: TargetModules::default(),
            fan_in_fan_out: false,
            merge_weights: false,
            bias: BiasMode::None,
            routing: RoutingMode::Off,
            heads: 4,
            inference_mode: false,
            seed: 0,
        }
    }
}

impl LoraConfig {
    /// alpha / r
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(Error::InvalidConfig("rank r must be positive".into()));
        }
        if self.heads == 0 {
            return Err(Error::InvalidConfig("heads must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(Error::InvalidConfig(format!(
                "lora_dropout must be in [0, 1), got {}",
                self.lora_dropout
            )));
        }
        if !self.lora_alpha.is_finite() {
            return Err(Error::InvalidConfig("lora_alpha must be finite".into()));
        }
        if let TargetModules::Names(names) = &self.target_modules {
            if names.is_empty() {
                return Err(Error::InvalidConfig("target_modules is empty".into()));
            }
        }
        self.target_modules.matcher()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_matching() {
        let m = TargetModules::Names(vec!["q_proj".into(), "v_proj".into()]).matcher().unwrap();
        assert!(m.matches("model.layers.0.self_attn.q_proj"));
        assert!(!m.matches("model.layers.0.self_attn.o_proj"));
    }

    #[test]
    fn test_pattern_is_full_match() {
        let m = TargetModules::Pattern(r".*decoder.*(q|v)".into()).matcher().unwrap();
        assert!(m.matches("decoder.block.0.q"));
        assert!(!m.matches("decoder.block.0.q.extra"));
    }

    #[test]
    fn test_target_modules_json_shapes() {
        let names: TargetModules = serde_json::from_str(r#"["q_proj","k_proj"]"#).unwrap();
        assert_eq!(names, TargetModules::Names(vec!["q_proj".into(), "k_proj".into()]));
        let pattern: TargetModules = serde_json::from_str(r#"".*(q|v)_proj""#).unwrap();
        assert!(matches!(pattern, TargetModules::Pattern(_)));
    }

    #[test]
    fn test_validate() {
        assert!(LoraConfig::default().validate().is_ok());
        assert!(LoraConfig { r: 0, ..LoraConfig::default() }.validate().is_err());
        assert!(LoraConfig { lora_dropout: 1.0, ..LoraConfig::default() }.validate().is_err());
        let bad_regex = LoraConfig {
            target_modules: TargetModules::Pattern("(".into()),
            ..LoraConfig::default()
        };
        assert!(matches!(bad_regex.validate(), Err(Error::Regex(_))));
    }

    #[test]
    fn test_scaling() {
        let config = LoraConfig { r: 32, lora_alpha: 64.0, ..LoraConfig::default() };
        assert_eq!(config.scaling(), 2.0);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LoraConfig = serde_json::from_str(r#"{"r": 16, "routing": "mixer"}"#).unwrap();
        assert_eq!(config.r, 16);
        assert_eq!(config.routing, RoutingMode::Mixer);
        assert_eq!(config.heads, 4);
    }
}
