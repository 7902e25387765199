//! Routed LoRA linear layer
//!
//! A frozen dense layer `y = W·x + b` with a routed low-rank branch. The input
//! features are split into `heads` equal chunks; every chunk goes through the
//! same [`AdapterMixture`] whose candidates are the `r` rank-one components of
//! the adapter, so routing re-weights (or mixes) individual rank directions.

use super::config::LoraConfig;
use super::router::{AdapterMixture, RoutingMode, RoutingWeights};
use crate::error::{Error, Result};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A plain dense layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    /// (out, in), or (in, out) when `fan_in_fan_out` is set
    pub weight: DMatrix<f64>,
    pub bias: Option<DVector<f64>>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl Linear {
    pub fn new(weight: DMatrix<f64>, bias: Option<DVector<f64>>) -> Self {
        Self { weight, bias, fan_in_fan_out: false }
    }

    /// Random layer, uniform in `±1/√in`
    pub fn random<R: Rng>(in_features: usize, out_features: usize, bias: bool, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let weight = DMatrix::from_fn(out_features, in_features, |_, _| rng.gen_range(-bound..=bound));
        let bias = bias.then(|| DVector::from_fn(out_features, |_, _| rng.gen_range(-bound..=bound)));
        Self::new(weight, bias)
    }

    pub fn in_features(&self) -> usize {
        if self.fan_in_fan_out { self.weight.nrows() } else { self.weight.ncols() }
    }

    pub fn out_features(&self) -> usize {
        if self.fan_in_fan_out { self.weight.ncols() } else { self.weight.nrows() }
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.as_ref().map_or(0, |b| b.len())
    }

    /// `X` is tokens × in_features; returns tokens × out_features
    pub fn forward(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if x.ncols() != self.in_features() {
            return Err(Error::ShapeMismatch {
                context: "linear input",
                expected: (x.nrows(), self.in_features()),
                got: x.shape(),
            });
        }
        let mut y = if self.fan_in_fan_out { x * &self.weight } else { x * self.weight.transpose() };
        if let Some(bias) = &self.bias {
            let bias = bias.transpose();
            for mut row in y.row_iter_mut() {
                row += &bias;
            }
        }
        Ok(y)
    }
}

/// Dense layer with a routed multi-head LoRA branch
#[derive(Debug, Clone)]
pub struct RoutedLinear {
    pub base: Linear,
    pub mixture: AdapterMixture,
    heads: usize,
    dropout: f64,
    merge_weights: bool,
    training: bool,
    merged: bool,
    disabled: bool,
    rng: StdRng,
}

impl RoutedLinear {
    /// Wrap `base` with a fresh adapter. `B` starts at zero, so the wrapped
    /// layer initially computes exactly what `base` does.
    pub fn new(base: Linear, config: &LoraConfig) -> Result<Self> {
        Self::with_seed(base, config, config.seed)
    }

    /// Like [`new`](Self::new) with an explicit seed for the adapter init and
    /// dropout masks
    pub fn with_seed(base: Linear, config: &LoraConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        if config.fan_in_fan_out != base.fan_in_fan_out {
            warn!(
                "fan_in_fan_out={} requested but the module stores fan_in_fan_out={}; using the module layout",
                config.fan_in_fan_out, base.fan_in_fan_out
            );
        }
        let (in_features, out_features) = (base.in_features(), base.out_features());
        let heads = config.heads;
        if in_features % heads != 0 || out_features % heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "features {}x{} are not divisible by {} heads",
                out_features, in_features, heads
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mixture = AdapterMixture::new(
            in_features / heads,
            out_features / heads,
            config.r,
            1,
            config.routing,
            config.scaling(),
            &mut rng,
        );
        Ok(Self {
            base,
            mixture,
            heads,
            dropout: config.lora_dropout,
            merge_weights: config.merge_weights || config.inference_mode,
            training: true,
            merged: false,
            disabled: false,
            rng,
        })
    }

    pub fn in_features(&self) -> usize {
        self.base.in_features()
    }

    pub fn out_features(&self) -> usize {
        self.base.out_features()
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn mode(&self) -> RoutingMode {
        self.mixture.mode
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_merged(&self) -> bool {
        self.merged
    }

    /// Disabling splits a merged adapter back out of the base weight;
    /// re-enabling in eval mode merges it again when configured
    pub fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        if disabled {
            self.unmerge()?;
        }
        self.disabled = disabled;
        if !disabled && !self.training {
            self.merge_if_configured()?;
        }
        Ok(())
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Switch to training mode; a merged adapter is split back out first
    pub fn train(&mut self) -> Result<()> {
        if self.merged {
            self.unmerge()?;
        }
        self.training = true;
        Ok(())
    }

    /// Switch to eval mode, merging when configured and possible
    pub fn eval(&mut self) -> Result<()> {
        self.training = false;
        self.merge_if_configured()
    }

    fn merge_if_configured(&mut self) -> Result<()> {
        if self.merge_weights && !self.merged && !self.disabled {
            if self.mixture.mode == RoutingMode::Off {
                self.merge()?;
            } else {
                debug!("merge_weights ignored for routed adapter ({})", self.mixture.mode);
            }
        }
        Ok(())
    }

    /// Full (out × in) delta: one copy of the head delta per diagonal block
    fn full_delta(&self) -> Result<DMatrix<f64>> {
        let head = self.mixture.delta_weight()?;
        let (ho, hi) = head.shape();
        let mut delta = DMatrix::zeros(self.out_features(), self.in_features());
        for h in 0..self.heads {
            delta.view_mut((h * ho, h * hi), (ho, hi)).copy_from(&head);
        }
        Ok(delta)
    }

    fn add_to_base(&mut self, delta: DMatrix<f64>) {
        if self.base.fan_in_fan_out {
            self.base.weight += delta.transpose();
        } else {
            self.base.weight += delta;
        }
    }

    /// Fold the adapter into the base weight (plain LoRA only)
    pub fn merge(&mut self) -> Result<()> {
        if self.merged {
            return Ok(());
        }
        if self.disabled {
            return Err(Error::InvalidConfig("cannot merge a disabled adapter".into()));
        }
        let delta = self.full_delta()?;
        self.add_to_base(delta);
        self.merged = true;
        Ok(())
    }

    /// Undo [`merge`](Self::merge)
    pub fn unmerge(&mut self) -> Result<()> {
        if !self.merged {
            return Ok(());
        }
        let delta = self.full_delta()?;
        self.add_to_base(-delta);
        self.merged = false;
        Ok(())
    }

    fn apply_dropout(&mut self, x: &DMatrix<f64>) -> DMatrix<f64> {
        if !self.training || self.dropout <= 0.0 {
            return x.clone();
        }
        let keep = 1.0 - self.dropout;
        let rng = &mut self.rng;
        x.map(|v| if rng.gen::<f64>() < keep { v / keep } else { 0.0 })
    }

    fn check_input(&self, x: &DMatrix<f64>) -> Result<()> {
        if x.ncols() != self.in_features() {
            return Err(Error::ShapeMismatch {
                context: "routed linear input",
                expected: (x.nrows(), self.in_features()),
                got: x.shape(),
            });
        }
        Ok(())
    }

    /// Per-token, per-head routing weights (token-major)
    pub fn routing_weights(&self, x: &DMatrix<f64>) -> Result<Vec<RoutingWeights>> {
        self.check_input(x)?;
        let head_in = self.in_features() / self.heads;
        let mut out = Vec::with_capacity(x.nrows() * self.heads);
        for row in x.row_iter() {
            for h in 0..self.heads {
                let chunk: DVector<f64> = row.columns(h * head_in, head_in).transpose();
                out.push(self.mixture.route(&chunk)?);
            }
        }
        Ok(out)
    }

    fn lora_branch(&self, x: &DMatrix<f64>, weights: Option<&RoutingWeights>) -> Result<DMatrix<f64>> {
        let head_in = self.in_features() / self.heads;
        let head_out = self.out_features() / self.heads;
        let mut result = DMatrix::zeros(x.nrows(), self.out_features());
        for (t, row) in x.row_iter().enumerate() {
            for h in 0..self.heads {
                let chunk: DVector<f64> = row.columns(h * head_in, head_in).transpose();
                let y = match weights {
                    Some(w) => self.mixture.forward_with(&chunk, w)?,
                    None => self.mixture.forward(&chunk)?,
                };
                result.view_mut((t, h * head_out), (1, head_out)).copy_from(&y.transpose());
            }
        }
        Ok(result)
    }

    /// `X` is tokens × in_features (batch and sequence flattened)
    pub fn forward(&mut self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        self.check_input(x)?;
        let base = self.base.forward(x)?;
        if self.disabled || self.merged {
            return Ok(base);
        }
        let dropped = self.apply_dropout(x);
        Ok(base + self.lora_branch(&dropped, None)?)
    }

    /// Forward pass with the same explicit routing weights for every token and head
    pub fn forward_with(&mut self, x: &DMatrix<f64>, weights: &RoutingWeights) -> Result<DMatrix<f64>> {
        self.check_input(x)?;
        let base = self.base.forward(x)?;
        if self.disabled || self.merged {
            return Ok(base);
        }
        let dropped = self.apply_dropout(x);
        Ok(base + self.lora_branch(&dropped, Some(weights))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::router::kaiming_uniform;

    fn config(routing: RoutingMode) -> LoraConfig {
        LoraConfig { r: 4, lora_alpha: 8.0, routing, heads: 4, seed: 42, ..LoraConfig::default() }
    }

    fn layer(routing: RoutingMode) -> RoutedLinear {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, true, &mut rng);
        let mut layer = RoutedLinear::new(base, &config(routing)).unwrap();
        layer.mixture.lora_b = kaiming_uniform(2, 4, &mut rng);
        layer
    }

    fn input(tokens: usize) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(2);
        DMatrix::from_fn(tokens, 16, |_, _| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn test_fresh_layer_equals_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, true, &mut rng);
        for routing in [RoutingMode::Off, RoutingMode::Router, RoutingMode::Mixer] {
            let mut layer = RoutedLinear::new(base.clone(), &config(routing)).unwrap();
            let x = input(5);
            let diff = layer.forward(&x).unwrap() - base.forward(&x).unwrap();
            assert!(diff.norm() < 1e-12);
        }
    }

    #[test]
    fn test_output_shape() {
        let mut layer = layer(RoutingMode::Mixer);
        let y = layer.forward(&input(6)).unwrap();
        assert_eq!(y.shape(), (6, 8));
    }

    #[test]
    fn test_zero_routing_weights_fall_back_to_base() {
        for routing in [RoutingMode::Router, RoutingMode::Mixer] {
            let mut layer = layer(routing);
            let x = input(3);
            let zeros = RoutingWeights::zeros(routing, 4);
            let y = layer.forward_with(&x, &zeros).unwrap();
            assert!((y - layer.base.forward(&x).unwrap()).norm() < 1e-12);
            // the routed path itself does change the output
            let routed = layer.forward(&x).unwrap();
            assert!((routed - layer.base.forward(&x).unwrap()).norm() > 0.0);
        }
    }

    #[test]
    fn test_routing_weights_per_token_and_head() {
        let layer = layer(RoutingMode::Router);
        let weights = layer.routing_weights(&input(3)).unwrap();
        assert_eq!(weights.len(), 12);
        for w in weights {
            assert!((w.sum(4) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_merge_matches_unmerged_forward() {
        let mut layer = layer(RoutingMode::Off);
        layer.eval().unwrap();
        let x = input(4);
        let unmerged = layer.forward(&x).unwrap();
        layer.merge().unwrap();
        assert!(layer.is_merged());
        let merged = layer.forward(&x).unwrap();
        assert!((unmerged - merged).norm() < 1e-9);

        let original = layer.base.weight.clone();
        layer.unmerge().unwrap();
        layer.merge().unwrap();
        assert!((layer.base.weight.clone() - original).norm() < 1e-9);
    }

    #[test]
    fn test_routed_layer_cannot_merge() {
        let mut layer = layer(RoutingMode::Router);
        assert!(matches!(layer.merge(), Err(Error::InputDependentDelta(_))));
        assert!(!layer.is_merged());
    }

    #[test]
    fn test_eval_merges_when_configured() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, false, &mut rng);
        let config = LoraConfig { merge_weights: true, ..config(RoutingMode::Off) };
        let mut layer = RoutedLinear::new(base, &config).unwrap();
        layer.eval().unwrap();
        assert!(layer.is_merged());
        layer.train().unwrap();
        assert!(!layer.is_merged());
    }

    #[test]
    fn test_disabled_adapter_returns_base() {
        let mut layer = layer(RoutingMode::Mixer);
        layer.set_disabled(true).unwrap();
        let x = input(2);
        assert_eq!(layer.forward(&x).unwrap(), layer.base.forward(&x).unwrap());
    }

    #[test]
    fn test_disabling_merged_adapter_restores_base() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, true, &mut rng);
        let config = LoraConfig { merge_weights: true, ..config(RoutingMode::Off) };
        let mut layer = RoutedLinear::new(base.clone(), &config).unwrap();
        layer.mixture.lora_b = kaiming_uniform(2, 4, &mut rng);
        let x = input(3);
        let adapted = layer.forward(&x).unwrap();

        layer.eval().unwrap();
        assert!(layer.is_merged());
        layer.set_disabled(true).unwrap();
        assert!(!layer.is_merged());
        assert!((layer.forward(&x).unwrap() - base.forward(&x).unwrap()).norm() < 1e-12);
        assert!(layer.merge().is_err());

        layer.set_disabled(false).unwrap();
        assert!(layer.is_merged());
        assert!((layer.forward(&x).unwrap() - adapted).norm() < 1e-9);
    }

    #[test]
    fn test_inference_mode_merges_on_eval() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, false, &mut rng);
        let config = LoraConfig { inference_mode: true, ..config(RoutingMode::Off) };
        let mut layer = RoutedLinear::new(base, &config).unwrap();
        layer.eval().unwrap();
        assert!(layer.is_merged());
    }

    #[test]
    fn test_seed_controls_init() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, false, &mut rng);
        let cfg = config(RoutingMode::Router);
        let a = RoutedLinear::with_seed(base.clone(), &cfg, 1).unwrap();
        let b = RoutedLinear::with_seed(base.clone(), &cfg, 2).unwrap();
        let c = RoutedLinear::new(base, &cfg).unwrap();
        assert_ne!(a.mixture.lora_a, b.mixture.lora_a);
        assert_ne!(a.mixture.lora_r, b.mixture.lora_r);
        assert_eq!(c.mixture.lora_a, RoutedLinear::with_seed(c.base.clone(), &cfg, cfg.seed).unwrap().mixture.lora_a);
    }

    #[test]
    fn test_dropout_only_in_training() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(16, 8, false, &mut rng);
        let config = LoraConfig { lora_dropout: 0.5, ..config(RoutingMode::Off) };
        let mut layer = RoutedLinear::new(base, &config).unwrap();
        layer.mixture.lora_b = kaiming_uniform(2, 4, &mut rng);
        let x = input(4);
        let a = layer.forward(&x).unwrap();
        let b = layer.forward(&x).unwrap();
        assert!((a - b).norm() > 0.0);

        layer.eval().unwrap();
        let c = layer.forward(&x).unwrap();
        let d = layer.forward(&x).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn test_fan_in_fan_out_layout() {
        let mut rng = StdRng::seed_from_u64(1);
        let standard = Linear::random(16, 8, true, &mut rng);
        let conv1d = Linear {
            weight: standard.weight.transpose(),
            bias: standard.bias.clone(),
            fan_in_fan_out: true,
        };
        let x = input(3);
        assert!((standard.forward(&x).unwrap() - conv1d.forward(&x).unwrap()).norm() < 1e-12);

        let mut layer = RoutedLinear::new(conv1d, &LoraConfig { fan_in_fan_out: true, ..config(RoutingMode::Off) }).unwrap();
        assert_eq!((layer.in_features(), layer.out_features()), (16, 8));
        layer.mixture.lora_b = kaiming_uniform(2, 4, &mut rng);
        let before = layer.forward(&x).unwrap();
        layer.eval().unwrap();
        layer.merge().unwrap();
        assert!((before - layer.forward(&x).unwrap()).norm() < 1e-9);
    }

    #[test]
    fn test_indivisible_heads_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Linear::random(10, 8, false, &mut rng);
        assert!(matches!(RoutedLinear::new(base, &config(RoutingMode::Off)), Err(Error::InvalidConfig(_))));
    }
}
