//! Adapter Router: input-conditioned selection and mixing of low-rank adapters
//!
//! An [`AdapterMixture`] holds N candidate adapters `(A_i, B_i)` of rank `k`,
//! stacked into one `A (N·k × d_in)` and one `B (d_out × N·k)`, plus an optional
//! gate. For an input `x` each candidate projects into its rank space,
//! `h_i = A_i · x`, the routing weights recombine those projections and the
//! result is lifted back through `B`:
//!
//! ```text
//! h'_j = Σ_i M[i, j] · h_i          M = I        (Off)
//! Δy   = scaling · Σ_j B_j · h'_j   M = diag(w)  (Router, w = softmax(G·x))
//!                                   M = reshape(softmax(G·x), N, N)  (Mixer)
//! ```

use crate::error::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the candidates of a mixture are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Plain LoRA: every candidate contributes with weight 1
    #[default]
    Off,
    /// Dense gate over candidates, applied to their outputs
    Router,
    /// N×N gate that mixes the candidates' rank-space projections
    Mixer,
}

impl RoutingMode {
    /// Build from the `--use_lora_router` / `--use_lora_router_mixer` flag pair
    pub fn from_flags(use_router: bool, use_mixer: bool) -> Result<Self> {
        match (use_router, use_mixer) {
            (false, false) => Ok(RoutingMode::Off),
            (true, false) => Ok(RoutingMode::Router),
            (true, true) => Ok(RoutingMode::Mixer),
            (false, true) => Err(Error::InvalidConfig(
                "the router mixer requires the router to be enabled".into(),
            )),
        }
    }

    pub fn use_router(&self) -> bool {
        !matches!(self, RoutingMode::Off)
    }

    pub fn use_mixer(&self) -> bool {
        matches!(self, RoutingMode::Mixer)
    }

    /// Number of gate logits needed for `experts` candidates
    pub fn gate_outputs(&self, experts: usize) -> usize {
        match self {
            RoutingMode::Off => 0,
            RoutingMode::Router => experts,
            RoutingMode::Mixer => experts * experts,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Off => "off",
            RoutingMode::Router => "router",
            RoutingMode::Mixer => "mixer",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "lora" => Ok(RoutingMode::Off),
            "router" => Ok(RoutingMode::Router),
            "mixer" | "router_mixer" | "router-mixer" => Ok(RoutingMode::Mixer),
            other => Err(Error::InvalidConfig(format!("unknown routing mode '{}'", other))),
        }
    }
}

/// Numerically stable softmax.
///
/// Logits that cannot be normalised (NaN, +inf, all -inf) fall back to the
/// uniform distribution so the result always sums to 1.
pub fn softmax(logits: &DVector<f64>) -> DVector<f64> {
    let n = logits.len();
    if n == 0 {
        return DVector::zeros(0);
    }
    let uniform = || DVector::from_element(n, 1.0 / n as f64);
    if logits.iter().any(|v| v.is_nan()) {
        return uniform();
    }
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return uniform();
    }
    let exps = logits.map(|v| (v - max).exp());
    let sum = exps.sum();
    if !(sum.is_finite() && sum > 0.0) {
        return uniform();
    }
    exps / sum
}

/// Routing weights for one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutingWeights {
    /// Identity mixing (plain LoRA)
    Uniform,
    /// One weight per candidate
    Gates(DVector<f64>),
    /// Full N×N mixing matrix, `M[i, j]` = share of candidate `i` routed to `j`
    Mixing(DMatrix<f64>),
}

impl RoutingWeights {
    /// All-zero weights of the shape `mode` produces
    pub fn zeros(mode: RoutingMode, experts: usize) -> Self {
        match mode {
            RoutingMode::Mixer => RoutingWeights::Mixing(DMatrix::zeros(experts, experts)),
            _ => RoutingWeights::Gates(DVector::zeros(experts)),
        }
    }

    /// Sum of all weights. `Uniform` counts as N ones.
    pub fn sum(&self, experts: usize) -> f64 {
        match self {
            RoutingWeights::Uniform => experts as f64,
            RoutingWeights::Gates(w) => w.sum(),
            RoutingWeights::Mixing(m) => m.sum(),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            RoutingWeights::Uniform => false,
            RoutingWeights::Gates(w) => w.iter().all(|v| *v == 0.0),
            RoutingWeights::Mixing(m) => m.iter().all(|v| *v == 0.0),
        }
    }

    /// Dense N×N form of these weights
    pub fn mixing_matrix(&self, experts: usize) -> DMatrix<f64> {
        match self {
            RoutingWeights::Uniform => DMatrix::identity(experts, experts),
            RoutingWeights::Gates(w) => DMatrix::from_diagonal(w),
            RoutingWeights::Mixing(m) => m.clone(),
        }
    }

    /// Shannon entropy (nats) of the normalised weights
    pub fn entropy(&self) -> f64 {
        let values: Vec<f64> = match self {
            RoutingWeights::Uniform => return 0.0,
            RoutingWeights::Gates(w) => w.iter().cloned().collect(),
            RoutingWeights::Mixing(m) => m.iter().cloned().collect(),
        };
        let total: f64 = values.iter().sum();
        if total <= 0.0 {
            return 0.0;
        }
        values
            .iter()
            .map(|v| v / total)
            .filter(|p| *p > 0.0)
            .map(|p| -p * p.ln())
            .sum()
    }

    fn check(&self, experts: usize) -> Result<()> {
        match self {
            RoutingWeights::Uniform => Ok(()),
            RoutingWeights::Gates(w) if w.len() == experts => Ok(()),
            RoutingWeights::Gates(w) => Err(Error::ShapeMismatch {
                context: "routing gates",
                expected: (experts, 1),
                got: (w.len(), 1),
            }),
            RoutingWeights::Mixing(m) if m.shape() == (experts, experts) => Ok(()),
            RoutingWeights::Mixing(m) => Err(Error::ShapeMismatch {
                context: "routing mixing matrix",
                expected: (experts, experts),
                got: m.shape(),
            }),
        }
    }
}

/// Kaiming-uniform init with `a = √5`, which reduces to bound `1/√fan_in`
pub(crate) fn kaiming_uniform<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> DMatrix<f64> {
    let bound = 1.0 / (cols.max(1) as f64).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    DMatrix::from_fn(rows, cols, |_, _| dist.sample(rng))
}

/// N candidate low-rank adapters plus the gate that routes between them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterMixture {
    /// Number of candidate adapters (N)
    pub experts: usize,
    /// Rank of each candidate (k)
    pub expert_rank: usize,
    pub mode: RoutingMode,
    /// alpha / r
    pub scaling: f64,
    /// Stacked down-projections, (N·k) × d_in
    pub lora_a: DMatrix<f64>,
    /// Stacked up-projections, d_out × (N·k)
    pub lora_b: DMatrix<f64>,
    /// Gate, gate_outputs × d_in (absent when routing is off)
    pub lora_r: Option<DMatrix<f64>>,
}

impl AdapterMixture {
    /// Fresh mixture: `A` and the gate Kaiming-uniform, `B` zero
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        experts: usize,
        expert_rank: usize,
        mode: RoutingMode,
        scaling: f64,
        rng: &mut R,
    ) -> Self {
        let rank = experts * expert_rank;
        let lora_a = kaiming_uniform(rank, in_features, rng);
        let lora_r = match mode.gate_outputs(experts) {
            0 => None,
            outputs => Some(kaiming_uniform(outputs, in_features, rng)),
        };
        Self {
            experts,
            expert_rank,
            mode,
            scaling,
            lora_a,
            lora_b: DMatrix::zeros(out_features, rank),
            lora_r,
        }
    }

    /// Assemble a mixture from per-candidate factor pairs
    pub fn from_factors(
        a: &[DMatrix<f64>],
        b: &[DMatrix<f64>],
        gate: Option<DMatrix<f64>>,
        mode: RoutingMode,
        scaling: f64,
    ) -> Result<Self> {
        if a.is_empty() || a.len() != b.len() {
            return Err(Error::InvalidConfig(format!(
                "need the same non-zero number of A and B factors, got {} and {}",
                a.len(),
                b.len()
            )));
        }
        let experts = a.len();
        let (k, d_in) = a[0].shape();
        let d_out = b[0].nrows();
        for (ai, bi) in a.iter().zip(b) {
            if ai.shape() != (k, d_in) {
                return Err(Error::ShapeMismatch { context: "candidate A", expected: (k, d_in), got: ai.shape() });
            }
            if bi.shape() != (d_out, k) {
                return Err(Error::ShapeMismatch { context: "candidate B", expected: (d_out, k), got: bi.shape() });
            }
        }

        let mut lora_a = DMatrix::zeros(experts * k, d_in);
        let mut lora_b = DMatrix::zeros(d_out, experts * k);
        for (i, (ai, bi)) in a.iter().zip(b).enumerate() {
            lora_a.view_mut((i * k, 0), (k, d_in)).copy_from(ai);
            lora_b.view_mut((0, i * k), (d_out, k)).copy_from(bi);
        }

        let outputs = mode.gate_outputs(experts);
        let lora_r = match (outputs, gate) {
            (0, _) => None,
            (n, Some(g)) if g.shape() == (n, d_in) => Some(g),
            (n, Some(g)) => {
                return Err(Error::ShapeMismatch { context: "router gate", expected: (n, d_in), got: g.shape() })
            }
            (_, None) => {
                return Err(Error::InvalidConfig(format!("routing mode '{}' needs a gate", mode)))
            }
        };

        Ok(Self { experts, expert_rank: k, mode, scaling, lora_a, lora_b, lora_r })
    }

    pub fn in_features(&self) -> usize {
        self.lora_a.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.lora_b.nrows()
    }

    /// Total rank N·k
    pub fn rank(&self) -> usize {
        self.experts * self.expert_rank
    }

    /// Trainable parameter count (A + B + gate)
    pub fn num_parameters(&self) -> usize {
        self.lora_a.len() + self.lora_b.len() + self.lora_r.as_ref().map_or(0, |r| r.len())
    }

    fn check_input(&self, x: &DVector<f64>) -> Result<()> {
        if x.len() != self.in_features() {
            return Err(Error::ShapeMismatch {
                context: "adapter input",
                expected: (self.in_features(), 1),
                got: (x.len(), 1),
            });
        }
        Ok(())
    }

    /// Compute the routing weights for `x`
    pub fn route(&self, x: &DVector<f64>) -> Result<RoutingWeights> {
        self.check_input(x)?;
        if self.mode == RoutingMode::Off {
            return Ok(RoutingWeights::Uniform);
        }
        let gate = self
            .lora_r
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig(format!("routing mode '{}' has no gate", self.mode)))?;
        let weights = softmax(&(gate * x));
        Ok(match self.mode {
            RoutingMode::Mixer => {
                RoutingWeights::Mixing(DMatrix::from_row_slice(self.experts, self.experts, weights.as_slice()))
            }
            _ => RoutingWeights::Gates(weights),
        })
    }

    /// Routed low-rank update for `x`
    pub fn forward(&self, x: &DVector<f64>) -> Result<DVector<f64>> {
        let weights = self.route(x)?;
        self.forward_with(x, &weights)
    }

    /// Low-rank update for `x` under explicit routing weights
    pub fn forward_with(&self, x: &DVector<f64>, weights: &RoutingWeights) -> Result<DVector<f64>> {
        self.check_input(x)?;
        weights.check(self.experts)?;

        let h = &self.lora_a * x;
        let mixed = match weights {
            RoutingWeights::Uniform => h,
            _ => {
                // Column i holds candidate i's rank-space projection
                let projections = DMatrix::from_column_slice(self.expert_rank, self.experts, h.as_slice());
                let mixed = projections * weights.mixing_matrix(self.experts);
                DVector::from_column_slice(mixed.as_slice())
            }
        };
        Ok(&self.lora_b * mixed * self.scaling)
    }

    /// Dense weight delta `scaling · B·A`; only defined without routing
    pub fn delta_weight(&self) -> Result<DMatrix<f64>> {
        if self.mode != RoutingMode::Off {
            return Err(Error::InputDependentDelta(self.mode.to_string()));
        }
        Ok(&self.lora_b * &self.lora_a * self.scaling)
    }
}
