//! Evaluation sweep: one evaluation run per benchmark, in a fixed order
//!
//! Every dataset is evaluated against the same adapter weights and base model.
//! A failing dataset is logged and recorded but does not stop the sweep; a
//! missing adapter checkpoint stops it before anything runs.

use super::command::{eval_command, ProgramCommand};
use super::config::{Launcher, PipelineConfig, RunLayout};
use super::runner::CommandRunner;
use crate::error::{Error, Result};
use crate::lora::ADAPTER_WEIGHTS_FILE;
use crate::storage::ResultStore;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const SWEEP_REPORT_FILE: &str = "sweep_report.json";

/// File names an adapter checkpoint may use
pub const ADAPTER_WEIGHT_FILES: [&str; 3] = ["adapter_model.bin", "adapter_model.safetensors", ADAPTER_WEIGHTS_FILE];

/// Commonsense-reasoning benchmarks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Benchmark {
    #[serde(rename = "boolq")]
    BoolQ,
    #[serde(rename = "piqa")]
    Piqa,
    #[serde(rename = "social_i_qa")]
    SocialIqa,
    #[serde(rename = "hellaswag")]
    HellaSwag,
    #[serde(rename = "winogrande")]
    WinoGrande,
    #[serde(rename = "ARC-Challenge")]
    ArcChallenge,
    #[serde(rename = "ARC-Easy")]
    ArcEasy,
    #[serde(rename = "openbookqa")]
    OpenBookQa,
}

impl Benchmark {
    /// Sweep order
    pub const ALL: [Benchmark; 8] = [
        Benchmark::BoolQ,
        Benchmark::Piqa,
        Benchmark::SocialIqa,
        Benchmark::HellaSwag,
        Benchmark::WinoGrande,
        Benchmark::ArcChallenge,
        Benchmark::ArcEasy,
        Benchmark::OpenBookQa,
    ];

    /// Name the evaluation program expects
    pub fn as_str(&self) -> &'static str {
        match self {
            Benchmark::BoolQ => "boolq",
            Benchmark::Piqa => "piqa",
            Benchmark::SocialIqa => "social_i_qa",
            Benchmark::HellaSwag => "hellaswag",
            Benchmark::WinoGrande => "winogrande",
            Benchmark::ArcChallenge => "ARC-Challenge",
            Benchmark::ArcEasy => "ARC-Easy",
            Benchmark::OpenBookQa => "openbookqa",
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Benchmark {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Benchmark::ALL
            .iter()
            .find(|b| b.as_str() == s)
            .or_else(|| Benchmark::ALL.iter().find(|b| b.as_str().eq_ignore_ascii_case(s)))
            .copied()
            .ok_or_else(|| Error::UnknownBenchmark(s.to_string()))
    }
}

/// Whether `dir` holds an adapter checkpoint
pub fn adapter_weights_present(dir: &Path) -> bool {
    ADAPTER_WEIGHT_FILES.iter().any(|f| dir.join(f).is_file())
}

/// Result of one dataset's evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetOutcome {
    Completed { artifact: String, checksum: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepEntry {
    pub dataset: Benchmark,
    pub outcome: DatasetOutcome,
    pub duration_ms: u64,
}

/// Per-dataset outcomes of a sweep, in sweep order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub run_id: String,
    pub model: String,
    pub adapter: String,
    pub lora_weights: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    pub fn succeeded(&self) -> Vec<Benchmark> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, DatasetOutcome::Completed { .. }))
            .map(|e| e.dataset)
            .collect()
    }

    pub fn failed(&self) -> Vec<Benchmark> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, DatasetOutcome::Failed { .. }))
            .map(|e| e.dataset)
            .collect()
    }

    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(SWEEP_REPORT_FILE);
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// The evaluation sweep over one trained adapter
#[derive(Debug, Clone)]
pub struct EvalSweep {
    pub launcher: Launcher,
    pub model: String,
    pub adapter: String,
    pub batch_size: u32,
    pub base_model: String,
    pub lora_weights: PathBuf,
    pub save_dir: PathBuf,
    pub datasets: Vec<Benchmark>,
    /// Value for `CUDA_VISIBLE_DEVICES` on every invocation
    pub device: Option<String>,
}

impl EvalSweep {
    /// Resolve the eval flags against the run layout
    pub fn from_config(config: &PipelineConfig, layout: &RunLayout) -> Self {
        let eval = &config.eval;
        Self {
            launcher: config.launcher.clone(),
            model: eval.model.clone(),
            adapter: eval.adapter.clone(),
            batch_size: eval.batch_size,
            base_model: eval.base_model.clone().unwrap_or_else(|| config.finetune.base_model.clone()),
            lora_weights: eval.lora_weights.clone().unwrap_or_else(|| layout.output_dir.clone()),
            save_dir: layout.results_dir.clone(),
            datasets: eval.datasets.clone(),
            device: config.device.clone(),
        }
    }

    pub fn command(&self, dataset: Benchmark) -> ProgramCommand {
        eval_command(
            &self.launcher,
            &self.model,
            &self.adapter,
            dataset,
            self.batch_size,
            &self.base_model,
            &self.lora_weights,
            &self.save_dir,
        )
        .pin_device(self.device.as_deref())
    }

    /// All invocations, in sweep order
    pub fn commands(&self) -> Vec<ProgramCommand> {
        self.datasets.iter().map(|d| self.command(*d)).collect()
    }

    /// Where the evaluation program writes `dataset`'s results
    pub fn artifact_path(&self, dataset: Benchmark) -> PathBuf {
        self.save_dir.join(format!("{}-{}-{}.json", self.model, self.adapter, dataset))
    }

    /// Run every dataset in order, isolating per-dataset failures
    pub async fn run<R: CommandRunner>(&self, runner: &mut R) -> Result<SweepReport> {
        if !adapter_weights_present(&self.lora_weights) {
            return Err(Error::MissingAdapterWeights(self.lora_weights.display().to_string()));
        }
        std::fs::create_dir_all(&self.save_dir)?;
        let mut store = ResultStore::open(&self.save_dir);
        let started_at = Utc::now();
        let mut entries = Vec::with_capacity(self.datasets.len());

        info!(
            "Evaluating {} on {} datasets -> {}",
            self.lora_weights.display(),
            self.datasets.len(),
            self.save_dir.display()
        );

        for (i, dataset) in self.datasets.iter().copied().enumerate() {
            info!("[{}/{}] {}", i + 1, self.datasets.len(), dataset);
            let start = std::time::Instant::now();
            let outcome = match self.clear_artifact(dataset) {
                Err(e) => DatasetOutcome::Failed { reason: format!("cannot clear previous result: {}", e) },
                Ok(()) => match runner.run(&self.command(dataset)).await {
                    Ok(status) if status.success() => self.collect(&mut store, dataset),
                    Ok(status) => DatasetOutcome::Failed { reason: format!("exited with {}", status) },
                    Err(e) => DatasetOutcome::Failed { reason: e.to_string() },
                },
            };
            if let DatasetOutcome::Failed { reason } = &outcome {
                warn!("{} failed: {}; continuing", dataset, reason);
                store.remove(dataset.as_str());
            }
            entries.push(SweepEntry {
                dataset,
                outcome,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }

        store.save()?;
        let report = SweepReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            model: self.model.clone(),
            adapter: self.adapter.clone(),
            lora_weights: self.lora_weights.clone(),
            started_at,
            finished_at: Utc::now(),
            entries,
        };
        report.save(&self.save_dir)?;
        info!(
            "Sweep done: {} succeeded, {} failed",
            report.succeeded().len(),
            report.failed().len()
        );
        Ok(report)
    }

    /// Remove a result left by an earlier sweep so only this run's output counts
    fn clear_artifact(&self, dataset: Benchmark) -> std::io::Result<()> {
        match std::fs::remove_file(self.artifact_path(dataset)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn collect(&self, store: &mut ResultStore, dataset: Benchmark) -> DatasetOutcome {
        let path = self.artifact_path(dataset);
        if !path.is_file() {
            return DatasetOutcome::Failed { reason: format!("no result artifact at {}", path.display()) };
        }
        match store.record(dataset.as_str(), &path) {
            Ok(meta) => DatasetOutcome::Completed { artifact: meta.filename, checksum: meta.checksum },
            Err(e) => DatasetOutcome::Failed { reason: e.to_string() },
        }
    }
}
