//! End-to-end run: fine-tune one routed adapter, then evaluate it on every
//! benchmark

use super::command::{dreambooth_command, finetune_command, ProgramCommand};
use super::config::{PipelineConfig, RunLayout};
use super::runner::CommandRunner;
use super::sweep::{EvalSweep, SweepReport};
use crate::error::{Error, Result};
use log::info;
use std::path::PathBuf;

pub const RUN_CONFIG_FILE: &str = "run_config.json";

/// Which part of a run to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Finetune,
    Evaluate,
    Full,
    DreamBooth,
}

/// A validated configuration and the directories it resolves to
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub layout: RunLayout,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        Ok(Self { config, layout })
    }

    pub fn finetune_command(&self) -> ProgramCommand {
        finetune_command(&self.config.launcher, &self.config.finetune, &self.layout.output_dir)
            .pin_device(self.config.device.as_deref())
    }

    pub fn dreambooth_command(&self) -> ProgramCommand {
        dreambooth_command(&self.config.launcher, &self.config.dreambooth).pin_device(self.config.device.as_deref())
    }

    pub fn sweep(&self) -> EvalSweep {
        EvalSweep::from_config(&self.config, &self.layout)
    }

    /// Every command a full run would execute, in order
    pub fn plan(&self) -> Vec<ProgramCommand> {
        self.commands(Stage::Full)
    }

    pub fn commands(&self, stage: Stage) -> Vec<ProgramCommand> {
        match stage {
            Stage::Finetune => vec![self.finetune_command()],
            Stage::Evaluate => self.sweep().commands(),
            Stage::Full => {
                let mut commands = vec![self.finetune_command()];
                commands.extend(self.sweep().commands());
                commands
            }
            Stage::DreamBooth => vec![self.dreambooth_command()],
        }
    }

    /// Hand a stage's commands to `runner` without creating directories or
    /// saving the config; returns how many were issued
    pub async fn dry_run<R: CommandRunner>(&self, stage: Stage, runner: &mut R) -> Result<usize> {
        let commands = self.commands(stage);
        for cmd in &commands {
            runner.run(cmd).await?;
        }
        Ok(commands.len())
    }

    /// Fine-tune; returns the adapter output dir
    pub async fn train<R: CommandRunner>(&self, runner: &mut R) -> Result<PathBuf> {
        self.layout.ensure()?;
        self.config.save(self.layout.results_dir.join(RUN_CONFIG_FILE))?;
        info!(
            "Fine-tuning {} (r={}, alpha={}, routing={}) -> {}",
            self.config.finetune.base_model,
            self.config.finetune.lora_r,
            self.config.finetune.lora_alpha,
            self.config.finetune.routing,
            self.layout.output_dir.display()
        );
        let status = runner.run(&self.finetune_command()).await?;
        if !status.success() {
            return Err(Error::TrainingFailed(format!("fine-tune {}", status)));
        }
        Ok(self.layout.output_dir.clone())
    }

    pub async fn evaluate<R: CommandRunner>(&self, runner: &mut R) -> Result<SweepReport> {
        self.sweep().run(runner).await
    }

    /// Fine-tune then sweep; a failed fine-tune stops before evaluation
    pub async fn run<R: CommandRunner>(&self, runner: &mut R) -> Result<SweepReport> {
        self.train(runner).await?;
        self.evaluate(runner).await
    }

    /// Diffusion-model DreamBooth training only
    pub async fn dreambooth<R: CommandRunner>(&self, runner: &mut R) -> Result<()> {
        let args = &self.config.dreambooth;
        std::fs::create_dir_all(&args.output_dir)?;
        info!(
            "DreamBooth {} on {} -> {}",
            args.model_name,
            args.instance_data_dir.display(),
            args.output_dir.display()
        );
        let status = runner.run(&self.dreambooth_command()).await?;
        if !status.success() {
            return Err(Error::TrainingFailed(format!("dreambooth {}", status)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::config::DEVICE_ENV;
    use crate::run::runner::{DryRunRunner, RunStatus};
    use crate::run::sweep::Benchmark;
    use std::path::Path;

    /// Succeeds at everything; the fine-tune writes adapter weights, the
    /// evaluations write their artifacts
    struct FakeHarness {
        train_code: i32,
        labels: Vec<String>,
    }

    impl CommandRunner for FakeHarness {
        async fn run(&mut self, cmd: &ProgramCommand) -> Result<RunStatus> {
            self.labels.push(cmd.label.clone());
            if cmd.label == "finetune" {
                if self.train_code == 0 {
                    let out = Path::new(cmd.option_value("output_dir").unwrap_or_default());
                    std::fs::write(out.join("adapter_model.bin"), b"weights")?;
                }
                return Ok(RunStatus { code: Some(self.train_code), duration_ms: 1 });
            }
            let save_dir = Path::new(cmd.option_value("save_dir").unwrap_or_default());
            let name = format!(
                "{}-{}-{}.json",
                cmd.option_value("model").unwrap_or_default(),
                cmd.option_value("adapter").unwrap_or_default(),
                cmd.option_value("dataset").unwrap_or_default()
            );
            std::fs::write(save_dir.join(name), "{}")?;
            Ok(RunStatus { code: Some(0), duration_ms: 1 })
        }
    }

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.trained_root = root.join("trained_models");
        config.results_root = root.join("experiment");
        config.eval.datasets = vec![Benchmark::BoolQ, Benchmark::Piqa];
        config.dreambooth.output_dir = root.join("lora-trained-xl");
        config
    }

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("lora-router-pipeline-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_plan_order() {
        let pipeline = Pipeline::new(config(Path::new("/tmp/plan"))).unwrap();
        let labels: Vec<String> = pipeline.plan().into_iter().map(|c| c.label).collect();
        assert_eq!(labels, vec!["finetune", "eval:boolq", "eval:piqa"]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config(Path::new("/tmp/invalid"));
        cfg.eval.datasets.clear();
        assert!(matches!(Pipeline::new(cfg), Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_full_run() {
        let root = temp_root();
        let pipeline = Pipeline::new(config(&root)).unwrap();
        let mut harness = FakeHarness { train_code: 0, labels: Vec::new() };
        let report = pipeline.run(&mut harness).await.unwrap();

        assert_eq!(harness.labels, vec!["finetune", "eval:boolq", "eval:piqa"]);
        assert_eq!(report.succeeded(), vec![Benchmark::BoolQ, Benchmark::Piqa]);
        let saved = PipelineConfig::load(pipeline.layout.results_dir.join(RUN_CONFIG_FILE)).unwrap();
        assert_eq!(saved, pipeline.config);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_training_failure_stops_sweep() {
        let root = temp_root();
        let pipeline = Pipeline::new(config(&root)).unwrap();
        let mut harness = FakeHarness { train_code: 2, labels: Vec::new() };
        assert!(matches!(pipeline.run(&mut harness).await, Err(Error::TrainingFailed(_))));
        assert_eq!(harness.labels, vec!["finetune"]);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_dry_run_without_weights_stops_at_sweep() {
        let root = temp_root();
        let pipeline = Pipeline::new(config(&root)).unwrap();
        let mut runner = DryRunRunner::new();
        let result = pipeline.run(&mut runner).await;
        assert!(matches!(result, Err(Error::MissingAdapterWeights(_))));
        assert_eq!(runner.commands.len(), 1);
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_dry_run_leaves_filesystem_alone() {
        let root = temp_root();
        let pipeline = Pipeline::new(config(&root)).unwrap();
        let mut runner = DryRunRunner::new();
        for (stage, issued) in [(Stage::Finetune, 1), (Stage::Evaluate, 2), (Stage::Full, 3), (Stage::DreamBooth, 1)] {
            assert_eq!(pipeline.dry_run(stage, &mut runner).await.unwrap(), issued);
        }
        assert_eq!(runner.commands.len(), 7);
        assert!(!root.exists());
    }

    #[test]
    fn test_commands_pin_device() {
        let mut cfg = config(Path::new("/tmp/device"));
        cfg.device = Some("3".into());
        let pipeline = Pipeline::new(cfg).unwrap();
        for cmd in pipeline.commands(Stage::Full).iter().chain(&pipeline.commands(Stage::DreamBooth)) {
            assert_eq!(cmd.env_value(DEVICE_ENV), Some("3"));
            assert!(cmd.shell_line().contains("CUDA_VISIBLE_DEVICES=3 "), "{}", cmd.shell_line());
        }
    }

    #[tokio::test]
    async fn test_dreambooth() {
        let root = temp_root();
        let pipeline = Pipeline::new(config(&root)).unwrap();
        let mut runner = DryRunRunner::new();
        pipeline.dreambooth(&mut runner).await.unwrap();
        assert_eq!(runner.commands[0].label, "dreambooth");
        assert!(pipeline.config.dreambooth.output_dir.is_dir());
        std::fs::remove_dir_all(&root).ok();
    }
}
