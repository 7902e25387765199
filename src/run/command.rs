//! Command construction for the external training and evaluation programs

use super::config::{format_target_modules, DreamBoothArgs, FinetuneArgs, Launcher, DEVICE_ENV};
use super::sweep::Benchmark;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

/// One invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCommand {
    /// Short name used in logs and reports
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl ProgramCommand {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    /// Positional argument
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// `--name value`
    pub fn opt(mut self, name: &str, value: impl Display) -> Self {
        self.args.push(format!("--{}", name));
        self.args.push(value.to_string());
        self
    }

    /// `--name`
    pub fn flag(self, name: &str) -> Self {
        self.arg(format!("--{}", name))
    }

    pub fn flag_if(self, name: &str, enabled: bool) -> Self {
        if enabled {
            self.flag(name)
        } else {
            self
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Pin the invocation to one accelerator
    pub fn pin_device(self, device: Option<&str>) -> Self {
        match device {
            Some(device) => self.env(DEVICE_ENV, device),
            None => self,
        }
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn current_dir(mut self, dir: Option<&Path>) -> Self {
        self.current_dir = dir.map(Path::to_path_buf);
        self
    }

    /// Value passed for `--name`, if any
    pub fn option_value(&self, name: &str) -> Option<&str> {
        let key = format!("--{}", name);
        self.args
            .iter()
            .position(|a| *a == key)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        let key = format!("--{}", name);
        self.args.iter().any(|a| *a == key)
    }

    /// Copy-pasteable shell form, env assignments first
    pub fn shell_line(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect();
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let line = parts.join(" ");
        match &self.current_dir {
            Some(dir) => format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), line),
            None => line,
        }
    }

    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }
}

fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || "_-./:=,+@%".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// `python finetune.py ...`
pub fn finetune_command(launcher: &Launcher, args: &FinetuneArgs, output_dir: &Path) -> ProgramCommand {
    ProgramCommand::new("finetune", &launcher.python)
        .arg(launcher.finetune_script.to_string_lossy())
        .opt("base_model", &args.base_model)
        .opt("data_path", &args.data_path)
        .opt("output_dir", output_dir.display())
        .opt("batch_size", args.batch_size)
        .opt("micro_batch_size", args.micro_batch_size)
        .opt("num_epochs", args.num_epochs)
        .opt("learning_rate", args.learning_rate)
        .opt("cutoff_len", args.cutoff_len)
        .opt("val_set_size", args.val_set_size)
        .opt("eval_step", args.eval_step)
        .opt("save_step", args.save_step)
        .opt("adapter_name", &args.adapter_name)
        .opt("lora_r", args.lora_r)
        .opt("lora_alpha", args.lora_alpha)
        .opt("lora_dropout", args.lora_dropout)
        .opt("target_modules", format_target_modules(&args.target_modules))
        .flag_if("use_lora_router", args.routing.use_router())
        .flag_if("use_lora_router_mixer", args.routing.use_mixer())
        .flag_if("use_gradient_checkpointing", args.use_gradient_checkpointing)
        .current_dir(launcher.working_dir.as_deref())
}

/// `python commonsense_evaluate.py ...` for one dataset
#[allow(clippy::too_many_arguments)]
pub fn eval_command(
    launcher: &Launcher,
    model: &str,
    adapter: &str,
    dataset: Benchmark,
    batch_size: u32,
    base_model: &str,
    lora_weights: &Path,
    save_dir: &Path,
) -> ProgramCommand {
    ProgramCommand::new(format!("eval:{}", dataset), &launcher.python)
        .arg(launcher.eval_script.to_string_lossy())
        .opt("model", model)
        .opt("adapter", adapter)
        .opt("dataset", dataset)
        .opt("batch_size", batch_size)
        .opt("base_model", base_model)
        .opt("lora_weights", lora_weights.display())
        .opt("save_dir", save_dir.display())
        .current_dir(launcher.working_dir.as_deref())
}

/// `accelerate launch train_dreambooth_lora_sdxl.py ...`
pub fn dreambooth_command(launcher: &Launcher, args: &DreamBoothArgs) -> ProgramCommand {
    ProgramCommand::new("dreambooth", &launcher.accelerate)
        .env("MODEL_NAME", &args.model_name)
        .env("INSTANCE_DIR", args.instance_data_dir.to_string_lossy())
        .env("VAE_PATH", &args.vae_path)
        .env("OUTPUT_DIR", args.output_dir.to_string_lossy())
        .arg("launch")
        .arg(launcher.dreambooth_script.to_string_lossy())
        .opt("pretrained_model_name_or_path", &args.model_name)
        .opt("instance_data_dir", args.instance_data_dir.display())
        .opt("pretrained_vae_model_name_or_path", &args.vae_path)
        .opt("output_dir", args.output_dir.display())
        .opt("mixed_precision", &args.mixed_precision)
        .opt("instance_prompt", &args.instance_prompt)
        .opt("resolution", args.resolution)
        .opt("train_batch_size", args.train_batch_size)
        .opt("gradient_accumulation_steps", args.gradient_accumulation_steps)
        .opt("learning_rate", args.learning_rate)
        .opt("lr_scheduler", &args.lr_scheduler)
        .opt("lr_warmup_steps", args.lr_warmup_steps)
        .opt("max_train_steps", args.max_train_steps)
        .opt("validation_prompt", &args.validation_prompt)
        .opt("validation_epochs", args.validation_epochs)
        .opt("seed", args.seed)
        .flag_if("use_lora_router", args.use_lora_router)
        .current_dir(launcher.working_dir.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::RoutingMode;

    #[test]
    fn test_finetune_flags() {
        let args = FinetuneArgs { routing: RoutingMode::Mixer, ..FinetuneArgs::default() };
        let cmd = finetune_command(&Launcher::default(), &args, Path::new("out/run"));
        assert_eq!(cmd.program, "python");
        assert_eq!(cmd.args[0], "finetune.py");
        assert_eq!(cmd.option_value("output_dir"), Some("out/run"));
        assert_eq!(cmd.option_value("lora_r"), Some("32"));
        assert_eq!(cmd.option_value("learning_rate"), Some("0.0002"));
        assert_eq!(
            cmd.option_value("target_modules"),
            Some(r#"["q_proj", "k_proj", "v_proj", "up_proj", "down_proj"]"#)
        );
        assert!(cmd.has_flag("use_lora_router"));
        assert!(cmd.has_flag("use_lora_router_mixer"));
    }

    #[test]
    fn test_router_flags_follow_mode() {
        let launcher = Launcher::default();
        let off = finetune_command(&launcher, &FinetuneArgs { routing: RoutingMode::Off, ..FinetuneArgs::default() }, Path::new("o"));
        assert!(!off.has_flag("use_lora_router"));
        assert!(!off.has_flag("use_lora_router_mixer"));
        let router = finetune_command(&launcher, &FinetuneArgs::default(), Path::new("o"));
        assert!(router.has_flag("use_lora_router"));
        assert!(!router.has_flag("use_lora_router_mixer"));
    }

    #[test]
    fn test_eval_command() {
        let cmd = eval_command(
            &Launcher::default(),
            "LLaMA-7B",
            "LoRA",
            Benchmark::ArcChallenge,
            1,
            "yahma/llama-7b-hf",
            Path::new("trained/run"),
            Path::new("results/run"),
        );
        assert_eq!(cmd.label, "eval:ARC-Challenge");
        assert_eq!(cmd.option_value("dataset"), Some("ARC-Challenge"));
        assert_eq!(cmd.option_value("lora_weights"), Some("trained/run"));
        assert_eq!(cmd.option_value("save_dir"), Some("results/run"));
    }

    #[test]
    fn test_dreambooth_command() {
        let cmd = dreambooth_command(&Launcher::default(), &DreamBoothArgs::default());
        assert_eq!(cmd.program, "accelerate");
        assert_eq!(&cmd.args[..2], &["launch".to_string(), "train_dreambooth_lora_sdxl.py".to_string()]);
        assert_eq!(cmd.option_value("resolution"), Some("1024"));
        assert!(cmd.env.contains(&("MODEL_NAME".into(), "stabilityai/stable-diffusion-xl-base-1.0".into())));
        assert!(!cmd.has_flag("use_lora_router"));
    }

    #[test]
    fn test_shell_line_quoting() {
        let cmd = ProgramCommand::new("t", "python")
            .env("CUDA_VISIBLE_DEVICES", "0")
            .opt("instance_prompt", "a photo of sks dog")
            .opt("note", "it's");
        assert_eq!(
            cmd.shell_line(),
            r#"CUDA_VISIBLE_DEVICES=0 python --instance_prompt 'a photo of sks dog' --note 'it'\''s'"#
        );
        let in_dir = cmd.current_dir(Some(Path::new("/work dir")));
        assert!(in_dir.shell_line().starts_with("cd '/work dir' && "));
    }
}
