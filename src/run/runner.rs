//! Program execution: one external program at a time

use super::command::ProgramCommand;
use super::config::DEVICE_ENV;
use crate::error::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub duration_ms: u64,
}

impl RunStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("signal"),
        }
    }
}

/// Executes program commands
#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    async fn run(&mut self, cmd: &ProgramCommand) -> Result<RunStatus>;
}

/// Spawns the real programs, inheriting stdio
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    /// Value for `CUDA_VISIBLE_DEVICES` when a command does not pin one
    pub device: Option<String>,
}

impl ProcessRunner {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }
}

impl CommandRunner for ProcessRunner {
    async fn run(&mut self, cmd: &ProgramCommand) -> Result<RunStatus> {
        let mut command = cmd.to_tokio();
        if let (Some(device), None) = (&self.device, cmd.env_value(DEVICE_ENV)) {
            command.env(DEVICE_ENV, device);
        }
        info!("[{}] {}", cmd.label, cmd.shell_line());
        let start = Instant::now();
        let status = command.status().await?;
        let run = RunStatus {
            code: status.code(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if run.success() {
            info!("[{}] finished in {:.1}s", cmd.label, run.duration_ms as f64 / 1000.0);
        } else {
            warn!("[{}] {} after {:.1}s", cmd.label, run, run.duration_ms as f64 / 1000.0);
        }
        Ok(run)
    }
}

/// Logs commands instead of running them
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner {
    pub commands: Vec<ProgramCommand>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandRunner for DryRunRunner {
    async fn run(&mut self, cmd: &ProgramCommand) -> Result<RunStatus> {
        info!("[dry-run {}] {}", cmd.label, cmd.shell_line());
        self.commands.push(cmd.clone());
        Ok(RunStatus { code: Some(0), duration_ms: 0 })
    }
}
