//! virsh operation executor
//!
//! Runs `virsh -c <uri> <subcommand> <vm>` and judges the outcome from the
//! captured output. `restart` is two runs, `destroy` then `start`, with no
//! rollback: a failed `start` leaves the domain stopped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::types::{CommandOutput, CommandResult, FailureDetection};

/// Default hypervisor CLI
pub const DEFAULT_VIRSH_BINARY: &str = "virsh";

/// Default libvirt connection URI
pub const DEFAULT_CONNECT_URI: &str = "qemu:///system";

/// Spawns an external program and captures its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// Runner backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out run drops this future; take the child down with it.
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Executor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Hypervisor CLI binary
    pub binary: String,

    /// libvirt connection URI passed with `-c`
    pub connect_uri: String,

    /// How each run is judged
    pub failure_detection: FailureDetection,

    /// Per-run limit; unbounded when `None`
    #[serde(with = "optional_secs")]
    pub command_timeout: Option<Duration>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            binary: DEFAULT_VIRSH_BINARY.to_string(),
            connect_uri: DEFAULT_CONNECT_URI.to_string(),
            failure_detection: FailureDetection::default(),
            command_timeout: None,
        }
    }
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_secs()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Restart progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestartPhase {
    Idle,
    Destroying,
    Starting,
    Done,
}

impl RestartPhase {
    fn next(self) -> Self {
        match self {
            RestartPhase::Idle => RestartPhase::Destroying,
            RestartPhase::Destroying => RestartPhase::Starting,
            RestartPhase::Starting | RestartPhase::Done => RestartPhase::Done,
        }
    }
}

/// virsh subcommands making up an operation, in order.
pub fn plan(operation: &str) -> Vec<&str> {
    match operation {
        "restart" => vec!["destroy", "start"],
        other => vec![other],
    }
}

/// Maps approved operations onto virsh runs
#[derive(Clone)]
pub struct VirshExecutor {
    runner: Arc<dyn CommandRunner>,
    settings: ExecutorSettings,
}

impl std::fmt::Debug for VirshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirshExecutor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl VirshExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self::with_runner(settings, Arc::new(ProcessRunner))
    }

    pub fn with_runner(settings: ExecutorSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute an allow-listed operation against `vm`.
    ///
    /// Every planned step runs even if an earlier one failed.
    pub async fn execute(&self, operation: &str, vm: &str) -> CommandResult {
        if operation == "restart" {
            return self.restart(vm).await;
        }
        self.run_step(operation, vm).await
    }

    async fn restart(&self, vm: &str) -> CommandResult {
        let mut phase = RestartPhase::Idle;
        let mut result: Option<CommandResult> = None;

        for step in plan("restart") {
            phase = phase.next();
            debug!(vm, ?phase, "restart step");

            let outcome = self.run_step(step, vm).await;
            result = Some(match result {
                Some(prev) => prev.and_then_step(outcome),
                None => outcome,
            });
        }

        phase = phase.next();
        let result = result.unwrap_or_else(CommandResult::success);
        debug!(vm, ?phase, succeeded = result.succeeded, "restart finished");
        if !result.succeeded {
            warn!(vm, "restart did not complete cleanly; domain may be left stopped");
        }
        result
    }

    /// One `virsh -c <uri> <subcommand> <vm>` run.
    async fn run_step(&self, subcommand: &str, vm: &str) -> CommandResult {
        let args = vec![
            "-c".to_string(),
            self.settings.connect_uri.clone(),
            subcommand.to_string(),
            vm.to_string(),
        ];
        let binary = &self.settings.binary;

        let run = self.runner.run(binary, &args);
        let output = match self.settings.command_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(operation = subcommand, vm, "command timed out");
                    return CommandResult::failure(format!(
                        "{} {} timed out after {}s",
                        binary,
                        subcommand,
                        limit.as_secs()
                    ));
                }
            },
            None => run.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                warn!(operation = subcommand, vm, "Could not run command: {}", e);
                return CommandResult::failure(format!("could not run {}: {}", binary, e));
            }
        };

        info!(operation = subcommand, vm, "Run operation");
        info!("stdout: {}", output.stdout);
        info!("stderr: {}", output.stderr);

        self.settings.failure_detection.classify(&output)
    }
}
