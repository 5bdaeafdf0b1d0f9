use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use confd_common::telemetry::MetricsRegistry;
use confd_error::{FailureScope, ScopedFailure};
use metrics::{counter, Counter};
use snafu::{ResultExt as _, Snafu};
use tokio::{process::Command, sync::Mutex, time::timeout};
use tracing::{debug, info};

/// The agent could not be reloaded.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReloadError {
    #[snafu(display("Failed to spawn reload command '{}': {}", command, source))]
    Spawn { command: String, source: std::io::Error },

    #[snafu(display("Reload command '{}' exited with code {}: {}", command, exit_code, stderr))]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[snafu(display("Reload command '{}' did not finish within {} seconds.", command, timeout_secs))]
    TimedOut { command: String, timeout_secs: u64 },
}

impl ScopedFailure for ReloadError {
    // The agent would keep running with stale checks and nothing retries the reload.
    fn scope(&self) -> FailureScope {
        FailureScope::Process
    }
}

/// Whether a reload actually ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,

    /// Reloading is turned off by configuration.
    Suppressed,
}

/// Something that makes the monitoring agent pick up new configuration files.
#[async_trait]
pub trait ReloadAction: Send + Sync {
    async fn reload(&self) -> Result<(), ReloadError>;
}

/// Reloads the agent by running an external command, such as `service datadog-agent reload`.
pub struct ServiceCommandReload {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ServiceCommandReload {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    fn display_command(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ReloadAction for ServiceCommandReload {
    async fn reload(&self) -> Result<(), ReloadError> {
        let command = self.display_command();

        let child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context(Spawn {
                command: command.clone(),
            })?;

        debug!(command = %command, "Spawned agent reload command.");

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ReloadError::TimedOut {
                command: command.clone(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .context(Spawn {
                command: command.clone(),
            })?;

        if !output.status.success() {
            return Err(ReloadError::Failed {
                command,
                exit_code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(())
    }
}

/// Reloads the agent on behalf of every reconciler.
///
/// Reloads are serialized: a reconciler that asks while another reload is running waits for it to finish and then
/// runs its own, since its file was written after the running reload started reading.
pub struct ReloadTrigger {
    action: Arc<dyn ReloadAction>,
    suppressed: bool,
    lock: Mutex<()>,
    reloads: Counter,
}

impl ReloadTrigger {
    /// Creates a new `ReloadTrigger`.
    ///
    /// When `suppressed` is set, reloads are counted and logged but `action` is never run.
    pub fn new(action: Arc<dyn ReloadAction>, suppressed: bool, metrics: &MetricsRegistry) -> Self {
        Self {
            action,
            suppressed,
            lock: Mutex::new(()),
            reloads: metrics.scoped(|| counter!("agent_reloads_total")),
        }
    }

    /// Reloads the agent after `family`'s configuration file changed.
    ///
    /// # Errors
    ///
    /// If the reload action fails, an error is returned.
    pub async fn trigger(&self, family: &str) -> Result<ReloadOutcome, ReloadError> {
        self.reloads.increment(1);

        if self.suppressed {
            info!(family, "Agent reload suppressed by configuration.");
            return Ok(ReloadOutcome::Suppressed);
        }

        let _guard = self.lock.lock().await;
        self.action.reload().await?;
        info!(family, "Reloaded agent.");

        Ok(ReloadOutcome::Reloaded)
    }
}
