//! Shell command execution
//!
//! Two modes:
//! - **Captured**: `bash -c` subprocess with capped output, timeout
//!   escalation and cancellation ([`run_captured`])
//! - **Monitorable**: a named terminal surface from a [`TerminalHost`],
//!   falling back to fire-and-forget ([`run_monitorable`])
//!
//! Long-running services go to the [`ProcessRegistry`] instead and are
//! polled by id.

mod background;
mod captured;
pub mod classify;
mod surface;

pub use background::{BackgroundOutput, BackgroundSummary, ProcessRegistry, RunState};
pub use captured::{run_captured, CaptureOptions, CommandOutput, KILLED_EXIT_CODE};
pub use surface::{run_monitorable, MonitoredRun, TerminalHost, TerminalSurface};

use crate::config::ShellConfig;
use crate::error::{Result, RuntimeError};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One shell invocation
#[derive(Debug, Clone, Default)]
pub struct ShellRequest {
    pub command: String,
    /// Explicit timeout; otherwise picked from the command's tier
    pub timeout_ms: Option<u64>,
    pub cwd: Option<PathBuf>,
    /// Explicit background flag; otherwise service detection decides
    pub run_in_background: Option<bool>,
}

impl ShellRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// How a shell request ended up running
#[derive(Debug, Clone, PartialEq)]
pub enum ShellOutcome {
    Completed(CommandOutput),
    Background { bash_id: String },
}

/// Entry point tying classification, captured runs and background runs together
pub struct ShellExecutor {
    config: ShellConfig,
    registry: Arc<ProcessRegistry>,
    terminal: Option<Arc<dyn TerminalHost>>,
}

impl ShellExecutor {
    pub fn new(config: ShellConfig) -> Self {
        let registry = Arc::new(ProcessRegistry::new(config.clone()));
        Self {
            config,
            registry,
            terminal: None,
        }
    }

    /// Attach a terminal host for monitorable runs
    pub fn with_terminal_host(mut self, host: Arc<dyn TerminalHost>) -> Self {
        self.terminal = Some(host);
        self
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    fn capture_options(&self, request: &ShellRequest) -> CaptureOptions {
        CaptureOptions {
            shell: self.config.shell.clone(),
            cwd: request.cwd.clone(),
            timeout: classify::resolve_timeout(
                &request.command,
                request.timeout_ms,
                &self.config.timeouts,
            ),
            max_output_bytes: self.config.max_output_bytes,
            kill_grace: self.config.kill_grace(),
            reader_drain: self.config.reader_drain(),
        }
    }

    /// Run a request in captured mode or register it as a background process
    pub async fn execute(
        &self,
        request: &ShellRequest,
        cancel: CancellationToken,
    ) -> Result<ShellOutcome> {
        if request.command.trim().is_empty() {
            return Err(RuntimeError::Validation("command must not be empty".to_string()));
        }

        if classify::should_run_in_background(&request.command, request.run_in_background) {
            let bash_id = self
                .registry
                .spawn(&request.command, request.cwd.clone())
                .await?;
            return Ok(ShellOutcome::Background { bash_id });
        }

        let output = run_captured(&request.command, &self.capture_options(request), cancel).await?;
        Ok(ShellOutcome::Completed(output))
    }

    /// Run on a named terminal surface; captured mode when no host is attached
    pub async fn execute_monitorable(
        &self,
        surface_name: &str,
        request: &ShellRequest,
    ) -> Result<MonitoredRun> {
        let opts = self.capture_options(request);
        match &self.terminal {
            Some(host) => {
                run_monitorable(host.as_ref(), surface_name, &request.command, opts.timeout).await
            }
            None => {
                let output = run_captured(&request.command, &opts, CancellationToken::new()).await?;
                Ok(MonitoredRun::Captured {
                    surface: surface_name.to_string(),
                    output,
                })
            }
        }
    }
}
