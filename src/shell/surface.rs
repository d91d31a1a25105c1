//! Monitorable execution on host terminal surfaces
//!
//! A host (an IDE terminal panel, a multiplexer) hands out named, reusable
//! surfaces. When the surface can capture output the command runs there with
//! capture; otherwise it is dispatched fire-and-forget and the caller is told
//! that no output is available.

use super::captured::CommandOutput;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A terminal a command can be sent to
#[async_trait]
pub trait TerminalSurface: Send + Sync {
    /// Stable name used to reuse the surface
    fn name(&self) -> &str;

    /// Whether [`run_captured`](Self::run_captured) is supported
    fn supports_capture(&self) -> bool;

    /// Type a command into the surface without waiting for it
    async fn send_text(&self, command: &str) -> Result<()>;

    /// Run a command and collect its output
    async fn run_captured(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Provider of terminal surfaces
#[async_trait]
pub trait TerminalHost: Send + Sync {
    /// Return the surface with this name, creating it if needed
    async fn acquire(&self, name: &str) -> Result<Arc<dyn TerminalSurface>>;
}

/// Outcome of a monitorable run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MonitoredRun {
    /// The surface captured the command's output
    Captured { surface: String, output: CommandOutput },
    /// Sent to the surface without capture
    Dispatched { surface: String, message: String },
}

/// Run `command` on the named surface, degrading to fire-and-forget
pub async fn run_monitorable(
    host: &dyn TerminalHost,
    surface_name: &str,
    command: &str,
    timeout: Duration,
) -> Result<MonitoredRun> {
    let surface = host.acquire(surface_name).await?;
    let surface_name = surface.name().to_string();

    if surface.supports_capture() {
        tracing::debug!(surface = %surface_name, command, "Running on terminal surface with capture");
        let output = surface.run_captured(command, timeout).await?;
        return Ok(MonitoredRun::Captured {
            surface: surface_name,
            output,
        });
    }

    tracing::debug!(surface = %surface_name, command, "Terminal surface cannot capture, dispatching");
    surface.send_text(command).await?;
    Ok(MonitoredRun::Dispatched {
        message: format!(
            "Command was sent to terminal '{}'. Output capture is not available there; check the terminal for results.",
            surface_name
        ),
        surface: surface_name,
    })
}
