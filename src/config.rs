//! Runtime configuration
//!
//! Configuration is built programmatically via `RuntimeConfig::default()` plus
//! builder methods, or loaded from a camelCase JSON file with
//! [`RuntimeConfig::from_file`]. Every section has defaults so partial files
//! are accepted.

use crate::error::{Result, RuntimeError};
use crate::permission::ConfirmationPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Session
// ============================================================================

/// Session controller tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// How often the stall timer checks for inactivity
    pub stall_poll_interval_ms: u64,
    /// Inactivity while busy after which a turn counts as stalled
    pub stall_threshold_ms: u64,
    /// Whether stall recovery sends a continuation at all
    pub stall_recovery: bool,
    /// Text of the synthetic message sent on stall
    pub continuation_message: String,
    /// Whether a `compacting` event triggers an automatic continuation
    pub continue_after_compaction: bool,
    /// Text of the synthetic message sent on compaction
    pub compaction_message: String,
    /// Timeout for the launch call
    pub launch_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stall_poll_interval_ms: 5_000,
            stall_threshold_ms: 30_000,
            stall_recovery: true,
            continuation_message: "Continue.".to_string(),
            continue_after_compaction: true,
            compaction_message: "Continue from where you left off.".to_string(),
            launch_timeout_ms: 60_000,
        }
    }
}

impl SessionConfig {
    pub fn stall_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stall_poll_interval_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

// ============================================================================
// Shell
// ============================================================================

/// Timeout tiers picked by command classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutTiers {
    /// Network commands (curl, wget, ping, git fetch)
    pub network_ms: u64,
    /// Anything unclassified
    pub default_ms: u64,
    /// Builds and test runs
    pub build_ms: u64,
    /// Package installs
    pub install_ms: u64,
    /// Upper bound for any timeout, including explicit ones
    pub max_ms: u64,
}

impl Default for TimeoutTiers {
    fn default() -> Self {
        Self {
            network_ms: 30_000,
            default_ms: 120_000,
            build_ms: 300_000,
            install_ms: 600_000,
            max_ms: 600_000,
        }
    }
}

/// Shell command executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellConfig {
    /// Shell binary used as `<shell> -c <command>`
    pub shell: String,
    /// Byte cap per stream (stdout, stderr) in captured mode
    pub max_output_bytes: usize,
    /// Byte cap per stream for background processes
    pub background_output_bytes: usize,
    /// Delay between the graceful signal and the forced kill
    pub kill_grace_ms: u64,
    /// How long to wait for output readers after the process exited
    pub reader_drain_ms: u64,
    pub timeouts: TimeoutTiers,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            max_output_bytes: 30_000,
            background_output_bytes: 1024 * 1024,
            kill_grace_ms: 2_000,
            reader_drain_ms: 500,
            timeouts: TimeoutTiers::default(),
        }
    }
}

impl ShellConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn reader_drain(&self) -> Duration {
        Duration::from_millis(self.reader_drain_ms)
    }
}

// ============================================================================
// Snapshots and tool limits
// ============================================================================

/// Snapshot store retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SnapshotConfig {
    /// Maximum retained snapshots; oldest are evicted first
    pub max_snapshots: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self { max_snapshots: 500 }
    }
}

/// Output caps for file and search tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolLimits {
    pub max_read_lines: usize,
    pub max_line_length: usize,
    pub max_glob_results: usize,
    pub max_grep_matches: usize,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_read_lines: 2_000,
            max_line_length: 2_000,
            max_glob_results: 1_000,
            max_grep_matches: 200,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration for the agent runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub shell: ShellConfig,
    pub snapshots: SnapshotConfig,
    pub tools: ToolLimits,
    pub confirmation: ConfirmationPolicy,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            RuntimeError::Config(format!("Failed to parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Runtime config loaded");
        Ok(config)
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_confirmation_policy(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation = policy;
        self
    }

    pub fn with_max_snapshots(mut self, max_snapshots: usize) -> Self {
        self.snapshots.max_snapshots = max_snapshots;
        self
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        let s = &self.session;
        if s.stall_poll_interval_ms == 0 {
            return Err(RuntimeError::Config(
                "session.stallPollIntervalMs must be greater than 0".to_string(),
            ));
        }
        if s.stall_threshold_ms < s.stall_poll_interval_ms {
            return Err(RuntimeError::Config(format!(
                "session.stallThresholdMs ({}) must be at least the poll interval ({})",
                s.stall_threshold_ms, s.stall_poll_interval_ms
            )));
        }
        if self.shell.shell.trim().is_empty() {
            return Err(RuntimeError::Config("shell.shell must not be empty".to_string()));
        }
        if self.shell.max_output_bytes == 0 {
            return Err(RuntimeError::Config(
                "shell.maxOutputBytes must be greater than 0".to_string(),
            ));
        }
        let t = &self.shell.timeouts;
        for (name, value) in [
            ("networkMs", t.network_ms),
            ("defaultMs", t.default_ms),
            ("buildMs", t.build_ms),
            ("installMs", t.install_ms),
        ] {
            if value == 0 || value > t.max_ms {
                return Err(RuntimeError::Config(format!(
                    "shell.timeouts.{} must be in 1..={} (got {})",
                    name, t.max_ms, value
                )));
            }
        }
        if self.snapshots.max_snapshots == 0 {
            return Err(RuntimeError::Config(
                "snapshots.maxSnapshots must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
