//! Background process registry
//!
//! Long-running commands are spawned detached from the caller and tracked
//! under an opaque `bash-<uuid>` id. Output accumulates in capped buffers
//! and can be polled at any time without blocking on the process.

use super::captured::{
    exit_code_of, shell_command, spawn_reader, terminate, CappedBuffer, SharedBuffer,
    KILLED_EXIT_CODE,
};
use crate::config::ShellConfig;
use crate::error::{Result, RuntimeError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Lifecycle of a background process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunState {
    Running,
    Exited { code: i32 },
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Running)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunState::Running => None,
            RunState::Exited { code } => Some(*code),
        }
    }
}

/// Snapshot of a background process's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundOutput {
    pub bash_id: String,
    pub stdout: String,
    pub stderr: String,
    pub state: RunState,
}

/// Listing entry for a background process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSummary {
    pub bash_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub state: RunState,
}

struct BackgroundProcess {
    command: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    state: watch::Receiver<RunState>,
    kill: CancellationToken,
}

/// Tracks background processes; passed explicitly, never global
pub struct ProcessRegistry {
    processes: RwLock<HashMap<String, Arc<BackgroundProcess>>>,
    config: ShellConfig,
}

impl ProcessRegistry {
    pub fn new(config: ShellConfig) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Spawn a command in the background and return its id immediately
    pub async fn spawn(&self, command: &str, cwd: Option<PathBuf>) -> Result<String> {
        let mut child = shell_command(&self.config.shell, command, cwd.as_ref()).spawn()?;
        let bash_id = format!("bash-{}", uuid::Uuid::new_v4());
        let pid = child.id();

        let cap = self.config.background_output_bytes;
        let stdout: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        let stderr: SharedBuffer = Arc::new(Mutex::new(CappedBuffer::new(cap)));
        if let Some(pipe) = child.stdout.take() {
            spawn_reader(pipe, stdout.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_reader(pipe, stderr.clone());
        }

        let (state_tx, state_rx) = watch::channel(RunState::Running);
        let kill = CancellationToken::new();

        let monitor_kill = kill.clone();
        let grace = self.config.kill_grace();
        let monitor_id = bash_id.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => exit_code_of(status),
                    Err(e) => {
                        tracing::warn!(bash_id = %monitor_id, error = %e, "Failed to wait on background process");
                        KILLED_EXIT_CODE
                    }
                },
                _ = monitor_kill.cancelled() => {
                    terminate(&mut child, grace).await;
                    KILLED_EXIT_CODE
                }
            };
            tracing::debug!(bash_id = %monitor_id, code, "Background process exited");
            let _ = state_tx.send(RunState::Exited { code });
        });

        tracing::info!(bash_id = %bash_id, pid = ?pid, command, "Background process started");
        self.processes.write().await.insert(
            bash_id.clone(),
            Arc::new(BackgroundProcess {
                command: command.to_string(),
                pid,
                started_at: Utc::now(),
                stdout,
                stderr,
                state: state_rx,
                kill,
            }),
        );
        Ok(bash_id)
    }

    async fn lookup(&self, bash_id: &str) -> Result<Arc<BackgroundProcess>> {
        self.processes
            .read()
            .await
            .get(bash_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownShell(bash_id.to_string()))
    }

    /// Accumulated output and current state; `filter` keeps matching lines only
    pub async fn output(&self, bash_id: &str, filter: Option<&str>) -> Result<BackgroundOutput> {
        let filter = filter
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| RuntimeError::Validation(format!("Invalid filter regex: {}", e)))
            })
            .transpose()?;

        let process = self.lookup(bash_id).await?;
        let state = *process.state.borrow();
        let stdout = process.stdout.lock().await.to_text();
        let stderr = process.stderr.lock().await.to_text();

        let apply = |text: String| match &filter {
            Some(re) => text
                .lines()
                .filter(|line| re.is_match(line))
                .collect::<Vec<_>>()
                .join("\n"),
            None => text,
        };

        Ok(BackgroundOutput {
            bash_id: bash_id.to_string(),
            stdout: apply(stdout),
            stderr: apply(stderr),
            state,
        })
    }

    /// Kill a background process; returns false if it had already exited
    pub async fn kill(&self, bash_id: &str) -> Result<bool> {
        let process = self.lookup(bash_id).await?;
        if !process.state.borrow().is_running() {
            return Ok(false);
        }

        tracing::info!(bash_id, "Killing background process");
        process.kill.cancel();

        let mut state = process.state.clone();
        let wait = self.config.kill_grace() + Duration::from_secs(1);
        let _ = tokio::time::timeout(wait, state.wait_for(|s| !s.is_running())).await;
        Ok(true)
    }

    /// Wait until a process exits, up to `timeout`; returns the final state
    pub async fn wait(&self, bash_id: &str, timeout: Duration) -> Result<RunState> {
        let process = self.lookup(bash_id).await?;
        let mut state = process.state.clone();
        let _ = tokio::time::timeout(timeout, state.wait_for(|s| !s.is_running())).await;
        let current = *state.borrow();
        Ok(current)
    }

    pub async fn list(&self) -> Vec<BackgroundSummary> {
        let processes = self.processes.read().await;
        let mut list: Vec<BackgroundSummary> = processes
            .iter()
            .map(|(id, p)| BackgroundSummary {
                bash_id: id.clone(),
                command: p.command.clone(),
                pid: p.pid,
                started_at: p.started_at,
                state: *p.state.borrow(),
            })
            .collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    /// Forget an exited process; running processes are left alone
    pub async fn remove(&self, bash_id: &str) -> bool {
        let mut processes = self.processes.write().await;
        let exited = processes
            .get(bash_id)
            .is_some_and(|p| !p.state.borrow().is_running());
        if exited {
            processes.remove(bash_id);
        }
        exited
    }

    /// Kill every running process
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.kill(&id).await;
        }
    }
}
