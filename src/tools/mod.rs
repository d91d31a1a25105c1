//! Tool execution
//!
//! Tool calls arrive as `(name, input)` pairs, are parsed into a typed
//! [`ToolCall`], and are dispatched by exhaustive match. Every outcome,
//! including bad input and failed commands, comes back as a [`ToolResult`]
//! so the conversation can continue.
//!
//! Mutating file tools take a [`SnapshotStore`] snapshot before touching an
//! existing file; the result then carries `snapshotId` and `canRevert`.

mod bash;
mod fs;
mod search;
mod types;
mod workspace;

pub use types::{
    BashInput, BashOutput, BashOutputInput, BashOutputOutput, EditInput, EditOutput, GlobInput,
    GlobOutput, GrepInput, GrepMatch, GrepOutput, KillShellInput, KillShellOutput, ReadInput,
    ReadOutput, ToolCall, ToolError, ToolErrorCode, ToolInvocation, ToolKind, ToolResult,
    WriteInput, WriteOutput,
};
pub use workspace::Workspace;

use crate::config::{RuntimeConfig, ToolLimits};
use crate::error::Result;
use crate::shell::ShellExecutor;
use crate::snapshot::SnapshotStore;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Executes tool calls inside one workspace
pub struct ToolExecutor {
    workspace: Workspace,
    limits: ToolLimits,
    snapshots: Arc<SnapshotStore>,
    shell: Arc<ShellExecutor>,
}

fn to_value<T: Serialize>(output: &T) -> serde_json::Value {
    serde_json::to_value(output).unwrap_or(serde_json::Value::Null)
}

impl ToolExecutor {
    pub fn new(workspace: impl AsRef<Path>, config: &RuntimeConfig) -> Self {
        Self {
            workspace: Workspace::new(workspace.as_ref()),
            limits: config.tools.clone(),
            snapshots: Arc::new(SnapshotStore::new(config.snapshots.max_snapshots)),
            shell: Arc::new(ShellExecutor::new(config.shell.clone())),
        }
    }

    /// Share a snapshot store with other executors
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Share a shell executor (and its process registry)
    pub fn with_shell(mut self, shell: Arc<ShellExecutor>) -> Self {
        self.shell = shell;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn shell(&self) -> &Arc<ShellExecutor> {
        &self.shell
    }

    /// Definitions of every tool, for advertising to the backend
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        ToolKind::ALL.iter().map(|k| k.definition()).collect()
    }

    /// Parse and run a tool call
    pub async fn execute(
        &self,
        tool_use_id: &str,
        name: &str,
        input: &serde_json::Value,
    ) -> ToolResult {
        self.execute_with_cancel(tool_use_id, name, input, CancellationToken::new())
            .await
    }

    /// Parse and run a tool call; `cancel` stops a running command
    pub async fn execute_with_cancel(
        &self,
        tool_use_id: &str,
        name: &str,
        input: &serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        match ToolInvocation::parse(tool_use_id, name, input) {
            Ok(invocation) => self.invoke(&invocation, cancel).await,
            Err(error) => {
                tracing::debug!(tool = name, tool_use_id, error = %error, "Rejected tool input");
                ToolResult::failure(tool_use_id, name, error)
            }
        }
    }

    /// Run an already-validated invocation
    pub async fn invoke(&self, invocation: &ToolInvocation, cancel: CancellationToken) -> ToolResult {
        let name = invocation.call.kind().name();
        let span = tracing::info_span!(
            "a3s.tool.execute",
            "a3s.tool.name" = name,
            "a3s.tool.use_id" = %invocation.tool_use_id,
            "a3s.tool.success" = tracing::field::Empty,
            "a3s.tool.duration_ms" = tracing::field::Empty,
        );
        let start = std::time::Instant::now();

        let result = self.dispatch(invocation, cancel).instrument(span.clone()).await;

        span.record("a3s.tool.success", !result.is_error);
        span.record("a3s.tool.duration_ms", start.elapsed().as_millis() as u64);
        if let Some(error) = &result.error {
            tracing::debug!(parent: &span, code = ?error.code, message = %error.message, "Tool failed");
        }
        result
    }

    async fn dispatch(&self, invocation: &ToolInvocation, cancel: CancellationToken) -> ToolResult {
        let id = invocation.tool_use_id.as_str();
        let name = invocation.call.kind().name();
        let ws = &self.workspace;

        let outcome = match &invocation.call {
            ToolCall::Read(input) => fs::read(ws, &self.limits, input)
                .await
                .map(|out| (to_value(&out), None)),
            ToolCall::Write(input) => fs::write(ws, &self.snapshots, id, input)
                .await
                .map(|m| (to_value(&m.output), m.snapshot_id)),
            ToolCall::Edit(input) => fs::edit(ws, &self.snapshots, id, input)
                .await
                .map(|m| (to_value(&m.output), m.snapshot_id)),
            ToolCall::Bash(input) => bash::bash(ws, &self.shell, input, cancel)
                .await
                .map(|out| (to_value(&out), None)),
            ToolCall::BashOutput(input) => bash::bash_output(&self.shell, input)
                .await
                .map(|out| (to_value(&out), None)),
            ToolCall::KillShell(input) => bash::kill_shell(&self.shell, input)
                .await
                .map(|out| (to_value(&out), None)),
            ToolCall::Glob(input) => search::glob(ws, &self.limits, input)
                .await
                .map(|out| (to_value(&out), None)),
            ToolCall::Grep(input) => search::grep(ws, &self.limits, input)
                .await
                .map(|out| (to_value(&out), None)),
        };

        match outcome {
            Ok((output, Some(snapshot_id))) => {
                ToolResult::success(id, name, output).with_snapshot(snapshot_id)
            }
            Ok((output, None)) => ToolResult::success(id, name, output),
            Err(error) => ToolResult::failure(id, name, error),
        }
    }

    /// Revert the file mutation made by a tool use
    pub async fn revert(&self, tool_use_id: &str) -> Result<PathBuf> {
        self.snapshots.revert(tool_use_id).await
    }

    /// Unified diff of a mutation against the file's current content
    pub async fn diff(&self, tool_use_id: &str) -> Result<String> {
        self.snapshots.diff(tool_use_id).await
    }
}
