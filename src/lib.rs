//! # a3s-agent-runtime
//!
//! Runtime core of an interactive agent client: a duplex, multiplexed
//! streaming protocol between a UI surface and an agent backend, permission
//! arbitration for side-effecting tool calls, and the tool execution layer
//! underneath (shell commands with output capture, file tools guarded by
//! revertible snapshots).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_agent_runtime::{
//!     ChannelTransport, FramedTransport, PermissionArbiter, RuntimeConfig, SessionController,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_agent_runtime::Result<()> {
//! let transport = FramedTransport::connect_unix("/tmp/agent.sock").await?;
//! let bus = Arc::new(ChannelTransport::new(Arc::new(transport)));
//! let session = SessionController::new(
//!     bus,
//!     Arc::new(PermissionArbiter::new()),
//!     &RuntimeConfig::default(),
//! );
//!
//! let channel = session.send("Summarize the README").await?;
//! println!("Turn running on {}", channel);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **transport**: [`Transport`] trait, framed and in-memory transports,
//!   [`ChannelTransport`] for correlated calls and ordered event streams
//! - **session**: [`SessionController`] state machine, stall recovery,
//!   compaction handling, interrupt
//! - **permission**: [`PermissionArbiter`] and [`ConfirmationPolicy`]
//! - **shell**: [`ShellExecutor`]: captured, monitorable and background runs
//! - **snapshot**: [`SnapshotStore`]: one revertible snapshot per tool use
//! - **tools**: [`ToolExecutor`]: read, write, edit, bash, bash_output,
//!   kill_shell, glob, grep

pub mod config;
pub mod error;
pub mod permission;
pub mod session;
pub mod shell;
pub mod snapshot;
pub mod tools;
pub mod transport;
pub mod types;

// Re-export core types
pub use config::{RuntimeConfig, SessionConfig, ShellConfig, SnapshotConfig, ToolLimits};
pub use error::{Result, RuntimeError};
pub use permission::{
    ConfirmationPolicy, PermissionArbiter, PermissionDecision, PermissionRequest,
    PermissionResult,
};
pub use session::{SessionController, SessionEvent, SessionState};
pub use shell::{ShellExecutor, ShellOutcome, ShellRequest};
pub use snapshot::{Snapshot, SnapshotStore};
pub use tools::{ToolExecutor, ToolResult};
#[cfg(unix)]
pub use transport::FramedListener;
pub use transport::{ChannelTransport, EventStream, FramedTransport, MemoryTransport, Transport};
pub use types::{AgentEvent, ChannelId, ControlMessage, Envelope, StreamEvent};
