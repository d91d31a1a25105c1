//! Error types for a3s-agent-runtime

use thiserror::Error;

/// Errors that can occur in the agent runtime
///
/// Tool-level failures are not represented here: they travel as
/// [`ToolResult`](crate::tools::ToolResult) values so a conversation can
/// continue after them.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The underlying transport is gone; fatal to the owning session
    #[error("Transport closed")]
    TransportClosed,

    /// Transport-level send/receive failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Wire frame could not be encoded or decoded
    #[error("Frame error: {0}")]
    Frame(String),

    /// A pending call was cancelled before its response arrived
    #[error("Request {request_id} was cancelled")]
    Cancelled { request_id: u64 },

    /// The remote side answered a call with an error payload
    #[error("Remote error: {0}")]
    Remote(String),

    /// A channel was closed by the remote side with an error
    #[error("Channel '{channel_id}' closed: {reason}")]
    ChannelClosed { channel_id: String, reason: String },

    /// A request id is already awaiting a response
    #[error("Request {0} is already pending")]
    DuplicateRequest(u64),

    /// A session state transition that the state machine does not allow
    #[error("Invalid session transition from {from} on {action}")]
    InvalidTransition { from: String, action: String },

    /// Permission request unknown or already resolved
    #[error("Permission request not found: {0}")]
    PermissionNotFound(String),

    /// Snapshot lookup failure
    #[error("Snapshot not found for tool use '{0}'")]
    SnapshotNotFound(String),

    /// A snapshot already exists for this tool use
    #[error("Snapshot already exists for tool use '{0}'")]
    SnapshotExists(String),

    /// The snapshot was already reverted once
    #[error("Snapshot for tool use '{0}' was already reverted")]
    AlreadyReverted(String),

    /// Background process handle unknown
    #[error("Unknown background shell: {0}")]
    UnknownShell(String),

    /// Input validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem or process I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
