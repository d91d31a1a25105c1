//! Core wire types for the agent runtime
//!
//! All types use camelCase JSON fields for wire compatibility. Envelope and
//! event variants are tagged with a `type` field.

use crate::error::{Result, RuntimeError};
use crate::permission::PermissionResult;
use crate::tools::ToolResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation id of a request/response pair
pub type RequestId = u64;

/// Identity of one running agent turn-stream (`ch-<uuid>`)
///
/// A fresh id is generated for every launch and never reused, so anything
/// still referencing an old id is provably orphaned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Generate a new unique channel id
    pub fn generate() -> Self {
        Self(format!("ch-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The unit sent across a [`Transport`](crate::transport::Transport)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// A call expecting a correlated response
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_id: Option<ChannelId>,
        payload: serde_json::Value,
    },

    /// Answer to a request
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: RequestId,
        payload: ResponsePayload,
    },

    /// One ordered agent event belonging to a channel
    #[serde(rename_all = "camelCase")]
    StreamEvent {
        channel_id: ChannelId,
        seq: u64,
        event: AgentEvent,
        #[serde(default)]
        done: bool,
    },

    /// Abandon a pending request
    #[serde(rename_all = "camelCase")]
    Cancel { target_request_id: RequestId },

    /// Tear down a channel, optionally with an error
    #[serde(rename_all = "camelCase")]
    Close {
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Envelope {
    /// Build a stream-event envelope
    pub fn stream_event(channel_id: ChannelId, seq: u64, event: AgentEvent, done: bool) -> Self {
        Self::StreamEvent {
            channel_id,
            seq,
            event,
            done,
        }
    }

    /// Short variant name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::StreamEvent { .. } => "stream-event",
            Envelope::Cancel { .. } => "cancel",
            Envelope::Close { .. } => "close",
        }
    }
}

/// Response body: either a success payload or `{type: "error", error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Failure(ResponseError),
    Success(serde_json::Value),
}

/// Error body of a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseError {
    Error { error: String },
}

impl ResponsePayload {
    pub fn ok(value: serde_json::Value) -> Self {
        Self::Success(value)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Failure(ResponseError::Error {
            error: message.into(),
        })
    }

    /// Convert into a `Result`, mapping error bodies to [`RuntimeError::Remote`]
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(ResponseError::Error { error }) => Err(RuntimeError::Remote(error)),
        }
    }
}

/// A stream event as yielded to consumers of a channel
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub channel_id: ChannelId,
    /// Per-channel sequence number assigned by the producer
    pub seq: u64,
    pub event: AgentEvent,
    /// Set on the final event of a turn
    pub done: bool,
}

/// Events emitted by the agent backend during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streamed assistant text
    AssistantText { text: String },

    /// A tool call the backend runs without confirmation
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// A side-effecting tool call that needs the user's approval
    #[serde(rename_all = "camelCase")]
    PermissionRequest {
        tool_use_id: String,
        tool_name: String,
        inputs: serde_json::Value,
        #[serde(default)]
        suggestions: Vec<serde_json::Value>,
    },

    /// Result of a tool call
    ToolResult(ToolResult),

    /// Context compaction started (system event)
    Compacting,

    /// Context compaction finished
    Compacted,

    /// Terminal event of a turn
    #[serde(rename_all = "camelCase")]
    Result {
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    /// Backend-reported error inside a turn
    Error { message: String },
}

/// Request payloads the session sends to the agent backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start a new turn-stream on a fresh channel
    #[serde(rename_all = "camelCase")]
    Launch { channel_id: ChannelId, prompt: String },

    /// Additional user input on a live channel
    #[serde(rename_all = "camelCase")]
    UserMessage {
        channel_id: ChannelId,
        text: String,
        /// True for continuation messages the runtime generated itself
        #[serde(default)]
        synthetic: bool,
    },

    /// Answer to a permission request
    #[serde(rename_all = "camelCase")]
    PermissionResponse {
        channel_id: ChannelId,
        tool_use_id: String,
        result: PermissionResult,
    },

    /// Stop the running turn
    #[serde(rename_all = "camelCase")]
    Interrupt { channel_id: ChannelId },
}

impl ControlMessage {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Current time as Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
