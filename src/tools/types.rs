//! Tool call parsing, schemas and results

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

// ============================================================================
// Tool kinds
// ============================================================================

/// Every tool the runtime can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    Read,
    Write,
    Edit,
    Bash,
    BashOutput,
    KillShell,
    Glob,
    Grep,
}

impl ToolKind {
    pub const ALL: [ToolKind; 8] = [
        ToolKind::Read,
        ToolKind::Write,
        ToolKind::Edit,
        ToolKind::Bash,
        ToolKind::BashOutput,
        ToolKind::KillShell,
        ToolKind::Glob,
        ToolKind::Grep,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::Read => "read",
            ToolKind::Write => "write",
            ToolKind::Edit => "edit",
            ToolKind::Bash => "bash",
            ToolKind::BashOutput => "bash_output",
            ToolKind::KillShell => "kill_shell",
            ToolKind::Glob => "glob",
            ToolKind::Grep => "grep",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::Read => "Read a text file from the workspace, optionally a window of lines",
            ToolKind::Write => "Write a file, replacing its content. Existing files can be reverted",
            ToolKind::Edit => "Replace exactly one occurrence of oldString with newString in a file",
            ToolKind::Bash => "Run a shell command and capture its output",
            ToolKind::BashOutput => "Read the accumulated output of a background command",
            ToolKind::KillShell => "Kill a background command",
            ToolKind::Glob => "Find files by glob pattern",
            ToolKind::Grep => "Search file contents with a regular expression",
        }
    }

    /// JSON Schema of the tool's input
    pub fn schema(&self) -> serde_json::Value {
        match self {
            ToolKind::Read => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path, relative to the workspace"},
                    "offset": {"type": "integer", "minimum": 0, "description": "Zero-based line to start at"},
                    "limit": {"type": "integer", "minimum": 1, "description": "Maximum lines to return"}
                },
                "required": ["path"]
            }),
            ToolKind::Write => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "createDirs": {"type": "boolean", "description": "Create missing parent directories"}
                },
                "required": ["path", "content"]
            }),
            ToolKind::Edit => json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "oldString": {"type": "string", "description": "Text to replace; must occur exactly once"},
                    "newString": {"type": "string"}
                },
                "required": ["path", "oldString", "newString"]
            }),
            ToolKind::Bash => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout": {"type": "integer", "minimum": 1, "description": "Timeout in milliseconds"},
                    "cwd": {"type": "string", "description": "Working directory, relative to the workspace"},
                    "runInBackground": {"type": "boolean"}
                },
                "required": ["command"]
            }),
            ToolKind::BashOutput => json!({
                "type": "object",
                "properties": {
                    "bashId": {"type": "string"},
                    "filter": {"type": "string", "description": "Regex; only matching lines are returned"}
                },
                "required": ["bashId"]
            }),
            ToolKind::KillShell => json!({
                "type": "object",
                "properties": {
                    "bashId": {"type": "string"}
                },
                "required": ["bashId"]
            }),
            ToolKind::Glob => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Glob relative to the search path, e.g. **/*.rs"},
                    "path": {"type": "string"}
                },
                "required": ["pattern"]
            }),
            ToolKind::Grep => json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression"},
                    "path": {"type": "string"},
                    "filePattern": {"type": "string", "description": "Glob the file name (or relative path) must match"},
                    "caseInsensitive": {"type": "boolean"}
                },
                "required": ["pattern"]
            }),
        }
    }

    /// Tool definition in the shape agent backends expect
    pub fn definition(&self) -> serde_json::Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "inputSchema": self.schema(),
        })
    }
}

// ============================================================================
// Inputs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadInput {
    pub path: String,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteInput {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub create_dirs: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditInput {
    pub path: String,
    pub old_string: String,
    pub new_string: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashInput {
    pub command: String,
    /// Milliseconds
    pub timeout: Option<u64>,
    pub cwd: Option<String>,
    pub run_in_background: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashOutputInput {
    pub bash_id: String,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillShellInput {
    pub bash_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobInput {
    pub pattern: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrepInput {
    pub pattern: String,
    pub path: Option<String>,
    pub file_pattern: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

/// A validated tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    Read(ReadInput),
    Write(WriteInput),
    Edit(EditInput),
    Bash(BashInput),
    BashOutput(BashOutputInput),
    KillShell(KillShellInput),
    Glob(GlobInput),
    Grep(GrepInput),
}

fn parse_input<T: DeserializeOwned>(kind: ToolKind, input: &serde_json::Value) -> Result<T, ToolError> {
    T::deserialize(input).map_err(|e| {
        ToolError::invalid_input(format!("Invalid input for '{}': {}", kind.name(), e))
            .with_hint(format!("Expected input matching: {}", kind.schema()))
    })
}

impl ToolCall {
    /// Parse a `(name, input)` pair into a typed call
    pub fn parse(name: &str, input: &serde_json::Value) -> Result<Self, ToolError> {
        let kind = ToolKind::from_name(name).ok_or_else(|| ToolError {
            code: ToolErrorCode::UnknownTool,
            message: format!("Unknown tool: {}", name),
            hint: Some(format!(
                "Available tools: {}",
                ToolKind::ALL.map(|k| k.name()).join(", ")
            )),
        })?;

        Ok(match kind {
            ToolKind::Read => ToolCall::Read(parse_input(kind, input)?),
            ToolKind::Write => ToolCall::Write(parse_input(kind, input)?),
            ToolKind::Edit => ToolCall::Edit(parse_input(kind, input)?),
            ToolKind::Bash => ToolCall::Bash(parse_input(kind, input)?),
            ToolKind::BashOutput => ToolCall::BashOutput(parse_input(kind, input)?),
            ToolKind::KillShell => ToolCall::KillShell(parse_input(kind, input)?),
            ToolKind::Glob => ToolCall::Glob(parse_input(kind, input)?),
            ToolKind::Grep => ToolCall::Grep(parse_input(kind, input)?),
        })
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolCall::Read(_) => ToolKind::Read,
            ToolCall::Write(_) => ToolKind::Write,
            ToolCall::Edit(_) => ToolKind::Edit,
            ToolCall::Bash(_) => ToolKind::Bash,
            ToolCall::BashOutput(_) => ToolKind::BashOutput,
            ToolCall::KillShell(_) => ToolKind::KillShell,
            ToolCall::Glob(_) => ToolKind::Glob,
            ToolCall::Grep(_) => ToolKind::Grep,
        }
    }
}

/// A tool call tied to the tool use that requested it
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub call: ToolCall,
}

impl ToolInvocation {
    pub fn parse(
        tool_use_id: impl Into<String>,
        name: &str,
        input: &serde_json::Value,
    ) -> Result<Self, ToolError> {
        Ok(Self {
            tool_use_id: tool_use_id.into(),
            call: ToolCall::parse(name, input)?,
        })
    }
}

// ============================================================================
// Outputs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOutput {
    pub content: String,
    pub total_lines: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutput {
    pub path: String,
    pub bytes_written: usize,
    /// True when the file did not exist before
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOutput {
    pub path: String,
    pub replacements: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashOutput {
    pub stdout: String,
    pub stderr: String,
    /// `null` for background runs that are still going
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bash_id: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashOutputOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillShellOutput {
    pub bash_id: String,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobOutput {
    pub paths: Vec<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrepMatch {
    pub file: String,
    /// One-based line number
    pub line: usize,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrepOutput {
    pub matches: Vec<GrepMatch>,
    pub truncated: bool,
}

// ============================================================================
// Errors and results
// ============================================================================

/// Machine-readable tool error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    InvalidInput,
    UnknownTool,
    NoMatch,
    MultipleMatches,
    NotFound,
    PermissionDenied,
    ExecutionFailed,
}

/// Structured tool error, surfaced verbatim to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvalidInput, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Map an I/O failure on `path` to a tool error
    pub fn from_io(err: &std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::new(
                ToolErrorCode::NotFound,
                format!("{}: {}", path, err),
            )
            .with_hint("Check the path with glob before retrying"),
            std::io::ErrorKind::PermissionDenied => Self::new(
                ToolErrorCode::PermissionDenied,
                format!("{}: {}", path, err),
            ),
            _ => Self::new(ToolErrorCode::ExecutionFailed, format!("{}: {}", path, err)),
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Result of one tool invocation, as reported back to the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub tool_name: String,
    pub is_error: bool,
    /// Typed output of the tool; `null` on error
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    /// Snapshot guarding this mutation, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub can_revert: bool,
}

impl ToolResult {
    pub fn success(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            is_error: false,
            output,
            error: None,
            snapshot_id: None,
            can_revert: false,
        }
    }

    pub fn failure(
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: ToolError,
    ) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            tool_name: tool_name.into(),
            is_error: true,
            output: serde_json::Value::Null,
            error: Some(error),
            snapshot_id: None,
            can_revert: false,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self.can_revert = true;
        self
    }

    /// Decode the output into its typed form
    pub fn output_as<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.output).ok()
    }

    pub fn error_code(&self) -> Option<ToolErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
            assert_eq!(kind.schema()["type"], "object");
        }
        assert_eq!(ToolKind::from_name("ls"), None);
    }

    #[test]
    fn test_parse_edit() {
        let call = ToolCall::parse(
            "edit",
            &json!({"path": "a.rs", "oldString": "foo", "newString": "bar"}),
        )
        .unwrap();
        assert_eq!(
            call,
            ToolCall::Edit(EditInput {
                path: "a.rs".to_string(),
                old_string: "foo".to_string(),
                new_string: "bar".to_string(),
            })
        );
        assert_eq!(call.kind(), ToolKind::Edit);
    }

    #[test]
    fn test_parse_missing_field() {
        let err = ToolCall::parse("write", &json!({"path": "a.txt"})).unwrap_err();
        assert_eq!(err.code, ToolErrorCode::InvalidInput);
        assert!(err.message.contains("content"));
        assert!(err.hint.is_some());
    }

    #[test]
    fn test_parse_unknown_tool() {
        let err = ToolCall::parse("teleport", &json!({})).unwrap_err();
        assert_eq!(err.code, ToolErrorCode::UnknownTool);
        assert!(err.hint.unwrap().contains("bash_output"));
    }

    #[test]
    fn test_parse_grep_defaults() {
        let call = ToolCall::parse("grep", &json!({"pattern": "TODO"})).unwrap();
        let ToolCall::Grep(input) = call else {
            panic!("expected grep");
        };
        assert!(!input.case_insensitive);
        assert!(input.path.is_none());
    }

    #[test]
    fn test_error_code_wire_format() {
        let err = ToolError::new(ToolErrorCode::MultipleMatches, "3 matches");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "MULTIPLE_MATCHES");
        assert!(json.get("hint").is_none());
    }

    #[test]
    fn test_tool_result_shape() {
        let result = ToolResult::success("toolu_1", "write", json!({"path": "a"}))
            .with_snapshot("toolu_1");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["toolUseId"], "toolu_1");
        assert_eq!(json["isError"], false);
        assert_eq!(json["snapshotId"], "toolu_1");
        assert_eq!(json["canRevert"], true);

        let back: ToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
