//! Local confirmation policy
//!
//! The backend decides which tool calls need approval. This policy decides
//! which of those the runtime may answer on the user's behalf:
//! - Tool categorization (ReadOnly, Mutating)
//! - Explicit auto-approve / require-confirm lists
//! - YOLO categories that are approved wholesale
//! - Timeout handling with a configurable action

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Tool category for determining confirmation requirements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Read-only operations (read, glob, grep, bash_output)
    ReadOnly,
    /// Mutating operations (bash, write, edit, kill_shell)
    Mutating,
}

impl ToolCategory {
    /// Classify a tool by its name
    pub fn from_tool_name(tool_name: &str) -> Self {
        match tool_name {
            "read" | "glob" | "grep" | "ls" | "bash_output" => ToolCategory::ReadOnly,
            // Unknown tools are treated as mutating
            _ => ToolCategory::Mutating,
        }
    }
}

/// Action to take when a permission request times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Deny the tool call on timeout
    #[default]
    Reject,
    /// Approve the tool call with its original inputs
    AutoApprove,
}

/// Confirmation policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfirmationPolicy {
    /// Whether the runtime answers anything itself (default: false, every
    /// request goes to the user)
    pub enabled: bool,

    /// Tools that are always auto-approved
    pub auto_approve_tools: HashSet<String>,

    /// Tools that always go to the user, even in YOLO categories
    pub require_confirm_tools: HashSet<String>,

    /// Categories approved without asking
    pub yolo_categories: HashSet<ToolCategory>,

    /// Pending requests older than this are resolved by `timeout_action`
    pub timeout_ms: Option<u64>,

    pub timeout_action: TimeoutAction,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_approve_tools: HashSet::new(),
            require_confirm_tools: HashSet::new(),
            yolo_categories: HashSet::new(),
            timeout_ms: None,
            timeout_action: TimeoutAction::Reject,
        }
    }
}

impl ConfirmationPolicy {
    /// Create a policy that auto-approves read-only tools
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_yolo_categories(mut self, categories: impl IntoIterator<Item = ToolCategory>) -> Self {
        self.yolo_categories = categories.into_iter().collect();
        self
    }

    pub fn with_auto_approve_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.auto_approve_tools = tools.into_iter().collect();
        self
    }

    pub fn with_require_confirm_tools(mut self, tools: impl IntoIterator<Item = String>) -> Self {
        self.require_confirm_tools = tools.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64, action: TimeoutAction) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self.timeout_action = action;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Whether a permission request for this tool can be approved without the user
    pub fn auto_approves(&self, tool_name: &str) -> bool {
        if !self.enabled {
            return false;
        }

        // Explicit require list wins over everything
        if self.require_confirm_tools.contains(tool_name) {
            return false;
        }

        if self.auto_approve_tools.contains(tool_name) {
            return true;
        }

        let category = ToolCategory::from_tool_name(tool_name);
        if self.yolo_categories.contains(&category) {
            return true;
        }

        matches!(category, ToolCategory::ReadOnly)
    }
}
