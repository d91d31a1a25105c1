//! Conversation transcript
//!
//! Entries are kept in the order events were applied. Tool uses and tool
//! results are keyed by `toolUseId`; a second result for the same id is
//! ignored so a replayed event can never duplicate it.

use crate::tools::ToolResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    User {
        text: String,
        /// Generated by the runtime (stall or compaction continuation)
        #[serde(default)]
        synthetic: bool,
    },
    AssistantText {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        result: ToolResult,
    },
    System {
        note: String,
    },
}

#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    tool_uses: HashSet<String>,
    tool_results: HashSet<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>, synthetic: bool) -> TranscriptEntry {
        let entry = TranscriptEntry::User {
            text: text.into(),
            synthetic,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Streamed text is merged into the assistant entry it continues
    pub fn push_assistant_text(&mut self, text: &str) -> TranscriptEntry {
        if let Some(TranscriptEntry::AssistantText { text: current }) = self.entries.last_mut() {
            current.push_str(text);
            return TranscriptEntry::AssistantText {
                text: current.clone(),
            };
        }
        let entry = TranscriptEntry::AssistantText {
            text: text.to_string(),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Returns `None` if this tool use is already recorded
    pub fn push_tool_use(
        &mut self,
        tool_use_id: &str,
        tool_name: &str,
        input: &serde_json::Value,
    ) -> Option<TranscriptEntry> {
        if !self.tool_uses.insert(tool_use_id.to_string()) {
            return None;
        }
        let entry = TranscriptEntry::ToolUse {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            input: input.clone(),
        };
        self.entries.push(entry.clone());
        Some(entry)
    }

    /// Returns `None` for a duplicate result
    pub fn push_tool_result(&mut self, result: &ToolResult) -> Option<TranscriptEntry> {
        if !self.tool_results.insert(result.tool_use_id.clone()) {
            tracing::debug!(tool_use_id = %result.tool_use_id, "Ignoring duplicate tool result");
            return None;
        }
        let entry = TranscriptEntry::ToolResult {
            result: result.clone(),
        };
        self.entries.push(entry.clone());
        Some(entry)
    }

    pub fn push_system(&mut self, note: impl Into<String>) -> TranscriptEntry {
        let entry = TranscriptEntry::System { note: note.into() };
        self.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn tool_result(&self, tool_use_id: &str) -> Option<&ToolResult> {
        self.entries.iter().find_map(|e| match e {
            TranscriptEntry::ToolResult { result } if result.tool_use_id == tool_use_id => {
                Some(result)
            }
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
