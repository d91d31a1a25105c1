//! Permission arbiter
//!
//! Tracks permission requests raised by the backend until the user (or the
//! local policy) resolves them. Requests are ordered by registration and tied
//! to the channel that raised them, so an interrupted channel's requests can
//! be dropped in one step.

use super::policy::TimeoutAction;
use crate::error::{Result, RuntimeError};
use crate::types::{now_millis, ChannelId};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};

/// A tool call waiting for the user's approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Arbiter-assigned id (`perm-<uuid>`)
    pub id: String,
    pub channel_id: ChannelId,
    pub tool_use_id: String,
    /// Later tool uses with the same call, answered together with this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_tool_use_ids: Vec<String>,
    pub tool_name: String,
    pub inputs: serde_json::Value,
    /// Opaque policy hints from the backend
    #[serde(default)]
    pub suggestions: Vec<serde_json::Value>,
    /// Unix milliseconds
    pub created_at: u64,
}

impl PermissionRequest {
    pub fn new(
        channel_id: ChannelId,
        tool_use_id: impl Into<String>,
        tool_name: impl Into<String>,
        inputs: serde_json::Value,
        suggestions: Vec<serde_json::Value>,
    ) -> Self {
        Self {
            id: format!("perm-{}", uuid::Uuid::new_v4()),
            channel_id,
            tool_use_id: tool_use_id.into(),
            merged_tool_use_ids: Vec::new(),
            tool_name: tool_name.into(),
            inputs,
            suggestions,
            created_at: now_millis(),
        }
    }

    /// Every tool use waiting on this request, first one first
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.tool_use_id.as_str())
            .chain(self.merged_tool_use_ids.iter().map(String::as_str))
    }

    fn same_call(&self, other: &PermissionRequest) -> bool {
        self.channel_id == other.channel_id
            && self.tool_name == other.tool_name
            && self.inputs == other.inputs
    }
}

/// The user's answer to a permission request
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Allow, optionally with edited inputs (the original inputs otherwise)
    Accept {
        updated_inputs: Option<serde_json::Value>,
        updated_permissions: Vec<serde_json::Value>,
    },
    /// Deny; `interrupt` also stops the running turn
    Deny { message: String, interrupt: bool },
}

impl PermissionDecision {
    /// Accept with the original inputs
    pub fn accept() -> Self {
        Self::Accept {
            updated_inputs: None,
            updated_permissions: Vec::new(),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
            interrupt: false,
        }
    }
}

/// Wire form of a resolution, sent back to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionResult {
    #[serde(rename_all = "camelCase")]
    Allow {
        updated_input: serde_json::Value,
        #[serde(default)]
        updated_permissions: Vec<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Deny {
        message: String,
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionResult {
    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionResult::Allow { .. })
    }

    fn from_decision(request: &PermissionRequest, decision: PermissionDecision) -> Self {
        match decision {
            PermissionDecision::Accept {
                updated_inputs,
                updated_permissions,
            } => PermissionResult::Allow {
                updated_input: updated_inputs.unwrap_or_else(|| request.inputs.clone()),
                updated_permissions,
            },
            PermissionDecision::Deny { message, interrupt } => {
                PermissionResult::Deny { message, interrupt }
            }
        }
    }
}

/// A resolved request together with the result to send
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request: PermissionRequest,
    pub result: PermissionResult,
}

/// Outcome of [`PermissionArbiter::register`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    /// False when an identical pending request already existed
    pub created: bool,
}

/// Arbiter activity, published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterEvent {
    Registered { request: PermissionRequest },
    Resolved { id: String, allowed: bool },
    Discarded { channel_id: ChannelId, count: usize },
    Expired { id: String, action: TimeoutAction },
}

struct Entry {
    request: PermissionRequest,
    registered_at: Instant,
}

/// Holds pending permission requests in registration order
pub struct PermissionArbiter {
    pending: RwLock<Vec<Entry>>,
    event_tx: broadcast::Sender<ArbiterEvent>,
}

impl Default for PermissionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionArbiter {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            pending: RwLock::new(Vec::new()),
            event_tx,
        }
    }

    /// Subscribe to arbiter events
    pub fn subscribe(&self) -> broadcast::Receiver<ArbiterEvent> {
        self.event_tx.subscribe()
    }

    /// Register a request; an identical pending request absorbs its tool use
    /// instead
    pub async fn register(&self, request: PermissionRequest) -> Registration {
        let mut pending = self.pending.write().await;
        if let Some(existing) = pending.iter_mut().find(|e| e.request.same_call(&request)) {
            if !existing.request.tool_use_ids().any(|id| id == request.tool_use_id) {
                existing
                    .request
                    .merged_tool_use_ids
                    .push(request.tool_use_id.clone());
            }
            tracing::debug!(
                id = %existing.request.id,
                tool = %request.tool_name,
                tool_use_id = %request.tool_use_id,
                "Duplicate permission request, merged into existing"
            );
            return Registration {
                id: existing.request.id.clone(),
                created: false,
            };
        }

        let id = request.id.clone();
        tracing::debug!(
            id = %id,
            channel_id = %request.channel_id,
            tool = %request.tool_name,
            "Permission request registered"
        );
        pending.push(Entry {
            request: request.clone(),
            registered_at: Instant::now(),
        });
        drop(pending);

        let _ = self.event_tx.send(ArbiterEvent::Registered { request });
        Registration { id, created: true }
    }

    /// Pending requests in registration order, filtered by channel when known
    pub async fn requests_for(&self, channel_id: Option<&ChannelId>) -> Vec<PermissionRequest> {
        self.pending
            .read()
            .await
            .iter()
            .filter(|e| channel_id.map_or(true, |c| &e.request.channel_id == c))
            .map(|e| e.request.clone())
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<PermissionRequest> {
        self.pending
            .read()
            .await
            .iter()
            .find(|e| e.request.id == id)
            .map(|e| e.request.clone())
    }

    /// Find the pending request raised for a tool use
    pub async fn find_by_tool_use(&self, tool_use_id: &str) -> Option<PermissionRequest> {
        self.pending
            .read()
            .await
            .iter()
            .find(|e| e.request.tool_use_ids().any(|id| id == tool_use_id))
            .map(|e| e.request.clone())
    }

    /// Resolve a request exactly once
    pub async fn resolve(&self, id: &str, decision: PermissionDecision) -> Result<Resolution> {
        let request = {
            let mut pending = self.pending.write().await;
            let pos = pending
                .iter()
                .position(|e| e.request.id == id)
                .ok_or_else(|| RuntimeError::PermissionNotFound(id.to_string()))?;
            pending.remove(pos).request
        };

        let result = PermissionResult::from_decision(&request, decision);
        tracing::debug!(id = %id, allowed = result.is_allow(), "Permission request resolved");
        let _ = self.event_tx.send(ArbiterEvent::Resolved {
            id: id.to_string(),
            allowed: result.is_allow(),
        });
        Ok(Resolution { request, result })
    }

    /// Drop every request of a channel; returns how many were discarded
    pub async fn discard_channel(&self, channel_id: &ChannelId) -> usize {
        let count = {
            let mut pending = self.pending.write().await;
            let before = pending.len();
            pending.retain(|e| &e.request.channel_id != channel_id);
            before - pending.len()
        };

        if count > 0 {
            tracing::debug!(channel_id = %channel_id, count, "Discarded permission requests");
            let _ = self.event_tx.send(ArbiterEvent::Discarded {
                channel_id: channel_id.clone(),
                count,
            });
        }
        count
    }

    /// Resolve every request older than `timeout` with `action`
    pub async fn expire(&self, timeout: Duration, action: TimeoutAction) -> Vec<Resolution> {
        let expired: Vec<PermissionRequest> = {
            let mut pending = self.pending.write().await;
            let mut expired = Vec::new();
            pending.retain(|e| {
                if e.registered_at.elapsed() >= timeout {
                    expired.push(e.request.clone());
                    false
                } else {
                    true
                }
            });
            expired
        };

        expired
            .into_iter()
            .map(|request| {
                let decision = match action {
                    TimeoutAction::Reject => PermissionDecision::Deny {
                        message: "Permission request timed out".to_string(),
                        interrupt: false,
                    },
                    TimeoutAction::AutoApprove => PermissionDecision::accept(),
                };
                tracing::info!(id = %request.id, tool = %request.tool_name, ?action, "Permission request expired");
                let _ = self.event_tx.send(ArbiterEvent::Expired {
                    id: request.id.clone(),
                    action,
                });
                let result = PermissionResult::from_decision(&request, decision);
                Resolution { request, result }
            })
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(channel: &str, tool_use: &str, inputs: serde_json::Value) -> PermissionRequest {
        PermissionRequest::new(ChannelId::from(channel), tool_use, "bash", inputs, vec![])
    }

    #[tokio::test]
    async fn test_register_and_list_in_order() {
        let arbiter = PermissionArbiter::new();
        let a = arbiter.register(request("ch-1", "t1", json!({"command": "ls"}))).await;
        let b = arbiter.register(request("ch-1", "t2", json!({"command": "pwd"}))).await;
        assert!(a.created && b.created);

        let listed = arbiter.requests_for(Some(&ChannelId::from("ch-1"))).await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, a.id);
        assert_eq!(listed[1].id, b.id);
        assert!(a.id.starts_with("perm-"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_returns_existing_id() {
        let arbiter = PermissionArbiter::new();
        let first = arbiter.register(request("ch-1", "t1", json!({"command": "ls"}))).await;
        let second = arbiter.register(request("ch-1", "t9", json!({"command": "ls"}))).await;
        assert_eq!(first.id, second.id);
        assert!(!second.created);
        assert_eq!(arbiter.pending_count().await, 1);

        // The second tool use rides along and is answered by the same resolution
        let pending = arbiter.get(&first.id).await.unwrap();
        assert_eq!(pending.tool_use_ids().collect::<Vec<_>>(), vec!["t1", "t9"]);
        assert_eq!(arbiter.find_by_tool_use("t9").await.unwrap().id, first.id);

        // Re-registering a known tool use does not duplicate it
        arbiter.register(request("ch-1", "t9", json!({"command": "ls"}))).await;
        let resolution = arbiter
            .resolve(&first.id, PermissionDecision::accept())
            .await
            .unwrap();
        assert_eq!(resolution.request.merged_tool_use_ids, vec!["t9"]);

        // Same inputs on a different channel are distinct
        let other = arbiter.register(request("ch-2", "t1", json!({"command": "ls"}))).await;
        assert!(other.created);
    }

    #[tokio::test]
    async fn test_requests_for_filters_by_channel() {
        let arbiter = PermissionArbiter::new();
        arbiter.register(request("ch-1", "t1", json!(1))).await;
        arbiter.register(request("ch-2", "t2", json!(2))).await;

        assert_eq!(arbiter.requests_for(Some(&ChannelId::from("ch-2"))).await.len(), 1);
        assert_eq!(arbiter.requests_for(Some(&ChannelId::from("ch-3"))).await.len(), 0);
        assert_eq!(arbiter.requests_for(None).await.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_allow_uses_original_inputs() {
        let arbiter = PermissionArbiter::new();
        let reg = arbiter.register(request("ch-1", "t1", json!({"command": "ls"}))).await;

        let resolution = arbiter.resolve(&reg.id, PermissionDecision::accept()).await.unwrap();
        assert_eq!(
            resolution.result,
            PermissionResult::Allow {
                updated_input: json!({"command": "ls"}),
                updated_permissions: vec![],
            }
        );
        assert_eq!(arbiter.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_allow_with_updated_inputs() {
        let arbiter = PermissionArbiter::new();
        let reg = arbiter.register(request("ch-1", "t1", json!({"command": "rm -rf x"}))).await;

        let decision = PermissionDecision::Accept {
            updated_inputs: Some(json!({"command": "rm -r x"})),
            updated_permissions: vec![json!({"rule": "bash(rm:*)"})],
        };
        let resolution = arbiter.resolve(&reg.id, decision).await.unwrap();
        let wire = serde_json::to_value(&resolution.result).unwrap();
        assert_eq!(wire["behavior"], "allow");
        assert_eq!(wire["updatedInput"]["command"], "rm -r x");
        assert_eq!(wire["updatedPermissions"][0]["rule"], "bash(rm:*)");
    }

    #[tokio::test]
    async fn test_second_resolution_is_error() {
        let arbiter = PermissionArbiter::new();
        let reg = arbiter.register(request("ch-1", "t1", json!({}))).await;

        arbiter.resolve(&reg.id, PermissionDecision::deny("no")).await.unwrap();
        let err = arbiter
            .resolve(&reg.id, PermissionDecision::accept())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PermissionNotFound(_)));
    }

    #[tokio::test]
    async fn test_deny_wire_shape() {
        let result = PermissionResult::Deny {
            message: "not allowed".to_string(),
            interrupt: true,
        };
        let wire = serde_json::to_value(&result).unwrap();
        assert_eq!(
            wire,
            json!({"behavior": "deny", "message": "not allowed", "interrupt": true})
        );
    }

    #[tokio::test]
    async fn test_discard_channel() {
        let arbiter = PermissionArbiter::new();
        let mut events = arbiter.subscribe();
        arbiter.register(request("ch-old", "t1", json!(1))).await;
        arbiter.register(request("ch-old", "t2", json!(2))).await;
        arbiter.register(request("ch-new", "t3", json!(3))).await;

        let removed = arbiter.discard_channel(&ChannelId::from("ch-old")).await;
        assert_eq!(removed, 2);
        assert_eq!(arbiter.pending_count().await, 1);

        // Three registrations, then one discard event
        for _ in 0..3 {
            assert!(matches!(events.recv().await.unwrap(), ArbiterEvent::Registered { .. }));
        }
        match events.recv().await.unwrap() {
            ArbiterEvent::Discarded { channel_id, count } => {
                assert_eq!(channel_id.as_str(), "ch-old");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_rejects_old_requests() {
        let arbiter = PermissionArbiter::new();
        arbiter.register(request("ch-1", "t1", json!(1))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        arbiter.register(request("ch-1", "t2", json!(2))).await;

        let expired = arbiter
            .expire(Duration::from_millis(20), TimeoutAction::Reject)
            .await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].request.tool_use_id, "t1");
        assert!(!expired[0].result.is_allow());
        assert_eq!(arbiter.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_expire_auto_approve() {
        let arbiter = PermissionArbiter::new();
        arbiter.register(request("ch-1", "t1", json!({"x": 1}))).await;

        let expired = arbiter.expire(Duration::ZERO, TimeoutAction::AutoApprove).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(
            expired[0].result,
            PermissionResult::Allow {
                updated_input: json!({"x": 1}),
                updated_permissions: vec![],
            }
        );
    }

    #[tokio::test]
    async fn test_find_by_tool_use() {
        let arbiter = PermissionArbiter::new();
        let reg = arbiter.register(request("ch-1", "toolu_1", json!({}))).await;
        let found = arbiter.find_by_tool_use("toolu_1").await.unwrap();
        assert_eq!(found.id, reg.id);
        assert!(arbiter.find_by_tool_use("missing").await.is_none());
    }
}
