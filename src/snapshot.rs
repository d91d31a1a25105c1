//! File snapshots for revertible tool writes
//!
//! Before `write` or `edit` mutates an existing file, the file's bytes are
//! captured under the tool use id that is about to change it. A snapshot can be
//! reverted exactly once and diffed against the file's current content.
//!
//! ## Design
//!
//! - One snapshot per tool use id, immutable once taken
//! - Creating a file that did not exist is not snapshotted
//! - Retention is capped by count; the oldest snapshots are evicted first
//! - Reverts of different tool use ids never wait on each other's file I/O
//! - Mutations of one path are serialized through [`SnapshotStore::lock_path`]

use crate::error::{Result, RuntimeError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Which tool mutation a snapshot guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Write,
    Edit,
}

/// Pre-mutation content of one file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub tool_use_id: String,
    pub path: PathBuf,
    pub kind: SnapshotKind,
    #[serde(skip)]
    content: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub reverted: bool,
}

impl Snapshot {
    /// The exact bytes the file held before the mutation
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }
}

#[derive(Default)]
struct Inner {
    snapshots: HashMap<String, Snapshot>,
    /// Insertion order for eviction
    order: VecDeque<String>,
}

/// Count-capped store of file snapshots keyed by tool use id
pub struct SnapshotStore {
    inner: Mutex<Inner>,
    path_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    max_snapshots: usize,
}

impl SnapshotStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            path_locks: Mutex::new(HashMap::new()),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Exclusive access to `path` for a read-modify-write cycle
    ///
    /// Holders of the guard are the only writers of the path among tools
    /// and reverts sharing this store.
    pub async fn lock_path(&self, path: impl AsRef<Path>) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.path_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(path.as_ref().to_path_buf())
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }

    /// Capture `path` before it is mutated by `tool_use_id`
    ///
    /// Returns `false` without storing anything when the file does not exist
    /// yet. A second snapshot for the same tool use id is an error.
    pub async fn create_snapshot(
        &self,
        tool_use_id: &str,
        path: impl AsRef<Path>,
        kind: SnapshotKind,
    ) -> Result<bool> {
        let path = path.as_ref();

        if self.inner.lock().await.snapshots.contains_key(tool_use_id) {
            return Err(RuntimeError::SnapshotExists(tool_use_id.to_string()));
        }

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(tool_use_id, path = %path.display(), "No snapshot for new file");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        self.record_snapshot(tool_use_id, path, kind, content).await?;
        Ok(true)
    }

    /// Store `content` as the pre-mutation bytes of `path`
    ///
    /// For callers that already hold the bytes their mutation was computed
    /// from, under [`SnapshotStore::lock_path`].
    pub async fn record_snapshot(
        &self,
        tool_use_id: &str,
        path: impl AsRef<Path>,
        kind: SnapshotKind,
        content: Vec<u8>,
    ) -> Result<()> {
        let path = path.as_ref();
        let mut inner = self.inner.lock().await;
        // A concurrent caller may have won the race while the file was read
        if inner.snapshots.contains_key(tool_use_id) {
            return Err(RuntimeError::SnapshotExists(tool_use_id.to_string()));
        }

        tracing::debug!(
            tool_use_id,
            path = %path.display(),
            size = content.len(),
            "Snapshot created"
        );
        inner.snapshots.insert(
            tool_use_id.to_string(),
            Snapshot {
                tool_use_id: tool_use_id.to_string(),
                path: path.to_path_buf(),
                kind,
                content,
                created_at: Utc::now(),
                reverted: false,
            },
        );
        inner.order.push_back(tool_use_id.to_string());
        self.evict_if_needed(&mut inner);
        Ok(())
    }

    /// Restore the captured bytes; returns the restored path
    pub async fn revert(&self, tool_use_id: &str) -> Result<PathBuf> {
        let (path, content) = {
            let mut inner = self.inner.lock().await;
            let snapshot = inner
                .snapshots
                .get_mut(tool_use_id)
                .ok_or_else(|| RuntimeError::SnapshotNotFound(tool_use_id.to_string()))?;
            if snapshot.reverted {
                return Err(RuntimeError::AlreadyReverted(tool_use_id.to_string()));
            }
            // Claimed before the write so a concurrent revert is rejected
            snapshot.reverted = true;
            (snapshot.path.clone(), snapshot.content.clone())
        };

        let _guard = self.lock_path(&path).await;
        if let Err(e) = tokio::fs::write(&path, &content).await {
            tracing::warn!(tool_use_id, path = %path.display(), error = %e, "Revert failed");
            if let Some(snapshot) = self.inner.lock().await.snapshots.get_mut(tool_use_id) {
                snapshot.reverted = false;
            }
            return Err(e.into());
        }

        tracing::info!(tool_use_id, path = %path.display(), "Snapshot reverted");
        Ok(path)
    }

    /// Unified diff from the snapshot to the file's current content
    pub async fn diff(&self, tool_use_id: &str) -> Result<String> {
        let snapshot = self
            .get(tool_use_id)
            .await
            .ok_or_else(|| RuntimeError::SnapshotNotFound(tool_use_id.to_string()))?;

        let current = match tokio::fs::read(&snapshot.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(generate_unified_diff(
            &String::from_utf8_lossy(&snapshot.content),
            &String::from_utf8_lossy(&current),
            &snapshot.path.display().to_string(),
        ))
    }

    pub async fn get(&self, tool_use_id: &str) -> Option<Snapshot> {
        self.inner.lock().await.snapshots.get(tool_use_id).cloned()
    }

    /// All snapshots, oldest first
    pub async fn list(&self) -> Vec<Snapshot> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.snapshots.get(id).cloned())
            .collect()
    }

    /// Whether a snapshot exists and has not been reverted
    pub async fn can_revert(&self, tool_use_id: &str) -> bool {
        self.inner
            .lock()
            .await
            .snapshots
            .get(tool_use_id)
            .is_some_and(|s| !s.reverted)
    }

    /// Drop a snapshot explicitly
    pub async fn evict(&self, tool_use_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.snapshots.remove(tool_use_id).is_some();
        if removed {
            inner.order.retain(|id| id != tool_use_id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn evict_if_needed(&self, inner: &mut Inner) {
        while inner.snapshots.len() > self.max_snapshots {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.snapshots.remove(&oldest);
            tracing::debug!(tool_use_id = %oldest, "Evicted oldest snapshot");
        }
    }
}

fn generate_unified_diff(old: &str, new: &str, path: &str) -> String {
    let diff = TextDiff::from_lines(old, new);
    let mut output = String::new();

    output.push_str(&format!("--- a/{} (snapshot)\n", path));
    output.push_str(&format!("+++ b/{} (current)\n", path));

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        output.push_str(&format!("{}", hunk));
    }

    output
}
