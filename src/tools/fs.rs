//! read, write and edit

use super::types::{
    EditInput, EditOutput, ReadInput, ReadOutput, ToolError, ToolErrorCode, WriteInput,
    WriteOutput,
};
use super::workspace::Workspace;
use crate::config::ToolLimits;
use crate::error::RuntimeError;
use crate::snapshot::{SnapshotKind, SnapshotStore};
use std::io::ErrorKind;
use std::path::Path;

/// Output of a mutating tool plus the snapshot guarding it
#[derive(Debug)]
pub(super) struct Mutation<T> {
    pub output: T,
    pub snapshot_id: Option<String>,
}

fn truncate_line(line: &str, max_chars: usize) -> (String, bool) {
    let body = line.strip_suffix('\n').unwrap_or(line);
    if body.chars().count() <= max_chars {
        return (line.to_string(), false);
    }
    let mut cut: String = body.chars().take(max_chars).collect();
    cut.push_str("...");
    if line.ends_with('\n') {
        cut.push('\n');
    }
    (cut, true)
}

pub(super) async fn read(
    workspace: &Workspace,
    limits: &ToolLimits,
    input: &ReadInput,
) -> Result<ReadOutput, ToolError> {
    let path = workspace.resolve(&input.path)?;
    if path.is_dir() {
        return Err(ToolError::invalid_input(format!("{} is a directory", input.path))
            .with_hint("Use glob to list directory contents"));
    }
    if input.limit == Some(0) {
        return Err(ToolError::invalid_input("limit must be at least 1"));
    }

    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ToolError::from_io(&e, &input.path))?;
    let text = String::from_utf8_lossy(&bytes);

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let total_lines = lines.len();
    let offset = input.offset.unwrap_or(0);
    let limit = input.limit.unwrap_or(limits.max_read_lines).min(limits.max_read_lines);

    let mut truncated = offset + limit < total_lines;
    let mut content = String::new();
    for line in lines.iter().skip(offset).take(limit) {
        let (line, cut) = truncate_line(line, limits.max_line_length);
        truncated |= cut;
        content.push_str(&line);
    }

    Ok(ReadOutput {
        content,
        total_lines,
        truncated,
    })
}

/// Record `content` as the snapshot of `path` for `tool_use_id`
async fn snapshot_before(
    snapshots: &SnapshotStore,
    tool_use_id: &str,
    path: &Path,
    kind: SnapshotKind,
    content: Vec<u8>,
) -> Result<String, ToolError> {
    match snapshots.record_snapshot(tool_use_id, path, kind, content).await {
        Ok(()) => Ok(tool_use_id.to_string()),
        Err(RuntimeError::SnapshotExists(id)) => Err(ToolError::invalid_input(format!(
            "Tool use '{}' already modified a file",
            id
        ))
        .with_hint("Each mutation needs its own tool use id")),
        Err(e) => Err(ToolError::new(ToolErrorCode::ExecutionFailed, e.to_string())),
    }
}

/// Current bytes of `path`, `None` when it does not exist yet
async fn read_existing(path: &Path, display: &str) -> Result<Option<Vec<u8>>, ToolError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ToolError::from_io(&e, display)),
    }
}

pub(super) async fn write(
    workspace: &Workspace,
    snapshots: &SnapshotStore,
    tool_use_id: &str,
    input: &WriteInput,
) -> Result<Mutation<WriteOutput>, ToolError> {
    let path = workspace.resolve(&input.path)?;
    if path.is_dir() {
        return Err(ToolError::invalid_input(format!("{} is a directory", input.path)));
    }

    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if input.create_dirs {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::from_io(&e, &input.path))?;
            } else {
                return Err(ToolError::new(
                    ToolErrorCode::NotFound,
                    format!("Parent directory of {} does not exist", input.path),
                )
                .with_hint("Set createDirs to true to create it"));
            }
        }
    }

    let _guard = snapshots.lock_path(&path).await;
    let snapshot_id = match read_existing(&path, &input.path).await? {
        Some(before) => Some(
            snapshot_before(snapshots, tool_use_id, &path, SnapshotKind::Write, before).await?,
        ),
        None => None,
    };

    if let Err(e) = tokio::fs::write(&path, input.content.as_bytes()).await {
        if snapshot_id.is_some() {
            snapshots.evict(tool_use_id).await;
        }
        return Err(ToolError::from_io(&e, &input.path));
    }

    tracing::debug!(path = %path.display(), bytes = input.content.len(), "File written");
    Ok(Mutation {
        output: WriteOutput {
            path: workspace.display_path(&path),
            bytes_written: input.content.len(),
            created: snapshot_id.is_none(),
        },
        snapshot_id,
    })
}

pub(super) async fn edit(
    workspace: &Workspace,
    snapshots: &SnapshotStore,
    tool_use_id: &str,
    input: &EditInput,
) -> Result<Mutation<EditOutput>, ToolError> {
    if input.old_string.is_empty() {
        return Err(ToolError::invalid_input("oldString must not be empty")
            .with_hint("Use write to create or replace a whole file"));
    }
    if input.old_string == input.new_string {
        return Err(ToolError::invalid_input("oldString and newString are identical"));
    }

    let path = workspace.resolve(&input.path)?;
    // Held from the read until the write so concurrent edits of one file
    // apply on top of each other
    let _guard = snapshots.lock_path(&path).await;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| ToolError::from_io(&e, &input.path))?;
    let content = String::from_utf8(bytes).map_err(|_| {
        ToolError::invalid_input(format!("{} is not valid UTF-8 text", input.path))
    })?;

    let matches = content.matches(input.old_string.as_str()).count();
    match matches {
        0 => {
            return Err(ToolError::new(
                ToolErrorCode::NoMatch,
                format!("oldString not found in {}", input.path),
            )
            .with_hint("Read the file again; whitespace and indentation must match exactly"))
        }
        1 => {}
        n => {
            return Err(ToolError::new(
                ToolErrorCode::MultipleMatches,
                format!("oldString matches {} locations in {}", n, input.path),
            )
            .with_hint("Include more surrounding context so the match is unique"))
        }
    }

    let updated = content.replacen(input.old_string.as_str(), &input.new_string, 1);
    let snapshot_id = snapshot_before(
        snapshots,
        tool_use_id,
        &path,
        SnapshotKind::Edit,
        content.into_bytes(),
    )
    .await?;

    if let Err(e) = tokio::fs::write(&path, updated.as_bytes()).await {
        snapshots.evict(tool_use_id).await;
        return Err(ToolError::from_io(&e, &input.path));
    }

    tracing::debug!(path = %path.display(), "File edited");
    Ok(Mutation {
        output: EditOutput {
            path: workspace.display_path(&path),
            replacements: 1,
        },
        snapshot_id: Some(snapshot_id),
    })
}
