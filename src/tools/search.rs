//! glob and grep
//!
//! Both walk the tree with `ignore`, so `.gitignore`d and hidden files are
//! skipped the way developers expect. Walking is blocking and runs on the
//! blocking pool.

use super::types::{GlobInput, GlobOutput, GrepInput, GrepMatch, GrepOutput, ToolError, ToolErrorCode};
use super::workspace::Workspace;
use crate::config::ToolLimits;
use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use regex::RegexBuilder;
use std::path::{Path, PathBuf};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn compile_glob(pattern: &str) -> Result<Pattern, ToolError> {
    Pattern::new(pattern).map_err(|e| {
        ToolError::invalid_input(format!("Invalid glob pattern '{}': {}", pattern, e))
    })
}

fn search_root(workspace: &Workspace, path: Option<&str>) -> Result<PathBuf, ToolError> {
    let root = workspace.resolve(path.unwrap_or("."))?;
    if !root.exists() {
        return Err(ToolError::new(
            ToolErrorCode::NotFound,
            format!("{} does not exist", path.unwrap_or(".")),
        ));
    }
    Ok(root)
}

/// Files under `root` in a stable order
fn walk_files(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkBuilder::new(root)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .map(|entry| entry.into_path())
}

async fn run_blocking<T, F>(f: F) -> Result<T, ToolError>
where
    F: FnOnce() -> Result<T, ToolError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        ToolError::new(ToolErrorCode::ExecutionFailed, format!("Search task failed: {}", e))
    })?
}

pub(super) async fn glob(
    workspace: &Workspace,
    limits: &ToolLimits,
    input: &GlobInput,
) -> Result<GlobOutput, ToolError> {
    let pattern = compile_glob(&input.pattern)?;
    let root = search_root(workspace, input.path.as_deref())?;
    let workspace = workspace.clone();
    let max = limits.max_glob_results;

    run_blocking(move || {
        let mut paths = Vec::new();
        let mut truncated = false;
        for file in walk_files(&root) {
            let Ok(relative) = file.strip_prefix(&root) else {
                continue;
            };
            if !pattern.matches_path_with(relative, MATCH_OPTIONS) {
                continue;
            }
            if paths.len() == max {
                truncated = true;
                break;
            }
            paths.push(workspace.display_path(&file));
        }
        Ok(GlobOutput { paths, truncated })
    })
    .await
}

pub(super) async fn grep(
    workspace: &Workspace,
    limits: &ToolLimits,
    input: &GrepInput,
) -> Result<GrepOutput, ToolError> {
    let regex = RegexBuilder::new(&input.pattern)
        .case_insensitive(input.case_insensitive)
        .build()
        .map_err(|e| ToolError::invalid_input(format!("Invalid regex: {}", e)))?;
    let file_pattern = input.file_pattern.as_deref().map(compile_glob).transpose()?;
    // Patterns without a separator match the file name at any depth
    let match_name_only = input
        .file_pattern
        .as_deref()
        .is_some_and(|p| !p.contains('/'));

    let root = search_root(workspace, input.path.as_deref())?;
    let workspace = workspace.clone();
    let max = limits.max_grep_matches;
    let max_line = limits.max_line_length;

    run_blocking(move || {
        let mut matches = Vec::new();
        let mut truncated = false;

        'files: for file in walk_files(&root) {
            if let Some(pattern) = &file_pattern {
                let candidate = if match_name_only {
                    file.file_name().map(Path::new)
                } else {
                    file.strip_prefix(&root).ok()
                };
                if !candidate.is_some_and(|c| pattern.matches_path_with(c, MATCH_OPTIONS)) {
                    continue;
                }
            }

            let Ok(bytes) = std::fs::read(&file) else {
                continue;
            };
            // Binary files are skipped
            if bytes.contains(&0) {
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);

            for (index, line) in text.lines().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                if matches.len() == max {
                    truncated = true;
                    break 'files;
                }
                let content = if line.chars().count() > max_line {
                    let mut cut: String = line.chars().take(max_line).collect();
                    cut.push_str("...");
                    cut
                } else {
                    line.to_string()
                };
                matches.push(GrepMatch {
                    file: workspace.display_path(&file),
                    line: index + 1,
                    content,
                });
            }
        }

        Ok(GrepOutput { matches, truncated })
    })
    .await
}
