//! Workspace sandbox for tool paths

use super::types::ToolError;
use std::path::{Component, Path, PathBuf};

/// Root directory every tool path must stay inside
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

/// Lexically resolve `.` and `..` without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // Canonicalize to handle symlinks (e.g., /var -> /private/var on macOS)
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative or absolute path, rejecting anything outside the root
    ///
    /// The path does not have to exist. Symlinks are followed for the part of
    /// the path that does exist, so a link pointing out of the workspace is
    /// rejected too.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        if path.trim().is_empty() {
            return Err(ToolError::invalid_input("path must not be empty"));
        }

        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined);

        if !normalized.starts_with(&self.root) {
            return Err(escape_error(path));
        }

        let mut ancestor = normalized.as_path();
        while !ancestor.exists() {
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }
        if let Ok(canonical) = ancestor.canonicalize() {
            if !canonical.starts_with(&self.root) {
                return Err(escape_error(path));
            }
        }

        Ok(normalized)
    }

    /// Path relative to the root, for display in tool output
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

fn escape_error(path: &str) -> ToolError {
    ToolError::invalid_input(format!("Path escapes workspace: {}", path))
        .with_hint("Use a path inside the workspace root")
}
