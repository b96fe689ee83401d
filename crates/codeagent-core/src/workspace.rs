//! Workspace path containment.
//!
//! Every filesystem path a tool touches is resolved through [`Workspace`],
//! which confines it to a single root directory.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Path escapes workspace: {}", .0.display())]
    PathEscapesWorkspace(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A directory that confines all file access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open a workspace, creating the root directory if it is missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    /// Wrap a root without touching the filesystem.
    ///
    /// The root is canonicalized when it exists and normalized lexically
    /// otherwise.
    pub fn at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| normalize(root));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path against the root.
    ///
    /// Relative paths are joined to the root and `..` segments are folded
    /// lexically. The result must stay under the root, and so must the
    /// target of every symlink along the way.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, WorkspaceError> {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = normalize(&joined);
        if !resolved.starts_with(&self.root) {
            return Err(WorkspaceError::PathEscapesWorkspace(path.to_path_buf()));
        }
        self.check_symlinks(&resolved, path)?;
        Ok(resolved)
    }

    /// Whether `path` resolves inside the workspace.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.resolve(path).is_ok()
    }

    /// Render a path relative to the root, for transcripts.
    pub fn relative(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }

    fn check_symlinks(&self, resolved: &Path, requested: &Path) -> Result<(), WorkspaceError> {
        let Ok(rest) = resolved.strip_prefix(&self.root) else {
            return Err(WorkspaceError::PathEscapesWorkspace(requested.to_path_buf()));
        };

        let mut current = self.root.clone();
        for component in rest.components() {
            current.push(component);
            let Ok(meta) = std::fs::symlink_metadata(&current) else {
                // Nothing below a missing component exists yet.
                break;
            };
            if !meta.file_type().is_symlink() {
                continue;
            }
            let target = match std::fs::canonicalize(&current) {
                Ok(target) => target,
                Err(_) => {
                    // Dangling link: judge its literal target.
                    let link = std::fs::read_link(&current)?;
                    let base = current.parent().unwrap_or(&self.root);
                    normalize(&base.join(link))
                }
            };
            if !target.starts_with(&self.root) {
                return Err(WorkspaceError::PathEscapesWorkspace(requested.to_path_buf()));
            }
        }
        Ok(())
    }
}

/// Fold `.` and `..` lexically. `..` never climbs above the filesystem root.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
        }
    }
    out
}
