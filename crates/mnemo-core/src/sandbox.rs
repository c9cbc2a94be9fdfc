//! Sandbox root layout and path confinement.
//!
//! Every tool path goes through [`Sandbox::resolve`] or
//! [`Sandbox::resolve_writable`] before any filesystem or process action.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::SandboxConfig;
use crate::core::events::{ErrorCode, ToolOutput};
use crate::prompts::{DEFAULT_GUIDELINE, DEFAULT_MEMORY};

pub const WORKSPACE_DIR: &str = "workspace";
pub const HISTORY_DIR: &str = "storage/history";
pub const DOCUMENTS_DIR: &str = "storage/documents";
pub const OUTPUTS_DIR: &str = "storage/outputs";

#[derive(Debug)]
pub enum SandboxError {
    /// The path contains a `..` component.
    Traversal { path: String },
    /// The path (or a symlink along it) points outside the root.
    Escape { path: String },
    /// The path is readable but must not be written by tools.
    Protected { path: String },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxError::Traversal { path } => {
                write!(f, "Path '{path}' contains '..', which is not allowed")
            }
            SandboxError::Escape { path } => {
                write!(f, "Path '{path}' resolves outside the sandbox root")
            }
            SandboxError::Protected { path } => write!(
                f,
                "Path '{path}' is managed by the agent and cannot be modified directly"
            ),
        }
    }
}

impl std::error::Error for SandboxError {}

impl From<SandboxError> for ToolOutput {
    fn from(err: SandboxError) -> Self {
        ToolOutput::failure(ErrorCode::SandboxViolation, err.to_string(), None)
    }
}

/// The agent's root directory and its fixed layout.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    memory_path: PathBuf,
    guideline_path: PathBuf,
    history_dir: PathBuf,
}

impl Sandbox {
    /// Creates the layout under `root` if needed and opens it.
    ///
    /// Missing guideline and working-memory documents are written from the
    /// bundled defaults.
    ///
    /// # Errors
    /// Returns an error if a directory or default document cannot be created.
    pub fn open(root: &Path, layout: &SandboxConfig) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create sandbox root {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve sandbox root {}", root.display()))?;

        for dir in [WORKSPACE_DIR, HISTORY_DIR, DOCUMENTS_DIR, OUTPUTS_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
        }

        let sandbox = Self {
            memory_path: root.join(&layout.memory_file),
            guideline_path: root.join(&layout.guideline_file),
            history_dir: root.join(HISTORY_DIR),
            root,
        };

        for (path, default) in [
            (&sandbox.guideline_path, DEFAULT_GUIDELINE),
            (&sandbox.memory_path, DEFAULT_MEMORY),
        ] {
            if !path.exists() {
                fs::write(path, default)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                tracing::info!(path = %path.display(), "created default document");
            }
        }

        Ok(sandbox)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }

    pub fn guideline_path(&self) -> &Path {
        &self.guideline_path
    }

    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    /// Resolves a tool-supplied path to an absolute path inside the root.
    ///
    /// Relative paths are taken from the root. An absolute path is accepted
    /// only if it already lies under the root. Existing path prefixes are
    /// canonicalized so symlinks cannot point the result elsewhere.
    ///
    /// # Errors
    /// Returns `Traversal` for any `..` component and `Escape` when the
    /// resolved path leaves the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let trimmed = path.trim();
        let requested = Path::new(if trimmed.is_empty() { "." } else { trimmed });

        if requested
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SandboxError::Traversal {
                path: path.to_string(),
            });
        }

        let joined = if requested.is_absolute() {
            if !requested.starts_with(&self.root) {
                return Err(SandboxError::Escape {
                    path: path.to_string(),
                });
            }
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };
        let candidate: PathBuf = joined
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();

        let resolved = canonicalize_existing_prefix(&candidate).map_err(|_| {
            SandboxError::Escape {
                path: path.to_string(),
            }
        })?;

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(SandboxError::Escape {
                path: path.to_string(),
            })
        }
    }

    /// Like [`resolve`](Self::resolve), additionally refusing the working
    /// memory document and the archive subtree.
    ///
    /// # Errors
    /// Returns `Protected` for agent-managed paths, plus every `resolve` error.
    pub fn resolve_writable(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let resolved = self.resolve(path)?;
        if resolved == self.memory_path || resolved.starts_with(&self.history_dir) {
            return Err(SandboxError::Protected {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Displays an absolute path relative to the root (`.` for the root).
    pub fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

/// Canonicalizes the deepest existing ancestor and re-appends the rest.
///
/// A dangling symlink anywhere on the path is an error: writing through it
/// would create its target wherever it points.
fn canonicalize_existing_prefix(path: &Path) -> io::Result<PathBuf> {
    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();
    let mut current = path;
    loop {
        match fs::canonicalize(current) {
            Ok(base) => {
                let mut resolved = base;
                for part in suffix.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(err) => {
                if fs::symlink_metadata(current).is_ok() {
                    return Err(err);
                }
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(err);
                };
                suffix.push(name);
                current = parent;
            }
        }
    }
}
