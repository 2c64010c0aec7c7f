//! Filesystem containment to a single workspace root.
//!
//! Every path is canonicalized (`..` and symlinks resolved) and must be a
//! component-wise descendant of the canonical root. Targets that do not
//! exist yet are resolved component by component, following every link
//! that does exist along the way.

use std::io;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::RwLock;

use tracing::{info, warn};

/// Reasons a path is rejected.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("null bytes in path")]
    NullByte,

    #[error("workspace root does not exist or is not a directory: {}", path.display())]
    InvalidRoot { path: PathBuf },

    #[error("path escapes workspace: {} -> {}", path.display(), resolved.display())]
    Escape { path: PathBuf, resolved: PathBuf },

    #[error("symlink escapes workspace: {} -> {}", path.display(), target.display())]
    SymlinkEscape { path: PathBuf, target: PathBuf },

    #[error("cannot resolve path {}: {source}", path.display())]
    Unresolvable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ScopeError {
    /// Machine-parsable code for the rejection.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NullByte => "null_byte",
            Self::InvalidRoot { .. } => "invalid_root",
            Self::Escape { .. } => "path_escape",
            Self::SymlinkEscape { .. } => "symlink_escape",
            Self::Unresolvable { .. } => "unresolvable_path",
        }
    }
}

/// Contains filesystem access to one root directory.
#[derive(Debug)]
pub struct WorkspaceScope {
    root: RwLock<PathBuf>,
}

impl WorkspaceScope {
    /// Bind to `root`, which must exist and be a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ScopeError> {
        let root = canonical_root(root.as_ref())?;
        info!(root = %root.display(), "workspace scope bound");
        Ok(Self {
            root: RwLock::new(root),
        })
    }

    /// Current canonical root.
    pub fn root(&self) -> PathBuf {
        self.root
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Swap the root after validating the new one.
    pub fn set_root(&self, root: impl AsRef<Path>) -> Result<(), ScopeError> {
        let new_root = canonical_root(root.as_ref())?;
        let mut guard = self
            .root
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        info!(from = %guard.display(), to = %new_root.display(), "workspace root changed");
        *guard = new_root;
        Ok(())
    }

    /// Resolve `target` and confirm it lies inside the workspace.
    ///
    /// Relative targets are joined to the current root. Returns the
    /// canonical path on success.
    pub fn validate(&self, target: impl AsRef<Path>) -> Result<PathBuf, ScopeError> {
        let target = target.as_ref();
        if target.to_string_lossy().contains('\0') {
            return Err(ScopeError::NullByte);
        }

        let root = self.root();
        let candidate = if target.is_absolute() {
            target.to_path_buf()
        } else {
            root.join(target)
        };

        let resolved = resolve_lenient(&candidate)?;
        if !resolved.starts_with(&root) {
            warn!(path = %target.display(), resolved = %resolved.display(), "path escapes workspace");
            return Err(ScopeError::Escape {
                path: target.to_path_buf(),
                resolved,
            });
        }

        // The final node may itself be a link pointing elsewhere.
        let is_link = std::fs::symlink_metadata(&candidate)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            let real = std::fs::canonicalize(&candidate).map_err(|source| {
                ScopeError::Unresolvable {
                    path: candidate.clone(),
                    source,
                }
            })?;
            if !real.starts_with(&root) {
                warn!(path = %target.display(), target = %real.display(), "symlink escapes workspace");
                return Err(ScopeError::SymlinkEscape {
                    path: target.to_path_buf(),
                    target: real,
                });
            }
        }

        Ok(resolved)
    }

    /// Alias for [`Self::validate`].
    pub fn resolve_safe(&self, target: impl AsRef<Path>) -> Result<PathBuf, ScopeError> {
        self.validate(target)
    }

    /// Non-failing containment check.
    pub fn is_within(&self, target: impl AsRef<Path>) -> bool {
        self.validate(target).is_ok()
    }

    /// Workspace-relative form of a validated path.
    pub fn make_relative(&self, target: impl AsRef<Path>) -> Result<PathBuf, ScopeError> {
        let resolved = self.validate(target)?;
        let root = self.root();
        Ok(resolved
            .strip_prefix(&root)
            .map(Path::to_path_buf)
            .unwrap_or_default())
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf, ScopeError> {
    let invalid = || ScopeError::InvalidRoot {
        path: root.to_path_buf(),
    };
    let canonical = std::fs::canonicalize(root).map_err(|_| invalid())?;
    if !canonical.is_dir() {
        return Err(invalid());
    }
    Ok(canonical)
}

/// Walk `path` one component at a time. Every component that exists on
/// disk is canonicalized before the next one is applied, so a `..` that
/// climbs out of a missing directory still lands on the real target of any
/// link it reaches afterwards. Missing components are applied lexically.
fn resolve_lenient(path: &Path) -> Result<PathBuf, ScopeError> {
    let mut resolved = PathBuf::new();

    for component in path.components() {
        match component {
            PathComponent::Prefix(_) | PathComponent::RootDir => {
                resolved.push(component.as_os_str());
            }
            PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                resolved.pop();
            }
            PathComponent::Normal(part) => {
                let next = resolved.join(part);
                resolved = match std::fs::symlink_metadata(&next) {
                    Ok(_) => std::fs::canonicalize(&next)
                        .map_err(|source| ScopeError::Unresolvable { path: next, source })?,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => next,
                    // Present but unreadable: fail closed.
                    Err(source) => return Err(ScopeError::Unresolvable { path: next, source }),
                };
            }
        }
    }

    if resolved.as_os_str().is_empty() {
        return Err(ScopeError::Unresolvable {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "empty path"),
        });
    }
    Ok(resolved)
}
