//! Path containment for every capability that touches the filesystem.
//!
//! [`resolve`] is purely lexical, so paths that do not exist yet resolve the
//! same way as existing ones. [`Sandbox::resolve`] additionally refuses any
//! existing symlink below the root.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf, MAIN_SEPARATOR};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Invalid path: path must not be empty")]
    Empty,
    #[error("Invalid path '{0}': absolute paths are not allowed")]
    Absolute(String),
    #[error("Invalid path '{0}': parent traversal is not allowed")]
    ParentTraversal(String),
    #[error("Invalid path '{0}': path escapes the sandbox root")]
    Escapes(String),
    #[error("Invalid path '{0}': symlinks are not allowed")]
    Symlink(String),
}

/// A fixed directory all capability paths are confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: normalize_lexically(root.as_ref()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> Result<PathBuf, PathError> {
        let joined = resolve(&self.root, relative)?;
        reject_symlinks(&self.root, &joined, relative.trim())?;
        Ok(joined)
    }

    /// Like [`Sandbox::resolve`], but `.` and the empty string name the root.
    pub fn resolve_dir(&self, relative: Option<&str>) -> Result<PathBuf, PathError> {
        match relative.map(str::trim) {
            None | Some("") | Some(".") => Ok(self.root.clone()),
            Some(other) => self.resolve(other),
        }
    }
}

/// Resolve `relative` against `root`, rejecting anything that is not strictly
/// inside it.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }

    let candidate = Path::new(trimmed);
    if candidate.is_absolute() || candidate.has_root() {
        return Err(PathError::Absolute(trimmed.to_string()));
    }
    if candidate.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        )
    }) {
        return Err(PathError::ParentTraversal(trimmed.to_string()));
    }

    let root = normalize_lexically(root);
    let joined = normalize_lexically(&root.join(candidate));

    // Compare against "root/" so a sibling such as `root2` never matches `root`.
    let mut prefix: OsString = root.clone().into_os_string();
    if !prefix.to_string_lossy().ends_with(MAIN_SEPARATOR) {
        prefix.push(MAIN_SEPARATOR.to_string());
    }
    if !joined
        .to_string_lossy()
        .starts_with(prefix.to_string_lossy().as_ref())
    {
        return Err(PathError::Escapes(trimmed.to_string()));
    }

    Ok(joined)
}

/// Fail if `path` or any of its ancestors below `root` is a symlink.
/// Components that do not exist yet are skipped.
fn reject_symlinks(root: &Path, path: &Path, shown: &str) -> Result<(), PathError> {
    let mut check = path.to_path_buf();
    while check.starts_with(root) && check != root {
        if let Ok(metadata) = std::fs::symlink_metadata(&check) {
            if metadata.file_type().is_symlink() {
                return Err(PathError::Symlink(shown.to_string()));
            }
        }
        if !check.pop() {
            break;
        }
    }
    Ok(())
}

fn normalize_lexically(path: &Path) -> PathBuf {
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
