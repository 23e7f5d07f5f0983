use std::path::{Component, Path, PathBuf};

use crate::error::ValidationError;

/// Default mount point for the ramfs secret tree.
pub const DEFAULT_MOUNT_POINT: &str = "/run/credible.d";
/// Default stable symlink pointing at the mount point.
pub const DEFAULT_SECRET_DIR: &str = "/run/credible";
/// Marker file written at the root of an active mount.
pub const MOUNT_MARKER_FILE: &str = ".credible-mount.json";

/// Canonical path layout for the mounted secret tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountLayout {
    mount_point: PathBuf,
    secret_dir: PathBuf,
}

impl MountLayout {
    /// Creates a layout from a mount point and the symlink that exposes it.
    pub fn new(mount_point: impl AsRef<Path>, secret_dir: impl AsRef<Path>) -> Self {
        Self {
            mount_point: normalize_path(mount_point.as_ref()),
            secret_dir: normalize_path(secret_dir.as_ref()),
        }
    }

    /// Directory the ramfs is mounted on.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Stable symlink pointing at the mount point.
    pub fn secret_dir(&self) -> &Path {
        &self.secret_dir
    }

    /// Mount marker file.
    pub fn marker_file(&self) -> PathBuf {
        self.mount_point.join(MOUNT_MARKER_FILE)
    }

    /// Absolute location of a mount entry.
    pub fn entry_path(&self, relative: &Path) -> PathBuf {
        self.mount_point.join(relative)
    }
}

impl Default for MountLayout {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNT_POINT, DEFAULT_SECRET_DIR)
    }
}

/// Validates a path that must stay inside its root, returning it normalized.
pub fn validate_relative_path(raw: &Path) -> Result<PathBuf, ValidationError> {
    let mut normalized = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ValidationError::NotRelative)
            }
            Component::ParentDir => return Err(ValidationError::PathTraversal),
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(ValidationError::InvalidName);
    }
    Ok(normalized)
}

/// Lexically normalizes a path, dropping `.` and resolving `..`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let is_absolute = path.is_absolute();
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() && !is_absolute {
                    normalized.push("..");
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        if is_absolute {
            PathBuf::from(std::path::MAIN_SEPARATOR.to_string())
        } else {
            PathBuf::from(".")
        }
    } else {
        normalized
    }
}

/// Resolves `path` against `cwd` and normalizes it.
pub fn absolutize_path(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        normalize_path(&cwd.join(path))
    }
}
