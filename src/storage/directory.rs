use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{fs_secure::write_private_file_atomic, paths::validate_relative_path};

use super::{SecretStorage, StorageError};

/// `type = "directory"` storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectoryConfig {
    /// Directory holding ciphertext objects.
    pub root: PathBuf,
}

/// Ciphertext objects stored as files below one root directory.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    /// Creates a backend rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Filesystem location for one object path.
    pub fn object_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = validate_relative_path(Path::new(path))
            .map_err(|_| StorageError::InvalidPath(path.to_owned()))?;
        Ok(self.root.join(relative))
    }
}

impl SecretStorage for DirectoryStorage {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let object = self.object_path(path)?;
        fs::read(&object).map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(path.to_owned()),
            _ => StorageError::Unavailable {
                path: path.to_owned(),
                reason: error.to_string(),
            },
        })
    }

    fn put(&self, path: &str, ciphertext: &[u8]) -> Result<(), StorageError> {
        let object = self.object_path(path)?;
        write_private_file_atomic(&object, ciphertext).map_err(|error| {
            StorageError::Unavailable {
                path: path.to_owned(),
                reason: error.to_string(),
            }
        })
    }
}
