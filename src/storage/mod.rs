//! Ciphertext storage backends.

mod directory;
mod s3;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use directory::{DirectoryConfig, DirectoryStorage};
pub use s3::{AwsCliExecutor, S3Config, S3Executor, S3Storage};

/// Storage backend failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists at the path.
    #[error("secret not found in storage: {0}")]
    NotFound(String),
    /// Backend could not be reached or refused the request.
    #[error("storage backend unavailable for {path}: {reason}")]
    Unavailable {
        /// Object path that was requested.
        path: String,
        /// Backend-supplied reason.
        reason: String,
    },
    /// The object path is not acceptable to this backend.
    #[error("invalid storage path: {0}")]
    InvalidPath(String),
}

/// Backend able to fetch and store opaque ciphertext by path.
pub trait SecretStorage: Send + Sync {
    /// Fetches the ciphertext stored at `path`.
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    /// Stores `ciphertext` at `path`, replacing any existing object.
    fn put(&self, path: &str, ciphertext: &[u8]) -> Result<(), StorageError>;
}

/// `[storage]` table of a configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// S3 bucket accessed through the `aws` CLI.
    S3(S3Config),
    /// Local directory of ciphertext files.
    Directory(DirectoryConfig),
}

impl StorageConfig {
    /// Opens the configured backend.
    pub fn open(&self) -> Box<dyn SecretStorage> {
        match self {
            StorageConfig::S3(config) => Box::new(S3Storage::new(config)),
            StorageConfig::Directory(config) => Box::new(DirectoryStorage::new(&config.root)),
        }
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            StorageConfig::S3(config) => format!("s3://{} ({})", config.bucket, config.region),
            StorageConfig::Directory(config) => format!("directory {}", config.root.display()),
        }
    }
}
