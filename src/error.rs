use std::io;

use thiserror::Error;

use crate::{
    cipher::CipherError,
    config::ConfigError,
    exposure::{ExposureError, TeardownError},
    plan::PlanError,
    resolver::ResolveError,
    storage::StorageError,
    supervisor::SupervisorError,
};

/// Validation failures for identifiers, keys and relative paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Secret name is empty or too long.
    #[error("invalid name: must be 1..=128 characters")]
    InvalidName,
    /// Name or path attempts traversal.
    #[error("invalid path: traversal is not allowed")]
    PathTraversal,
    /// Path must be relative but was absolute.
    #[error("invalid path: must be relative")]
    NotRelative,
    /// Secret name contains unsupported characters.
    #[error("invalid character in name: use only A-Za-z0-9._/-")]
    InvalidCharacter,
    /// Public key is not an age recipient.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

/// Successful invocation.
pub const EXIT_SUCCESS: i32 = 0;
/// Usage or unclassified I/O failure.
pub const EXIT_USAGE: i32 = 1;
/// Configuration merge or validation failure.
pub const EXIT_CONFIG: i32 = 2;
/// Storage or cryptography failure while resolving secrets.
pub const EXIT_RESOLVE: i32 = 3;
/// Destination collides with live host state.
pub const EXIT_PLAN: i32 = 4;
/// Exposure could not be materialized (already rolled back).
pub const EXIT_EXPOSURE: i32 = 5;
/// Target command could not be spawned.
pub const EXIT_SPAWN: i32 = 6;
/// Exposures could not be fully torn down.
pub const EXIT_TEARDOWN: i32 = 7;
/// Interrupted by a signal before the target command started.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Top-level broker errors, one variant per stage.
#[derive(Debug, Error)]
pub enum CredibleError {
    /// Configuration stage failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Storage failure outside of resolution (upload).
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Cipher failure outside of resolution (upload).
    #[error(transparent)]
    Cipher(#[from] CipherError),
    /// Resolve stage failure.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Plan stage failure.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// Exposure stage failure.
    #[error(transparent)]
    Exposure(#[from] ExposureError),
    /// Teardown failure.
    #[error(transparent)]
    Teardown(#[from] TeardownError),
    /// Supervisor failure.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// Input was syntactically valid but semantically unsupported.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A typed result used across the crate.
pub type Result<T> = std::result::Result<T, CredibleError>;

impl CredibleError {
    /// Returns the stable process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CredibleError::Config(_) => EXIT_CONFIG,
            CredibleError::Storage(_) | CredibleError::Cipher(_) | CredibleError::Resolve(_) => {
                EXIT_RESOLVE
            }
            CredibleError::Plan(_) => EXIT_PLAN,
            CredibleError::Exposure(_) => EXIT_EXPOSURE,
            CredibleError::Teardown(_) => EXIT_TEARDOWN,
            CredibleError::Supervisor(error) => error.exit_code(),
            CredibleError::InvalidInput(_) | CredibleError::Io(_) => EXIT_USAGE,
        }
    }

    /// Returns the short label of the failing stage.
    pub fn stage(&self) -> &'static str {
        match self {
            CredibleError::Config(_) => "config",
            CredibleError::Storage(_) => "storage",
            CredibleError::Cipher(_) => "cipher",
            CredibleError::Resolve(_) => "resolve",
            CredibleError::Plan(_) => "plan",
            CredibleError::Exposure(_) => "exposure",
            CredibleError::Teardown(_) => "teardown",
            CredibleError::Supervisor(error) => error.stage(),
            CredibleError::InvalidInput(_) => "input",
            CredibleError::Io(_) => "io",
        }
    }

    /// Formats the single-line diagnostic printed on failure.
    pub fn diagnostic(&self) -> String {
        let message = self.to_string().replace('\n', " ");
        format!("error[{}]: {message}", self.stage())
    }
}
