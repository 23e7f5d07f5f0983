//! Configuration fragments and the validated merge result.

mod fragment;
mod merge;

use std::{io, path::PathBuf};

use thiserror::Error;

pub use fragment::{
    discover_fragment, ConfigFragment, ExposureArg, ExposureDecl, SecretDecl, CONFIG_FILE_NAME,
};
pub use merge::{
    merge, merge_in, ConfigMerger, Configuration, Destination, ExposureKind, ExposureSpec,
    FileOptions, Secret,
};

/// Configuration loading, merge and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Secret name declared by more than one fragment.
    #[error("duplicate secret name specified: {0}")]
    DuplicateSecret(String),
    /// Two exposures share one destination.
    #[error("duplicate exposure target specified: {0}")]
    DuplicateExposureTarget(Destination),
    /// Exposure references a secret no fragment declares.
    #[error("exposure references undeclared secret: {0}")]
    UnknownSecretReference(String),
    /// More than one fragment declares `[storage]`.
    #[error("storage backend declared more than once")]
    MultipleStorageBackends,
    /// No fragment declares `[storage]`.
    #[error("no storage backend configured")]
    MissingStorage,
    /// Secret declaration is malformed.
    #[error("invalid secret '{name}': {reason}")]
    InvalidSecret {
        /// Declared name.
        name: String,
        /// Validation failure.
        reason: String,
    },
    /// Exposure declaration is malformed.
    #[error("invalid exposure for {destination}: {reason}")]
    InvalidExposure {
        /// Declared destination.
        destination: String,
        /// Validation failure.
        reason: String,
    },
    /// Ad-hoc exposure is not a `kind:secret:destination` triple.
    #[error("invalid exposure '{0}': expected env|file|mount:<secret>:<destination>")]
    InvalidExposureArg(String),
    /// Fragment file could not be read.
    #[error("failed to read config fragment {path}: {source}")]
    ReadingFragment {
        /// Fragment path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Fragment is not valid TOML for the fragment schema.
    #[error("failed to parse config fragment {source_name}: {message}")]
    ParsingFragment {
        /// Fragment path or `<command line>`.
        source_name: String,
        /// Parser message.
        message: String,
    },
    /// Fragment file has unsafe type or permissions.
    #[error("config fragment {path} is {reason}")]
    InsecureFragment {
        /// Fragment path.
        path: PathBuf,
        /// Offending property.
        reason: &'static str,
    },
    /// No fragment was given and none could be discovered.
    #[error("no configuration fragments given and no {} found", CONFIG_FILE_NAME)]
    NoFragments,
}
