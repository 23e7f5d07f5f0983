use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use serde::Deserialize;

use crate::storage::StorageConfig;

use super::ConfigError;

/// Default fragment file name discovered from the working directory upwards.
pub const CONFIG_FILE_NAME: &str = "credible.toml";

/// One partial, mergeable configuration source.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFragment {
    /// Storage backend, declared at most once across all fragments.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// Secret declarations.
    #[serde(default)]
    pub secrets: Vec<SecretDecl>,
    /// Exposure declarations.
    #[serde(default)]
    pub exposures: Vec<ExposureDecl>,
    /// Where the fragment came from, for diagnostics.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Raw `[[secrets]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecretDecl {
    /// Unique secret name.
    pub name: String,
    /// Storage path of the ciphertext.
    pub path: String,
    /// Recipients the ciphertext is encrypted for.
    #[serde(default)]
    pub encryption_keys: Vec<String>,
}

/// Raw `[[exposures]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum ExposureDecl {
    /// Environment variable of the spawned command.
    Env {
        /// Secret to expose.
        secret: String,
        /// Variable name.
        name: String,
    },
    /// Regular file on disk.
    File {
        /// Secret to expose.
        secret: String,
        /// Destination path, relative paths resolve against the working directory.
        path: PathBuf,
        /// Octal permission bits, defaulting to `0o400`.
        #[serde(default)]
        mode: Option<u32>,
        /// Owning user name or numeric uid.
        #[serde(default)]
        owner: Option<String>,
        /// Owning group name or numeric gid.
        #[serde(default)]
        group: Option<String>,
    },
    /// File under the memory-backed mount point.
    Mount {
        /// Secret to expose.
        secret: String,
        /// Destination relative to the mount point.
        path: PathBuf,
        /// Octal permission bits, defaulting to `0o400`.
        #[serde(default)]
        mode: Option<u32>,
        /// Owning user name or numeric uid.
        #[serde(default)]
        owner: Option<String>,
        /// Owning group name or numeric gid.
        #[serde(default)]
        group: Option<String>,
    },
}

impl ExposureDecl {
    /// Name of the referenced secret.
    pub fn secret(&self) -> &str {
        match self {
            ExposureDecl::Env { secret, .. }
            | ExposureDecl::File { secret, .. }
            | ExposureDecl::Mount { secret, .. } => secret,
        }
    }
}

/// Ad-hoc `kind:secret:destination` exposure given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureArg(pub ExposureDecl);

impl FromStr for ExposureArg {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidExposureArg(raw.to_owned());
        let mut parts = raw.splitn(3, ':');
        let kind = parts.next().ok_or_else(invalid)?;
        let secret = parts.next().filter(|part| !part.is_empty()).ok_or_else(invalid)?;
        let destination = parts.next().filter(|part| !part.is_empty()).ok_or_else(invalid)?;

        let secret = secret.to_owned();
        let decl = match kind {
            "env" => ExposureDecl::Env {
                secret,
                name: destination.to_owned(),
            },
            "file" => ExposureDecl::File {
                secret,
                path: PathBuf::from(destination),
                mode: None,
                owner: None,
                group: None,
            },
            "mount" => ExposureDecl::Mount {
                secret,
                path: PathBuf::from(destination),
                mode: None,
                owner: None,
                group: None,
            },
            _ => return Err(invalid()),
        };
        Ok(Self(decl))
    }
}

impl ConfigFragment {
    /// Reads and parses one fragment file after checking its permissions.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        validate_fragment_file(path)?;
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadingFragment {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, Some(path))
    }

    /// Parses fragment TOML.
    pub fn parse(raw: &str, source: Option<&Path>) -> Result<Self, ConfigError> {
        let mut fragment: Self =
            toml::from_str(raw).map_err(|error| ConfigError::ParsingFragment {
                source_name: describe_source(source),
                message: error.message().to_owned(),
            })?;
        fragment.source = source.map(Path::to_path_buf);
        Ok(fragment)
    }

    /// Builds a fragment holding only ad-hoc exposures.
    pub fn from_exposures(exposures: Vec<ExposureDecl>) -> Self {
        Self {
            exposures,
            ..Self::default()
        }
    }

    /// Human-readable name of the fragment source.
    pub fn source_name(&self) -> String {
        describe_source(self.source.as_deref())
    }
}

/// Walks from `start_dir` to the filesystem root looking for [`CONFIG_FILE_NAME`].
pub fn discover_fragment(start_dir: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start_dir.as_ref();
    loop {
        let candidate = current.join(CONFIG_FILE_NAME);
        if is_regular_file(&candidate) {
            return Some(candidate);
        }

        let parent = current.parent()?;
        current = parent;
    }
}

fn describe_source(source: Option<&Path>) -> String {
    source
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<command line>".to_owned())
}

fn validate_fragment_file(path: &Path) -> Result<(), ConfigError> {
    let metadata = fs::symlink_metadata(path).map_err(|source| ConfigError::ReadingFragment {
        path: path.to_path_buf(),
        source,
    })?;
    if !metadata.file_type().is_file() {
        return Err(ConfigError::InsecureFragment {
            path: path.to_path_buf(),
            reason: "not a regular file",
        });
    }

    #[cfg(unix)]
    {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o022 != 0 {
            return Err(ConfigError::InsecureFragment {
                path: path.to_path_buf(),
                reason: "group or world writable",
            });
        }
    }
    Ok(())
}

fn is_regular_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.file_type().is_file())
        .unwrap_or(false)
}
