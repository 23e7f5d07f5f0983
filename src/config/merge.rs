use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use crate::{
    paths::{absolutize_path, validate_relative_path},
    storage::StorageConfig,
    types::{PublicKey, SecretName},
};

use super::{ConfigError, ConfigFragment, ExposureDecl, SecretDecl};

const MAX_FILE_MODE: u32 = 0o7777;

/// Validated secret declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    /// Unique name.
    pub name: SecretName,
    /// Storage path of the ciphertext.
    pub path: String,
    /// Recipients the ciphertext is encrypted for, deduplicated in declaration order.
    pub encryption_keys: Vec<PublicKey>,
}

/// Permission and ownership overrides for file-like exposures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Permission bits.
    pub mode: Option<u32>,
    /// Owning user name or numeric uid.
    pub owner: Option<String>,
    /// Owning group name or numeric gid.
    pub group: Option<String>,
}

/// Validated exposure target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExposureKind {
    /// Environment variable of the spawned command.
    Env {
        /// Variable name.
        var_name: String,
    },
    /// File at a normalized absolute path.
    File {
        /// Destination path.
        path: PathBuf,
        /// Overrides.
        options: FileOptions,
    },
    /// File at a normalized path relative to the mount point.
    Mount {
        /// Destination path below the mount point.
        path: PathBuf,
        /// Overrides.
        options: FileOptions,
    },
}

/// Validated exposure declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureSpec {
    /// Exposed secret.
    pub secret_name: SecretName,
    /// Target.
    pub kind: ExposureKind,
}

impl ExposureSpec {
    /// Destination used for uniqueness checks and diagnostics.
    pub fn destination(&self) -> Destination {
        match &self.kind {
            ExposureKind::Env { var_name } => Destination::Env(var_name.clone()),
            ExposureKind::File { path, .. } => Destination::File(path.clone()),
            ExposureKind::Mount { path, .. } => Destination::Mount(path.clone()),
        }
    }
}

/// Exposure destination, unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Environment variable name.
    Env(String),
    /// Absolute file path.
    File(PathBuf),
    /// Path relative to the mount point.
    Mount(PathBuf),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Env(name) => write!(f, "env {name}"),
            Destination::File(path) => write!(f, "file {}", path.display()),
            Destination::Mount(path) => write!(f, "mount {}", path.display()),
        }
    }
}

/// Merged, validated configuration; read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    storage: StorageConfig,
    secrets: Vec<Secret>,
    exposures: Vec<ExposureSpec>,
}

impl Configuration {
    /// Storage backend.
    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Secrets in declaration order.
    pub fn secrets(&self) -> &[Secret] {
        &self.secrets
    }

    /// Exposures in declaration order.
    pub fn exposures(&self) -> &[ExposureSpec] {
        &self.exposures
    }

    /// Looks up a secret by name.
    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets
            .iter()
            .find(|secret| secret.name.as_str() == name)
    }

    /// Returns `true` when any exposure targets the mount point.
    pub fn has_mount_exposures(&self) -> bool {
        self.exposures
            .iter()
            .any(|exposure| matches!(exposure.kind, ExposureKind::Mount { .. }))
    }
}

/// Left-to-right accumulator that validates each fragment as it is added.
#[derive(Debug)]
pub struct ConfigMerger {
    cwd: PathBuf,
    storage: Option<StorageConfig>,
    secrets: Vec<Secret>,
    exposures: Vec<ExposureSpec>,
    secret_names: HashSet<SecretName>,
    destinations: HashSet<Destination>,
}

impl ConfigMerger {
    /// Creates an empty merger resolving relative file paths against `cwd`.
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            storage: None,
            secrets: Vec::new(),
            exposures: Vec::new(),
            secret_names: HashSet::new(),
            destinations: HashSet::new(),
        }
    }

    /// Adds one fragment, rejecting redeclared names, destinations or storage.
    pub fn add(&mut self, fragment: ConfigFragment) -> Result<(), ConfigError> {
        tracing::debug!(source = %fragment.source_name(), "merging config fragment");
        if let Some(storage) = fragment.storage {
            if self.storage.is_some() {
                return Err(ConfigError::MultipleStorageBackends);
            }
            self.storage = Some(storage);
        }

        for decl in fragment.secrets {
            let secret = validate_secret(decl)?;
            if !self.secret_names.insert(secret.name.clone()) {
                return Err(ConfigError::DuplicateSecret(secret.name.to_string()));
            }
            self.secrets.push(secret);
        }

        for decl in fragment.exposures {
            let exposure = self.validate_exposure(decl)?;
            let destination = exposure.destination();
            if !self.destinations.insert(destination.clone()) {
                return Err(ConfigError::DuplicateExposureTarget(destination));
            }
            self.exposures.push(exposure);
        }
        Ok(())
    }

    /// Completes the merge, checking storage presence and secret references.
    pub fn finish(self) -> Result<Configuration, ConfigError> {
        let storage = self.storage.ok_or(ConfigError::MissingStorage)?;
        if let Some(dangling) = self
            .exposures
            .iter()
            .find(|exposure| !self.secret_names.contains(&exposure.secret_name))
        {
            return Err(ConfigError::UnknownSecretReference(
                dangling.secret_name.to_string(),
            ));
        }

        Ok(Configuration {
            storage,
            secrets: self.secrets,
            exposures: self.exposures,
        })
    }

    fn validate_exposure(&self, decl: ExposureDecl) -> Result<ExposureSpec, ConfigError> {
        let secret_name = SecretName::new(decl.secret()).map_err(|error| {
            ConfigError::UnknownSecretReference(format!("{} ({error})", decl.secret()))
        })?;

        let kind = match decl {
            ExposureDecl::Env { name, .. } => {
                if name.is_empty() || name.contains('=') || name.contains('\0') {
                    return Err(ConfigError::InvalidExposure {
                        destination: format!("env {name}"),
                        reason: "variable name must be non-empty without '=' or NUL".to_owned(),
                    });
                }
                ExposureKind::Env { var_name: name }
            }
            ExposureDecl::File {
                path,
                mode,
                owner,
                group,
                ..
            } => {
                let destination = format!("file {}", path.display());
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::InvalidExposure {
                        destination,
                        reason: "path must not be empty".to_owned(),
                    });
                }
                ExposureKind::File {
                    path: absolutize_path(&path, &self.cwd),
                    options: validate_options(&destination, mode, owner, group)?,
                }
            }
            ExposureDecl::Mount {
                path,
                mode,
                owner,
                group,
                ..
            } => {
                let destination = format!("mount {}", path.display());
                let relative =
                    validate_relative_path(&path).map_err(|error| ConfigError::InvalidExposure {
                        destination: destination.clone(),
                        reason: error.to_string(),
                    })?;
                ExposureKind::Mount {
                    path: relative,
                    options: validate_options(&destination, mode, owner, group)?,
                }
            }
        };

        Ok(ExposureSpec { secret_name, kind })
    }
}

/// Merges fragments left to right, resolving relative paths against the current directory.
pub fn merge<I>(fragments: I) -> Result<Configuration, ConfigError>
where
    I: IntoIterator<Item = ConfigFragment>,
{
    let cwd = std::env::current_dir().map_err(|source| ConfigError::ReadingFragment {
        path: PathBuf::from("."),
        source,
    })?;
    merge_in(&cwd, fragments)
}

/// Merges fragments left to right, resolving relative paths against `cwd`.
pub fn merge_in<I>(cwd: &Path, fragments: I) -> Result<Configuration, ConfigError>
where
    I: IntoIterator<Item = ConfigFragment>,
{
    let mut merger = ConfigMerger::new(cwd);
    for fragment in fragments {
        merger.add(fragment)?;
    }
    merger.finish()
}

fn validate_secret(decl: SecretDecl) -> Result<Secret, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidSecret {
        name: decl.name.clone(),
        reason,
    };
    let name = SecretName::new(&decl.name).map_err(|error| invalid(error.to_string()))?;
    if decl.path.trim().is_empty() {
        return Err(invalid("storage path must not be empty".to_owned()));
    }

    let mut encryption_keys: Vec<PublicKey> = Vec::with_capacity(decl.encryption_keys.len());
    for raw in &decl.encryption_keys {
        let key = PublicKey::parse(raw).map_err(|error| invalid(error.to_string()))?;
        if !encryption_keys.contains(&key) {
            encryption_keys.push(key);
        }
    }

    Ok(Secret {
        name,
        path: decl.path.clone(),
        encryption_keys,
    })
}

fn validate_options(
    destination: &str,
    mode: Option<u32>,
    owner: Option<String>,
    group: Option<String>,
) -> Result<FileOptions, ConfigError> {
    if let Some(mode) = mode {
        if mode > MAX_FILE_MODE {
            return Err(ConfigError::InvalidExposure {
                destination: destination.to_owned(),
                reason: format!("mode {mode:o} is not a valid permission mode"),
            });
        }
    }
    let non_empty = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
    Ok(FileOptions {
        mode,
        owner: non_empty(owner),
        group: non_empty(group),
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{merge_in, Destination, ExposureKind};
    use crate::config::{ConfigError, ConfigFragment};

    fn fragment(raw: &str) -> ConfigFragment {
        ConfigFragment::parse(raw, None).unwrap()
    }

    const STORAGE: &str = "[storage]\ntype = \"directory\"\nroot = \"/srv/secrets\"\n";
    const SAMPLE_SECRET: &str = "[[secrets]]\nname = \"sample\"\npath = \"sample.age\"\n";

    #[test]
    fn relative_file_paths_are_absolutized_against_cwd() {
        let config = merge_in(
            Path::new("/work"),
            [fragment(&format!(
                "{STORAGE}{SAMPLE_SECRET}[[exposures]]\ntype = \"file\"\nsecret = \"sample\"\npath = \"./out/../secret.txt\"\n"
            ))],
        )
        .unwrap();

        assert!(matches!(
            &config.exposures()[0].kind,
            ExposureKind::File { path, .. } if path == &PathBuf::from("/work/secret.txt")
        ));
    }

    #[test]
    fn equivalent_paths_collide() {
        let error = merge_in(
            Path::new("/work"),
            [
                fragment(&format!(
                    "{STORAGE}{SAMPLE_SECRET}[[exposures]]\ntype = \"file\"\nsecret = \"sample\"\npath = \"secret.txt\"\n"
                )),
                fragment("[[exposures]]\ntype = \"file\"\nsecret = \"sample\"\npath = \"/work/./secret.txt\"\n"),
            ],
        )
        .unwrap_err();

        assert!(matches!(
            error,
            ConfigError::DuplicateExposureTarget(Destination::File(path)) if path == PathBuf::from("/work/secret.txt")
        ));
    }

    #[test]
    fn mount_paths_must_stay_relative() {
        let error = merge_in(
            Path::new("/work"),
            [fragment(&format!(
                "{STORAGE}{SAMPLE_SECRET}[[exposures]]\ntype = \"mount\"\nsecret = \"sample\"\npath = \"../escape\"\n"
            ))],
        )
        .unwrap_err();

        assert!(matches!(error, ConfigError::InvalidExposure { .. }));
    }

    #[test]
    fn env_names_reject_equals_sign() {
        let error = merge_in(
            Path::new("/work"),
            [fragment(&format!(
                "{STORAGE}{SAMPLE_SECRET}[[exposures]]\ntype = \"env\"\nsecret = \"sample\"\nname = \"A=B\"\n"
            ))],
        )
        .unwrap_err();

        assert!(matches!(error, ConfigError::InvalidExposure { .. }));
    }

    #[test]
    fn modes_above_permission_bits_are_rejected() {
        let error = merge_in(
            Path::new("/work"),
            [fragment(&format!(
                "{STORAGE}{SAMPLE_SECRET}[[exposures]]\ntype = \"file\"\nsecret = \"sample\"\npath = \"x\"\nmode = 65535\n"
            ))],
        )
        .unwrap_err();

        assert!(matches!(error, ConfigError::InvalidExposure { .. }));
    }

    #[test]
    fn invalid_recipients_are_rejected() {
        let error = merge_in(
            Path::new("/work"),
            [fragment(&format!(
                "{STORAGE}[[secrets]]\nname = \"sample\"\npath = \"sample.age\"\nencryption_keys = [\"age1bogus\"]\n"
            ))],
        )
        .unwrap_err();

        assert!(matches!(error, ConfigError::InvalidSecret { name, .. } if name == "sample"));
    }
}
