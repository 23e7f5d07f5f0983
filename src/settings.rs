//! Process-level settings read from `CREDIBLE_*` environment variables.
//!
//! List-valued variables are comma-separated. Empty values count as unset.

use std::path::{Path, PathBuf};

use crate::paths::{MountLayout, DEFAULT_MOUNT_POINT, DEFAULT_SECRET_DIR};

/// Comma-separated configuration fragment paths.
pub const ENV_CONFIG_FILES: &str = "CREDIBLE_CONFIG_FILES";
/// Comma-separated ad-hoc `kind:secret:destination` exposures.
pub const ENV_EXPOSURES: &str = "CREDIBLE_EXPOSURES";
/// Mount point for the ramfs secret tree.
pub const ENV_MOUNT_POINT: &str = "CREDIBLE_MOUNT_POINT";
/// Stable symlink to the mount point.
pub const ENV_SECRET_DIR: &str = "CREDIBLE_SECRET_DIR";
/// Default owner for file and mount exposures.
pub const ENV_OWNER_USER: &str = "CREDIBLE_OWNER_USER";
/// Default group for file and mount exposures.
pub const ENV_OWNER_GROUP: &str = "CREDIBLE_OWNER_GROUP";
/// Comma-separated age identity files.
pub const ENV_PRIVATE_KEY_PATHS: &str = "CREDIBLE_PRIVATE_KEY_PATHS";
/// Log filter directive.
pub const ENV_LOG: &str = "CREDIBLE_LOG";

/// SSH identities tried below `$HOME/.ssh` when no key path is configured.
pub const DEFAULT_SSH_IDENTITIES: [&str; 2] = ["id_rsa", "id_ed25519"];

/// Values of the documented environment contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvContract {
    /// Fragment files.
    pub config_files: Vec<PathBuf>,
    /// Ad-hoc exposures.
    pub exposures: Vec<String>,
    /// Mount point override.
    pub mount_point: Option<PathBuf>,
    /// Secret directory override.
    pub secret_dir: Option<PathBuf>,
    /// Default owner.
    pub owner_user: Option<String>,
    /// Default group.
    pub owner_group: Option<String>,
    /// Identity files.
    pub private_key_paths: Vec<PathBuf>,
    /// `HOME`, used to find default SSH identities.
    pub home: Option<PathBuf>,
}

impl EnvContract {
    /// Reads the contract from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the contract through `lookup`, useful for tests.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            config_files: list(lookup(ENV_CONFIG_FILES))
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            exposures: list(lookup(ENV_EXPOSURES)),
            mount_point: single(lookup(ENV_MOUNT_POINT)).map(PathBuf::from),
            secret_dir: single(lookup(ENV_SECRET_DIR)).map(PathBuf::from),
            owner_user: single(lookup(ENV_OWNER_USER)),
            owner_group: single(lookup(ENV_OWNER_GROUP)),
            private_key_paths: list(lookup(ENV_PRIVATE_KEY_PATHS))
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            home: single(lookup("HOME")).map(PathBuf::from),
        }
    }
}

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    /// `--config` values.
    pub config_files: Vec<PathBuf>,
    /// `--expose` values.
    pub exposures: Vec<String>,
    /// `--mount-point` value.
    pub mount_point: Option<PathBuf>,
    /// `--secret-dir` value.
    pub secret_dir: Option<PathBuf>,
    /// `--user` value.
    pub owner_user: Option<String>,
    /// `--group` value.
    pub owner_group: Option<String>,
    /// `--private-key` values.
    pub private_key_paths: Vec<PathBuf>,
}

/// Effective settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Fragment files in merge order; empty means discover.
    pub config_files: Vec<PathBuf>,
    /// Ad-hoc exposures merged as a final fragment.
    pub exposures: Vec<String>,
    /// Mount layout.
    pub layout: MountLayout,
    /// Default owner for file and mount exposures.
    pub owner_user: Option<String>,
    /// Default group for file and mount exposures.
    pub owner_group: Option<String>,
    /// Identity files.
    pub private_key_paths: Vec<PathBuf>,
}

impl BrokerSettings {
    /// Layers command-line overrides on top of the environment contract.
    ///
    /// A non-empty override list replaces the environment list entirely. Without
    /// any key path, the existing [`DEFAULT_SSH_IDENTITIES`] below `$HOME/.ssh`
    /// are used.
    pub fn resolve(overrides: SettingsOverrides, env: EnvContract) -> Self {
        let mount_point = overrides
            .mount_point
            .or(env.mount_point)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_POINT));
        let secret_dir = overrides
            .secret_dir
            .or(env.secret_dir)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SECRET_DIR));

        Self {
            config_files: prefer(overrides.config_files, env.config_files),
            exposures: prefer(overrides.exposures, env.exposures),
            layout: MountLayout::new(mount_point, secret_dir),
            owner_user: overrides.owner_user.or(env.owner_user),
            owner_group: overrides.owner_group.or(env.owner_group),
            private_key_paths: prefer(
                prefer(overrides.private_key_paths, env.private_key_paths),
                default_private_key_paths(env.home.as_deref()),
            ),
        }
    }
}

fn default_private_key_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let Some(home) = home else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    DEFAULT_SSH_IDENTITIES
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

fn prefer<T>(primary: Vec<T>, fallback: Vec<T>) -> Vec<T> {
    if primary.is_empty() {
        fallback
    } else {
        primary
    }
}

fn single(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_owned)
            .collect()
    })
    .unwrap_or_default()
}
