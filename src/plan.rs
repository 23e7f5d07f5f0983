//! Turns a configuration and a secret table into an ordered exposure plan.

use std::path::{Path, PathBuf};

use nix::unistd::{Group, User};
use thiserror::Error;

use crate::{
    config::{Configuration, ExposureKind, FileOptions},
    exposure::MountState,
    fs_secure::READ_ONLY_FILE_MODE,
    paths::MountLayout,
    resolver::SecretTable,
    types::{SecretName, SecretValue},
};

/// Live-state conflicts detected before anything is materialized.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A file already exists where an exposure would be written.
    #[error("destination already exists: {}", .0.display())]
    DestinationExists(PathBuf),
    /// The variable is already set in the broker's environment.
    #[error("environment variable already set: {0}")]
    EnvVarInUse(String),
    /// The mount point already holds a mount owned by someone else.
    #[error("mount point already in use: {}", .0.display())]
    MountPointInUse(PathBuf),
    /// Two mount entries need the same path as both file and directory.
    #[error("mount entries conflict: {} is nested under {}", .nested.display(), .parent.display())]
    NestedMountEntries {
        /// Entry used as a directory.
        parent: PathBuf,
        /// Entry below it.
        nested: PathBuf,
    },
    /// Owner does not name a user on this host.
    #[error("unknown user: {0}")]
    UnknownUser(String),
    /// Group does not name a group on this host.
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    /// Secret has no resolved plaintext.
    #[error("secret was not resolved: {0}")]
    MissingSecret(String),
}

/// Lifetime the exposures are planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureScope {
    /// Exposures live for one supervised command.
    Command,
    /// Mount exposures persist until an explicit unmount.
    System,
}

/// Numeric ownership applied after a file is written; `None` keeps the creator's id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileOwner {
    /// User id.
    pub uid: Option<u32>,
    /// Group id.
    pub gid: Option<u32>,
}

/// Host queries used to detect collisions with live state.
pub trait HostProbe {
    /// Returns `true` when anything exists at `path`, including dangling symlinks.
    fn path_exists(&self, path: &Path) -> bool;
    /// Returns `true` when `name` is set in the broker's environment.
    fn env_var_set(&self, name: &str) -> bool;
    /// Resolves a user name to a uid.
    fn lookup_user(&self, name: &str) -> Option<u32>;
    /// Resolves a group name to a gid.
    fn lookup_group(&self, name: &str) -> Option<u32>;
}

/// [`HostProbe`] backed by the real filesystem, environment and user database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn path_exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn env_var_set(&self, name: &str) -> bool {
        std::env::var_os(name).is_some()
    }

    fn lookup_user(&self, name: &str) -> Option<u32> {
        User::from_name(name)
            .ok()
            .flatten()
            .map(|user| user.uid.as_raw())
    }

    fn lookup_group(&self, name: &str) -> Option<u32> {
        Group::from_name(name)
            .ok()
            .flatten()
            .map(|group| group.gid.as_raw())
    }
}

/// Inputs describing where and for how long exposures are planned.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Exposure lifetime.
    pub scope: ExposureScope,
    /// Mount layout.
    pub layout: MountLayout,
    /// Current state of the mount point.
    pub mount_state: MountState,
    /// Default owner for file and mount exposures.
    pub default_user: Option<String>,
    /// Default group for file and mount exposures.
    pub default_group: Option<String>,
}

impl PlanRequest {
    /// Request for exposures scoped to one command.
    pub fn command(layout: MountLayout, mount_state: MountState) -> Self {
        Self {
            scope: ExposureScope::Command,
            layout,
            mount_state,
            default_user: None,
            default_group: None,
        }
    }

    /// Request for a persistent system mount.
    pub fn system(layout: MountLayout, mount_state: MountState) -> Self {
        Self {
            scope: ExposureScope::System,
            ..Self::command(layout, mount_state)
        }
    }

    /// Sets the default owner and group.
    pub fn with_default_owner(mut self, user: Option<String>, group: Option<String>) -> Self {
        self.default_user = user;
        self.default_group = group;
        self
    }
}

/// What one action creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// File below the mount point.
    Mount {
        /// Path relative to the mount point.
        relative_path: PathBuf,
        /// Permission bits.
        mode: u32,
        /// Ownership.
        owner: FileOwner,
    },
    /// Regular file.
    File {
        /// Absolute destination.
        path: PathBuf,
        /// Permission bits.
        mode: u32,
        /// Ownership.
        owner: FileOwner,
    },
    /// Environment variable of the spawned command.
    Env {
        /// Variable name.
        var_name: String,
    },
}

/// One exposure bound to its plaintext.
#[derive(Debug)]
pub struct ExposureAction<'a> {
    secret_name: &'a SecretName,
    kind: ActionKind,
    plaintext: &'a SecretValue,
}

impl<'a> ExposureAction<'a> {
    /// Exposed secret.
    pub fn secret_name(&self) -> &'a SecretName {
        self.secret_name
    }

    /// Target.
    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    /// Plaintext to expose.
    pub fn plaintext(&self) -> &'a SecretValue {
        self.plaintext
    }
}

/// Mount point preparation required by the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Layout to mount.
    pub layout: MountLayout,
    /// Existing mount must be removed first.
    pub replace_existing: bool,
}

/// Ordered actions: mounts, then files, then environment variables.
#[derive(Debug)]
pub struct ExposurePlan<'a> {
    actions: Vec<ExposureAction<'a>>,
    mount: Option<MountPlan>,
}

impl<'a> ExposurePlan<'a> {
    /// Every action in materialization order.
    pub fn actions(&self) -> &[ExposureAction<'a>] {
        &self.actions
    }

    /// Mount preparation, present when any mount action exists.
    pub fn mount(&self) -> Option<&MountPlan> {
        self.mount.as_ref()
    }

    /// Returns `true` when the plan does nothing.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Builds the ordered exposure plan.
///
/// In [`ExposureScope::Command`] all configured exposures are planned and an
/// existing mount is a conflict. In [`ExposureScope::System`] only mount
/// exposures are planned, every secret is mounted at its own name when none
/// are configured, and an existing mount is replaced.
pub fn plan<'a>(
    config: &'a Configuration,
    secrets: &'a SecretTable,
    request: &PlanRequest,
    host: &dyn HostProbe,
) -> Result<ExposurePlan<'a>, PlanError> {
    let default_owner = FileOptions {
        mode: None,
        owner: request.default_user.clone(),
        group: request.default_group.clone(),
    };
    let lookup = |name: &'a SecretName| {
        secrets
            .get(name)
            .ok_or_else(|| PlanError::MissingSecret(name.to_string()))
    };

    let mut mounts = Vec::new();
    let mut files = Vec::new();
    let mut envs = Vec::new();
    for exposure in config.exposures() {
        let secret_name = &exposure.secret_name;
        match &exposure.kind {
            ExposureKind::Mount { path, options } => {
                let (mode, owner) = file_attributes(options, &default_owner, host)?;
                mounts.push(ExposureAction {
                    secret_name,
                    kind: ActionKind::Mount {
                        relative_path: path.clone(),
                        mode,
                        owner,
                    },
                    plaintext: lookup(secret_name)?,
                });
            }
            ExposureKind::File { path, options } if request.scope == ExposureScope::Command => {
                if host.path_exists(path) {
                    return Err(PlanError::DestinationExists(path.clone()));
                }
                let (mode, owner) = file_attributes(options, &default_owner, host)?;
                files.push(ExposureAction {
                    secret_name,
                    kind: ActionKind::File {
                        path: path.clone(),
                        mode,
                        owner,
                    },
                    plaintext: lookup(secret_name)?,
                });
            }
            ExposureKind::Env { var_name } if request.scope == ExposureScope::Command => {
                if host.env_var_set(var_name) {
                    return Err(PlanError::EnvVarInUse(var_name.clone()));
                }
                envs.push(ExposureAction {
                    secret_name,
                    kind: ActionKind::Env {
                        var_name: var_name.clone(),
                    },
                    plaintext: lookup(secret_name)?,
                });
            }
            _ => {}
        }
    }

    if request.scope == ExposureScope::System && mounts.is_empty() {
        let (mode, owner) = file_attributes(&FileOptions::default(), &default_owner, host)?;
        for secret in config.secrets() {
            mounts.push(ExposureAction {
                secret_name: &secret.name,
                kind: ActionKind::Mount {
                    relative_path: PathBuf::from(secret.name.as_str()),
                    mode,
                    owner,
                },
                plaintext: lookup(&secret.name)?,
            });
        }
    }

    let mount = if mounts.is_empty() {
        None
    } else {
        Some(plan_mount(&mounts, request, host)?)
    };

    let mut actions = mounts;
    actions.extend(files);
    actions.extend(envs);
    tracing::debug!(actions = actions.len(), mount = mount.is_some(), "planned exposures");
    Ok(ExposurePlan { actions, mount })
}

fn plan_mount(
    mounts: &[ExposureAction<'_>],
    request: &PlanRequest,
    host: &dyn HostProbe,
) -> Result<MountPlan, PlanError> {
    let relative_paths: Vec<&Path> = mounts
        .iter()
        .filter_map(|action| match &action.kind {
            ActionKind::Mount { relative_path, .. } => Some(relative_path.as_path()),
            _ => None,
        })
        .collect();
    for parent in &relative_paths {
        if let Some(nested) = relative_paths
            .iter()
            .find(|candidate| candidate != &parent && candidate.starts_with(parent))
        {
            return Err(PlanError::NestedMountEntries {
                parent: parent.to_path_buf(),
                nested: nested.to_path_buf(),
            });
        }
    }

    let mounted = request.mount_state.is_mounted();
    if mounted && request.scope == ExposureScope::Command {
        return Err(PlanError::MountPointInUse(
            request.layout.mount_point().to_path_buf(),
        ));
    }

    let secret_dir = request.layout.secret_dir();
    let secret_dir_is_symlink = secret_dir
        .symlink_metadata()
        .map(|metadata| metadata.file_type().is_symlink())
        .unwrap_or(false);
    if host.path_exists(secret_dir) && !secret_dir_is_symlink {
        return Err(PlanError::DestinationExists(secret_dir.to_path_buf()));
    }

    Ok(MountPlan {
        layout: request.layout.clone(),
        replace_existing: mounted,
    })
}

fn file_attributes(
    options: &FileOptions,
    defaults: &FileOptions,
    host: &dyn HostProbe,
) -> Result<(u32, FileOwner), PlanError> {
    let mode = options.mode.unwrap_or(READ_ONLY_FILE_MODE);
    let uid = options
        .owner
        .as_deref()
        .or(defaults.owner.as_deref())
        .map(|name| resolve_id(name, |name| host.lookup_user(name), PlanError::UnknownUser))
        .transpose()?;
    let gid = options
        .group
        .as_deref()
        .or(defaults.group.as_deref())
        .map(|name| resolve_id(name, |name| host.lookup_group(name), PlanError::UnknownGroup))
        .transpose()?;
    Ok((mode, FileOwner { uid, gid }))
}

fn resolve_id<F>(name: &str, lookup: F, unknown: fn(String) -> PlanError) -> Result<u32, PlanError>
where
    F: Fn(&str) -> Option<u32>,
{
    if let Ok(id) = name.parse::<u32>() {
        return Ok(id);
    }
    lookup(name).ok_or_else(|| unknown(name.to_owned()))
}
