//! Materializes planned exposures and tears them down again.

mod mount;
mod record;

use std::{
    fs, io,
    os::unix::fs::{chown, symlink},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    fs_secure::{
        create_exclusive_file, create_missing_dirs, remove_created_dirs, secure_delete_file,
        set_permissions,
    },
    paths::{validate_relative_path, MountLayout},
    plan::{ActionKind, ExposureAction, ExposurePlan, FileOwner, MountPlan},
    types::SecretValue,
};

pub use mount::{MountDriver, MountMarker, MountState, RamfsDriver};
pub use record::{ExposureRecord, InvalidTransition, RecordKind, RecordState};

/// Permission bits applied to the mount point once mounted.
pub const MOUNT_DIR_MODE: u32 = 0o751;

/// Exposure materialization failures. Anything already created has been rolled back.
#[derive(Debug, Error)]
pub enum ExposureError {
    /// Writing one exposure failed.
    #[error("failed to expose secret '{secret}' at {destination}: {source}")]
    Materializing {
        /// Secret being exposed.
        secret: String,
        /// Failing destination.
        destination: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Plaintext cannot be passed through the environment.
    #[error("secret '{secret}' contains a NUL byte and cannot be exposed as env {var_name}")]
    InvalidEnvValue {
        /// Secret being exposed.
        secret: String,
        /// Target variable.
        var_name: String,
    },
    /// Preparing the mount point failed.
    #[error("failed to mount {}: {source}", .mount_point.display())]
    Mounting {
        /// Mount point.
        mount_point: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Removing an existing mount failed.
    #[error("failed to unmount {}: {source}", .mount_point.display())]
    Unmounting {
        /// Mount point.
        mount_point: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Mount state could not be determined.
    #[error("failed to inspect mount point {}: {source}", .mount_point.display())]
    InspectingMount {
        /// Mount point.
        mount_point: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Record lifecycle was violated.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    /// Materialization failed and the rollback left artifacts behind.
    #[error("{error}; rollback also failed: {rollback}")]
    RollbackFailed {
        /// Original failure.
        error: Box<ExposureError>,
        /// Rollback failures.
        rollback: TeardownError,
    },
}

impl ExposureError {
    /// Destination whose materialization failed, when one is known.
    pub fn destination(&self) -> Option<String> {
        match self {
            ExposureError::Materializing { destination, .. } => Some(destination.clone()),
            ExposureError::InvalidEnvValue { var_name, .. } => Some(format!("env {var_name}")),
            ExposureError::Mounting { mount_point, .. }
            | ExposureError::Unmounting { mount_point, .. }
            | ExposureError::InspectingMount { mount_point, .. } => {
                Some(mount_point.display().to_string())
            }
            ExposureError::InvalidTransition(error) => Some(error.destination.clone()),
            ExposureError::RollbackFailed { error, .. } => error.destination(),
        }
    }
}

/// One artifact that could not be removed.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Artifact destination.
    pub destination: String,
    /// Underlying error.
    pub source: io::Error,
}

/// Every artifact teardown could not remove. Teardown continues past failures.
#[derive(Debug, Error)]
#[error("failed to tear down {}", describe_failures(.failures))]
pub struct TeardownError {
    failures: Vec<TeardownFailure>,
}

impl TeardownError {
    /// Individual failures in teardown order.
    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }
}

fn describe_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.destination, failure.source))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Records and environment produced by a successful materialization.
#[derive(Debug)]
pub struct Materialized<'a> {
    records: Vec<ExposureRecord>,
    env: Vec<(String, &'a SecretValue)>,
}

impl<'a> Materialized<'a> {
    /// Records in creation order.
    pub fn records(&self) -> &[ExposureRecord] {
        &self.records
    }

    /// Environment variables for the spawned command.
    pub fn env(&self) -> &[(String, &'a SecretValue)] {
        &self.env
    }

    /// Splits into records and environment.
    pub fn into_parts(self) -> (Vec<ExposureRecord>, Vec<(String, &'a SecretValue)>) {
        (self.records, self.env)
    }
}

/// Executes exposure plans through one mount driver.
#[derive(Debug)]
pub struct ExposureRuntime<D: MountDriver> {
    driver: D,
}

impl<D: MountDriver> ExposureRuntime<D> {
    /// Creates a runtime backed by `driver`.
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    /// Mount driver in use.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Inspects the mount point.
    pub fn mount_state(&self, layout: &MountLayout) -> Result<MountState, ExposureError> {
        MountState::detect(&self.driver, layout).map_err(|source| ExposureError::InspectingMount {
            mount_point: layout.mount_point().to_path_buf(),
            source,
        })
    }

    /// Materializes every action of `plan` in order.
    ///
    /// On failure every artifact created so far is torn down before the error
    /// is returned.
    pub fn materialize<'a>(&self, plan: &ExposurePlan<'a>) -> Result<Materialized<'a>, ExposureError> {
        let mut records = Vec::new();
        let mut env = Vec::new();
        match self.materialize_into(plan, &mut records, &mut env) {
            Ok(()) => {
                tracing::info!(records = records.len(), "materialized exposures");
                Ok(Materialized { records, env })
            }
            Err(error) => {
                tracing::warn!(%error, created = records.len(), "rolling back partial exposure");
                Err(with_rollback(error, self.teardown(records)))
            }
        }
    }

    /// Reverses `records` newest first, continuing past individual failures.
    pub fn teardown(&self, records: Vec<ExposureRecord>) -> Result<(), TeardownError> {
        let mut failures = Vec::new();
        for mut record in records.into_iter().rev() {
            if record.state() != RecordState::Materialized {
                continue;
            }
            let undone = self
                .undo(record.kind())
                .and_then(|()| record.advance(RecordState::TornDown).map_err(io::Error::other));
            match undone {
                Ok(()) => tracing::debug!(destination = %record.destination(), "tore down exposure"),
                Err(source) => {
                    tracing::warn!(destination = %record.destination(), error = %source, "teardown failed");
                    failures.push(TeardownFailure {
                        destination: record.destination(),
                        source,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }

    /// Removes the mount and its symlink. Returns `false` when nothing was mounted.
    pub fn unmount(&self, layout: &MountLayout) -> Result<bool, ExposureError> {
        let MountState::Mounted { marker } = self.mount_state(layout)? else {
            tracing::info!(mount_point = %layout.mount_point().display(), "nothing mounted");
            return Ok(false);
        };

        let unmounting = |source| ExposureError::Unmounting {
            mount_point: layout.mount_point().to_path_buf(),
            source,
        };
        unlink_own_secret_dir(layout).map_err(unmounting)?;
        let active = self
            .driver
            .is_mounted(layout.mount_point())
            .map_err(unmounting)?;
        if active {
            self.driver.unmount(layout.mount_point()).map_err(unmounting)?;
        } else {
            // leftovers from a mount that vanished underneath us
            for entry in marker.map(|marker| marker.entries).unwrap_or_default() {
                let Ok(entry) = validate_relative_path(&entry) else {
                    tracing::warn!(entry = %entry.display(), "skipping marker entry outside mount point");
                    continue;
                };
                secure_delete_file(&layout.entry_path(&entry)).map_err(unmounting)?;
            }
            remove_if_present(&layout.marker_file()).map_err(unmounting)?;
        }
        tracing::info!(mount_point = %layout.mount_point().display(), "unmounted");
        Ok(true)
    }

    fn materialize_into<'a>(
        &self,
        plan: &ExposurePlan<'a>,
        records: &mut Vec<ExposureRecord>,
        env: &mut Vec<(String, &'a SecretValue)>,
    ) -> Result<(), ExposureError> {
        let actions = plan.actions();
        let mount_count = actions
            .iter()
            .take_while(|action| matches!(action.kind(), ActionKind::Mount { .. }))
            .count();
        let (mount_actions, other_actions) = actions.split_at(mount_count);

        if let Some(mount) = plan.mount() {
            records.push(self.prepare_mount(mount)?);
            let mut entries = Vec::with_capacity(mount_actions.len());
            for action in mount_actions {
                if let ActionKind::Mount {
                    relative_path,
                    mode,
                    owner,
                } = action.kind()
                {
                    let path = mount.layout.entry_path(relative_path);
                    let created_dirs = expose_file(action, &path, *mode, *owner)?;
                    records.push(materialized(RecordKind::MountEntry { path, created_dirs })?);
                    entries.push(relative_path.clone());
                }
            }
            finish_mount(&mount.layout, entries).map_err(|source| ExposureError::Mounting {
                mount_point: mount.layout.mount_point().to_path_buf(),
                source,
            })?;
        }

        for action in other_actions {
            match action.kind() {
                ActionKind::File { path, mode, owner } => {
                    let created_dirs = expose_file(action, path, *mode, *owner)?;
                    records.push(materialized(RecordKind::File {
                        path: path.clone(),
                        created_dirs,
                    })?);
                }
                ActionKind::Env { var_name } => {
                    if action.plaintext().expose(|bytes| bytes.contains(&0)) {
                        return Err(ExposureError::InvalidEnvValue {
                            secret: action.secret_name().to_string(),
                            var_name: var_name.clone(),
                        });
                    }
                    records.push(materialized(RecordKind::Env {
                        var_name: var_name.clone(),
                    })?);
                    env.push((var_name.clone(), action.plaintext()));
                }
                ActionKind::Mount { relative_path, .. } => {
                    return Err(ExposureError::Materializing {
                        secret: action.secret_name().to_string(),
                        destination: relative_path.display().to_string(),
                        source: io::Error::other("mount entry planned after non-mount exposures"),
                    });
                }
            }
        }
        Ok(())
    }

    fn prepare_mount(&self, mount: &MountPlan) -> Result<ExposureRecord, ExposureError> {
        let layout = &mount.layout;
        let mounting = |source| ExposureError::Mounting {
            mount_point: layout.mount_point().to_path_buf(),
            source,
        };
        if mount.replace_existing {
            self.unmount(layout)?;
        }

        let created_dirs = create_missing_dirs(layout.mount_point()).map_err(mounting)?;
        if let Err(error) = self.driver.mount(layout.mount_point()) {
            remove_created_dirs(&created_dirs);
            return Err(mounting(error));
        }
        let record = materialized(RecordKind::MountRoot {
            layout: layout.clone(),
            created_dirs,
        })?;
        if let Err(error) = set_permissions(layout.mount_point(), MOUNT_DIR_MODE) {
            return Err(with_rollback(mounting(error), self.teardown(vec![record])));
        }
        tracing::info!(mount_point = %layout.mount_point().display(), "mounted secret filesystem");
        Ok(record)
    }

    fn unmount_if_active(&self, mount_point: &Path) -> io::Result<()> {
        if self.driver.is_mounted(mount_point)? {
            self.driver.unmount(mount_point)?;
        }
        Ok(())
    }

    fn undo(&self, kind: &RecordKind) -> io::Result<()> {
        match kind {
            RecordKind::Env { .. } => Ok(()),
            RecordKind::File { path, created_dirs }
            | RecordKind::MountEntry { path, created_dirs } => {
                secure_delete_file(path)?;
                remove_created_dirs(created_dirs);
                Ok(())
            }
            RecordKind::MountRoot {
                layout,
                created_dirs,
            } => {
                let steps = [
                    unlink_own_secret_dir(layout),
                    remove_if_present(&layout.marker_file()),
                    self.unmount_if_active(layout.mount_point()),
                ];
                remove_created_dirs(created_dirs);
                steps.into_iter().collect()
            }
        }
    }
}

/// Attaches a failed rollback to `error`, so leftovers are always reported.
fn with_rollback(error: ExposureError, rollback: Result<(), TeardownError>) -> ExposureError {
    match rollback {
        Ok(()) => error,
        Err(rollback) => ExposureError::RollbackFailed {
            error: Box::new(error),
            rollback,
        },
    }
}

fn materialized(kind: RecordKind) -> Result<ExposureRecord, ExposureError> {
    let mut record = ExposureRecord::planned(kind);
    record.advance(RecordState::Materialized)?;
    Ok(record)
}

/// Writes one secret file, cleaning up after itself on failure.
fn expose_file(
    action: &ExposureAction<'_>,
    path: &Path,
    mode: u32,
    owner: FileOwner,
) -> Result<Vec<PathBuf>, ExposureError> {
    let failed = |source| ExposureError::Materializing {
        secret: action.secret_name().to_string(),
        destination: path.display().to_string(),
        source,
    };

    let parent = path.parent().unwrap_or(Path::new("/"));
    let created_dirs = create_missing_dirs(parent).map_err(failed)?;
    if let Err(error) = action
        .plaintext()
        .expose(|bytes| create_exclusive_file(path, bytes, mode))
    {
        remove_created_dirs(&created_dirs);
        return Err(failed(error));
    }
    if owner.uid.is_some() || owner.gid.is_some() {
        if let Err(error) = chown(path, owner.uid, owner.gid) {
            let rollback = secure_delete_file(path).map_err(|source| TeardownError {
                failures: vec![TeardownFailure {
                    destination: path.display().to_string(),
                    source,
                }],
            });
            remove_created_dirs(&created_dirs);
            return Err(with_rollback(failed(error), rollback));
        }
    }
    tracing::debug!(secret = %action.secret_name(), path = %path.display(), mode = format_args!("{mode:o}"), "wrote secret file");
    Ok(created_dirs)
}

fn finish_mount(layout: &MountLayout, entries: Vec<PathBuf>) -> io::Result<()> {
    mount::write_marker(layout, &MountMarker::new(entries))?;
    remove_secret_dir_link(layout)?;
    symlink(layout.mount_point(), layout.secret_dir())
}

fn remove_secret_dir_link(layout: &MountLayout) -> io::Result<()> {
    match fs::symlink_metadata(layout.secret_dir()) {
        Ok(metadata) if metadata.file_type().is_symlink() => fs::remove_file(layout.secret_dir()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a symlink", layout.secret_dir().display()),
        )),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

/// Removes the secret directory symlink only when it points at this mount point.
fn unlink_own_secret_dir(layout: &MountLayout) -> io::Result<()> {
    match fs::read_link(layout.secret_dir()) {
        Ok(target) if target == layout.mount_point() => fs::remove_file(layout.secret_dir()),
        Ok(_) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        // not a symlink
        Err(error) if error.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(error) => Err(error),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{with_rollback, ExposureError, TeardownError, TeardownFailure};

    fn materializing() -> ExposureError {
        ExposureError::Materializing {
            secret: "db".to_owned(),
            destination: "/etc/app/db".to_owned(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
    }

    #[test]
    fn clean_rollback_keeps_original_error() {
        let error = with_rollback(materializing(), Ok(()));
        assert!(matches!(error, ExposureError::Materializing { .. }));
    }

    #[test]
    fn failed_rollback_reports_leftover_destination() {
        let rollback = TeardownError {
            failures: vec![TeardownFailure {
                destination: "/etc/app/db".to_owned(),
                source: io::Error::other("read-only file system"),
            }],
        };

        let error = with_rollback(materializing(), Err(rollback));

        let ExposureError::RollbackFailed { error: inner, rollback } = &error else {
            panic!("expected rollback failure, got {error}");
        };
        assert!(matches!(**inner, ExposureError::Materializing { .. }));
        assert_eq!(rollback.failures()[0].destination, "/etc/app/db");
        assert_eq!(error.destination().as_deref(), Some("/etc/app/db"));
        assert!(error.to_string().contains("rollback also failed"));
    }
}
