use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::paths::MountLayout;

/// Lifecycle of one exposure record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Created before the artifact exists.
    Planned,
    /// Artifact exists on the host.
    Materialized,
    /// Artifact was removed.
    TornDown,
}

/// Artifact tracked by a record, carrying exactly what teardown must reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    /// Mounted filesystem together with its marker and symlink.
    MountRoot {
        /// Mounted layout.
        layout: MountLayout,
        /// Directories created for the mount point, outermost first.
        created_dirs: Vec<PathBuf>,
    },
    /// File written below the mount point.
    MountEntry {
        /// Absolute path of the entry.
        path: PathBuf,
        /// Directories created below the mount point for this entry.
        created_dirs: Vec<PathBuf>,
    },
    /// Regular file.
    File {
        /// Absolute path.
        path: PathBuf,
        /// Parent directories created for this file, outermost first.
        created_dirs: Vec<PathBuf>,
    },
    /// Environment variable handed to the spawned command.
    Env {
        /// Variable name.
        var_name: String,
    },
}

/// Invalid record lifecycle transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid exposure record transition for {destination}: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    /// Record destination.
    pub destination: String,
    /// State before the transition.
    pub from: RecordState,
    /// Requested state.
    pub to: RecordState,
}

/// Runtime-created artifact tracked for teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposureRecord {
    kind: RecordKind,
    created_at: DateTime<Utc>,
    state: RecordState,
}

impl ExposureRecord {
    pub(crate) fn planned(kind: RecordKind) -> Self {
        Self {
            kind,
            created_at: Utc::now(),
            state: RecordState::Planned,
        }
    }

    /// Tracked artifact.
    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Human-readable destination.
    pub fn destination(&self) -> String {
        match &self.kind {
            RecordKind::MountRoot { layout, .. } => {
                format!("mount point {}", layout.mount_point().display())
            }
            RecordKind::MountEntry { path, .. } | RecordKind::File { path, .. } => {
                path.display().to_string()
            }
            RecordKind::Env { var_name } => format!("env {var_name}"),
        }
    }

    pub(crate) fn advance(&mut self, to: RecordState) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.state, to),
            (RecordState::Planned, RecordState::Materialized)
                | (RecordState::Materialized, RecordState::TornDown)
        );
        if !allowed {
            return Err(InvalidTransition {
                destination: self.destination(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExposureRecord, RecordKind, RecordState};

    fn env_record() -> ExposureRecord {
        ExposureRecord::planned(RecordKind::Env {
            var_name: "TOKEN".to_owned(),
        })
    }

    #[test]
    fn records_move_forward_only() {
        let mut record = env_record();
        assert_eq!(record.state(), RecordState::Planned);
        record.advance(RecordState::Materialized).unwrap();
        record.advance(RecordState::TornDown).unwrap();
        assert_eq!(record.state(), RecordState::TornDown);
    }

    #[test]
    fn planned_records_cannot_be_torn_down() {
        let mut record = env_record();
        let error = record.advance(RecordState::TornDown).unwrap_err();
        assert_eq!(error.from, RecordState::Planned);
        assert_eq!(error.destination, "env TOKEN");
    }

    #[test]
    fn torn_down_records_cannot_be_revived() {
        let mut record = env_record();
        record.advance(RecordState::Materialized).unwrap();
        record.advance(RecordState::TornDown).unwrap();
        assert!(record.advance(RecordState::Materialized).is_err());
        assert!(record.advance(RecordState::TornDown).is_err());
    }
}
