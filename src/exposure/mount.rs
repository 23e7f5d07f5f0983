use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    command::{map_command_execution_error, run_captured},
    fs_secure::write_private_file_atomic,
    paths::MountLayout,
};

const RAMFS_MOUNT_OPTIONS: &str = "nodev,nosuid,mode=0751";

/// Memory-backed filesystem orchestration.
pub trait MountDriver: Send + Sync {
    /// Mounts a fresh memory-backed filesystem on an existing directory.
    fn mount(&self, mount_point: &Path) -> io::Result<()>;
    /// Unmounts one mount point.
    fn unmount(&self, mount_point: &Path) -> io::Result<()>;
    /// Returns mount status for one mount point.
    fn is_mounted(&self, mount_point: &Path) -> io::Result<bool>;
}

/// System `mount -t ramfs` command driver.
#[derive(Debug, Clone)]
pub struct RamfsDriver {
    mount_binary: String,
    umount_binary: String,
    mountpoint_binary: String,
}

impl RamfsDriver {
    /// Constructs a driver using default binary names.
    pub fn new() -> Self {
        Self {
            mount_binary: "mount".to_owned(),
            umount_binary: "umount".to_owned(),
            mountpoint_binary: "mountpoint".to_owned(),
        }
    }

    /// Constructs a driver with custom binaries.
    pub fn with_binaries(
        mount_binary: impl Into<String>,
        umount_binary: impl Into<String>,
        mountpoint_binary: impl Into<String>,
    ) -> Self {
        Self {
            mount_binary: mount_binary.into(),
            umount_binary: umount_binary.into(),
            mountpoint_binary: mountpoint_binary.into(),
        }
    }

    fn run(&self, binary: &str, command: &mut Command) -> io::Result<()> {
        let output = run_captured(command, None)
            .map_err(|error| map_command_execution_error(binary, error))?;
        if output.success() {
            return Ok(());
        }
        Err(io::Error::other(format!(
            "{binary} exited with status {}: {}",
            output.status_code, output.stderr
        )))
    }
}

impl Default for RamfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MountDriver for RamfsDriver {
    fn mount(&self, mount_point: &Path) -> io::Result<()> {
        self.run(
            &self.mount_binary,
            Command::new(&self.mount_binary)
                .args(["-t", "ramfs", "none"])
                .arg(mount_point)
                .args(["-o", RAMFS_MOUNT_OPTIONS]),
        )
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        self.run(
            &self.umount_binary,
            Command::new(&self.umount_binary).arg(mount_point),
        )
    }

    fn is_mounted(&self, mount_point: &Path) -> io::Result<bool> {
        let output = run_captured(
            Command::new(&self.mountpoint_binary)
                .arg("-q")
                .arg(mount_point),
            None,
        )
        .map_err(|error| map_command_execution_error(&self.mountpoint_binary, error))?;
        Ok(output.success())
    }
}

/// Contents of the marker file written at the root of an active mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountMarker {
    /// Mount timestamp.
    pub mounted_at: DateTime<Utc>,
    /// Broker process that created the mount.
    pub pid: u32,
    /// Entries written below the mount point, relative to it.
    pub entries: Vec<PathBuf>,
}

impl MountMarker {
    /// Marker for entries mounted now by this process.
    pub fn new(entries: Vec<PathBuf>) -> Self {
        Self {
            mounted_at: Utc::now(),
            pid: std::process::id(),
            entries,
        }
    }
}

/// Observed state of the mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    /// Nothing is mounted.
    Unmounted,
    /// A mount or a leftover marker exists.
    Mounted {
        /// Marker contents when readable.
        marker: Option<MountMarker>,
    },
}

impl MountState {
    /// Inspects `layout` through `driver`.
    ///
    /// A missing mount point directory is unmounted without consulting the driver.
    /// A readable marker without an active mount still counts as mounted so that
    /// leftovers are cleaned by the next unmount.
    pub fn detect(driver: &dyn MountDriver, layout: &MountLayout) -> io::Result<Self> {
        if !layout.mount_point().is_dir() {
            return Ok(MountState::Unmounted);
        }

        let marker = read_marker(layout);
        if driver.is_mounted(layout.mount_point())? || marker.is_some() {
            return Ok(MountState::Mounted { marker });
        }
        Ok(MountState::Unmounted)
    }

    /// Returns `true` for [`MountState::Mounted`].
    pub fn is_mounted(&self) -> bool {
        matches!(self, MountState::Mounted { .. })
    }
}

pub(crate) fn read_marker(layout: &MountLayout) -> Option<MountMarker> {
    let bytes = fs::read(layout.marker_file()).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Some(marker),
        Err(error) => {
            tracing::warn!(path = %layout.marker_file().display(), %error, "ignoring unreadable mount marker");
            None
        }
    }
}

pub(crate) fn write_marker(layout: &MountLayout, marker: &MountMarker) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(marker).map_err(io::Error::other)?;
    write_private_file_atomic(&layout.marker_file(), &bytes)
}
