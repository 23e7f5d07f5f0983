use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use uuid::Uuid;

/// Default Unix mode for private files.
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Default Unix mode for exposed secret files.
pub const READ_ONLY_FILE_MODE: u32 = 0o400;

/// Writes a file atomically with restricted permissions.
pub fn write_private_file_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    create_parent_dir(path)?;

    let temp_path = temp_path_for(path);
    let written = fs::write(&temp_path, bytes)
        .and_then(|()| set_permissions(&temp_path, PRIVATE_FILE_MODE))
        .and_then(|()| fs::rename(&temp_path, path));
    if let Err(error) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(error);
    }
    set_permissions(path, PRIVATE_FILE_MODE)
}

/// Creates a new file with `mode`, failing if anything already exists at `path`.
///
/// The file is removed again when writing the contents fails.
pub fn create_exclusive_file(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(mode);

    let mut file = options.open(path)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    if let Err(error) = written {
        let _ = secure_delete_file(path);
        return Err(error);
    }
    // umask may have masked bits off the requested mode
    set_permissions(path, mode)
}

/// Creates every missing ancestor of `dir`, returning the created directories outermost first.
pub fn create_missing_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(candidate) = current {
        if candidate.as_os_str().is_empty() || candidate.exists() {
            break;
        }
        missing.push(candidate.to_path_buf());
        current = candidate.parent();
    }
    missing.reverse();

    let mut created = Vec::with_capacity(missing.len());
    for candidate in missing {
        if let Err(error) = fs::create_dir(&candidate) {
            remove_created_dirs(&created);
            return Err(error);
        }
        created.push(candidate);
    }
    Ok(created)
}

/// Removes directories returned by [`create_missing_dirs`], innermost first.
///
/// Directories that are no longer empty are left in place.
pub fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(error) = fs::remove_dir(dir) {
            tracing::debug!(path = %dir.display(), %error, "leaving created directory in place");
        }
    }
}

/// Overwrites a file with zeroes before deletion. Missing files are ignored.
pub fn secure_delete_file(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if !metadata.file_type().is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to delete non-regular file {}", path.display()),
        ));
    }

    set_permissions(path, PRIVATE_FILE_MODE)?;
    let size = metadata.len() as usize;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0_u8; size])?;
    file.sync_all()?;
    drop(file);
    fs::remove_file(path)
}

/// Applies Unix permissions when supported.
pub fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let suffix = Uuid::new_v4();
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("tmp");
    let temp_name = format!(".{file_name}.{suffix}.tmp");
    path.with_file_name(temp_name)
}

fn create_parent_dir(path: &Path) -> io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)
}
