use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use credible::{
    cipher::{generate_identity_file, AgeCipher, CipherEngine},
    config::{merge_in, ConfigFragment, Configuration},
    exposure::MountDriver,
    storage::{SecretStorage, StorageError},
    types::PublicKey,
};

/// Identity file generated for one test.
#[allow(dead_code)]
pub struct IdentityMaterial {
    /// Path to the private identity file.
    pub identity_file: PathBuf,
    /// Matching public key.
    pub public_key: PublicKey,
}

/// Generates one identity file below `root`.
#[allow(dead_code)]
pub fn generate_identity(root: &Path, label: &str) -> IdentityMaterial {
    let identity_file = root.join(format!("{label}.agekey"));
    let public_key = generate_identity_file(&identity_file).unwrap_or_else(|error| {
        panic!(
            "failed to write identity {}: {error}",
            identity_file.display()
        )
    });
    IdentityMaterial {
        identity_file,
        public_key,
    }
}

/// Generates an unencrypted ed25519 SSH key with `ssh-keygen`.
///
/// Returns `None` when `ssh-keygen` is not installed.
#[allow(dead_code)]
pub fn generate_ssh_identity(dir: &Path, name: &str) -> Option<IdentityMaterial> {
    fs::create_dir_all(dir).unwrap();
    let identity_file = dir.join(name);
    let status = std::process::Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", "credible@test", "-f"])
        .arg(&identity_file)
        .stdin(std::process::Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => panic!("ssh-keygen failed: {status}"),
        Err(error) => {
            eprintln!("ssh-keygen unavailable ({error}), skipping");
            return None;
        }
    }
    let raw_public = fs::read_to_string(format!("{}.pub", identity_file.display())).unwrap();
    Some(IdentityMaterial {
        identity_file,
        public_key: PublicKey::parse(&raw_public).unwrap(),
    })
}

/// Encrypts `plaintext` for `recipients`.
#[allow(dead_code)]
pub fn encrypt_for(plaintext: &[u8], recipients: &[&PublicKey]) -> Vec<u8> {
    let recipients: Vec<PublicKey> = recipients.iter().map(|key| (*key).clone()).collect();
    AgeCipher.encrypt(plaintext, &recipients).unwrap()
}

/// Parses one inline fragment.
#[allow(dead_code)]
pub fn fragment(raw: &str) -> ConfigFragment {
    ConfigFragment::parse(raw, None).unwrap_or_else(|error| panic!("bad fragment: {error}\n{raw}"))
}

/// Merges inline fragments, resolving relative paths against `cwd`.
#[allow(dead_code)]
pub fn configuration(cwd: &Path, fragments: &[&str]) -> Configuration {
    merge_in(cwd, fragments.iter().map(|raw| fragment(raw))).unwrap()
}

/// `[[secrets]]` entry encrypted for `key`.
#[allow(dead_code)]
pub fn secret_toml(name: &str, path: &str, key: &PublicKey) -> String {
    format!("[[secrets]]\nname = \"{name}\"\npath = \"{path}\"\nencryption_keys = [\"{key}\"]\n")
}

/// In-memory storage backend counting every fetch.
#[allow(dead_code)]
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: Mutex<HashSet<String>>,
    gets: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryStorage {
    /// Stores one object.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(path.to_owned(), bytes);
    }

    /// Makes every fetch of `path` fail as unavailable.
    pub fn fail(&self, path: &str) {
        self.unavailable.lock().unwrap().insert(path.to_owned());
    }

    /// Number of fetches so far.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

impl SecretStorage for MemoryStorage {
    fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.lock().unwrap().contains(path) {
            return Err(StorageError::Unavailable {
                path: path.to_owned(),
                reason: "injected outage".to_owned(),
            });
        }
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_owned()))
    }

    fn put(&self, path: &str, ciphertext: &[u8]) -> Result<(), StorageError> {
        self.insert(path, ciphertext.to_vec());
        Ok(())
    }
}

/// Mount driver that treats a plain directory as a mount.
///
/// Unmounting empties the directory, the way a ramfs disappears.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingMountDriver {
    mounted: Mutex<HashSet<PathBuf>>,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
}

#[allow(dead_code)]
impl RecordingMountDriver {
    /// Successful mount calls.
    pub fn mount_count(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    /// Successful unmount calls.
    pub fn unmount_count(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    /// Currently mounted points.
    pub fn active_mounts(&self) -> usize {
        self.mounted.lock().unwrap().len()
    }
}

impl MountDriver for RecordingMountDriver {
    fn mount(&self, mount_point: &Path) -> io::Result<()> {
        if !mount_point.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "mount point does not exist",
            ));
        }
        if !self
            .mounted
            .lock()
            .unwrap()
            .insert(mount_point.to_path_buf())
        {
            return Err(io::Error::other("already mounted"));
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> io::Result<()> {
        if !self.mounted.lock().unwrap().remove(mount_point) {
            return Err(io::Error::other("not mounted"));
        }
        for entry in fs::read_dir(mount_point)? {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_mounted(&self, mount_point: &Path) -> io::Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(mount_point))
    }
}
