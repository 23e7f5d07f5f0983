//! Fetches and decrypts every declared secret into a [`SecretTable`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
};

use thiserror::Error;

use crate::{
    cipher::{CipherEngine, CipherError, PrivateKey},
    config::{Configuration, Secret},
    storage::{SecretStorage, StorageError},
    types::{SecretName, SecretValue},
};

/// Upper bound on concurrent fetch and decrypt tasks.
pub const MAX_RESOLVE_WORKERS: usize = 8;

/// Secret resolution failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Ciphertext is missing from storage.
    #[error("secret not found in storage: {0}")]
    NotFound(String),
    /// No supplied private key can decrypt the secret.
    #[error("no private key can decrypt secret '{0}'")]
    NoMatchingKey(String),
    /// Storage backend failed.
    #[error("storage backend unavailable for {path}: {reason}")]
    BackendUnavailable {
        /// Object path.
        path: String,
        /// Backend-supplied reason.
        reason: String,
    },
    /// Storage rejected the configured path.
    #[error("invalid storage path for secret '{secret}': {path}")]
    InvalidPath {
        /// Secret name.
        secret: String,
        /// Rejected path.
        path: String,
    },
    /// Ciphertext could not be decrypted.
    #[error("failed to decrypt secret '{secret}': {source}")]
    Decrypting {
        /// Secret name.
        secret: String,
        /// Cipher failure.
        #[source]
        source: CipherError,
    },
    /// Private key files could not be loaded.
    #[error(transparent)]
    LoadingKeys(#[from] CipherError),
}

/// Decrypted secrets keyed by name, each written exactly once.
#[derive(Default)]
pub struct SecretTable {
    entries: BTreeMap<SecretName, SecretValue>,
}

impl SecretTable {
    /// Builds a table from resolved entries.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (SecretName, SecretValue)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Plaintext for `name`.
    pub fn get(&self, name: &SecretName) -> Option<&SecretValue> {
        self.entries.get(name)
    }

    /// Resolved names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &SecretName> {
        self.entries.keys()
    }

    /// Number of resolved secrets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SecretTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Resolves secrets through one storage backend and one cipher engine.
pub struct SecretResolver<'a> {
    storage: &'a dyn SecretStorage,
    cipher: &'a dyn CipherEngine,
    max_workers: usize,
}

impl<'a> SecretResolver<'a> {
    /// Creates a resolver with the default worker bound.
    pub fn new(storage: &'a dyn SecretStorage, cipher: &'a dyn CipherEngine) -> Self {
        Self {
            storage,
            cipher,
            max_workers: MAX_RESOLVE_WORKERS,
        }
    }

    /// Overrides the worker bound; `0` is treated as `1`.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Resolves every secret declared by `config`.
    pub fn resolve(
        &self,
        config: &Configuration,
        keys: &[PrivateKey],
    ) -> Result<SecretTable, ResolveError> {
        self.resolve_secrets(config.secrets(), keys)
    }

    /// Resolves `secrets` on a bounded worker pool.
    ///
    /// Either every secret resolves or the first failure in declaration order is
    /// returned and no table is built. Remaining work is skipped once any task fails.
    pub fn resolve_secrets(
        &self,
        secrets: &[Secret],
        keys: &[PrivateKey],
    ) -> Result<SecretTable, ResolveError> {
        if secrets.is_empty() {
            return Ok(SecretTable::default());
        }

        let worker_count = self
            .max_workers
            .min(secrets.len())
            .min(available_parallelism());
        tracing::debug!(secrets = secrets.len(), workers = worker_count, "resolving secrets");

        let next_index = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let (sender, receiver) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..worker_count {
                let sender = sender.clone();
                let next_index = &next_index;
                let failed = &failed;
                scope.spawn(move || loop {
                    if failed.load(Ordering::Acquire) {
                        break;
                    }
                    let index = next_index.fetch_add(1, Ordering::AcqRel);
                    let Some(secret) = secrets.get(index) else {
                        break;
                    };
                    let result = self.resolve_one(secret, keys);
                    if result.is_err() {
                        failed.store(true, Ordering::Release);
                    }
                    if sender.send((index, result)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(sender);

        let mut slots: Vec<Option<Result<SecretValue, ResolveError>>> =
            secrets.iter().map(|_| None).collect();
        for (index, result) in receiver {
            slots[index] = Some(result);
        }

        let mut entries = Vec::with_capacity(secrets.len());
        let mut first_error = None;
        for (secret, slot) in secrets.iter().zip(slots) {
            match slot {
                Some(Ok(value)) => entries.push((secret.name.clone(), value)),
                Some(Err(error)) => {
                    first_error.get_or_insert(error);
                }
                None => {}
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(SecretTable::from_entries(entries))
    }

    fn resolve_one(&self, secret: &Secret, keys: &[PrivateKey]) -> Result<SecretValue, ResolveError> {
        let ciphertext = self
            .storage
            .get(&secret.path)
            .map_err(|error| match error {
                StorageError::NotFound(path) => ResolveError::NotFound(path),
                StorageError::Unavailable { path, reason } => {
                    ResolveError::BackendUnavailable { path, reason }
                }
                StorageError::InvalidPath(path) => ResolveError::InvalidPath {
                    secret: secret.name.to_string(),
                    path,
                },
            })?;
        tracing::debug!(secret = %secret.name, path = %secret.path, "fetched ciphertext");

        let candidates = candidate_keys(secret, keys);
        if candidates.is_empty() {
            return Err(ResolveError::NoMatchingKey(secret.name.to_string()));
        }
        self.cipher
            .decrypt(&ciphertext, &candidates)
            .map_err(|error| match error {
                CipherError::NoMatchingKey => ResolveError::NoMatchingKey(secret.name.to_string()),
                source => ResolveError::Decrypting {
                    secret: secret.name.to_string(),
                    source,
                },
            })
    }
}

/// Keys whose recipient is listed for `secret`, in caller order.
///
/// A secret without declared recipients may be tried with every key, and a key
/// with an unknown recipient is tried for every secret.
fn candidate_keys<'k>(secret: &Secret, keys: &'k [PrivateKey]) -> Vec<&'k PrivateKey> {
    if secret.encryption_keys.is_empty() {
        return keys.iter().collect();
    }
    keys.iter()
        .filter(|key| match key.public_key() {
            Some(public_key) => secret.encryption_keys.contains(public_key),
            None => true,
        })
        .collect()
}

fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::{candidate_keys, SecretTable};
    use crate::{
        cipher::PrivateKey,
        config::Secret,
        types::{SecretName, SecretValue},
    };

    fn secret_for(keys: &[&PrivateKey]) -> Secret {
        Secret {
            name: SecretName::new("db").unwrap(),
            path: "db.age".to_owned(),
            encryption_keys: keys
                .iter()
                .filter_map(|key| key.public_key().cloned())
                .collect(),
        }
    }

    #[test]
    fn candidates_follow_declared_recipients_in_caller_order() {
        let keys: Vec<PrivateKey> = (0..3)
            .map(|index| {
                PrivateKey::new(age::x25519::Identity::generate(), format!("key-{index}"))
            })
            .collect();
        let secret = secret_for(&[&keys[2], &keys[0]]);

        let candidates = candidate_keys(&secret, &keys);
        let sources: Vec<_> = candidates.iter().map(|key| key.source()).collect();
        assert_eq!(sources, vec![keys[0].source(), keys[2].source()]);
    }

    #[test]
    fn undeclared_recipients_allow_every_key() {
        let keys = vec![PrivateKey::new(age::x25519::Identity::generate(), "only")];
        let secret = secret_for(&[]);
        assert_eq!(candidate_keys(&secret, &keys).len(), 1);
    }

    #[test]
    fn table_debug_lists_names_only() {
        let table = SecretTable::from_entries([(
            SecretName::new("db").unwrap(),
            SecretValue::new(b"hunter2".to_vec()),
        )]);
        let rendered = format!("{table:?}");
        assert!(rendered.contains("db"));
        assert!(!rendered.contains("hunter2"));
    }
}
