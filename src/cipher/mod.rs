//! Envelope encryption of secret values.

mod age_crypto;

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::types::{PublicKey, SecretValue};

pub use age_crypto::{generate_identity_file, load_private_keys, AgeCipher};

/// Cipher engine failures.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Encryption requested with an empty recipient set.
    #[error("no recipients provided")]
    NoRecipients,
    /// None of the candidate keys could unwrap the ciphertext.
    #[error("no matching private key")]
    NoMatchingKey,
    /// Ciphertext is passphrase-encrypted.
    #[error("passphrase-encrypted ciphertext is not supported")]
    PassphraseEncrypted,
    /// Ciphertext could not be parsed or authenticated.
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
    /// Recipient could not be used for encryption.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    /// Identity file could not be read or written.
    #[error("failed to access private key file {path}: {source}")]
    KeyFile {
        /// Identity file path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// Identity file is malformed.
    #[error("invalid private key in {path}: {reason}")]
    InvalidKey {
        /// Identity file path.
        path: PathBuf,
        /// Parse failure description.
        reason: String,
    },
    /// I/O error while streaming.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Identity material accepted for decryption.
pub(crate) enum KeyMaterial {
    X25519(age::x25519::Identity),
    Ssh(age::ssh::Identity),
}

/// Age identity loaded from a key file.
pub struct PrivateKey {
    material: KeyMaterial,
    recipient: Option<PublicKey>,
    source: PathBuf,
}

impl PrivateKey {
    /// Wraps an x25519 identity loaded from `source`.
    pub fn new(identity: age::x25519::Identity, source: impl AsRef<Path>) -> Self {
        let recipient = PublicKey::from_recipient(&identity.to_public());
        Self {
            material: KeyMaterial::X25519(identity),
            recipient: Some(recipient),
            source: source.as_ref().to_path_buf(),
        }
    }

    /// Wraps an unencrypted SSH identity loaded from `source`.
    ///
    /// `recipient` comes from the companion `.pub` file when one exists.
    pub fn ssh(
        identity: age::ssh::Identity,
        recipient: Option<PublicKey>,
        source: impl AsRef<Path>,
    ) -> Self {
        Self {
            material: KeyMaterial::Ssh(identity),
            recipient,
            source: source.as_ref().to_path_buf(),
        }
    }

    /// Recipient matching this identity, when known.
    ///
    /// SSH identities without a readable `.pub` file have no known recipient.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.recipient.as_ref()
    }

    /// File the identity was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub(crate) fn identity(&self) -> &dyn age::Identity {
        match &self.material {
            KeyMaterial::X25519(identity) => identity,
            KeyMaterial::Ssh(identity) => identity,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.material {
            KeyMaterial::X25519(_) => "x25519",
            KeyMaterial::Ssh(_) => "ssh",
        };
        f.debug_struct("PrivateKey")
            .field("kind", &kind)
            .field("public_key", &self.recipient.as_ref().map(PublicKey::as_str))
            .field("source", &self.source)
            .finish()
    }
}

/// Envelope cipher used to protect secrets at rest.
pub trait CipherEngine: Send + Sync {
    /// Encrypts `plaintext` so any of `recipients` can decrypt it.
    fn encrypt(&self, plaintext: &[u8], recipients: &[PublicKey]) -> Result<Vec<u8>, CipherError>;
    /// Decrypts `ciphertext` with the first of `keys` that matches.
    fn decrypt(&self, ciphertext: &[u8], keys: &[&PrivateKey]) -> Result<SecretValue, CipherError>;
}
