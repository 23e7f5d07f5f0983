use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use age::{Decryptor, Encryptor};
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::{
    fs_secure::write_private_file_atomic,
    types::{PublicKey, SecretValue},
};

use super::{CipherEngine, CipherError, PrivateKey};

const SSH_PEM_PREFIX: &str = "-----BEGIN";

/// [`CipherEngine`] backed by age, for x25519 and SSH recipients.
#[derive(Debug, Clone, Copy, Default)]
pub struct AgeCipher;

impl CipherEngine for AgeCipher {
    fn encrypt(&self, plaintext: &[u8], recipients: &[PublicKey]) -> Result<Vec<u8>, CipherError> {
        if recipients.is_empty() {
            return Err(CipherError::NoRecipients);
        }

        let mut recipient_keys = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            recipient_keys.push(
                recipient
                    .to_recipient()
                    .map_err(|error| CipherError::InvalidRecipient(error.to_string()))?,
            );
        }
        let encryptor = Encryptor::with_recipients(
            recipient_keys
                .iter()
                .map(|recipient| recipient.as_ref() as &dyn age::Recipient),
        )
        .map_err(|error: age::EncryptError| CipherError::InvalidRecipient(error.to_string()))?;

        let mut ciphertext = Vec::new();
        let mut writer = encryptor.wrap_output(&mut ciphertext)?;
        writer.write_all(plaintext)?;
        writer.finish()?;
        Ok(ciphertext)
    }

    fn decrypt(&self, ciphertext: &[u8], keys: &[&PrivateKey]) -> Result<SecretValue, CipherError> {
        if keys.is_empty() {
            return Err(CipherError::NoMatchingKey);
        }

        let decryptor = Decryptor::new(ciphertext)
            .map_err(|error: age::DecryptError| CipherError::Malformed(error.to_string()))?;
        if decryptor.is_scrypt() {
            return Err(CipherError::PassphraseEncrypted);
        }

        let identities = keys.iter().copied().map(PrivateKey::identity);
        let mut reader = decryptor.decrypt(identities).map_err(|error| match error {
            age::DecryptError::NoMatchingKeys => CipherError::NoMatchingKey,
            other => CipherError::Malformed(other.to_string()),
        })?;
        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|error| CipherError::Malformed(error.to_string()))?;
        Ok(SecretValue::new(std::mem::take(&mut *plaintext)))
    }
}

/// Loads every identity from `paths`, preserving file and line order.
pub fn load_private_keys(paths: &[PathBuf]) -> Result<Vec<PrivateKey>, CipherError> {
    let mut keys = Vec::new();
    for path in paths {
        keys.extend(parse_identity_file(path)?);
    }
    Ok(keys)
}

/// Generates a new identity file and returns its recipient.
pub fn generate_identity_file(identity_file: &Path) -> Result<PublicKey, CipherError> {
    let identity = age::x25519::Identity::generate();
    let encoded_identity = identity.to_string();
    write_private_file_atomic(identity_file, encoded_identity.expose_secret().as_bytes())
        .map_err(|source| CipherError::KeyFile {
            path: identity_file.to_path_buf(),
            source,
        })?;
    Ok(PublicKey::from_recipient(&identity.to_public()))
}

fn parse_identity_file(identity_file: &Path) -> Result<Vec<PrivateKey>, CipherError> {
    let raw_identity =
        Zeroizing::new(
            fs::read_to_string(identity_file).map_err(|source| CipherError::KeyFile {
                path: identity_file.to_path_buf(),
                source,
            })?,
        );

    if raw_identity.trim_start().starts_with(SSH_PEM_PREFIX) {
        return parse_ssh_identity(&raw_identity, identity_file).map(|key| vec![key]);
    }

    let mut keys = Vec::new();
    for (line_index, line) in raw_identity.lines().enumerate() {
        let trimmed_line = line.trim();
        if trimmed_line.is_empty() || trimmed_line.starts_with('#') {
            continue;
        }
        let identity = parse_identity_line(trimmed_line, identity_file, line_index + 1)?;
        keys.push(PrivateKey::new(identity, identity_file));
    }

    if keys.is_empty() {
        return Err(CipherError::InvalidKey {
            path: identity_file.to_path_buf(),
            reason: "file has no key material".to_owned(),
        });
    }
    Ok(keys)
}

fn parse_identity_line(
    encoded_identity: &str,
    identity_file: &Path,
    line_number: usize,
) -> Result<age::x25519::Identity, CipherError> {
    encoded_identity
        .parse::<age::x25519::Identity>()
        .map_err(|error| CipherError::InvalidKey {
            path: identity_file.to_path_buf(),
            reason: format!("line {line_number}: {error}"),
        })
}

fn parse_ssh_identity(raw_identity: &str, identity_file: &Path) -> Result<PrivateKey, CipherError> {
    let invalid = |reason: String| CipherError::InvalidKey {
        path: identity_file.to_path_buf(),
        reason,
    };
    let identity = age::ssh::Identity::from_buffer(
        raw_identity.as_bytes(),
        Some(identity_file.display().to_string()),
    )
    .map_err(|error| invalid(error.to_string()))?;
    match identity {
        age::ssh::Identity::Unencrypted(_) => {}
        age::ssh::Identity::Encrypted(_) => {
            return Err(invalid(
                "passphrase-protected SSH keys are not supported".to_owned(),
            ))
        }
        age::ssh::Identity::Unsupported(_) => {
            return Err(invalid("unsupported SSH key type".to_owned()))
        }
    }

    let recipient = read_ssh_recipient(identity_file);
    if recipient.is_none() {
        tracing::debug!(path = %identity_file.display(), "no public key next to SSH identity");
    }
    Ok(PrivateKey::ssh(identity, recipient, identity_file))
}

/// Reads `<identity_file>.pub`, the recipient OpenSSH writes next to a key.
fn read_ssh_recipient(identity_file: &Path) -> Option<PublicKey> {
    let mut public_file = identity_file.as_os_str().to_owned();
    public_file.push(".pub");
    let raw = fs::read_to_string(&public_file).ok()?;
    match PublicKey::parse(&raw) {
        Ok(key) => Some(key),
        Err(error) => {
            tracing::warn!(path = %Path::new(&public_file).display(), %error, "ignoring unreadable SSH public key");
            None
        }
    }
}
