use std::fmt;

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const MAX_SECRET_NAME_LENGTH: usize = 128;

/// Validated secret name, unique within one merged configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct SecretName(String);

impl SecretName {
    /// Creates a validated secret name.
    pub fn new(name: &str) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > MAX_SECRET_NAME_LENGTH {
            return Err(ValidationError::InvalidName);
        }
        if name.contains("..") || name.starts_with('/') {
            return Err(ValidationError::PathTraversal);
        }
        if !name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || "_./-".contains(character))
        {
            return Err(ValidationError::InvalidCharacter);
        }
        Ok(Self(name.to_owned()))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SecretName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<SecretName> for String {
    fn from(value: SecretName) -> Self {
        value.0
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Age recipient a secret is encrypted for: a native x25519 key or an SSH key.
///
/// SSH keys are stored as `<type> <base64>` with any trailing comment dropped,
/// so the same key compares equal however it was annotated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey(String);

impl PublicKey {
    /// Parses and validates an age x25519 or SSH (`ssh-ed25519`, `ssh-rsa`) recipient.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        let invalid = || ValidationError::InvalidPublicKey(trimmed.to_owned());
        if trimmed.parse::<age::x25519::Recipient>().is_ok() {
            return Ok(Self(trimmed.to_owned()));
        }
        trimmed
            .parse::<age::ssh::Recipient>()
            .map_err(|_| invalid())?;
        let mut fields = trimmed.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(key_type), Some(encoded)) => Ok(Self(format!("{key_type} {encoded}"))),
            _ => Err(invalid()),
        }
    }

    pub(crate) fn from_recipient(recipient: &age::x25519::Recipient) -> Self {
        Self(recipient.to_string())
    }

    /// Returns `true` for SSH recipients.
    pub fn is_ssh(&self) -> bool {
        self.0.starts_with("ssh-")
    }

    pub(crate) fn to_recipient(&self) -> Result<Box<dyn age::Recipient + Send>, ValidationError> {
        let invalid = || ValidationError::InvalidPublicKey(self.0.clone());
        if self.is_ssh() {
            let recipient = self
                .0
                .parse::<age::ssh::Recipient>()
                .map_err(|_| invalid())?;
            Ok(Box::new(recipient))
        } else {
            let recipient = self
                .0
                .parse::<age::x25519::Recipient>()
                .map_err(|_| invalid())?;
            Ok(Box::new(recipient))
        }
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PublicKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PublicKey> for String {
    fn from(value: PublicKey) -> Self {
        value.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted secret bytes, zeroed on drop and redacted in debug output.
pub struct SecretValue {
    inner: SecretBox<Vec<u8>>,
}

impl SecretValue {
    /// Constructs a secret value from bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: SecretBox::new(Box::new(bytes)),
        }
    }

    /// Exposes the secret bytes to a closure.
    pub fn expose<F, R>(&self, function: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        function(self.inner.expose_secret().as_slice())
    }

    /// Number of plaintext bytes.
    pub fn len(&self) -> usize {
        self.inner.expose_secret().len()
    }

    /// Returns `true` when the plaintext is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue([REDACTED; {} bytes])", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{PublicKey, SecretName, SecretValue};
    use crate::error::ValidationError;

    #[test]
    fn secret_name_accepts_namespaced_names() {
        assert_eq!(SecretName::new("db/password").unwrap().as_str(), "db/password");
    }

    #[test]
    fn secret_name_rejects_traversal_and_bad_characters() {
        assert_eq!(SecretName::new("../etc"), Err(ValidationError::PathTraversal));
        assert_eq!(SecretName::new("/root"), Err(ValidationError::PathTraversal));
        assert_eq!(SecretName::new("db pass"), Err(ValidationError::InvalidCharacter));
        assert_eq!(SecretName::new(""), Err(ValidationError::InvalidName));
        assert_eq!(
            SecretName::new(&"a".repeat(129)),
            Err(ValidationError::InvalidName)
        );
    }

    #[test]
    fn public_key_rejects_garbage() {
        assert!(matches!(
            PublicKey::parse("age1notakey"),
            Err(ValidationError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn public_key_round_trips_generated_recipient() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let key = PublicKey::parse(&format!("  {recipient}\n")).unwrap();
        assert_eq!(key.as_str(), recipient);
    }

    #[test]
    fn public_key_rejects_unsupported_ssh_types() {
        assert!(matches!(
            PublicKey::parse("ssh-dss AAAAB3NzaC1kc3MAAACBAP alice@rust"),
            Err(ValidationError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn secret_value_debug_is_redacted() {
        let value = SecretValue::new(b"hunter2".to_vec());
        let rendered = format!("{value:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("7 bytes"));
    }
}
