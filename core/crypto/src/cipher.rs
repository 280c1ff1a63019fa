//! Field cipher: the encryption service injected into anything that
//! reads or writes sensitive user fields.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use tracing::{info, warn};

use rollcall_common::{EncryptedField, Error, FieldEncoding, FieldValue, Result};

use crate::aead;
use crate::keys::FieldKey;

/// Why no key is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unavailable {
    /// No key was configured.
    MissingKey,
    /// A key was configured but could not be parsed.
    InvalidKey(String),
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unavailable::MissingKey => write!(f, "no encryption key configured"),
            Unavailable::InvalidKey(reason) => write!(f, "invalid encryption key: {reason}"),
        }
    }
}

enum State {
    Ready(FieldKey),
    Unavailable(Unavailable),
}

/// Encrypts and decrypts sensitive fields.
///
/// A cipher without a usable key is a degraded but running mode: every
/// operation that needs the key reports [`Error::CryptoUnavailable`].
pub struct FieldCipher {
    state: State,
}

impl FieldCipher {
    /// Create a cipher from a key.
    pub fn new(key: FieldKey) -> Self {
        Self {
            state: State::Ready(key),
        }
    }

    /// Create a cipher that has no key.
    pub fn unavailable(reason: Unavailable) -> Self {
        Self {
            state: State::Unavailable(reason),
        }
    }

    /// Build a cipher from optional configured key material.
    ///
    /// Missing or malformed keys do not fail startup; they produce an
    /// unavailable cipher and a warning.
    pub fn from_config(key_material: Option<&str>) -> Self {
        match key_material.map(str::trim).filter(|k| !k.is_empty()) {
            None => {
                warn!("No encryption key configured; fingerprint templates cannot be encrypted");
                Self::unavailable(Unavailable::MissingKey)
            }
            Some(material) => match FieldKey::from_base64(material) {
                Ok(key) => {
                    info!("Field cipher initialized");
                    Self::new(key)
                }
                Err(e) => {
                    warn!("Encryption key rejected, running without field encryption: {}", e);
                    Self::unavailable(Unavailable::InvalidKey(e.to_string()))
                }
            },
        }
    }

    /// Whether a key is loaded.
    pub fn is_available(&self) -> bool {
        matches!(self.state, State::Ready(_))
    }

    /// The reason the cipher is unavailable, if it is.
    pub fn unavailable_reason(&self) -> Option<&Unavailable> {
        match &self.state {
            State::Ready(_) => None,
            State::Unavailable(reason) => Some(reason),
        }
    }

    fn key(&self) -> Result<&FieldKey> {
        match &self.state {
            State::Ready(key) => Ok(key),
            State::Unavailable(reason) => Err(Error::CryptoUnavailable(reason.to_string())),
        }
    }

    /// Encrypt raw bytes.
    ///
    /// # Errors
    /// - `CryptoUnavailable` if no key is loaded
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        aead::seal_bytes(self.key()?, plaintext)
    }

    /// Decrypt raw bytes.
    ///
    /// # Errors
    /// - `CryptoUnavailable` if no key is loaded
    /// - `Crypto` if authentication fails
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aead::open_bytes(self.key()?, ciphertext)
    }

    /// Encrypt a value into an [`EncryptedField`].
    ///
    /// # Errors
    /// - `CryptoUnavailable` if no key is loaded
    pub fn seal<T: FieldValue>(&self, value: &T) -> Result<EncryptedField<T>> {
        let ciphertext = self.encrypt(&value.to_plaintext())?;
        Ok(EncryptedField::from_stored(
            FieldEncoding::Encrypted,
            STANDARD.encode(ciphertext),
        ))
    }

    /// Encrypt a value, or store it flagged as plaintext when no key is
    /// loaded.
    ///
    /// The returned field reports [`EncryptedField::is_plaintext`] in the
    /// fallback case so callers can surface the downgrade.
    pub fn seal_or_plaintext<T: FieldValue>(&self, value: &T) -> Result<EncryptedField<T>> {
        match self.seal(value) {
            Err(Error::CryptoUnavailable(reason)) => {
                warn!("Storing sensitive field as plaintext: {}", reason);
                let text = String::from_utf8(value.to_plaintext()).map_err(|_| {
                    Error::Validation("Sensitive field is not valid UTF-8".to_string())
                })?;
                Ok(EncryptedField::from_stored(FieldEncoding::Plaintext, text))
            }
            other => other,
        }
    }

    /// Recover the value held by a field.
    ///
    /// Plaintext-flagged fields are returned as stored.
    ///
    /// # Errors
    /// - `CryptoUnavailable` for an encrypted field when no key is loaded
    /// - `Crypto` if the stored text is corrupt or sealed under another key
    pub fn open<T: FieldValue>(&self, field: &EncryptedField<T>) -> Result<T> {
        match field.encoding() {
            FieldEncoding::Plaintext => T::from_plaintext(field.stored().as_bytes().to_vec()),
            FieldEncoding::Encrypted => {
                let ciphertext = STANDARD
                    .decode(field.stored())
                    .map_err(|e| Error::Crypto(format!("Stored field is not base64: {e}")))?;
                T::from_plaintext(self.decrypt(&ciphertext)?)
            }
        }
    }
}

impl fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Ready(_) => write!(f, "FieldCipher(ready)"),
            State::Unavailable(reason) => write!(f, "FieldCipher(unavailable: {reason})"),
        }
    }
}
