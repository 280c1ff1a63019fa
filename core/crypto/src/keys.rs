//! Field encryption key with secure memory handling.
//!
//! The key zeroizes its memory on drop so that key material does not
//! linger after the cipher is torn down.

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chacha20poly1305::aead::{KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use rollcall_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Key used to seal sensitive user fields.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FieldKey {
    key: [u8; KEY_LENGTH],
}

impl FieldKey {
    /// Create a field key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Parse a key from its base64 text form.
    ///
    /// Both the standard and the URL-safe alphabets are accepted, so keys
    /// issued in the Fernet style keep working.
    ///
    /// # Errors
    /// - Returns error if the text is not base64
    /// - Returns error if it does not decode to exactly KEY_LENGTH bytes
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let mut decoded = URL_SAFE
            .decode(encoded)
            .or_else(|_| STANDARD.decode(encoded))
            .map_err(|e| Error::Crypto(format!("Key is not valid base64: {e}")))?;

        if decoded.len() != KEY_LENGTH {
            let len = decoded.len();
            decoded.zeroize();
            return Err(Error::Crypto(format!(
                "Invalid key length: expected {KEY_LENGTH}, got {len}"
            )));
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&decoded);
        decoded.zeroize();
        Ok(Self { key })
    }

    /// Generate a random field key.
    pub fn generate() -> Self {
        let generated = XChaCha20Poly1305::generate_key(&mut OsRng);
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&generated);
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Encode the key as URL-safe base64, the form read from configuration.
    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.key)
    }
}

impl fmt::Debug for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldKey([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_random() {
        let key1 = FieldKey::generate();
        let key2 = FieldKey::generate();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_base64_roundtrip() {
        let key = FieldKey::generate();
        let parsed = FieldKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_standard_alphabet_accepted() {
        let encoded = STANDARD.encode([0xFBu8; KEY_LENGTH]);
        let key = FieldKey::from_base64(&encoded).unwrap();
        assert_eq!(key.as_bytes(), &[0xFBu8; KEY_LENGTH]);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let encoded = URL_SAFE.encode([1u8; 16]);
        assert!(FieldKey::from_base64(&encoded).is_err());
        assert!(FieldKey::from_base64("not base64 at all!").is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = FieldKey::from_bytes([7u8; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "FieldKey([REDACTED])");
    }
}
