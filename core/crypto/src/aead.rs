//! Byte-level sealing for fingerprint templates and other sensitive fields.
//!
//! A sealed value is laid out as
//!
//! ```text
//! | nonce (24) | XChaCha20-Poly1305 ciphertext | Poly1305 tag (16) |
//! ```
//!
//! The extended nonce is drawn fresh from the OS for every seal, so the
//! same template sealed twice never produces the same bytes. Opening
//! checks the tag before anything is returned; a value sealed under a
//! different field key is refused rather than decoded into garbage.

use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use crate::keys::FieldKey;
use rollcall_common::{Error, Result};

/// Bytes of nonce stored in front of every sealed value.
pub const NONCE_SIZE: usize = 24;

/// Bytes of tag appended by Poly1305.
pub const TAG_SIZE: usize = 16;

/// Smallest well-formed sealed value: an empty plaintext.
pub const SEALED_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

fn cipher_for(key: &FieldKey) -> XChaCha20Poly1305 {
    XChaCha20Poly1305::new(GenericArray::from_slice(key.as_bytes()))
}

/// Seal `plaintext` under the field key.
///
/// The result is `SEALED_OVERHEAD` bytes longer than the input.
pub fn seal_bytes(key: &FieldKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let body = cipher_for(key)
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::Crypto("could not seal field".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + body.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend(body);
    Ok(sealed)
}

/// Recover the plaintext of a value produced by [`seal_bytes`].
///
/// # Errors
/// - `Crypto` if the value is shorter than a nonce and tag
/// - `Crypto` if the tag does not verify, which covers a wrong key and
///   any edited byte
pub fn open_bytes(key: &FieldKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(Error::Crypto(format!(
            "sealed field is {} bytes, need at least {}",
            sealed.len(),
            SEALED_OVERHEAD
        )));
    }
    let (nonce, body) = sealed.split_at(NONCE_SIZE);
    cipher_for(key)
        .decrypt(XNonce::from_slice(nonce), body)
        .map_err(|_| Error::Crypto("sealed field failed authentication".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    fn key(byte: u8) -> FieldKey {
        FieldKey::from_bytes([byte; KEY_LENGTH])
    }

    #[test]
    fn test_template_survives_seal_and_open() {
        let template = b"left-thumb-minutiae";
        let sealed = seal_bytes(&key(7), template).unwrap();

        assert_eq!(sealed.len(), template.len() + SEALED_OVERHEAD);
        assert!(!sealed.windows(template.len()).any(|w| w == template));
        assert_eq!(open_bytes(&key(7), &sealed).unwrap(), template);
    }

    #[test]
    fn test_resealing_changes_nonce() {
        let a = seal_bytes(&key(7), b"right-index").unwrap();
        let b = seal_bytes(&key(7), b"right-index").unwrap();

        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_other_deployment_key_is_refused() {
        let sealed = seal_bytes(&key(1), b"template").unwrap();
        let err = open_bytes(&key(2), &sealed).unwrap_err();
        assert!(err.to_string().contains("authentication"));
    }

    #[test]
    fn test_edited_tag_is_refused() {
        let mut sealed = seal_bytes(&key(7), b"template").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(open_bytes(&key(7), &sealed).is_err());
    }

    #[test]
    fn test_truncated_value_is_refused() {
        let sealed = seal_bytes(&key(7), b"").unwrap();
        assert_eq!(sealed.len(), SEALED_OVERHEAD);
        assert!(open_bytes(&key(7), &sealed).is_ok());
        assert!(open_bytes(&key(7), &sealed[..SEALED_OVERHEAD - 1]).is_err());
    }
}
