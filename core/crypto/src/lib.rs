//! Cryptographic primitives for Rollcall.
//!
//! This module provides:
//! - Nonce-prefixed XChaCha20-Poly1305 sealing of field bytes
//! - A zeroizing field key parsed from configuration
//! - The field cipher that seals biometric templates at rest
//!
//! # Security Guarantees
//! - Key material is zeroized on drop
//! - No plaintext or key material is ever logged

pub mod aead;
pub mod cipher;
pub mod keys;

pub use aead::{open_bytes, seal_bytes};
pub use cipher::{FieldCipher, Unavailable};
pub use keys::{FieldKey, KEY_LENGTH};
