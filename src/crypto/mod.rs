//! Cryptographic primitives for the record layer
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD with implicit counter nonces
//! - HKDF-SHA256 derivation of per-direction keys from the pre-shared key

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_direction_keys, DirectionKeys, Hkdf};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Empty pre-shared key")]
    EmptyKey,

    #[error("Nonce space exhausted")]
    NonceExhausted,
}
