//! Key Derivation Functions
//!
//! Provides HKDF-SHA256 for turning the pre-shared key into record keys

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

const RECORD_SALT: &[u8] = b"usocks record layer";
const CLIENT_TO_SERVER: &[u8] = b"usocks client to server";
const SERVER_TO_CLIENT: &[u8] = b"usocks server to client";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Derive key material into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Record keys for the two directions of a tunnel
#[derive(Clone)]
pub struct DirectionKeys {
    pub client_to_server: [u8; KEY_LEN],
    pub server_to_client: [u8; KEY_LEN],
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DirectionKeys([REDACTED])")
    }
}

/// Derive per-direction record keys from the pre-shared key
pub fn derive_direction_keys(shared_key: &[u8]) -> Result<DirectionKeys, CryptoError> {
    if shared_key.is_empty() {
        return Err(CryptoError::EmptyKey);
    }
    let hkdf = Hkdf::new(Some(RECORD_SALT), shared_key);

    Ok(DirectionKeys {
        client_to_server: hkdf.expand_key(CLIENT_TO_SERVER)?,
        server_to_client: hkdf.expand_key(SERVER_TO_CLIENT)?,
    })
}
