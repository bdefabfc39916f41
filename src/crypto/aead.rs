//! AEAD encryption/decryption for records
//!
//! ChaCha20-Poly1305 with a monotonic counter nonce. Both peers count the
//! records they seal and open, so nonces never travel on the wire.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher for one direction of a record stream
pub struct Cipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            nonce_counter: 0,
        })
    }

    /// Encrypt `buffer` in place, appending the auth tag
    pub fn seal_in_place(
        &mut self,
        associated_data: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        self.key
            .seal_in_place_append_tag(nonce, Aad::from(associated_data), buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))
    }

    /// Decrypt `buffer` in place, verifying the auth tag
    ///
    /// Returns the plaintext length; the plaintext occupies the front of
    /// `buffer`. The counter advances even on failure, since a failed record
    /// is fatal for the connection anyway.
    pub fn open_in_place(
        &mut self,
        associated_data: &[u8],
        buffer: &mut [u8],
    ) -> Result<usize, CryptoError> {
        if buffer.len() < TAG_LEN {
            return Err(CryptoError::Decryption("record shorter than tag".to_string()));
        }
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(associated_data), buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.len())
    }

    /// Generate the next nonce (monotonic counter, never wraps)
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter = self
            .nonce_counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;
        Ok(nonce)
    }

    /// Number of records processed by this cipher
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}
