//! Record encoding/decoding independent of any transport

use super::{RecordError, Role, MAX_RECORD_LEN, MAX_RECORD_PAYLOAD, RECORD_HEADER_LEN};
use crate::crypto::{derive_direction_keys, Cipher, TAG_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Seals outbound and opens inbound records for one end of a tunnel
pub struct RecordCodec {
    sealer: Cipher,
    opener: Cipher,
}

impl RecordCodec {
    /// Create a codec from the pre-shared key
    pub fn new(shared_key: &[u8], role: Role) -> Result<Self, RecordError> {
        let keys = derive_direction_keys(shared_key)?;
        let (seal_key, open_key) = match role {
            Role::Client => (keys.client_to_server, keys.server_to_client),
            Role::Server => (keys.server_to_client, keys.client_to_server),
        };

        Ok(Self {
            sealer: Cipher::new(&seal_key)?,
            opener: Cipher::new(&open_key)?,
        })
    }

    /// Encrypt `plaintext` and append the framed record to `dst`
    pub fn encode(&mut self, plaintext: &[u8], dst: &mut BytesMut) -> Result<(), RecordError> {
        if plaintext.len() > MAX_RECORD_PAYLOAD {
            return Err(RecordError::TooLarge(plaintext.len(), MAX_RECORD_PAYLOAD));
        }

        let record_len = (plaintext.len() + TAG_LEN) as u16;
        let header = record_len.to_be_bytes();

        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);
        self.sealer.seal_in_place(&header, &mut buffer)?;

        dst.reserve(RECORD_HEADER_LEN + buffer.len());
        dst.put_slice(&header);
        dst.put_slice(&buffer);
        Ok(())
    }

    /// Decode one complete record from the front of `src`
    ///
    /// Returns `Ok(None)` while the record is still incomplete; `src` is
    /// only consumed once a whole record is available.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, RecordError> {
        if src.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }

        let header = [src[0], src[1]];
        let record_len = u16::from_be_bytes(header) as usize;
        if record_len < TAG_LEN {
            return Err(RecordError::Malformed(format!(
                "record length {} shorter than tag",
                record_len
            )));
        }
        debug_assert!(record_len <= MAX_RECORD_LEN);

        if src.len() < RECORD_HEADER_LEN + record_len {
            return Ok(None);
        }

        src.advance(RECORD_HEADER_LEN);
        let mut record = src.split_to(record_len);
        let plaintext_len = self.opener.open_in_place(&header, &mut record)?;
        record.truncate(plaintext_len);

        Ok(Some(record.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &[u8]) -> (RecordCodec, RecordCodec) {
        (
            RecordCodec::new(key, Role::Client).unwrap(),
            RecordCodec::new(key, Role::Server).unwrap(),
        )
    }

    #[test]
    fn test_record_roundtrip() {
        let (mut client, mut server) = pair(b"secret");
        let mut wire = BytesMut::new();

        client.encode(b"first", &mut wire).unwrap();
        client.encode(b"second", &mut wire).unwrap();
        assert_eq!(wire.len(), 2 * (RECORD_HEADER_LEN + TAG_LEN) + 11);

        assert_eq!(&server.decode(&mut wire).unwrap().unwrap()[..], b"first");
        assert_eq!(&server.decode(&mut wire).unwrap().unwrap()[..], b"second");
        assert!(server.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_partial_record_buffered() {
        let (mut client, mut server) = pair(b"secret");
        let mut wire = BytesMut::new();
        client.encode(b"partial delivery", &mut wire).unwrap();

        let mut inbound = BytesMut::new();
        let total = wire.len();
        for (i, byte) in wire.iter().enumerate() {
            inbound.put_u8(*byte);
            let decoded = server.decode(&mut inbound).unwrap();
            if i + 1 < total {
                assert!(decoded.is_none());
            } else {
                assert_eq!(&decoded.unwrap()[..], b"partial delivery");
            }
        }
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_directions_are_distinct() {
        let mut a = RecordCodec::new(b"secret", Role::Client).unwrap();
        let mut b = RecordCodec::new(b"secret", Role::Client).unwrap();
        let mut wire = BytesMut::new();
        a.encode(b"hello", &mut wire).unwrap();

        // A client cannot open its own direction
        assert!(matches!(b.decode(&mut wire), Err(RecordError::Crypto(_))));
    }

    #[test]
    fn test_tampered_header_fails() {
        let (mut client, mut server) = pair(b"secret");
        let mut wire = BytesMut::new();
        client.encode(b"hello world", &mut wire).unwrap();
        wire.put_u8(0);
        // Claim one extra byte of ciphertext
        let len = u16::from_be_bytes([wire[0], wire[1]]) + 1;
        wire[..2].copy_from_slice(&len.to_be_bytes());

        assert!(matches!(server.decode(&mut wire), Err(RecordError::Crypto(_))));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut client = RecordCodec::new(b"secret", Role::Client).unwrap();
        let mut server = RecordCodec::new(b"other", Role::Server).unwrap();
        let mut wire = BytesMut::new();
        client.encode(b"hello", &mut wire).unwrap();

        assert!(server.decode(&mut wire).is_err());
    }

    #[test]
    fn test_short_length_malformed() {
        let (_, mut server) = pair(b"secret");
        let mut wire = BytesMut::from(&[0u8, 3, 1, 2, 3][..]);
        assert!(matches!(server.decode(&mut wire), Err(RecordError::Malformed(_))));
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let (mut client, _) = pair(b"secret");
        let mut wire = BytesMut::new();
        let big = vec![0u8; MAX_RECORD_PAYLOAD + 1];
        assert!(matches!(
            client.encode(&big, &mut wire),
            Err(RecordError::TooLarge(_, _))
        ));

        let max = vec![0u8; MAX_RECORD_PAYLOAD];
        client.encode(&max, &mut wire).unwrap();
        assert_eq!(wire.len(), RECORD_HEADER_LEN + MAX_RECORD_LEN);
    }
}
