//! Compress-then-encrypt sealing of record payloads.

use super::keys::KeyPair;
use crate::error::{Result, StoreError};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rsa::Oaep;
use sha2::Sha256;
use std::sync::Arc;

/// Current sealed-frame format version.
pub const SEAL_VERSION: u8 = 1;

/// AES-GCM nonce size.
const NONCE_SIZE: usize = 12;

/// Data key size (AES-256).
const DATA_KEY_SIZE: usize = 32;

/// Seals and opens payloads with the store key pair.
///
/// Frame layout before base64:
/// `version | wrapped_len (u16 BE) | wrapped key | nonce | ciphertext+tag`
#[derive(Clone, Debug)]
pub struct Sealer {
    keys: Arc<KeyPair>,
    max_payload: usize,
}

impl Sealer {
    pub fn new(keys: KeyPair, max_payload: usize) -> Self {
        Self {
            keys: Arc::new(keys),
            max_payload,
        }
    }

    /// Largest plaintext accepted by [`Sealer::seal`].
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Compress, encrypt and encode `plaintext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        if plaintext.len() > self.max_payload {
            return Err(StoreError::PayloadTooLarge {
                size: plaintext.len(),
                max: self.max_payload,
            });
        }

        let compressed = lz4_flex::compress_prepend_size(plaintext);

        let data_key = Aes256Gcm::generate_key(OsRng);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = Aes256Gcm::new(&data_key)
            .encrypt(&nonce, compressed.as_slice())
            .map_err(|e| StoreError::Crypto(format!("Payload encryption failed: {}", e)))?;

        let mut rng = rand::rngs::OsRng;
        let wrapped = self
            .keys
            .public()
            .encrypt(&mut rng, Oaep::new::<Sha256>(), data_key.as_slice())
            .map_err(|e| StoreError::Crypto(format!("Key wrapping failed: {}", e)))?;
        let wrapped_len = u16::try_from(wrapped.len())
            .map_err(|_| StoreError::Crypto("Wrapped key too long".into()))?;

        let mut frame = Vec::with_capacity(3 + wrapped.len() + NONCE_SIZE + ciphertext.len());
        frame.push(SEAL_VERSION);
        frame.extend_from_slice(&wrapped_len.to_be_bytes());
        frame.extend_from_slice(&wrapped);
        frame.extend_from_slice(nonce.as_slice());
        frame.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(frame))
    }

    /// Decode, decrypt and decompress sealed text.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let frame = STANDARD
            .decode(sealed.trim())
            .map_err(|e| StoreError::Crypto(format!("Sealed text is not base64: {}", e)))?;

        let (version, rest) = frame
            .split_first()
            .ok_or_else(|| StoreError::Crypto("Empty sealed frame".into()))?;
        if *version != SEAL_VERSION {
            return Err(StoreError::Crypto(format!(
                "Unsupported sealed frame version: {}",
                version
            )));
        }
        if rest.len() < 2 {
            return Err(StoreError::Crypto("Truncated sealed frame".into()));
        }
        let wrapped_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let rest = &rest[2..];
        if rest.len() < wrapped_len + NONCE_SIZE {
            return Err(StoreError::Crypto("Truncated sealed frame".into()));
        }
        let (wrapped, rest) = rest.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

        let data_key = self
            .keys
            .private()
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| StoreError::Crypto(format!("Key unwrapping failed: {}", e)))?;
        if data_key.len() != DATA_KEY_SIZE {
            return Err(StoreError::Crypto("Unwrapped data key has wrong size".into()));
        }

        let cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|e| StoreError::Crypto(format!("Invalid data key: {}", e)))?;
        let compressed = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| StoreError::Crypto(format!("Payload decryption failed: {}", e)))?;

        // The size prefix drives the allocation, so bound it before decompressing.
        if compressed.len() < 4 {
            return Err(StoreError::Crypto("Compressed payload too short".into()));
        }
        let declared = u32::from_le_bytes([compressed[0], compressed[1], compressed[2], compressed[3]])
            as usize;
        if declared > self.max_payload {
            return Err(StoreError::Crypto(format!(
                "Compressed payload declares {} bytes (max {})",
                declared, self.max_payload
            )));
        }

        lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Crypto(format!("Decompression failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_keys;

    fn sealer() -> Sealer {
        Sealer::new(test_keys(), 1024 * 1024)
    }

    #[test]
    fn test_seal_open_round_trip() {
        let sealer = sealer();
        let sealed = sealer.seal(b"hello, shard").unwrap();
        assert_eq!(sealer.open(&sealed).unwrap(), b"hello, shard");
    }

    #[test]
    fn test_sealed_text_is_printable_and_comma_free() {
        let sealed = sealer().seal(&[0u8, 255, 44, 10, 13]).unwrap();
        assert!(sealed.chars().all(|c| c.is_ascii_graphic()));
        assert!(!sealed.contains(','));
    }

    #[test]
    fn test_payloads_beyond_the_rsa_block_are_sealed() {
        // Far past what a 1024-bit OAEP block could carry directly.
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let sealer = sealer();
        let sealed = sealer.seal(&payload).unwrap();
        assert_eq!(sealer.open(&sealed).unwrap(), payload);
    }

    #[test]
    fn test_sealing_is_randomised() {
        let sealer = sealer();
        assert_ne!(sealer.seal(b"same").unwrap(), sealer.seal(b"same").unwrap());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let sealer = Sealer::new(test_keys(), 8);
        let result = sealer.seal(b"nine bytes");
        assert!(matches!(
            result,
            Err(StoreError::PayloadTooLarge { size: 10, max: 8 })
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails_to_open() {
        let sealer = sealer();
        let sealed = sealer.seal(b"integrity matters").unwrap();
        let mut frame = STANDARD.decode(&sealed).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let tampered = STANDARD.encode(frame);
        assert!(matches!(sealer.open(&tampered), Err(StoreError::Crypto(_))));
    }

    #[test]
    fn test_garbage_fails_to_open() {
        let sealer = sealer();
        assert!(matches!(sealer.open("%%%"), Err(StoreError::Crypto(_))));
        assert!(matches!(sealer.open(""), Err(StoreError::Crypto(_))));
        assert!(matches!(
            sealer.open(&STANDARD.encode([SEAL_VERSION, 0, 200])),
            Err(StoreError::Crypto(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let sealed = sealer().seal(b"for someone else").unwrap();
        let mut rng = rand::thread_rng();
        let other = KeyPair::new(rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap());
        let stranger = Sealer::new(other, 1024);
        assert!(matches!(stranger.open(&sealed), Err(StoreError::Crypto(_))));
    }
}
