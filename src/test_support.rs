//! Shared fixtures for unit tests.

use crate::crypto::KeyPair;
use rsa::RsaPrivateKey;
use std::sync::OnceLock;

/// A key pair generated once per test binary.
pub(crate) fn test_keys() -> KeyPair {
    static KEYS: OnceLock<KeyPair> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        KeyPair::new(RsaPrivateKey::new(&mut rng, 1024).unwrap())
    })
    .clone()
}
