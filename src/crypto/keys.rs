//! Store key pair loading.

use crate::error::{Result, StoreError};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use std::fmt;
use std::fs;
use std::path::Path;

/// The asymmetric key pair a store seals and opens payloads with.
///
/// Provisioning happens elsewhere; this type only loads and checks keys.
#[derive(Clone)]
pub struct KeyPair {
    public: RsaPublicKey,
    private: RsaPrivateKey,
}

impl KeyPair {
    /// Build a pair from a private key, deriving the public half.
    pub fn new(private: RsaPrivateKey) -> Self {
        Self {
            public: private.to_public_key(),
            private,
        }
    }

    /// Build a pair from separately supplied halves.
    pub fn from_parts(public: RsaPublicKey, private: RsaPrivateKey) -> Result<Self> {
        if private.to_public_key() != public {
            return Err(StoreError::Crypto(
                "Public key does not match private key".into(),
            ));
        }
        Ok(Self { public, private })
    }

    /// Parse PEM text. Accepts PKCS#8 or PKCS#1 private keys and SPKI or
    /// PKCS#1 public keys.
    pub fn from_pem(private_pem: &str, public_pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_pem))
            .map_err(|e| StoreError::Crypto(format!("Invalid private key: {}", e)))?;
        let public = RsaPublicKey::from_public_key_pem(public_pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_pem))
            .map_err(|e| StoreError::Crypto(format!("Invalid public key: {}", e)))?;
        Self::from_parts(public, private)
    }

    /// Load the PEM files written by the key provisioning utility.
    pub fn from_pem_files(
        private_path: impl AsRef<Path>,
        public_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let private_pem = fs::read_to_string(private_path)?;
        let public_pem = fs::read_to_string(public_path)?;
        Self::from_pem(&private_pem, &public_pem)
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    pub(crate) fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// Modulus size in bytes.
    pub fn modulus_bytes(&self) -> usize {
        self.public.size()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("modulus_bits", &(self.modulus_bytes() * 8))
            .finish_non_exhaustive()
    }
}
