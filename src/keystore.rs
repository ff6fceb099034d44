//! Ed25519 signing abstraction.
//!
//! Audit checkpoints and consensus records are signed through the
//! `KeyStore` trait so deployments can swap the software keys used here
//! for hardware-backed ones without touching the engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to generate keypair: {0}")]
    KeyGeneration(String),

    #[error("failed to sign data: {0}")]
    SigningFailed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;

/// Cryptographic key storage backend
///
/// Implementations must be thread-safe and sign with Ed25519 (or a
/// compatible 64-byte signature scheme).
pub trait KeyStore: Send + Sync {
    /// Sign data with the private key, returning the 64-byte signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify a signature made by this store's key.
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()>;

    /// Compressed public key bytes (32 for Ed25519)
    fn public_key_bytes(&self) -> Vec<u8>;

    /// Human-readable identifier for diagnostics
    fn identifier(&self) -> String {
        "KeyStore".to_string()
    }
}

/// In-memory Ed25519 key store
///
/// Suitable for development, tests, and single-process deployments.
#[derive(Clone)]
pub struct SoftwareKeyStore {
    keypair: ed25519_compact::KeyPair,
}

impl SoftwareKeyStore {
    /// Generate a fresh Ed25519 keypair
    pub fn generate() -> Result<Self> {
        Ok(SoftwareKeyStore {
            keypair: ed25519_compact::KeyPair::from_seed(ed25519_compact::Seed::generate()),
        })
    }

    /// Deterministic keypair from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Result<Self> {
        Ok(SoftwareKeyStore {
            keypair: ed25519_compact::KeyPair::from_seed(ed25519_compact::Seed::new(seed)),
        })
    }
}

impl KeyStore for SoftwareKeyStore {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .keypair
            .sk
            .sign(data, Some(ed25519_compact::Noise::generate()));
        Ok(signature.to_vec())
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        verify_detached(&self.public_key_bytes(), data, signature)
    }

    fn public_key_bytes(&self) -> Vec<u8> {
        self.keypair.pk.to_vec()
    }

    fn identifier(&self) -> String {
        "SoftwareKeyStore".to_string()
    }
}

/// Verify a detached signature against an exported public key
pub fn verify_detached(pubkey: &[u8], data: &[u8], signature: &[u8]) -> Result<()> {
    let pk = ed25519_compact::PublicKey::from_slice(pubkey)
        .map_err(|e| KeyStoreError::InvalidKeyFormat(e.to_string()))?;

    let sig = ed25519_compact::Signature::from_slice(signature)
        .map_err(|_| KeyStoreError::InvalidSignature)?;

    pk.verify(data, &sig)
        .map_err(|_| KeyStoreError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let store = SoftwareKeyStore::generate().unwrap();
        let sig = store.sign(b"decision record").unwrap();
        assert!(store.verify(b"decision record", &sig).is_ok());
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let store = SoftwareKeyStore::generate().unwrap();
        let mut sig = store.sign(b"data").unwrap();
        sig[0] ^= 0xFF;
        assert!(matches!(
            store.verify(b"data", &sig),
            Err(KeyStoreError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_message_rejected() {
        let store = SoftwareKeyStore::generate().unwrap();
        let sig = store.sign(b"data").unwrap();
        assert!(store.verify(b"other", &sig).is_err());
    }

    #[test]
    fn test_detached_verification() {
        let store = SoftwareKeyStore::generate().unwrap();
        let sig = store.sign(b"payload").unwrap();
        assert!(verify_detached(&store.public_key_bytes(), b"payload", &sig).is_ok());
    }

    #[test]
    fn test_deterministic_seed() {
        let a = SoftwareKeyStore::from_seed([7u8; 32]).unwrap();
        let b = SoftwareKeyStore::from_seed([7u8; 32]).unwrap();
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
    }
}
