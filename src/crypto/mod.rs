//! Cryptographic primitives: domain-separated hashing, ed25519 keys,
//! signing and verification.
//!
//! Every content hash in the protocol goes through [`hash256`] with an
//! ASCII domain prefix so a transaction hash can never collide with a
//! block hash over the same bytes.

pub mod hd;

use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::address;
use crate::types::Hash256;

/// Domain prefixes. New record types get new domains; existing ones are
/// frozen by consensus.
pub const DOMAIN_TX: &[u8] = b"bt2c/tx";
pub const DOMAIN_BLOCK: &[u8] = b"bt2c/block";
pub const DOMAIN_MERKLE: &[u8] = b"bt2c/merkle";
pub const DOMAIN_SELECTION: &[u8] = b"bt2c/select";
pub const DOMAIN_REGISTRATION: &[u8] = b"bt2c/register";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key bytes")]
    InvalidPublicKey,
    #[error("Invalid secret key bytes")]
    InvalidSecretKey,
    #[error("Invalid signature bytes")]
    InvalidSignature,
    #[error("Key derivation failed: {0}")]
    Derivation(String),
}

/// Deterministic 256-bit digest of `domain || bytes`.
pub fn hash256(domain: &[u8], bytes: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(bytes);
    hasher.finalize().into()
}

/// An ed25519 keypair. The secret half is zeroized on drop.
pub struct Keypair {
    signing: ed25519_dalek::SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret: [u8; 32] = rand::random();
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&secret),
        }
    }

    /// Rebuild a keypair from 32 secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&arr),
        })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The `bt2c_` address derived from this keypair's public key.
    pub fn address(&self) -> String {
        address::derive_address(&self.public_bytes())
    }

    /// Sign arbitrary bytes; returns the 64-byte detached signature.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&self.signing.to_bytes()),
        }
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public_bytes()))
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature. Returns false on any tampering or on
/// malformed key/signature material; verification never panics.
pub fn verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let pk_arr: [u8; 32] = match public_key.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };
    let Ok(vk) = ed25519_dalek::VerifyingKey::from_bytes(&pk_arr) else {
        return false;
    };
    let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_domain_separated() {
        let a = hash256(DOMAIN_TX, b"payload");
        let b = hash256(DOMAIN_BLOCK, b"payload");
        assert_ne!(a, b);
        assert_eq!(a, hash256(DOMAIN_TX, b"payload"));
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let kp = Keypair::generate();
        let msg = b"the quick brown fox";
        let sig = kp.sign(msg);
        assert!(verify(&kp.public_bytes(), msg, &sig));
    }

    #[test]
    fn test_single_bit_tamper_fails() {
        let kp = Keypair::generate();
        let msg = b"the quick brown fox".to_vec();
        let sig = kp.sign(&msg);

        let mut tampered_msg = msg.clone();
        tampered_msg[0] ^= 1;
        assert!(!verify(&kp.public_bytes(), &tampered_msg, &sig));

        let mut tampered_sig = sig.clone();
        tampered_sig[0] ^= 1;
        assert!(!verify(&kp.public_bytes(), &msg, &tampered_sig));
    }

    #[test]
    fn test_malformed_material_fails_closed() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"msg");
        assert!(!verify(&[0u8; 5], b"msg", &sig));
        assert!(!verify(&kp.public_bytes(), b"msg", &[0u8; 10]));
    }

    #[test]
    fn test_keypair_secret_round_trip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(kp.public_bytes(), restored.public_bytes());
        assert_eq!(kp.address(), restored.address());
    }
}
