//! Hierarchical-deterministic key derivation.
//!
//! BIP39 mnemonics feed a SLIP-0010 ed25519 derivation at
//! `m/44'/999'/0'/0'/n'`. Ed25519 has no public parent-to-child
//! derivation, so every path segment is hardened.

use bip39::{Language, Mnemonic};
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroize;

use super::{CryptoError, Keypair};

type HmacSha512 = Hmac<Sha512>;

/// BIP44 coin type assigned to BT2C
pub const COIN_TYPE: u32 = 999;

const HARDENED: u32 = 0x8000_0000;
const MASTER_KEY: &[u8] = b"ed25519 seed";

/// Generate a fresh 24-word English mnemonic.
pub fn generate_mnemonic() -> Result<Mnemonic, CryptoError> {
    Mnemonic::generate_in(Language::English, 24)
        .map_err(|e| CryptoError::Derivation(e.to_string()))
}

/// Parse a user-supplied phrase, normalizing whitespace.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, CryptoError> {
    Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| CryptoError::Derivation(e.to_string()))
}

/// PBKDF2 stretch of the mnemonic into a 64-byte seed.
pub fn mnemonic_to_seed(mnemonic: &Mnemonic, passphrase: &str) -> [u8; 64] {
    mnemonic.to_seed(passphrase)
}

/// Derive the account keypair at index `n` (path `m/44'/999'/0'/0'/n'`).
pub fn derive_keypair(seed: &[u8; 64], index: u32) -> Result<Keypair, CryptoError> {
    let path = [
        44 | HARDENED,
        COIN_TYPE | HARDENED,
        HARDENED,
        HARDENED,
        index | HARDENED,
    ];

    let (mut key, mut chain) = master_from_seed(seed)?;
    for segment in path {
        let (child_key, child_chain) = derive_child(&key, &chain, segment)?;
        key.zeroize();
        chain.zeroize();
        key = child_key;
        chain = child_chain;
    }

    let keypair = Keypair::from_secret_bytes(&key);
    key.zeroize();
    chain.zeroize();
    keypair
}

fn master_from_seed(seed: &[u8; 64]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac = HmacSha512::new_from_slice(MASTER_KEY)
        .map_err(|e| CryptoError::Derivation(e.to_string()))?;
    mac.update(seed);
    split_hmac(mac)
}

fn derive_child(
    key: &[u8; 32],
    chain: &[u8; 32],
    index: u32,
) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut mac =
        HmacSha512::new_from_slice(chain).map_err(|e| CryptoError::Derivation(e.to_string()))?;
    // SLIP-0010 hardened child: HMAC(chain, 0x00 || key || index_be)
    mac.update(&[0u8]);
    mac.update(key);
    mac.update(&index.to_be_bytes());
    split_hmac(mac)
}

fn split_hmac(mac: HmacSha512) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let digest = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    let mut chain = [0u8; 32];
    key.copy_from_slice(&digest[..32]);
    chain.copy_from_slice(&digest[32..]);
    Ok((key, chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_word_count() {
        let m = generate_mnemonic().unwrap();
        assert_eq!(m.word_count(), 24);
    }

    #[test]
    fn test_seed_is_passphrase_sensitive() {
        let m = generate_mnemonic().unwrap();
        let a = mnemonic_to_seed(&m, "");
        let b = mnemonic_to_seed(&m, "trezor");
        assert_ne!(a, b);
    }

    #[test]
    fn test_derivation_deterministic() {
        let m = generate_mnemonic().unwrap();
        let seed = mnemonic_to_seed(&m, "");
        let k1 = derive_keypair(&seed, 0).unwrap();
        let k2 = derive_keypair(&seed, 0).unwrap();
        assert_eq!(k1.public_bytes(), k2.public_bytes());
    }

    #[test]
    fn test_indexes_diverge() {
        let m = generate_mnemonic().unwrap();
        let seed = mnemonic_to_seed(&m, "");
        let k0 = derive_keypair(&seed, 0).unwrap();
        let k1 = derive_keypair(&seed, 1).unwrap();
        assert_ne!(k0.public_bytes(), k1.public_bytes());
    }

    #[test]
    fn test_phrase_round_trip() {
        let m = generate_mnemonic().unwrap();
        let phrase = m.to_string();
        let parsed = parse_mnemonic(&phrase).unwrap();
        assert_eq!(
            mnemonic_to_seed(&m, "x"),
            mnemonic_to_seed(&parsed, "x")
        );
    }
}
