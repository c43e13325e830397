//! Wallet management: mnemonic-backed keys with encrypted storage.
//!
//! Security: wallet files are encrypted with AES-256-GCM under an
//! Argon2-derived key. Decrypted secret material is zeroized when the
//! wallet is dropped.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hd, Keypair};
use crate::network_type::NetworkType;
use crate::types::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("Failed to create wallet: {0}")]
    CreationFailed(String),
    #[error("Failed to load wallet: {0}")]
    LoadFailed(String),
    #[error("Failed to save wallet: {0}")]
    SaveFailed(String),
    #[error("Wallet file not found")]
    NotFound,
    #[error("Invalid password")]
    InvalidPassword,
    #[error("Encryption error: {0}")]
    EncryptionError(String),
}

/// Encrypted wallet file format
#[derive(Serialize, Deserialize)]
struct EncryptedWalletFile {
    /// File format version
    version: u32,
    /// Argon2 salt
    salt: Vec<u8>,
    /// AES-GCM nonce (12 bytes)
    nonce: Vec<u8>,
    /// Encrypted wallet data
    ciphertext: Vec<u8>,
}

/// Plaintext wallet payload (encrypted at rest)
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct WalletData {
    pub version: u32,
    #[zeroize(skip)]
    pub network: NetworkType,
    /// BIP39 recovery phrase
    pub mnemonic: String,
    /// Derivation index of the account key
    pub account_index: u32,
    /// Derived 32-byte secret key
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
    #[zeroize(skip)]
    pub address: String,
    pub created_at: u64,
    #[zeroize(skip)]
    pub label: Option<String>,
}

pub struct Wallet {
    data: WalletData,
    keypair: Keypair,
}

const WALLET_VERSION: u32 = 1;
const SALT_BYTES: usize = 16;
const NONCE_BYTES: usize = 12;

impl Wallet {
    /// Create a wallet with a fresh 24-word mnemonic at account index 0.
    pub fn create(network: NetworkType, label: Option<String>) -> Result<Self, WalletError> {
        let mnemonic =
            hd::generate_mnemonic().map_err(|e| WalletError::CreationFailed(e.to_string()))?;
        Self::from_mnemonic_phrase(&mnemonic.to_string(), network, label)
    }

    /// Recover a wallet from an existing phrase.
    pub fn from_mnemonic_phrase(
        phrase: &str,
        network: NetworkType,
        label: Option<String>,
    ) -> Result<Self, WalletError> {
        let mnemonic =
            hd::parse_mnemonic(phrase).map_err(|e| WalletError::CreationFailed(e.to_string()))?;
        let mut seed = hd::mnemonic_to_seed(&mnemonic, "");
        let keypair = hd::derive_keypair(&seed, 0)
            .map_err(|e| WalletError::CreationFailed(e.to_string()))?;
        seed.zeroize();

        let data = WalletData {
            version: WALLET_VERSION,
            network,
            mnemonic: mnemonic.to_string(),
            account_index: 0,
            secret_key: keypair.secret_bytes(),
            public_key: keypair.public_bytes(),
            address: keypair.address(),
            created_at: now_ms(),
            label,
        };
        Ok(Self { data, keypair })
    }

    pub fn address(&self) -> &str {
        &self.data.address
    }

    pub fn mnemonic(&self) -> &str {
        &self.data.mnemonic
    }

    pub fn network(&self) -> NetworkType {
        self.data.network
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Encrypt and write the wallet file.
    pub fn save<P: AsRef<Path>>(&self, path: P, password: &str) -> Result<(), WalletError> {
        let mut plaintext = serde_json::to_vec(&self.data)
            .map_err(|e| WalletError::SaveFailed(e.to_string()))?;

        let salt: [u8; SALT_BYTES] = rand::random();
        let mut key = derive_key(password, &salt)?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| WalletError::EncryptionError(e.to_string()))?;
        let nonce_bytes: [u8; NONCE_BYTES] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| WalletError::EncryptionError(e.to_string()))?;
        plaintext.zeroize();
        key.zeroize();

        let file = EncryptedWalletFile {
            version: WALLET_VERSION,
            salt: salt.to_vec(),
            nonce: nonce_bytes.to_vec(),
            ciphertext,
        };
        let raw =
            serde_json::to_vec(&file).map_err(|e| WalletError::SaveFailed(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| WalletError::SaveFailed(e.to_string()))?;
        }
        std::fs::write(path, raw).map_err(|e| WalletError::SaveFailed(e.to_string()))
    }

    /// Load and decrypt a wallet file.
    pub fn load<P: AsRef<Path>>(path: P, password: &str) -> Result<Self, WalletError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(WalletError::NotFound);
        }
        let raw = std::fs::read(path).map_err(|e| WalletError::LoadFailed(e.to_string()))?;
        let file: EncryptedWalletFile =
            serde_json::from_slice(&raw).map_err(|e| WalletError::LoadFailed(e.to_string()))?;

        let mut key = derive_key(password, &file.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| WalletError::EncryptionError(e.to_string()))?;
        let mut plaintext = cipher
            .decrypt(Nonce::from_slice(&file.nonce), file.ciphertext.as_slice())
            .map_err(|_| WalletError::InvalidPassword)?;
        key.zeroize();

        let data: WalletData = serde_json::from_slice(&plaintext)
            .map_err(|e| WalletError::LoadFailed(e.to_string()))?;
        plaintext.zeroize();

        let keypair = Keypair::from_secret_bytes(&data.secret_key)
            .map_err(|e| WalletError::LoadFailed(e.to_string()))?;
        Ok(Self { data, keypair })
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], WalletError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| WalletError::EncryptionError(e.to_string()))?;
    Ok(key)
}
