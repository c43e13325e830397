//! BT2C address derivation and validation.
//!
//! An address is `bt2c_` followed by the base58 encoding of
//! RIPEMD-160(SHA-256(public_key)). The 20-byte payload keeps addresses
//! short and length-stable.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ADDRESS_PREFIX: &str = "bt2c_";

/// RIPEMD-160 payload length
const PAYLOAD_BYTES: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address prefix (expected bt2c_)")]
    InvalidPrefix,
    #[error("Invalid address length")]
    InvalidLength,
    #[error("Invalid base58 character")]
    InvalidBase58,
    #[error("Invalid payload length")]
    InvalidPayload,
}

/// Derive the printable address for a public key.
pub fn derive_address(public_key: &[u8]) -> String {
    let sha = Sha256::digest(public_key);
    let payload = Ripemd160::digest(sha);
    format!("{}{}", ADDRESS_PREFIX, bs58::encode(payload).into_string())
}

/// Decode an address back to its 20-byte payload, validating shape.
pub fn decode_address(address: &str) -> Result<[u8; PAYLOAD_BYTES], AddressError> {
    let encoded = address
        .strip_prefix(ADDRESS_PREFIX)
        .ok_or(AddressError::InvalidPrefix)?;
    if encoded.is_empty() || encoded.len() > 40 {
        return Err(AddressError::InvalidLength);
    }
    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| AddressError::InvalidBase58)?;
    decoded
        .as_slice()
        .try_into()
        .map_err(|_| AddressError::InvalidPayload)
}

/// True when the string parses as a well-formed BT2C address.
pub fn is_valid_address(address: &str) -> bool {
    decode_address(address).is_ok()
}
