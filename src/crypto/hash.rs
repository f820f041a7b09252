//! Hashing and Base58Check utilities
//!
//! Provides the SHA-256 family used for transaction ids and signature hashes,
//! HASH160 for script and key hashes, and Base58Check for addresses and
//! extended keys.

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the Base58Check checksum
pub const CHECKSUM_LEN: usize = 4;

/// Base58Check decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Base58Error {
    #[error("Invalid base58 character")]
    InvalidEncoding,
    #[error("Base58 payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Base58 checksum mismatch")]
    BadChecksum,
}

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for transaction ids and signature hashes
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// RIPEMD160(SHA256(data)), the hash behind addresses and key fingerprints
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut ripemd = Ripemd160::new();
    ripemd.update(sha256(data));
    ripemd.finalize().into()
}

/// Base58 encode `payload` followed by the first 4 bytes of its double SHA-256
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = double_sha256(payload);
    let mut data = Vec::with_capacity(payload.len() + CHECKSUM_LEN);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum[..CHECKSUM_LEN]);
    bs58::encode(data).into_string()
}

/// Decode a Base58Check string and return the payload without checksum
pub fn base58check_decode(encoded: &str) -> Result<Vec<u8>, Base58Error> {
    let mut data = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| Base58Error::InvalidEncoding)?;

    if data.len() < CHECKSUM_LEN + 1 {
        return Err(Base58Error::TooShort(data.len()));
    }

    let split = data.len() - CHECKSUM_LEN;
    let expected = double_sha256(&data[..split]);
    if data[split..] != expected[..CHECKSUM_LEN] {
        return Err(Base58Error::BadChecksum);
    }

    data.truncate(split);
    Ok(data)
}
