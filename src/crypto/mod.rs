//! Cryptographic utilities for the wallet
//!
//! This module provides:
//! - SHA-256, HASH160 and Base58Check
//! - ECDSA key management (secp256k1)
//! - BIP32 extended keys

pub mod hash;
pub mod hd;
pub mod keys;

pub use hash::{
    base58check_decode, base58check_encode, double_sha256, hash160, sha256,
    Base58Error,
};
pub use hd::{ExtendedPrivKey, ExtendedPubKey, BIP45_PURPOSE, HARDENED};
pub use keys::{sign_digest, verify_digest, KeyError, KeyPair};
