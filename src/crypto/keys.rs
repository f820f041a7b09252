//! ECDSA key management
//!
//! Key pair generation, DER signing over 32-byte digests, and verification
//! using the secp256k1 curve.

use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::hash160;

/// Errors that can occur during key operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Invalid extended key: {0}")]
    InvalidExtendedKey(String),
    #[error("Cannot derive hardened child {0} from a public key")]
    HardenedFromPublic(u32),
    #[error("Derived key is invalid at index {0}")]
    InvalidChild(u32),
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// HASH160 of the compressed public key
    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.public_key.serialize())
    }

    /// Sign a 32-byte digest, returning a DER signature
    pub fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
        sign_digest(&self.secret_key, digest)
    }

    /// Verify a DER signature against this key pair's public key
    pub fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<bool, KeyError> {
        verify_digest(&self.public_key, digest, signature)
    }
}

/// Sign a digest with a secret key; the signature is low-S DER
pub fn sign_digest(secret_key: &SecretKey, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(digest)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_der().to_vec())
}

/// Verify a DER signature against a public key
///
/// Malformed DER is an error; a well-formed signature that does not match
/// yields `Ok(false)`.
pub fn verify_digest(
    public_key: &PublicKey,
    digest: &[u8; 32],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest_slice(digest)?;
    let mut sig = Signature::from_der(signature).map_err(|_| KeyError::InvalidSignature)?;
    sig.normalize_s();

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}
