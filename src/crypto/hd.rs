//! BIP32 hierarchical deterministic keys
//!
//! Copayers exchange extended public keys for their BIP45 branch (`m/45'`).
//! Every address key is derived from those branches with non-hardened
//! public derivation, so all copayers compute identical keys independently.
//! Derivation and Base58 encoding are done by `bitcoin::bip32`.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{self, ChildNumber, DerivationPath, Xpriv, Xpub};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

use super::hash::hash160;
use super::keys::KeyError;
use crate::core::Network;

/// First hardened child index
pub const HARDENED: u32 = 0x8000_0000;

/// BIP45 purpose field
pub const BIP45_PURPOSE: u32 = 45;

impl From<bip32::Error> for KeyError {
    fn from(e: bip32::Error) -> Self {
        KeyError::InvalidExtendedKey(e.to_string())
    }
}

/// Path of raw child indexes; indexes at or above `HARDENED` are hardened
fn to_path(indexes: &[u32]) -> DerivationPath {
    indexes.iter().map(|&i| ChildNumber::from(i)).collect()
}

/// An extended public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedPubKey(Xpub);

impl ExtendedPubKey {
    pub fn network(&self) -> Network {
        Network::from_kind(self.0.network)
    }

    pub fn public_key(&self) -> PublicKey {
        self.0.public_key
    }

    pub fn depth(&self) -> u8 {
        self.0.depth
    }

    /// HASH160 of the public key
    pub fn identifier(&self) -> [u8; 20] {
        hash160(&self.0.public_key.serialize())
    }

    /// Non-hardened child derivation (CKDpub)
    pub fn derive_child(&self, index: u32) -> Result<Self, KeyError> {
        self.derive_path(&[index])
    }

    /// Derive along a path of non-hardened indexes
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, KeyError> {
        if let Some(&index) = path.iter().find(|&&i| i >= HARDENED) {
            return Err(KeyError::HardenedFromPublic(index));
        }
        let secp = Secp256k1::verification_only();
        Ok(Self(self.0.derive_pub(&secp, &to_path(path))?))
    }
}

impl fmt::Display for ExtendedPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ExtendedPubKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<Xpub>()?))
    }
}

/// An extended private key
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedPrivKey(Xpriv);

impl ExtendedPrivKey {
    /// Master key from a seed (BIP32 `Bitcoin seed` HMAC)
    pub fn from_seed(network: Network, seed: &[u8]) -> Result<Self, KeyError> {
        Ok(Self(Xpriv::new_master(network.kind(), seed)?))
    }

    pub fn network(&self) -> Network {
        Network::from_kind(self.0.network)
    }

    pub fn secret_key(&self) -> SecretKey {
        self.0.private_key
    }

    /// Public half of this key
    pub fn to_xpub(&self) -> ExtendedPubKey {
        let secp = Secp256k1::signing_only();
        ExtendedPubKey(Xpub::from_priv(&secp, &self.0))
    }

    /// Child derivation (CKDpriv), hardened when `index >= HARDENED`
    pub fn derive_child(&self, index: u32) -> Result<Self, KeyError> {
        self.derive_path(&[index])
    }

    /// Derive along a path; indexes at or above `HARDENED` are hardened
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, KeyError> {
        let secp = Secp256k1::signing_only();
        Ok(Self(self.0.derive_priv(&secp, &to_path(path))?))
    }

    /// The `m/45'` branch a copayer shares with the wallet
    pub fn bip45_branch(&self) -> Result<Self, KeyError> {
        self.derive_child(BIP45_PURPOSE | HARDENED)
    }
}

impl fmt::Debug for ExtendedPrivKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivKey")
            .field("network", &self.network())
            .field("depth", &self.0.depth)
            .field("fingerprint", &hex::encode(&self.to_xpub().identifier()[..4]))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ExtendedPrivKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ExtendedPrivKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse::<Xpriv>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 1
    const SEED: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn test_master_key_vector() {
        let seed = hex::decode(SEED).unwrap();
        let master = ExtendedPrivKey::from_seed(Network::Livenet, &seed).unwrap();
        assert_eq!(
            master.to_string(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            master.to_xpub().to_string(),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
    }

    #[test]
    fn test_hardened_then_public_vector() {
        let seed = hex::decode(SEED).unwrap();
        let master = ExtendedPrivKey::from_seed(Network::Livenet, &seed).unwrap();
        // m/0'/1
        let child = master.derive_path(&[HARDENED, 1]).unwrap();
        assert_eq!(
            child.to_xpub().to_string(),
            "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ"
        );
        assert_eq!(child.to_xpub().depth(), 2);

        // public derivation of the non-hardened step agrees with private derivation
        let parent = master.derive_child(HARDENED).unwrap().to_xpub();
        assert_eq!(parent.derive_child(1).unwrap(), child.to_xpub());
    }

    #[test]
    fn test_hardened_public_derivation_rejected() {
        let seed = [7u8; 32];
        let xpub = ExtendedPrivKey::from_seed(Network::Testnet, &seed)
            .unwrap()
            .to_xpub();
        assert_eq!(
            xpub.derive_child(HARDENED),
            Err(KeyError::HardenedFromPublic(HARDENED))
        );
        assert_eq!(
            xpub.derive_path(&[0, HARDENED | 3]),
            Err(KeyError::HardenedFromPublic(HARDENED | 3))
        );
    }

    #[test]
    fn test_xkey_string_roundtrip() {
        let xprv = ExtendedPrivKey::from_seed(Network::Testnet, &[3u8; 32])
            .unwrap()
            .bip45_branch()
            .unwrap();
        let xpub = xprv.to_xpub();

        assert!(xpub.to_string().starts_with("tpub"));
        assert!(xprv.to_string().starts_with("tprv"));
        assert_eq!(xpub.network(), Network::Testnet);
        assert_eq!(xpub.to_string().parse::<ExtendedPubKey>().unwrap(), xpub);
        assert_eq!(xprv.to_string().parse::<ExtendedPrivKey>().unwrap(), xprv);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            "xpub-not-a-key".parse::<ExtendedPubKey>(),
            Err(KeyError::InvalidExtendedKey(_))
        ));
        let xpub = ExtendedPrivKey::from_seed(Network::Livenet, &[1u8; 32])
            .unwrap()
            .to_xpub()
            .to_string();
        // A public key does not parse as a private one
        assert!(xpub.parse::<ExtendedPrivKey>().is_err());
    }
}
