//! Base58Check addresses
//!
//! P2PKH and P2SH addresses, their output scripts, and recovery of an
//! address from an output script.

use secp256k1::PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::network::Network;
use crate::core::script::Script;
use crate::crypto::{base58check_decode, base58check_encode, hash160, Base58Error};

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Base58 error: {0}")]
    Base58(#[from] Base58Error),
    #[error("Invalid address length: {0}")]
    InvalidLength(usize),
    #[error("Unknown address version byte: {0:#04x}")]
    UnknownVersion(u8),
    #[error("Address is for {found}, expected {expected}")]
    WrongNetwork { expected: Network, found: Network },
}

/// What an address commits to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressKind {
    /// Pay to public key hash
    P2pkh,
    /// Pay to script hash
    P2sh,
}

/// A Bitcoin address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub network: Network,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

impl Address {
    /// P2SH address for a redeem script
    pub fn p2sh(redeem_script: &Script, network: Network) -> Self {
        Self {
            network,
            kind: AddressKind::P2sh,
            hash: redeem_script.script_hash(),
        }
    }

    /// P2PKH address for a public key (compressed encoding)
    pub fn p2pkh(public_key: &PublicKey, network: Network) -> Self {
        Self {
            network,
            kind: AddressKind::P2pkh,
            hash: hash160(&public_key.serialize()),
        }
    }

    /// Recover the address an output script pays to
    ///
    /// Returns `None` for scripts that are neither P2PKH nor P2SH.
    pub fn from_script(script: &Script, network: Network) -> Option<Self> {
        let hash = script.committed_hash()?;
        let kind = if script.is_p2sh() {
            AddressKind::P2sh
        } else {
            AddressKind::P2pkh
        };
        Some(Self {
            network,
            kind,
            hash,
        })
    }

    /// Output script paying to this address
    pub fn script_pubkey(&self) -> Script {
        match self.kind {
            AddressKind::P2pkh => Script::p2pkh(&self.hash),
            AddressKind::P2sh => Script::p2sh(&self.hash),
        }
    }

    pub fn is_p2sh(&self) -> bool {
        self.kind == AddressKind::P2sh
    }

    fn version(&self) -> u8 {
        match self.kind {
            AddressKind::P2pkh => self.network.p2pkh_version(),
            AddressKind::P2sh => self.network.p2sh_version(),
        }
    }

    /// Parse an address and require it to belong to `network`
    pub fn parse_for(s: &str, network: Network) -> Result<Self, AddressError> {
        let address: Address = s.parse()?;
        if address.network != network {
            return Err(AddressError::WrongNetwork {
                expected: network,
                found: address.network,
            });
        }
        Ok(address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut payload = Vec::with_capacity(21);
        payload.push(self.version());
        payload.extend_from_slice(&self.hash);
        f.write_str(&base58check_encode(&payload))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let payload = base58check_decode(s)?;
        if payload.len() != 21 {
            return Err(AddressError::InvalidLength(payload.len()));
        }

        let version = payload[0];
        let (network, kind) = [Network::Livenet, Network::Testnet]
            .into_iter()
            .find_map(|network| {
                if version == network.p2pkh_version() {
                    Some((network, AddressKind::P2pkh))
                } else if version == network.p2sh_version() {
                    Some((network, AddressKind::P2sh))
                } else {
                    None
                }
            })
            .ok_or(AddressError::UnknownVersion(version))?;

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self {
            network,
            kind,
            hash,
        })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_addresses() {
        // HASH160 of the generator point's compressed encoding
        let key = PublicKey::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let address = Address::p2pkh(&key, Network::Livenet);
        assert_eq!(address.to_string(), "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");

        let parsed: Address = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH".parse().unwrap();
        assert_eq!(parsed, address);
    }

    #[test]
    fn test_p2sh_versions() {
        let script = Script::from_bytes(vec![0x51]);
        let main = Address::p2sh(&script, Network::Livenet);
        let test = Address::p2sh(&script, Network::Testnet);

        assert!(main.to_string().starts_with('3'));
        let t = test.to_string();
        assert!(t.starts_with('2'), "{}", t);
        assert_eq!(t.parse::<Address>().unwrap(), test);
    }

    #[test]
    fn test_script_roundtrip() {
        let script = Script::from_bytes(vec![0x52, 0xae]);
        let address = Address::p2sh(&script, Network::Testnet);
        let spk = address.script_pubkey();

        assert!(spk.is_p2sh());
        assert_eq!(Address::from_script(&spk, Network::Testnet), Some(address));
        assert_eq!(Address::from_script(&script, Network::Testnet), None);
    }

    #[test]
    fn test_wrong_network() {
        let script = Script::from_bytes(vec![0x51]);
        let main = Address::p2sh(&script, Network::Livenet).to_string();
        assert!(matches!(
            Address::parse_for(&main, Network::Testnet),
            Err(AddressError::WrongNetwork { .. })
        ));
    }

    #[test]
    fn test_serde_as_string() {
        let script = Script::from_bytes(vec![0x51]);
        let address = Address::p2sh(&script, Network::Livenet);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", address));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
