//! Network parameters
//!
//! Version bytes for addresses, the extended key family, and the network
//! names used by the payment protocol.

use bitcoin::NetworkKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bitcoin network a wallet operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Livenet,
    Testnet,
}

impl Network {
    /// Version byte for pay-to-pubkey-hash addresses
    pub fn p2pkh_version(self) -> u8 {
        match self {
            Network::Livenet => 0x00,
            Network::Testnet => 0x6f,
        }
    }

    /// Version byte for pay-to-script-hash addresses
    pub fn p2sh_version(self) -> u8 {
        match self {
            Network::Livenet => 0x05,
            Network::Testnet => 0xc4,
        }
    }

    /// Extended key version family (`xpub`/`xprv` or `tpub`/`tprv`)
    pub fn kind(self) -> NetworkKind {
        match self {
            Network::Livenet => NetworkKind::Main,
            Network::Testnet => NetworkKind::Test,
        }
    }

    pub fn from_kind(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::Main => Network::Livenet,
            NetworkKind::Test => Network::Testnet,
        }
    }

    /// Network name carried in PaymentDetails
    pub fn paypro_name(self) -> &'static str {
        match self {
            Network::Livenet => "main",
            Network::Testnet => "test",
        }
    }

    pub fn from_paypro_name(name: &str) -> Option<Self> {
        match name {
            "main" => Some(Network::Livenet),
            "test" => Some(Network::Testnet),
            _ => None,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Livenet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Livenet => f.write_str("livenet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "livenet" | "mainnet" | "main" => Ok(Network::Livenet),
            "testnet" | "test" => Ok(Network::Testnet),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paypro_names() {
        assert_eq!(Network::from_paypro_name("main"), Some(Network::Livenet));
        assert_eq!(Network::from_paypro_name("test"), Some(Network::Testnet));
        assert_eq!(Network::from_paypro_name("regtest"), None);
        assert_eq!(Network::Testnet.paypro_name(), "test");
    }

    #[test]
    fn test_extended_key_family() {
        for network in [Network::Livenet, Network::Testnet] {
            assert_eq!(Network::from_kind(network.kind()), network);
        }
        assert_eq!(Network::Testnet.kind(), NetworkKind::Test);
    }

    #[test]
    fn test_parse_network() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Livenet);
        assert_eq!("TESTNET".parse::<Network>().unwrap(), Network::Testnet);
        assert!("signet".parse::<Network>().is_err());
    }
}
