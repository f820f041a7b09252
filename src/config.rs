//! Wallet configuration
//!
//! Stored as JSON. Every field has a default so a partial file is enough.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::{FeePolicy, Network, DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_PER_KB};
use crate::multisig::MAX_COPAYERS;
use crate::paypro::{PkiError, TrustStore};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Trusted root {path:?}: {source}")]
    TrustRoot { path: PathBuf, source: PkiError },
}

/// Wallet settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub network: Network,
    /// Signatures needed to spend (M)
    pub required_copayers: u8,
    /// Copayers in the wallet (N)
    pub total_copayers: u8,
    /// Satoshis per started kilobyte
    pub fee_per_kb: u64,
    /// Change at or below this is added to the fee
    pub dust_threshold: u64,
    pub spend_unconfirmed: bool,
    pub allow_unsigned_requests: bool,
    pub http_timeout_secs: u64,
    /// Address indexes searched per branch when matching an address
    pub address_search_limit: u32,
    /// PEM files with root certificates for payment requests
    pub trusted_roots: Vec<PathBuf>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Livenet,
            required_copayers: 1,
            total_copayers: 1,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            spend_unconfirmed: false,
            allow_unsigned_requests: false,
            http_timeout_secs: 30,
            address_search_limit: 100,
            trusted_roots: Vec::new(),
        }
    }
}

impl WalletConfig {
    /// Default settings for an M-of-N wallet
    pub fn multisig(required: u8, total: u8, network: Network) -> Self {
        Self {
            network,
            required_copayers: required,
            total_copayers: total,
            ..Default::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let config: WalletConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let temp_path = path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (m, n) = (self.required_copayers, self.total_copayers);
        if m == 0 || m > n || n as usize > MAX_COPAYERS {
            return Err(ConfigError::Invalid(format!(
                "quorum {}-of-{} (at most {} copayers)",
                m, n, MAX_COPAYERS
            )));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http_timeout_secs must be positive".into()));
        }
        if self.address_search_limit == 0 {
            return Err(ConfigError::Invalid(
                "address_search_limit must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy::new(self.fee_per_kb, self.dust_threshold)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Read every configured root certificate file
    pub fn load_trust_store(&self) -> Result<TrustStore, ConfigError> {
        let mut trust = TrustStore::new();
        for path in &self.trusted_roots {
            let pem = fs::read(path)?;
            let added = trust
                .add_pem(&pem)
                .map_err(|source| ConfigError::TrustRoot {
                    path: path.clone(),
                    source,
                })?;
            log::debug!("Loaded {} root certificate(s) from {:?}", added, path);
        }
        Ok(trust)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MerchantPki;

    #[test]
    fn test_defaults() {
        let config = WalletConfig::default();
        assert_eq!(config.fee_per_kb, 10_000);
        assert_eq!(config.dust_threshold, 5_430);
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
        assert!(!config.allow_unsigned_requests);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wallet.json");

        let mut config = WalletConfig::multisig(2, 3, Network::Testnet);
        config.fee_per_kb = 20_000;
        config.save(&path).unwrap();

        assert_eq!(WalletConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("wallet.json");
        fs::write(
            &path,
            r#"{"network": "testnet", "required_copayers": 2, "total_copayers": 3}"#,
        )
        .unwrap();

        let config = WalletConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.address_search_limit, 100);
        assert_eq!(config.fee_policy(), FeePolicy::default());
    }

    #[test]
    fn test_invalid_quorum() {
        for (m, n) in [(0, 3), (4, 3), (2, 16)] {
            assert!(matches!(
                WalletConfig::multisig(m, n, Network::Testnet).validate(),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_trust_store_from_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pki = MerchantPki::new();
        let root = temp_dir.path().join("root.pem");
        fs::write(&root, pki.root_pem()).unwrap();

        let config = WalletConfig {
            trusted_roots: vec![root],
            ..Default::default()
        };
        assert_eq!(config.load_trust_store().unwrap().len(), 1);

        let garbage = temp_dir.path().join("garbage.pem");
        fs::write(
            &garbage,
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        let config = WalletConfig {
            trusted_roots: vec![garbage],
            ..Default::default()
        };
        assert!(matches!(
            config.load_trust_store(),
            Err(ConfigError::TrustRoot { .. })
        ));
    }
}
