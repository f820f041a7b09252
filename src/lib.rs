//! Copay core: a multisig Bitcoin wallet with BIP70 payment protocol support
//!
//! This crate provides:
//! - BIP32/BIP45 copayer key rings and shared P2SH multisig addresses
//! - A staged transaction builder (coin selection, fees, partial signing)
//! - Transaction proposals shared and co-signed between copayers
//! - The BIP70 payment protocol: message codec, X.509 request
//!   verification, merchant HTTP transport and the full payment flow
//! - `bitcoin:` payment URIs
//! - JSON wallet configuration
//!
//! # Example
//!
//! ```ignore
//! use copay_core::config::WalletConfig;
//! use copay_core::wallet::{PaymentOutcome, Wallet};
//!
//! let wallet = Wallet::new(config, keyring, &my_id, collaborators, trust)?;
//!
//! let uri = "bitcoin:?r=https://merchant.example/i/42";
//! match wallet.fetch_and_pay(uri, &my_branch, Some("Gift wrap, please".into())).await? {
//!     PaymentOutcome::Paid { txid, ack_memo } => println!("Paid in {}: {:?}", txid, ack_memo),
//!     PaymentOutcome::AwaitingSignatures { proposal_id } => {
//!         println!("Proposal {} needs more signatures", proposal_id)
//!     }
//! }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod multisig;
pub mod paypro;
pub mod wallet;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::WalletConfig;
pub use core::{Address, Amount, Network, Transaction, Txid};
pub use crypto::{ExtendedPrivKey, ExtendedPubKey};
pub use multisig::{KeyRing, TransactionBuilder, TxProposal, TxProposalStore};
pub use paypro::{PaymentProtocolClient, PaymentUri, TrustStore};
pub use wallet::{Wallet, WalletError};
