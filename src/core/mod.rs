//! Core Bitcoin components
//!
//! This module contains the fundamental building blocks:
//! - Network parameters (version bytes, payment protocol names)
//! - Addresses (P2PKH, P2SH with Base58Check)
//! - Satoshi amounts
//! - Script system (multisig redeem scripts, scriptSigs)
//! - Legacy transactions (serialization, txid, SIGHASH_ALL)
//! - Fee policy

pub mod address;
pub mod amount;
pub mod fee;
pub mod network;
pub mod script;
pub mod transaction;

pub use address::{Address, AddressError, AddressKind};
pub use amount::{Amount, AmountError, SATOSHIS_PER_BTC};
pub use fee::{estimate_size, FeePolicy, DEFAULT_DUST_THRESHOLD, DEFAULT_FEE_PER_KB};
pub use network::Network;
pub use script::{
    build_redeem_script, multisig_script_sig, script_to_address, Instruction, Script, ScriptError,
    MAX_MULTISIG_KEYS, SIGHASH_ALL,
};
pub use transaction::{
    OutPoint, Transaction, TransactionError, TxIn, TxOut, Txid, SEQUENCE_FINAL, TX_VERSION,
};
