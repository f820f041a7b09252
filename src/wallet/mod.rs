//! Multisig wallet and the services it depends on

pub mod collaborators;
pub mod error;
pub mod wallet;

pub use collaborators::{
    with_timeout, Broadcaster, CollaboratorError, ProposalNetwork, UnspentSource,
};
pub use error::{ErrorCategory, WalletError};
pub use wallet::{Collaborators, CreateTxOutcome, PaymentOutcome, SendOutcome, Wallet};
