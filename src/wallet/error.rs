//! Wallet errors and their categories

use thiserror::Error;

use super::collaborators::CollaboratorError;
use crate::config::ConfigError;
use crate::core::{Address, AddressError};
use crate::crypto::KeyError;
use crate::multisig::{BuilderError, KeyRingError, ProposalError};
use crate::paypro::{PayProError, PkiError, TransportError, UriError};

/// Broad class of a failure, for callers deciding what to tell the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Bad input: addresses, amounts, quorum, funds
    Validation,
    /// Unreachable or failing remote service
    Network,
    /// The merchant broke the payment protocol
    Protocol,
    /// Keys, certificates or signatures did not check out
    Crypto,
    /// Operation not allowed in the current state
    State,
}

/// Wallet errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Key ring error: {0}")]
    KeyRing(#[from] KeyRingError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Builder error: {0}")]
    Builder(#[from] BuilderError),
    #[error("Proposal error: {0}")]
    Proposal(#[from] ProposalError),
    #[error("Payment protocol error: {0}")]
    PayPro(#[from] PayProError),
    #[error("Invalid payment URI: {0}")]
    Uri(#[from] UriError),
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("No amount given for {0}")]
    MissingAmount(String),
    #[error("Address {0} does not belong to this wallet")]
    UnknownAddress(Address),
    #[error("Not a payment request: {0}")]
    NotPaymentRequest(String),
    #[error("Proposal {0} does not fit this wallet")]
    ForeignProposal(String),
}

fn builder_category(e: &BuilderError) -> ErrorCategory {
    match e {
        BuilderError::StateError { .. } | BuilderError::IncompleteScripts => ErrorCategory::State,
        BuilderError::NoMatchingKeys | BuilderError::InvalidSignature(_) | BuilderError::Key(_) => {
            ErrorCategory::Crypto
        }
        _ => ErrorCategory::Validation,
    }
}

fn keyring_category(e: &KeyRingError) -> ErrorCategory {
    match e {
        KeyRingError::InvalidExtendedKey(_) => ErrorCategory::Crypto,
        KeyRingError::IncompleteKeyRing { .. } => ErrorCategory::State,
        _ => ErrorCategory::Validation,
    }
}

fn paypro_category(e: &PayProError) -> ErrorCategory {
    match e {
        PayProError::Transport(
            TransportError::Network(_) | TransportError::HttpStatus(_) | TransportError::Timeout,
        ) => ErrorCategory::Network,
        PayProError::Pki(
            PkiError::InvalidSignature
            | PkiError::InvalidCertificate(_)
            | PkiError::UntrustedCertificate(_)
            | PkiError::ExpiredCertificate(_)
            | PkiError::UnsupportedKeyType,
        ) => ErrorCategory::Crypto,
        PayProError::Refund(e) => keyring_category(e),
        PayProError::Worker(_) => ErrorCategory::State,
        _ => ErrorCategory::Protocol,
    }
}

impl WalletError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WalletError::KeyRing(e) => keyring_category(e),
            WalletError::Key(_) => ErrorCategory::Crypto,
            WalletError::Builder(e) => builder_category(e),
            WalletError::Proposal(ProposalError::Builder(e)) => builder_category(e),
            WalletError::Proposal(_) => ErrorCategory::State,
            WalletError::PayPro(e) => paypro_category(e),
            WalletError::Collaborator(_) => ErrorCategory::Network,
            WalletError::Config(_)
            | WalletError::Uri(_)
            | WalletError::Address(_)
            | WalletError::MissingAmount(_)
            | WalletError::UnknownAddress(_)
            | WalletError::NotPaymentRequest(_)
            | WalletError::ForeignProposal(_) => ErrorCategory::Validation,
        }
    }
}
