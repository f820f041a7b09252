//! Services the wallet depends on but does not implement

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::core::Txid;
use crate::multisig::{TxProposal, UnspentOutput};

/// Failure reported by an external service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Rejected by service: {0}")]
    Rejected(String),
    #[error("Service call timed out")]
    Timeout,
}

/// Reports the wallet's spendable outputs
#[async_trait]
pub trait UnspentSource: Send + Sync {
    async fn get_unspent(&self) -> Result<Vec<UnspentOutput>, CollaboratorError>;
}

/// Relays signed transactions to the network
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, raw_tx: &[u8]) -> Result<Txid, CollaboratorError>;
}

/// Shares proposals with the other copayers
#[async_trait]
pub trait ProposalNetwork: Send + Sync {
    async fn send_proposal(&self, proposal: &TxProposal) -> Result<(), CollaboratorError>;
}

/// Bound a collaborator call by `limit`
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| CollaboratorError::Timeout)?
}
