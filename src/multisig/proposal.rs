//! Transaction proposals awaiting copayer signatures
//!
//! A proposal wraps a builder whose scripts are attached. Copayers add
//! signatures until every input reaches the quorum, or reject it.

use chrono::{DateTime, Utc};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Txid;
use crate::multisig::builder::{BuilderError, BuilderState, TransactionBuilder};
use crate::paypro::PaymentContext;

/// Errors related to proposals
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    #[error("Proposal not found: {0}")]
    NotFound(String),
    #[error("Proposal is {0:?} and can no longer change")]
    Closed(ProposalState),
    #[error("Copayer {0} already voted the other way")]
    ConflictingVote(String),
    #[error("Proposal is not fully signed")]
    NotFullySigned,
    #[error("Builder has no transaction yet")]
    IncompleteBuilder,
    #[error("Builder error: {0}")]
    Builder(#[from] BuilderError),
    #[error("Signing worker failed: {0}")]
    Worker(String),
}

/// Lifecycle of a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalState {
    /// Waiting for more signatures
    Pending,
    /// Every input has its quorum; ready to broadcast
    FullySigned,
    /// Being delivered to the merchant or the network
    Sending,
    /// Too many copayers rejected it for the quorum to be reached
    Rejected,
    /// Sent to the network
    Broadcast,
}

/// A spend awaiting the wallet quorum
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxProposal {
    /// Hex ntxid of the unsigned transaction
    pub id: String,
    /// Copayer id of the proposer
    pub creator: String,
    pub memo: Option<String>,
    builder: TransactionBuilder,
    /// Copayers that added signatures
    pub signed_by: Vec<String>,
    pub rejected_by: Vec<String>,
    pub required: u8,
    pub total: u8,
    pub state: ProposalState,
    /// Merchant payment to complete once signed
    pub payment: Option<PaymentContext>,
    pub sent_txid: Option<Txid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TxProposal {
    /// Wrap a builder whose redeem scripts are attached
    pub fn new(
        builder: TransactionBuilder,
        creator: &str,
        memo: Option<String>,
        required: u8,
        total: u8,
    ) -> Result<Self, ProposalError> {
        if builder.state() < BuilderState::ScriptsAttached {
            return Err(ProposalError::IncompleteBuilder);
        }
        let id = builder
            .ntxid()
            .ok_or(ProposalError::IncompleteBuilder)?
            .to_string();
        let now = Utc::now();

        let mut proposal = Self {
            id,
            creator: creator.to_string(),
            memo,
            builder,
            signed_by: Vec::new(),
            rejected_by: Vec::new(),
            required,
            total,
            state: ProposalState::Pending,
            payment: None,
            sent_txid: None,
            created_at: now,
            updated_at: now,
        };
        proposal.refresh_state();
        Ok(proposal)
    }

    pub fn with_payment(mut self, payment: PaymentContext) -> Self {
        self.payment = Some(payment);
        self
    }

    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    fn refresh_state(&mut self) {
        if matches!(
            self.state,
            ProposalState::Rejected | ProposalState::Sending | ProposalState::Broadcast
        ) {
            return;
        }
        self.state = if self.builder.is_fully_signed() {
            ProposalState::FullySigned
        } else {
            ProposalState::Pending
        };
    }

    fn ensure_open(&self) -> Result<(), ProposalError> {
        match self.state {
            ProposalState::Pending | ProposalState::FullySigned => Ok(()),
            closed => Err(ProposalError::Closed(closed)),
        }
    }

    /// Add `copayer_id`'s signatures made with `keys`
    ///
    /// The builder is signed as a copy and replaced only on success.
    pub fn sign(
        &mut self,
        copayer_id: &str,
        keys: &[SecretKey],
    ) -> Result<ProposalState, ProposalError> {
        self.ensure_open()?;
        if self.rejected_by.iter().any(|c| c == copayer_id) {
            return Err(ProposalError::ConflictingVote(copayer_id.to_string()));
        }

        self.builder = self.builder.clone().sign(keys)?;
        if !self.signed_by.iter().any(|c| c == copayer_id) {
            self.signed_by.push(copayer_id.to_string());
        }
        self.updated_at = Utc::now();
        self.refresh_state();

        log::info!(
            "Proposal {} signed by {} ({}/{} copayers, {:?})",
            self.id,
            copayer_id,
            self.signed_by.len(),
            self.required,
            self.state
        );
        Ok(self.state)
    }

    /// Take in another copayer's copy of this proposal
    pub fn merge(&mut self, other: &TxProposal) -> Result<ProposalState, ProposalError> {
        if other.id != self.id {
            return Err(BuilderError::ProposalMismatch.into());
        }
        if matches!(self.state, ProposalState::Sending | ProposalState::Broadcast) {
            return Ok(self.state);
        }

        self.builder = self.builder.clone().merge_signatures(&other.builder)?;
        for id in &other.signed_by {
            if !self.signed_by.contains(id) {
                self.signed_by.push(id.clone());
            }
        }
        for id in &other.rejected_by {
            if !self.rejected_by.contains(id) {
                self.rejected_by.push(id.clone());
            }
        }
        if self.payment.is_none() {
            self.payment = other.payment.clone();
        }

        self.updated_at = Utc::now();
        self.refresh_state();
        self.apply_rejections();
        Ok(self.state)
    }

    /// Record a rejection; the proposal dies once the quorum is unreachable
    pub fn reject(&mut self, copayer_id: &str) -> Result<ProposalState, ProposalError> {
        self.ensure_open()?;
        if self.signed_by.iter().any(|c| c == copayer_id) {
            return Err(ProposalError::ConflictingVote(copayer_id.to_string()));
        }
        if !self.rejected_by.iter().any(|c| c == copayer_id) {
            self.rejected_by.push(copayer_id.to_string());
        }
        self.updated_at = Utc::now();
        self.apply_rejections();

        log::info!(
            "Proposal {} rejected by {} ({:?})",
            self.id,
            copayer_id,
            self.state
        );
        Ok(self.state)
    }

    /// Replace the votes with ones checked against the copayer set
    pub fn set_votes(&mut self, signed_by: Vec<String>, rejected_by: Vec<String>) {
        self.signed_by = signed_by;
        self.rejected_by = rejected_by;
        self.apply_rejections();
    }

    fn apply_rejections(&mut self) {
        let tolerated = self.total.saturating_sub(self.required) as usize;
        if self.state == ProposalState::Pending && self.rejected_by.len() > tolerated {
            self.state = ProposalState::Rejected;
        }
    }

    /// Serialized transaction ready for broadcast
    pub fn signed_tx(&self) -> Result<Vec<u8>, ProposalError> {
        if !self.builder.is_fully_signed() {
            return Err(ProposalError::NotFullySigned);
        }
        Ok(self.builder.build()?)
    }

    /// Claim the proposal for delivery; only one claim succeeds
    pub fn begin_send(&mut self) -> Result<(), ProposalError> {
        match self.state {
            ProposalState::FullySigned => {
                self.state = ProposalState::Sending;
                self.updated_at = Utc::now();
                Ok(())
            }
            ProposalState::Pending => Err(ProposalError::NotFullySigned),
            closed => Err(ProposalError::Closed(closed)),
        }
    }

    /// Give up a claim taken by [`begin_send`](Self::begin_send)
    pub fn abort_send(&mut self) {
        if self.state == ProposalState::Sending {
            self.state = ProposalState::FullySigned;
            self.updated_at = Utc::now();
        }
    }

    pub fn mark_broadcast(&mut self, txid: Txid) -> Result<(), ProposalError> {
        if !matches!(
            self.state,
            ProposalState::FullySigned | ProposalState::Sending
        ) {
            return Err(ProposalError::NotFullySigned);
        }
        self.state = ProposalState::Broadcast;
        self.sent_txid = Some(txid);
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_fully_signed(&self) -> bool {
        self.state == ProposalState::FullySigned
    }
}
