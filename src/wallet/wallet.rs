//! Multisig wallet
//!
//! Ties the key ring, transaction builder, proposal store and payment
//! protocol client together. Spends become proposals; a proposal is sent
//! once enough copayers have signed it, either straight to the network or
//! to the merchant that asked for it.

use chrono::Utc;
use secp256k1::SecretKey;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::collaborators::{with_timeout, Broadcaster, ProposalNetwork, UnspentSource};
use super::error::WalletError;
use crate::config::WalletConfig;
use crate::core::{Address, Txid};
use crate::crypto::ExtendedPrivKey;
use crate::multisig::{
    derive_private_key, AddressPath, BuilderOptions, Copayer, KeyRing, KeyRingError, OutputSpec,
    ProposalError, ProposalState, TransactionBuilder, TxProposal, TxProposalStore, SHARED_INDEX,
};
use crate::paypro::{
    refund_output, MerchantTransport, PayProError, PaymentContext, PaymentProtocolClient,
    PaymentUri, TrustStore,
};

/// External services a wallet talks to
#[derive(Clone)]
pub struct Collaborators {
    pub unspent: Arc<dyn UnspentSource>,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub merchant: Arc<dyn MerchantTransport>,
    pub peers: Option<Arc<dyn ProposalNetwork>>,
}

/// Result of proposing a spend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTxOutcome {
    pub proposal_id: String,
    pub state: ProposalState,
    /// Merchant payment the proposal completes, if any
    pub payment: Option<PaymentContext>,
}

/// Result of sending a fully signed proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub txid: Txid,
    pub ack_memo: Option<String>,
}

/// Result of paying a payment request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The merchant acknowledged the payment
    Paid {
        txid: Txid,
        ack_memo: Option<String>,
    },
    /// More copayers must sign before the payment can be sent
    AwaitingSignatures { proposal_id: String },
}

/// One copayer's view of an M-of-N wallet
pub struct Wallet {
    config: WalletConfig,
    keyring: Arc<KeyRing>,
    copayer_id: String,
    copayer_index: u32,
    signer: Option<ExtendedPrivKey>,
    proposals: TxProposalStore,
    paypro: PaymentProtocolClient,
    unspent: Arc<dyn UnspentSource>,
    broadcaster: Arc<dyn Broadcaster>,
    peers: Option<Arc<dyn ProposalNetwork>>,
    next_change_index: AtomicU32,
}

impl Wallet {
    pub fn new(
        config: WalletConfig,
        keyring: Arc<KeyRing>,
        copayer_id: &str,
        collaborators: Collaborators,
        trust: TrustStore,
    ) -> Result<Self, WalletError> {
        config.validate()?;
        if keyring.required() != config.required_copayers
            || keyring.total() != config.total_copayers
        {
            return Err(KeyRingError::InvalidQuorum {
                required: config.required_copayers,
                total: config.total_copayers,
            }
            .into());
        }
        if keyring.network() != config.network {
            return Err(KeyRingError::NetworkMismatch {
                expected: config.network,
                found: keyring.network(),
            }
            .into());
        }
        let copayer_index = keyring
            .copayer_index(copayer_id)
            .ok_or_else(|| KeyRingError::UnknownCopayer(copayer_id.to_string()))?;

        let paypro = PaymentProtocolClient::new(
            collaborators.merchant,
            Arc::new(trust),
            config.network,
            config.allow_unsigned_requests,
        );

        Ok(Self {
            config,
            keyring,
            copayer_id: copayer_id.to_string(),
            copayer_index,
            signer: None,
            proposals: TxProposalStore::new(),
            paypro,
            unspent: collaborators.unspent,
            broadcaster: collaborators.broadcaster,
            peers: collaborators.peers,
            next_change_index: AtomicU32::new(0),
        })
    }

    /// Sign new proposals with this copayer's branch key
    pub fn with_signer(mut self, branch: ExtendedPrivKey) -> Result<Self, WalletError> {
        let id = Copayer::new(branch.to_xpub()).id;
        if id != self.copayer_id {
            return Err(KeyRingError::UnknownCopayer(id).into());
        }
        self.signer = Some(branch);
        Ok(self)
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn copayer_id(&self) -> &str {
        &self.copayer_id
    }

    pub fn proposals(&self) -> &TxProposalStore {
        &self.proposals
    }

    /// Shared receive address at `index`
    pub fn receive_address(&self, index: u32) -> Result<Address, WalletError> {
        Ok(self.keyring.get_address(index, false, SHARED_INDEX)?)
    }

    fn timeout(&self) -> Duration {
        self.config.http_timeout()
    }

    // =========================================================================
    // Proposing
    // =========================================================================

    /// Propose a payment to an address, a `bitcoin:` URI, or the payment
    /// request a URI points at
    ///
    /// `amount` is used when the target does not carry one. The proposal is
    /// signed right away when the wallet has a signer.
    pub async fn create_tx(
        &self,
        address_or_uri: &str,
        amount: Option<u64>,
        memo: Option<String>,
    ) -> Result<CreateTxOutcome, WalletError> {
        let signer = self.signer.clone();
        let (outputs, payment) = if PaymentUri::is_uri(address_or_uri) {
            let uri = PaymentUri::parse(address_or_uri)?;
            match &uri.r {
                Some(url) => self.merchant_outputs(url).await?,
                None => {
                    let address = uri
                        .address
                        .ok_or_else(|| WalletError::NotPaymentRequest(address_or_uri.into()))?;
                    let amount = uri
                        .amount
                        .map(|a| a.to_sat())
                        .or(amount)
                        .ok_or_else(|| WalletError::MissingAmount(address_or_uri.into()))?;
                    (vec![self.output_to(&address, amount)?], None)
                }
            }
        } else {
            let address = Address::parse_for(address_or_uri.trim(), self.config.network)?;
            let amount = amount.ok_or_else(|| WalletError::MissingAmount(address_or_uri.into()))?;
            (vec![OutputSpec::to_address(&address, amount)], None)
        };

        self.propose(outputs, memo, payment, signer.as_ref()).await
    }

    fn output_to(&self, address: &Address, amount: u64) -> Result<OutputSpec, WalletError> {
        if address.network != self.config.network {
            return Err(crate::core::AddressError::WrongNetwork {
                expected: self.config.network,
                found: address.network,
            }
            .into());
        }
        Ok(OutputSpec::to_address(address, amount))
    }

    /// Fetch a payment request and turn it into outputs plus payment context
    async fn merchant_outputs(
        &self,
        url: &str,
    ) -> Result<(Vec<OutputSpec>, Option<PaymentContext>), WalletError> {
        let request = self.paypro.fetch_payment_request(url).await?;
        let outputs = request.output_specs();
        let refund = refund_output(&self.keyring, self.copayer_index, request.total)?;
        Ok((outputs, Some(request.into_context(refund))))
    }

    fn next_change_address(&self) -> Result<Address, WalletError> {
        let index = self.next_change_index.fetch_add(1, Ordering::Relaxed);
        Ok(self.keyring.get_address(index, true, self.copayer_index)?)
    }

    /// Paths of the builder's selected inputs
    fn input_paths(&self, builder: &TransactionBuilder) -> Result<Vec<AddressPath>, WalletError> {
        builder
            .selected_unspent()
            .iter()
            .map(|u| {
                self.keyring
                    .path_for_address(&u.address, self.config.address_search_limit)?
                    .ok_or(WalletError::UnknownAddress(u.address))
            })
            .collect()
    }

    /// Keys a copayer's branch holds for the builder's inputs
    fn input_keys(
        &self,
        branch: &ExtendedPrivKey,
        builder: &TransactionBuilder,
    ) -> Result<Vec<SecretKey>, WalletError> {
        self.input_paths(builder)?
            .iter()
            .map(|path| Ok(derive_private_key(branch, path)?))
            .collect()
    }

    /// Id of the copayer owning `branch`
    fn signer_id(&self, branch: &ExtendedPrivKey) -> Result<String, WalletError> {
        let id = Copayer::new(branch.to_xpub()).id;
        if self.keyring.copayer_index(&id).is_none() {
            return Err(KeyRingError::UnknownCopayer(id).into());
        }
        Ok(id)
    }

    async fn propose(
        &self,
        outputs: Vec<OutputSpec>,
        memo: Option<String>,
        payment: Option<PaymentContext>,
        signer: Option<&ExtendedPrivKey>,
    ) -> Result<CreateTxOutcome, WalletError> {
        let unspent = with_timeout(self.timeout(), self.unspent.get_unspent()).await?;
        log::debug!("Building proposal from {} unspent output(s)", unspent.len());

        let options = BuilderOptions {
            fee_policy: self.config.fee_policy(),
            change_address: Some(self.next_change_address()?),
            spend_unconfirmed: self.config.spend_unconfirmed,
            required_signatures: self.keyring.required(),
            total_signers: self.keyring.total(),
        };
        let builder = TransactionBuilder::new(options)
            .set_unspent(unspent)?
            .set_outputs(outputs)?;
        let scripts = self.keyring.redeem_script_map(&self.input_paths(&builder)?)?;
        let builder = builder.set_hash_to_script_map(&scripts)?;

        let mut proposal = TxProposal::new(
            builder,
            &self.copayer_id,
            memo,
            self.keyring.required(),
            self.keyring.total(),
        )?;
        if let Some(payment) = payment.clone() {
            proposal = proposal.with_payment(payment);
        }
        let fee = proposal.builder().fee();
        let id = self.proposals.insert(proposal).await?;
        log::info!("Created proposal {} (fee {} sat)", id, fee);

        let state = match signer {
            Some(branch) => self.sign(&id, branch).await?,
            None => ProposalState::Pending,
        };
        self.share(&id).await;

        Ok(CreateTxOutcome {
            proposal_id: id,
            state,
            payment,
        })
    }

    /// Send a proposal to the other copayers; failures are only logged
    async fn share(&self, id: &str) {
        let Some(peers) = &self.peers else {
            return;
        };
        let Some(proposal) = self.proposals.get(id).await else {
            return;
        };
        if let Err(e) = with_timeout(self.timeout(), peers.send_proposal(&proposal)).await {
            log::warn!("Failed to share proposal {}: {}", id, e);
        }
    }

    // =========================================================================
    // Signing
    // =========================================================================

    /// Add the signatures a copayer's branch key can make
    pub async fn sign(
        &self,
        proposal_id: &str,
        keys: &ExtendedPrivKey,
    ) -> Result<ProposalState, WalletError> {
        let copayer_id = self.signer_id(keys)?;
        let proposal = self
            .proposals
            .get(proposal_id)
            .await
            .ok_or_else(|| ProposalError::NotFound(proposal_id.to_string()))?;
        let secret_keys = self.input_keys(keys, proposal.builder())?;

        let state = self
            .proposals
            .sign(proposal_id, &copayer_id, secret_keys)
            .await?;
        Ok(state)
    }

    /// Reject a proposal as this copayer
    pub async fn reject(&self, proposal_id: &str) -> Result<ProposalState, WalletError> {
        Ok(self.proposals.reject(proposal_id, &self.copayer_id).await?)
    }

    /// Take in a proposal another copayer shared
    pub async fn receive_proposal(&self, remote: TxProposal) -> Result<ProposalState, WalletError> {
        let verified = self.verify_remote(&remote)?;
        Ok(self.proposals.merge(verified).await?)
    }

    /// Rebuild a shared proposal from the local key ring
    ///
    /// The transaction is selected again from the shared unspent and
    /// outputs, signatures are checked against locally derived keys, and
    /// the state and votes are worked out from what verified.
    fn verify_remote(&self, remote: &TxProposal) -> Result<TxProposal, WalletError> {
        let (required, total) = (self.keyring.required(), self.keyring.total());
        if remote.required != required || remote.total != total {
            return Err(WalletError::ForeignProposal(remote.id.clone()));
        }

        let paths = self.input_paths(remote.builder())?;
        let scripts = self.keyring.redeem_script_map(&paths)?;
        let builder = TransactionBuilder::replay(remote.builder(), &scripts)?;
        let mut proposal =
            TxProposal::new(builder, &remote.creator, remote.memo.clone(), required, total)?;
        if proposal.id != remote.id {
            return Err(WalletError::ForeignProposal(remote.id.clone()));
        }

        let signers = proposal.builder().signers();
        let mut signed_by = Vec::new();
        if let Some(path) = paths.first() {
            for (index, copayer) in self.keyring.copayers().into_iter().enumerate() {
                if signers.contains(&self.keyring.pubkey_for(path, index as u32)?) {
                    signed_by.push(copayer.id);
                }
            }
        }
        let rejected_by = remote
            .rejected_by
            .iter()
            .filter(|id| self.keyring.copayer_index(id).is_some() && !signed_by.contains(id))
            .cloned()
            .collect();
        if signed_by.len() != remote.signed_by.len() {
            log::warn!(
                "Proposal {} claims {} signer(s), {} verified",
                remote.id,
                remote.signed_by.len(),
                signed_by.len()
            );
        }
        proposal.set_votes(signed_by, rejected_by);

        proposal.created_at = remote.created_at;
        if let Some(payment) = &remote.payment {
            proposal = proposal.with_payment(payment.clone());
        }
        Ok(proposal)
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Send a fully signed proposal
    ///
    /// Merchant payments go to the merchant first and are broadcast only
    /// after the merchant acknowledged them.
    ///
    /// The proposal is claimed before any I/O, so concurrent calls for the
    /// same proposal deliver it once; the others fail with `Closed`.
    pub async fn send_tx(&self, proposal_id: &str) -> Result<SendOutcome, WalletError> {
        let proposal = self.proposals.begin_send(proposal_id).await?;
        let (txid, ack_memo) = match self.deliver(&proposal).await {
            Ok(sent) => sent,
            Err(e) => {
                self.proposals.abort_send(proposal_id).await;
                return Err(e);
            }
        };

        self.proposals.mark_broadcast(proposal_id, txid).await?;
        Ok(SendOutcome { txid, ack_memo })
    }

    /// Hand a claimed proposal to the merchant and the network
    async fn deliver(
        &self,
        proposal: &TxProposal,
    ) -> Result<(Txid, Option<String>), WalletError> {
        let raw = proposal.signed_tx()?;
        let txid = proposal.builder().build_transaction()?.txid();

        let ack_memo = match &proposal.payment {
            Some(context) => {
                let now = Utc::now().timestamp().max(0) as u64;
                if let Some(expires) = context.expires.filter(|&e| e != 0 && now > e) {
                    return Err(PayProError::ExpiredRequest { expires, now }.into());
                }
                let ack = self
                    .paypro
                    .submit(context, raw.clone(), proposal.memo.clone())
                    .await?;
                ack.memo
            }
            None => None,
        };

        match with_timeout(self.timeout(), self.broadcaster.broadcast(&raw)).await {
            Ok(relayed) if relayed != txid => {
                log::warn!("Broadcaster reported {} for {}", relayed, txid)
            }
            Ok(_) => {}
            Err(e) if proposal.payment.is_some() => {
                log::warn!("Merchant has {} but broadcast failed: {}", txid, e)
            }
            Err(e) => return Err(e.into()),
        }
        Ok((txid, ack_memo))
    }

    /// Pay the payment request at `uri` (a `bitcoin:` URI with `r=` or the
    /// request URL itself), signing with `keys`
    ///
    /// `memo` is the customer's note to the merchant; the merchant's own
    /// memo stays in the payment context.
    pub async fn fetch_and_pay(
        &self,
        uri: &str,
        keys: &ExtendedPrivKey,
        memo: Option<String>,
    ) -> Result<PaymentOutcome, WalletError> {
        let url = if PaymentUri::is_uri(uri) {
            PaymentUri::parse(uri)?
                .r
                .ok_or_else(|| WalletError::NotPaymentRequest(uri.to_string()))?
        } else {
            uri.to_string()
        };

        let (outputs, payment) = self.merchant_outputs(&url).await?;
        let outcome = self.propose(outputs, memo, payment, Some(keys)).await?;

        if outcome.state != ProposalState::FullySigned {
            log::info!(
                "Payment proposal {} needs more signatures",
                outcome.proposal_id
            );
            return Ok(PaymentOutcome::AwaitingSignatures {
                proposal_id: outcome.proposal_id,
            });
        }

        let sent = self.send_tx(&outcome.proposal_id).await?;
        Ok(PaymentOutcome::Paid {
            txid: sent.txid,
            ack_memo: sent.ack_memo,
        })
    }
}
