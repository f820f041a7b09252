//! Multisig transaction builder
//!
//! The builder is a value that moves through
//! `Empty → UnspentSelected → OutputsSet → ScriptsAttached → PartiallySigned
//! → FullySigned`. Every step takes the builder by value and hands back the
//! next one, so a failed step leaves nothing behind to reuse.

use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::{
    multisig_script_sig, Address, FeePolicy, OutPoint, Script, ScriptError, Transaction,
    TransactionError, TxIn, TxOut, Txid, SIGHASH_ALL,
};
use crate::crypto::{sign_digest, verify_digest, KeyError};

// =============================================================================
// Errors
// =============================================================================

/// Transaction builder errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuilderError {
    #[error("No outputs requested")]
    NoOutputs,
    #[error("Requested outputs pay nothing")]
    ZeroAmount,
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("No redeem script for input address {0}")]
    MissingScript(Address),
    #[error("Redeem script does not hash to input address {0}")]
    ScriptMismatch(Address),
    #[error("Redeem scripts not attached")]
    IncompleteScripts,
    #[error("Cannot {operation} in state {state:?}")]
    StateError {
        operation: &'static str,
        state: BuilderState,
    },
    #[error("None of the supplied keys can sign this transaction")]
    NoMatchingKeys,
    #[error("Change is due but no change address was given")]
    MissingChangeAddress,
    #[error("Amount overflow")]
    AmountOverflow,
    #[error("Invalid signature on input {0}")]
    InvalidSignature(usize),
    #[error("Signatures belong to a different transaction")]
    ProposalMismatch,
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// A spendable output reported by the unspent source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub address: Address,
    pub script_pub_key: Script,
    /// Value in satoshis
    pub amount: u64,
    pub confirmations: u32,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }
}

/// A requested payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub script: Script,
    pub amount: u64,
}

impl OutputSpec {
    pub fn new(script: Script, amount: u64) -> Self {
        Self { script, amount }
    }

    pub fn to_address(address: &Address, amount: u64) -> Self {
        Self {
            script: address.script_pubkey(),
            amount,
        }
    }
}

/// Builder progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuilderState {
    Empty,
    UnspentSelected,
    OutputsSet,
    ScriptsAttached,
    PartiallySigned,
    FullySigned,
}

/// Parameters fixed for the life of a builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderOptions {
    pub fee_policy: FeePolicy,
    /// Where change goes; required only when change is due
    pub change_address: Option<Address>,
    pub spend_unconfirmed: bool,
    /// Quorum used for size estimation
    pub required_signatures: u8,
    pub total_signers: u8,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            fee_policy: FeePolicy::default(),
            change_address: None,
            spend_unconfirmed: false,
            required_signatures: 1,
            total_signers: 1,
        }
    }
}

/// Signing progress of one input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct InputSigning {
    redeem_script: Script,
    required: u8,
    /// Keys in redeem script order
    keys: Vec<PublicKey>,
    /// One slot per key; DER signature plus hashtype byte
    signatures: Vec<Option<Vec<u8>>>,
}

impl InputSigning {
    fn signature_count(&self) -> usize {
        self.signatures.iter().flatten().count()
    }

    fn is_satisfied(&self) -> bool {
        self.signature_count() >= self.required as usize
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builds and collects signatures for a P2SH multisig spend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBuilder {
    options: BuilderOptions,
    state: BuilderState,
    candidates: Vec<UnspentOutput>,
    selected: Vec<UnspentOutput>,
    requested: Vec<OutputSpec>,
    fee: u64,
    tx: Option<Transaction>,
    inputs: Vec<InputSigning>,
}

impl TransactionBuilder {
    pub fn new(options: BuilderOptions) -> Self {
        Self {
            options,
            state: BuilderState::Empty,
            candidates: Vec::new(),
            selected: Vec::new(),
            requested: Vec::new(),
            fee: 0,
            tx: None,
            inputs: Vec::new(),
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[BuilderState],
    ) -> Result<(), BuilderError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(BuilderError::StateError {
                operation,
                state: self.state,
            })
        }
    }

    /// Store candidate inputs; unconfirmed ones are dropped unless allowed
    pub fn set_unspent(mut self, unspent: Vec<UnspentOutput>) -> Result<Self, BuilderError> {
        self.expect_state("set unspent", &[BuilderState::Empty])?;

        let spend_unconfirmed = self.options.spend_unconfirmed;
        self.candidates = unspent
            .into_iter()
            .filter(|u| spend_unconfirmed || u.confirmations > 0)
            .collect();
        self.state = BuilderState::UnspentSelected;
        Ok(self)
    }

    /// Set the requested outputs and select inputs to pay for them
    ///
    /// Candidates are taken by descending confirmations, then descending
    /// amount, then outpoint, until they cover the outputs plus the fee for
    /// the inputs taken so far.
    pub fn set_outputs(mut self, outputs: Vec<OutputSpec>) -> Result<Self, BuilderError> {
        self.expect_state("set outputs", &[BuilderState::UnspentSelected])?;
        if outputs.is_empty() {
            return Err(BuilderError::NoOutputs);
        }

        let requested_total = outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
            .ok_or(BuilderError::AmountOverflow)?;
        if requested_total == 0 {
            return Err(BuilderError::ZeroAmount);
        }

        let mut candidates = std::mem::take(&mut self.candidates);
        candidates.sort_by(|a, b| {
            b.confirmations
                .cmp(&a.confirmations)
                .then(b.amount.cmp(&a.amount))
                .then(a.outpoint().cmp(&b.outpoint()))
        });

        let policy = self.options.fee_policy;
        let (m, n) = (
            self.options.required_signatures,
            self.options.total_signers,
        );
        // Size estimates assume a change output
        let output_count = outputs.len() + 1;

        let mut selected = Vec::new();
        let mut have = 0u64;
        let mut fee = policy.estimate_fee(0, output_count, m, n);
        for candidate in &candidates {
            if have >= requested_total.saturating_add(fee) && !selected.is_empty() {
                break;
            }
            have = have
                .checked_add(candidate.amount)
                .ok_or(BuilderError::AmountOverflow)?;
            selected.push(candidate.clone());
            fee = policy.estimate_fee(selected.len(), output_count, m, n);
        }

        let need = requested_total.saturating_add(fee);
        if have < need {
            log::debug!("Input selection failed: have {}, need {}", have, need);
            return Err(BuilderError::InsufficientFunds { have, need });
        }

        let mut tx_outputs: Vec<TxOut> = outputs
            .iter()
            .map(|o| TxOut {
                value: o.amount,
                script_pubkey: o.script.clone(),
            })
            .collect();

        let change = have - need;
        if policy.is_dust(change) {
            fee += change;
        } else {
            let change_address = self
                .options
                .change_address
                .as_ref()
                .ok_or(BuilderError::MissingChangeAddress)?;
            tx_outputs.push(TxOut {
                value: change,
                script_pubkey: change_address.script_pubkey(),
            });
        }

        let tx_inputs = selected.iter().map(|u| TxIn::new(u.outpoint())).collect();
        self.tx = Some(Transaction::new(tx_inputs, tx_outputs));
        self.candidates = candidates;
        self.selected = selected;
        self.requested = outputs;
        self.fee = fee;
        self.state = BuilderState::OutputsSet;
        Ok(self)
    }

    /// Attach the redeem script for every selected input's address
    pub fn set_hash_to_script_map(
        mut self,
        scripts: &HashMap<Address, Script>,
    ) -> Result<Self, BuilderError> {
        self.expect_state("attach scripts", &[BuilderState::OutputsSet])?;

        let mut inputs = Vec::with_capacity(self.selected.len());
        for unspent in &self.selected {
            let script = scripts
                .get(&unspent.address)
                .ok_or(BuilderError::MissingScript(unspent.address))?;
            if script.script_hash() != unspent.address.hash || !unspent.address.is_p2sh() {
                return Err(BuilderError::ScriptMismatch(unspent.address));
            }

            let (required, keys) = script.parse_multisig()?;
            inputs.push(InputSigning {
                redeem_script: script.clone(),
                required,
                signatures: vec![None; keys.len()],
                keys,
            });
        }

        self.inputs = inputs;
        self.state = BuilderState::ScriptsAttached;
        Ok(self)
    }

    fn signing_tx(&self) -> Result<&Transaction, BuilderError> {
        self.tx.as_ref().ok_or(BuilderError::IncompleteScripts)
    }

    fn refresh_state(&mut self) {
        self.state = if self.inputs.iter().all(InputSigning::is_satisfied) {
            BuilderState::FullySigned
        } else {
            BuilderState::PartiallySigned
        };
    }

    /// Sign every input whose redeem script contains one of `keys`
    ///
    /// Signing again with a key that already signed an input changes nothing.
    pub fn sign(mut self, keys: &[SecretKey]) -> Result<Self, BuilderError> {
        self.expect_state(
            "sign",
            &[
                BuilderState::ScriptsAttached,
                BuilderState::PartiallySigned,
                BuilderState::FullySigned,
            ],
        )?;

        let secp = Secp256k1::signing_only();
        let key_pairs: Vec<(PublicKey, &SecretKey)> = keys
            .iter()
            .map(|k| (PublicKey::from_secret_key(&secp, k), k))
            .collect();

        let tx = self.signing_tx()?.clone();
        let mut matched = false;
        for (index, input) in self.inputs.iter_mut().enumerate() {
            let sighash = tx.signature_hash(index, &input.redeem_script)?;
            for (public_key, secret_key) in &key_pairs {
                let Some(slot) = input.keys.iter().position(|k| k == public_key) else {
                    continue;
                };
                matched = true;
                if input.signatures[slot].is_some() {
                    continue;
                }
                let mut signature = sign_digest(secret_key, &sighash)?;
                signature.push(SIGHASH_ALL);
                input.signatures[slot] = Some(signature);
            }
        }

        if !matched {
            return Err(BuilderError::NoMatchingKeys);
        }
        self.refresh_state();
        log::debug!(
            "Signed {} ({:?})",
            tx.ntxid(),
            self.state
        );
        Ok(self)
    }

    /// Import verified signatures from another copy of the same transaction
    pub fn merge_signatures(mut self, other: &TransactionBuilder) -> Result<Self, BuilderError> {
        let signed_states = [
            BuilderState::ScriptsAttached,
            BuilderState::PartiallySigned,
            BuilderState::FullySigned,
        ];
        self.expect_state("merge signatures", &signed_states)?;
        other.expect_state("merge signatures", &signed_states)?;
        if self.ntxid() != other.ntxid() || self.inputs.len() != other.inputs.len() {
            return Err(BuilderError::ProposalMismatch);
        }

        let tx = self.signing_tx()?.clone();
        for (index, (mine, theirs)) in self.inputs.iter_mut().zip(&other.inputs).enumerate() {
            if mine.redeem_script != theirs.redeem_script
                || theirs.signatures.len() != mine.keys.len()
            {
                return Err(BuilderError::ProposalMismatch);
            }
            let sighash = tx.signature_hash(index, &mine.redeem_script)?;
            for (slot, signature) in theirs.signatures.iter().enumerate() {
                let Some(signature) = signature else { continue };
                if mine.signatures[slot].is_some() {
                    continue;
                }
                let Some((&hash_type, der)) = signature.split_last() else {
                    return Err(BuilderError::InvalidSignature(index));
                };
                if hash_type != SIGHASH_ALL
                    || !verify_digest(&mine.keys[slot], &sighash, der).unwrap_or(false)
                {
                    return Err(BuilderError::InvalidSignature(index));
                }
                mine.signatures[slot] = Some(signature.clone());
            }
        }

        self.refresh_state();
        Ok(self)
    }

    /// Repeat another copy's input selection with locally derived scripts
    ///
    /// Only the unspent, outputs and options of `other` are taken; its
    /// signatures come in through [`merge_signatures`](Self::merge_signatures),
    /// which checks each one against the local keys.
    pub fn replay(
        other: &TransactionBuilder,
        scripts: &HashMap<Address, Script>,
    ) -> Result<Self, BuilderError> {
        let rebuilt = Self::new(other.options.clone())
            .set_unspent(other.selected.clone())?
            .set_outputs(other.requested.clone())?
            .set_hash_to_script_map(scripts)?;
        if rebuilt.ntxid() != other.ntxid() {
            return Err(BuilderError::ProposalMismatch);
        }
        rebuilt.merge_signatures(other)
    }

    /// Transaction with the current scriptSigs
    ///
    /// Inputs short of their quorum carry a placeholder scriptSig with
    /// `OP_0` in every unsigned slot.
    pub fn build_transaction(&self) -> Result<Transaction, BuilderError> {
        if self.state < BuilderState::ScriptsAttached {
            return Err(BuilderError::IncompleteScripts);
        }
        let mut tx = self.signing_tx()?.clone();
        for (txin, input) in tx.inputs.iter_mut().zip(&self.inputs) {
            txin.script_sig =
                multisig_script_sig(&input.signatures, input.required, &input.redeem_script);
        }
        Ok(tx)
    }

    /// Serialized transaction with the current scriptSigs
    pub fn build(&self) -> Result<Vec<u8>, BuilderError> {
        Ok(self.build_transaction()?.serialize())
    }

    /// The transaction before any scriptSig is set
    pub fn unsigned_tx(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    /// Hash of the unsigned transaction; stable while signatures arrive
    pub fn ntxid(&self) -> Option<Txid> {
        self.tx.as_ref().map(Transaction::ntxid)
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn is_fully_signed(&self) -> bool {
        self.state == BuilderState::FullySigned
    }

    /// Signatures collected for one input
    pub fn signature_count(&self, input: usize) -> usize {
        self.inputs
            .get(input)
            .map(InputSigning::signature_count)
            .unwrap_or(0)
    }

    /// Public keys that have signed every input they appear in
    pub fn signers(&self) -> Vec<PublicKey> {
        let Some(first) = self.inputs.first() else {
            return Vec::new();
        };
        first
            .keys
            .iter()
            .filter(|key| {
                self.inputs.iter().all(|input| {
                    input
                        .keys
                        .iter()
                        .position(|k| k == *key)
                        .map_or(true, |slot| input.signatures[slot].is_some())
                })
            })
            .copied()
            .collect()
    }

    pub fn selected_unspent(&self) -> &[UnspentOutput] {
        &self.selected
    }

    pub fn requested_outputs(&self) -> &[OutputSpec] {
        &self.requested
    }

    /// Sum of the requested outputs (change excluded)
    pub fn requested_total(&self) -> u64 {
        self.requested.iter().map(|o| o.amount).sum()
    }

    pub fn fee(&self) -> u64 {
        self.fee
    }

    pub fn options(&self) -> &BuilderOptions {
        &self.options
    }
}

// =============================================================================
// Tests
// =============================================================================
