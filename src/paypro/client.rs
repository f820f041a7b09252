//! Payment protocol client
//!
//! Drives one payment attempt: fetch the request, authenticate it, check the
//! terms, then (once the wallet has a signed transaction) submit the Payment
//! and check the merchant's acknowledgement.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::message::{
    CodecError, Output, Payment, PaymentAck, PaymentDetails, PaymentRequest, ProtoMessage,
    MAX_MESSAGE_SIZE,
};
use super::pki::{verify_request, PkiError, TrustStore, VerifiedMerchant};
use super::transport::{MerchantTransport, TransportError};
use crate::core::{Network, Script, Transaction, TransactionError};
use crate::multisig::{AddressPath, KeyRing, KeyRingError, OutputSpec};

/// Payment protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayProError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Verification failed: {0}")]
    Pki(#[from] PkiError),
    #[error("Payment request expired at {expires} (now {now})")]
    ExpiredRequest { expires: u64, now: u64 },
    #[error("Payment request is for network {found}, wallet is on {expected}")]
    NetworkMismatch { expected: Network, found: String },
    #[error("Payment request has no outputs")]
    NoOutputs,
    #[error("Payment request total overflows")]
    AmountOverflow,
    #[error("PaymentACK carries no transaction")]
    NoTransactionInAck,
    #[error("PaymentACK pays {found}, expected {expected}")]
    AckMismatch { expected: u64, found: u64 },
    #[error("Malformed transaction: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Cannot derive refund key: {0}")]
    Refund(#[from] KeyRingError),
    #[error("Verification worker failed: {0}")]
    Worker(String),
}

/// A fetched and authenticated payment request
#[derive(Debug, Clone)]
pub struct MerchantRequest {
    pub url: String,
    pub request: PaymentRequest,
    pub details: PaymentDetails,
    pub merchant: VerifiedMerchant,
    pub total: u64,
}

impl MerchantRequest {
    /// Merchant outputs as builder outputs, in request order
    pub fn output_specs(&self) -> Vec<OutputSpec> {
        self.details
            .outputs
            .iter()
            .map(|o| OutputSpec::new(o.script.clone(), o.amount.to_sat()))
            .collect()
    }

    /// Everything needed to finish the payment once the spend is signed
    pub fn into_context(self, refund: Output) -> PaymentContext {
        let payment_url = self
            .details
            .payment_url
            .clone()
            .unwrap_or_else(|| self.url.clone());
        PaymentContext {
            request_url: self.url,
            payment_url,
            merchant_data: self.details.merchant_data,
            merchant_memo: self.details.memo,
            outputs: self.details.outputs,
            total: self.total,
            refund,
            merchant_name: self.merchant.common_name,
            pki_type: self.merchant.pki_type.name().to_string(),
            expires: self.details.expires,
        }
    }
}

/// Merchant payment attached to a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentContext {
    pub request_url: String,
    /// Where the Payment is POSTed
    pub payment_url: String,
    pub merchant_data: Option<Vec<u8>>,
    pub merchant_memo: Option<String>,
    pub outputs: Vec<Output>,
    pub total: u64,
    pub refund: Output,
    pub merchant_name: Option<String>,
    pub pki_type: String,
    pub expires: Option<u64>,
}

impl PaymentContext {
    /// The Payment message carrying `signed_tx`
    pub fn payment(&self, signed_tx: Vec<u8>, memo: Option<String>) -> Payment {
        Payment {
            merchant_data: self.merchant_data.clone(),
            transactions: vec![signed_tx],
            refund_to: vec![self.refund.clone()],
            memo,
        }
    }
}

/// P2PKH refund output to a copayer's own receive key at index 0
pub fn refund_output(
    keyring: &KeyRing,
    copayer_index: u32,
    amount: u64,
) -> Result<Output, PayProError> {
    let path = AddressPath::for_cosigner(copayer_index, 0, false);
    let key = keyring.pubkey_for(&path, copayer_index)?;
    Ok(Output::new(amount, Script::p2pkh_for_key(&key)))
}

/// Check a PaymentACK against the payment that was sent
///
/// The first transaction's leading outputs, one per merchant output, must
/// add up to the requested total.
pub fn validate_ack(bytes: &[u8], context: &PaymentContext) -> Result<PaymentAck, PayProError> {
    let ack = PaymentAck::decode(bytes)?;
    let raw_tx = ack
        .payment
        .transactions
        .first()
        .ok_or(PayProError::NoTransactionInAck)?;
    let tx = Transaction::parse(raw_tx)?;

    let mismatch = |found| PayProError::AckMismatch {
        expected: context.total,
        found,
    };
    if tx.outputs.len() < context.outputs.len() {
        let found = tx.total_output().ok_or(PayProError::AmountOverflow)?;
        return Err(mismatch(found));
    }
    let paid = tx.outputs[..context.outputs.len()]
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value))
        .ok_or(PayProError::AmountOverflow)?;
    if paid != context.total {
        return Err(mismatch(paid));
    }
    Ok(ack)
}

/// Speaks the payment protocol with one merchant at a time
#[derive(Clone)]
pub struct PaymentProtocolClient {
    transport: Arc<dyn MerchantTransport>,
    trust: Arc<TrustStore>,
    network: Network,
    allow_unsigned: bool,
}

impl PaymentProtocolClient {
    pub fn new(
        transport: Arc<dyn MerchantTransport>,
        trust: Arc<TrustStore>,
        network: Network,
        allow_unsigned: bool,
    ) -> Self {
        Self {
            transport,
            trust,
            network,
            allow_unsigned,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Download and decode a PaymentRequest
    pub async fn fetch(&self, url: &str) -> Result<PaymentRequest, PayProError> {
        let bytes = self.transport.fetch_request(url).await?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len()).into());
        }
        Ok(PaymentRequest::decode(&bytes)?)
    }

    /// Authenticate a request on a blocking worker
    pub async fn verify(&self, request: &PaymentRequest) -> Result<VerifiedMerchant, PayProError> {
        let request = request.clone();
        let trust = Arc::clone(&self.trust);
        let allow_unsigned = self.allow_unsigned;
        let now = Utc::now().timestamp();

        let merchant = tokio::task::spawn_blocking(move || {
            verify_request(&request, &trust, now, allow_unsigned)
        })
        .await
        .map_err(|e| PayProError::Worker(e.to_string()))??;
        Ok(merchant)
    }

    /// Decode the payment terms and check them at time `now`
    pub fn decode_details(
        &self,
        request: &PaymentRequest,
        now: u64,
    ) -> Result<PaymentDetails, PayProError> {
        let details = request.payment_details()?;

        if let Some(expires) = details.expires {
            if details.is_expired(now) {
                return Err(PayProError::ExpiredRequest { expires, now });
            }
        }
        if details.network() != Some(self.network) {
            return Err(PayProError::NetworkMismatch {
                expected: self.network,
                found: details.network_name().to_string(),
            });
        }
        if details.outputs.is_empty() {
            return Err(PayProError::NoOutputs);
        }
        Ok(details)
    }

    /// Fetch, authenticate and check a payment request
    pub async fn fetch_payment_request(&self, url: &str) -> Result<MerchantRequest, PayProError> {
        log::info!("Fetching payment request from {}", url);
        let request = self.fetch(url).await?;
        let merchant = self.verify(&request).await?;
        let now = Utc::now().timestamp().max(0) as u64;
        let details = self.decode_details(&request, now)?;
        let total = details.total().ok_or(PayProError::AmountOverflow)?;

        log::info!(
            "Payment request from {} for {} sat in {} output(s)",
            merchant.common_name.as_deref().unwrap_or("unverified merchant"),
            total,
            details.outputs.len()
        );
        Ok(MerchantRequest {
            url: url.to_string(),
            request,
            details,
            merchant,
            total,
        })
    }

    /// POST the Payment for `signed_tx` and check the acknowledgement
    pub async fn submit(
        &self,
        context: &PaymentContext,
        signed_tx: Vec<u8>,
        memo: Option<String>,
    ) -> Result<PaymentAck, PayProError> {
        let payment = context.payment(signed_tx, memo);
        log::info!("Sending payment to {}", context.payment_url);
        let reply = self
            .transport
            .submit_payment(&context.payment_url, payment.encode())
            .await?;
        if reply.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(reply.len()).into());
        }

        let ack = validate_ack(&reply, context)?;
        log::info!(
            "Merchant acknowledged payment: {}",
            ack.memo.as_deref().unwrap_or("")
        );
        Ok(ack)
    }
}
