//! Payment protocol messages
//!
//! Field numbers and defaults follow BIP70. Optional fields are kept as
//! `Option` so a decoded message re-encodes to exactly the bytes the merchant
//! signed.

use quick_protobuf::sizeofs::{sizeof_len, sizeof_varint};
use quick_protobuf::{BytesReader, MessageRead, MessageWrite, Writer, WriterBackend};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Amount, Network, Script};

pub const PAYMENT_REQUEST_CONTENT_TYPE: &str = "application/bitcoin-paymentrequest";
pub const PAYMENT_CONTENT_TYPE: &str = "application/bitcoin-payment";
pub const PAYMENT_ACK_CONTENT_TYPE: &str = "application/bitcoin-paymentack";

/// Default `payment_details_version`
pub const PAYMENT_DETAILS_VERSION: u32 = 1;

/// Largest message accepted from a merchant
pub const MAX_MESSAGE_SIZE: usize = 50_000;

/// Encoding and decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Message of {0} bytes exceeds the size limit")]
    MessageTooLarge(usize),
}

impl From<quick_protobuf::Error> for CodecError {
    fn from(e: quick_protobuf::Error) -> Self {
        CodecError::MalformedMessage(e.to_string())
    }
}

fn missing(message: &str, field: &str) -> quick_protobuf::Error {
    quick_protobuf::Error::Message(format!("{} is missing required field {}", message, field))
}

/// A protocol message with a protobuf encoding
pub trait ProtoMessage: MessageWrite + for<'a> MessageRead<'a> {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.get_size());
        let mut writer = Writer::new(&mut buf);
        self.write_message(&mut writer).expect("Encoding to succeed");
        buf
    }

    /// Decode a complete message of at most [`MAX_MESSAGE_SIZE`] bytes
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(bytes.len()));
        }
        let mut reader = BytesReader::from_bytes(bytes);
        Ok(Self::from_reader(&mut reader, bytes)?)
    }
}

fn opt_len(value: Option<usize>) -> usize {
    value.map(|len| 1 + sizeof_len(len)).unwrap_or(0)
}

// =============================================================================
// Output
// =============================================================================

/// Amount and script of one payment output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub amount: Amount,
    pub script: Script,
}

impl Output {
    pub fn new(amount: u64, script: Script) -> Self {
        Self {
            amount: Amount(amount),
            script,
        }
    }
}

impl<'a> MessageRead<'a> for Output {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut amount = 0;
        let mut script = None;
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => amount = r.read_uint64(bytes)?,
                Ok(18) => script = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            amount: Amount(amount),
            script: Script::from_bytes(script.ok_or_else(|| missing("Output", "script"))?),
        })
    }
}

impl MessageWrite for Output {
    fn get_size(&self) -> usize {
        1 + sizeof_varint(self.amount.to_sat()) + 1 + sizeof_len(self.script.len())
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        w.write_with_tag(8, |w| w.write_uint64(self.amount.to_sat()))?;
        w.write_with_tag(18, |w| w.write_bytes(self.script.as_bytes()))?;
        Ok(())
    }
}

impl ProtoMessage for Output {}

// =============================================================================
// PaymentDetails
// =============================================================================

/// The merchant's payment terms
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub network: Option<String>,
    pub outputs: Vec<Output>,
    /// Creation time, seconds since the epoch
    pub time: u64,
    pub expires: Option<u64>,
    pub memo: Option<String>,
    pub payment_url: Option<String>,
    pub merchant_data: Option<Vec<u8>>,
}

impl PaymentDetails {
    /// Network name, `main` when absent
    pub fn network_name(&self) -> &str {
        self.network.as_deref().unwrap_or("main")
    }

    pub fn network(&self) -> Option<Network> {
        Network::from_paypro_name(self.network_name())
    }

    /// Sum of all requested outputs
    pub fn total(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount.to_sat()))
    }

    /// Whether the request has expired at `now` (seconds); 0 means no expiry
    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires, Some(expires) if expires != 0 && now > expires)
    }
}

impl<'a> MessageRead<'a> for PaymentDetails {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        let mut time = None;
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.network = Some(r.read_string(bytes)?.to_owned()),
                Ok(18) => msg.outputs.push(r.read_message::<Output>(bytes)?),
                Ok(24) => time = Some(r.read_uint64(bytes)?),
                Ok(32) => msg.expires = Some(r.read_uint64(bytes)?),
                Ok(42) => msg.memo = Some(r.read_string(bytes)?.to_owned()),
                Ok(50) => msg.payment_url = Some(r.read_string(bytes)?.to_owned()),
                Ok(58) => msg.merchant_data = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        msg.time = time.ok_or_else(|| missing("PaymentDetails", "time"))?;
        Ok(msg)
    }
}

impl MessageWrite for PaymentDetails {
    fn get_size(&self) -> usize {
        opt_len(self.network.as_ref().map(String::len))
            + self
                .outputs
                .iter()
                .map(|o| 1 + sizeof_len(o.get_size()))
                .sum::<usize>()
            + 1
            + sizeof_varint(self.time)
            + self.expires.map(|e| 1 + sizeof_varint(e)).unwrap_or(0)
            + opt_len(self.memo.as_ref().map(String::len))
            + opt_len(self.payment_url.as_ref().map(String::len))
            + opt_len(self.merchant_data.as_ref().map(Vec::len))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        if let Some(network) = &self.network {
            w.write_with_tag(10, |w| w.write_string(network))?;
        }
        for output in &self.outputs {
            w.write_with_tag(18, |w| w.write_message(output))?;
        }
        w.write_with_tag(24, |w| w.write_uint64(self.time))?;
        if let Some(expires) = self.expires {
            w.write_with_tag(32, |w| w.write_uint64(expires))?;
        }
        if let Some(memo) = &self.memo {
            w.write_with_tag(42, |w| w.write_string(memo))?;
        }
        if let Some(url) = &self.payment_url {
            w.write_with_tag(50, |w| w.write_string(url))?;
        }
        if let Some(data) = &self.merchant_data {
            w.write_with_tag(58, |w| w.write_bytes(data))?;
        }
        Ok(())
    }
}

impl ProtoMessage for PaymentDetails {}

// =============================================================================
// PaymentRequest
// =============================================================================

/// Signed envelope around serialized PaymentDetails
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub payment_details_version: Option<u32>,
    pub pki_type: Option<String>,
    pub pki_data: Option<Vec<u8>>,
    pub serialized_payment_details: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl PaymentRequest {
    pub fn version(&self) -> u32 {
        self.payment_details_version
            .unwrap_or(PAYMENT_DETAILS_VERSION)
    }

    /// `pki_type` string, `none` when absent
    pub fn pki_type_name(&self) -> &str {
        self.pki_type.as_deref().unwrap_or("none")
    }

    /// Bytes covered by the merchant's signature: the request re-encoded
    /// with an empty signature field
    pub fn signing_bytes(&self) -> Vec<u8> {
        let unsigned = Self {
            signature: Some(Vec::new()),
            ..self.clone()
        };
        unsigned.encode()
    }

    pub fn payment_details(&self) -> Result<PaymentDetails, CodecError> {
        PaymentDetails::decode(&self.serialized_payment_details)
    }
}

impl<'a> MessageRead<'a> for PaymentRequest {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        let mut details = None;
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(8) => msg.payment_details_version = Some(r.read_uint32(bytes)?),
                Ok(18) => msg.pki_type = Some(r.read_string(bytes)?.to_owned()),
                Ok(26) => msg.pki_data = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(34) => details = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(42) => msg.signature = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        msg.serialized_payment_details =
            details.ok_or_else(|| missing("PaymentRequest", "serialized_payment_details"))?;
        Ok(msg)
    }
}

impl MessageWrite for PaymentRequest {
    fn get_size(&self) -> usize {
        self.payment_details_version
            .map(|v| 1 + sizeof_varint(v as u64))
            .unwrap_or(0)
            + opt_len(self.pki_type.as_ref().map(String::len))
            + opt_len(self.pki_data.as_ref().map(Vec::len))
            + 1
            + sizeof_len(self.serialized_payment_details.len())
            + opt_len(self.signature.as_ref().map(Vec::len))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        if let Some(version) = self.payment_details_version {
            w.write_with_tag(8, |w| w.write_uint32(version))?;
        }
        if let Some(pki_type) = &self.pki_type {
            w.write_with_tag(18, |w| w.write_string(pki_type))?;
        }
        if let Some(pki_data) = &self.pki_data {
            w.write_with_tag(26, |w| w.write_bytes(pki_data))?;
        }
        w.write_with_tag(34, |w| w.write_bytes(&self.serialized_payment_details))?;
        if let Some(signature) = &self.signature {
            w.write_with_tag(42, |w| w.write_bytes(signature))?;
        }
        Ok(())
    }
}

impl ProtoMessage for PaymentRequest {}

// =============================================================================
// X509Certificates
// =============================================================================

/// DER certificates, leaf first
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct X509Certificates {
    pub certificates: Vec<Vec<u8>>,
}

impl<'a> MessageRead<'a> for X509Certificates {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.certificates.push(r.read_bytes(bytes)?.to_vec()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for X509Certificates {
    fn get_size(&self) -> usize {
        self.certificates
            .iter()
            .map(|c| 1 + sizeof_len(c.len()))
            .sum()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        for certificate in &self.certificates {
            w.write_with_tag(10, |w| w.write_bytes(certificate))?;
        }
        Ok(())
    }
}

impl ProtoMessage for X509Certificates {}

// =============================================================================
// Payment
// =============================================================================

/// The customer's payment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payment {
    pub merchant_data: Option<Vec<u8>>,
    /// Signed transactions
    pub transactions: Vec<Vec<u8>>,
    pub refund_to: Vec<Output>,
    pub memo: Option<String>,
}

impl<'a> MessageRead<'a> for Payment {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.merchant_data = Some(r.read_bytes(bytes)?.to_vec()),
                Ok(18) => msg.transactions.push(r.read_bytes(bytes)?.to_vec()),
                Ok(26) => msg.refund_to.push(r.read_message::<Output>(bytes)?),
                Ok(34) => msg.memo = Some(r.read_string(bytes)?.to_owned()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Payment {
    fn get_size(&self) -> usize {
        opt_len(self.merchant_data.as_ref().map(Vec::len))
            + self
                .transactions
                .iter()
                .map(|tx| 1 + sizeof_len(tx.len()))
                .sum::<usize>()
            + self
                .refund_to
                .iter()
                .map(|o| 1 + sizeof_len(o.get_size()))
                .sum::<usize>()
            + opt_len(self.memo.as_ref().map(String::len))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        if let Some(data) = &self.merchant_data {
            w.write_with_tag(10, |w| w.write_bytes(data))?;
        }
        for tx in &self.transactions {
            w.write_with_tag(18, |w| w.write_bytes(tx))?;
        }
        for output in &self.refund_to {
            w.write_with_tag(26, |w| w.write_message(output))?;
        }
        if let Some(memo) = &self.memo {
            w.write_with_tag(34, |w| w.write_string(memo))?;
        }
        Ok(())
    }
}

impl ProtoMessage for Payment {}

// =============================================================================
// PaymentACK
// =============================================================================

/// The merchant's acknowledgement of a payment
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentAck {
    pub payment: Payment,
    pub memo: Option<String>,
}

impl<'a> MessageRead<'a> for PaymentAck {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> quick_protobuf::Result<Self> {
        let mut payment = None;
        let mut memo = None;
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => payment = Some(r.read_message::<Payment>(bytes)?),
                Ok(18) => memo = Some(r.read_string(bytes)?.to_owned()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Self {
            payment: payment.ok_or_else(|| missing("PaymentACK", "payment"))?,
            memo,
        })
    }
}

impl MessageWrite for PaymentAck {
    fn get_size(&self) -> usize {
        1 + sizeof_len(self.payment.get_size()) + opt_len(self.memo.as_ref().map(String::len))
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> quick_protobuf::Result<()> {
        w.write_with_tag(10, |w| w.write_message(&self.payment))?;
        if let Some(memo) = &self.memo {
            w.write_with_tag(18, |w| w.write_string(memo))?;
        }
        Ok(())
    }
}

impl ProtoMessage for PaymentAck {}
