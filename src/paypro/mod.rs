//! BIP70 payment protocol
//!
//! - `message`: protobuf encoding of the protocol messages (quick-protobuf)
//! - `pki`: X.509 authentication of payment requests
//! - `transport`: merchant HTTP calls
//! - `client`: the fetch, verify, submit and acknowledge steps
//! - `uri`: `bitcoin:` URIs that point at payment requests

pub mod client;
pub mod message;
pub mod pki;
pub mod transport;
pub mod uri;

pub use client::{
    refund_output, validate_ack, MerchantRequest, PayProError, PaymentContext,
    PaymentProtocolClient,
};
pub use message::{
    CodecError, Output, Payment, PaymentAck, PaymentDetails, PaymentRequest, ProtoMessage,
    X509Certificates, MAX_MESSAGE_SIZE, PAYMENT_ACK_CONTENT_TYPE, PAYMENT_CONTENT_TYPE,
    PAYMENT_DETAILS_VERSION, PAYMENT_REQUEST_CONTENT_TYPE,
};
pub use pki::{verify_request, PkiError, PkiType, TrustStore, VerifiedMerchant};
pub use transport::{HttpTransport, MerchantTransport, TransportError};
pub use uri::{PaymentUri, UriError};
