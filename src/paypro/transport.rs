//! Merchant HTTP transport

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;
use thiserror::Error;

use super::message::{
    MAX_MESSAGE_SIZE, PAYMENT_ACK_CONTENT_TYPE, PAYMENT_CONTENT_TYPE, PAYMENT_REQUEST_CONTENT_TYPE,
};

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Merchant returned HTTP {0}")]
    HttpStatus(u16),
    #[error("Request to merchant timed out")]
    Timeout,
    #[error("Unexpected content type: expected {expected}, got {found}")]
    UnexpectedContentType { expected: String, found: String },
    #[error("Response of {0} bytes exceeds the size limit")]
    TooLarge(usize),
}

/// Talks to a merchant's payment protocol endpoints
#[async_trait]
pub trait MerchantTransport: Send + Sync {
    /// GET a serialized PaymentRequest
    async fn fetch_request(&self, url: &str) -> Result<Vec<u8>, TransportError>;

    /// POST a serialized Payment, returning the serialized PaymentACK
    async fn submit_payment(&self, url: &str, payment: Vec<u8>)
        -> Result<Vec<u8>, TransportError>;
}

/// Value for the Accept header of every merchant call
pub fn accept_header() -> String {
    format!("{}, {}", PAYMENT_REQUEST_CONTENT_TYPE, PAYMENT_ACK_CONTENT_TYPE)
}

/// Compare a Content-Type header to `expected`, ignoring parameters and case
pub fn check_content_type(header: Option<&str>, expected: &str) -> Result<(), TransportError> {
    let found = header.unwrap_or("");
    let media_type = found.split(';').next().unwrap_or("").trim();
    if media_type.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransportError::UnexpectedContentType {
            expected: expected.to_string(),
            found: found.to_string(),
        })
    }
}

/// reqwest-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

fn transport_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self { client, timeout })
    }

    async fn read_body(
        &self,
        request: reqwest::RequestBuilder,
        expected: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let exchange = async {
            let mut response = request
                .header(ACCEPT, accept_header())
                .send()
                .await
                .map_err(transport_error)?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::HttpStatus(status.as_u16()));
            }
            if let Some(len) = response.content_length() {
                if len as usize > MAX_MESSAGE_SIZE {
                    return Err(TransportError::TooLarge(len as usize));
                }
            }
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            check_content_type(content_type.as_deref(), expected)?;

            // Content-Length may be absent, so the limit is enforced while reading
            let mut body = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
                let len = body.len() + chunk.len();
                if len > MAX_MESSAGE_SIZE {
                    return Err(TransportError::TooLarge(len));
                }
                body.extend_from_slice(&chunk);
            }
            Ok(body)
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

#[async_trait]
impl MerchantTransport for HttpTransport {
    async fn fetch_request(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        log::debug!("GET {}", url);
        self.read_body(self.client.get(url), PAYMENT_REQUEST_CONTENT_TYPE)
            .await
    }

    async fn submit_payment(
        &self,
        url: &str,
        payment: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        log::debug!("POST {} ({} bytes)", url, payment.len());
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, PAYMENT_CONTENT_TYPE)
            .body(payment);
        self.read_body(request, PAYMENT_ACK_CONTENT_TYPE).await
    }
}
