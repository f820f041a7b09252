//! `bitcoin:` payment URIs
//!
//! `bitcoin:<address>?amount=<BTC>&label=<text>&message=<text>&r=<url>`.
//! The address may be omitted when an `r` payment request URL is present.

use reqwest::Url;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::{Address, AddressError, Amount, AmountError};

const SCHEME: &str = "bitcoin";

/// URI parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("Invalid payment URI: {0}")]
    InvalidUri(String),
    #[error("Unsupported URI scheme: {0}")]
    InvalidScheme(String),
    #[error("Payment URI has neither an address nor a payment request URL")]
    MissingAddress,
    #[error("Duplicate URI parameter: {0}")]
    DuplicateParameter(String),
    #[error("Unsupported required parameter: {0}")]
    UnsupportedRequirement(String),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Amount(#[from] AmountError),
}

/// A parsed payment URI
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentUri {
    pub address: Option<Address>,
    pub amount: Option<Amount>,
    pub label: Option<String>,
    pub message: Option<String>,
    /// Payment request URL
    pub r: Option<String>,
}

impl PaymentUri {
    /// Whether `s` looks like a payment URI rather than a bare address
    pub fn is_uri(s: &str) -> bool {
        s.get(..SCHEME.len() + 1)
            .map(|prefix| prefix.eq_ignore_ascii_case("bitcoin:"))
            .unwrap_or(false)
    }

    pub fn parse(s: &str) -> Result<Self, UriError> {
        let url = Url::parse(s.trim()).map_err(|e| UriError::InvalidUri(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(UriError::InvalidScheme(url.scheme().to_string()));
        }

        let mut uri = PaymentUri::default();
        let path = url.path();
        if !path.is_empty() {
            uri.address = Some(path.parse()?);
        }

        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "amount" => {
                    if uri.amount.is_some() {
                        return Err(UriError::DuplicateParameter(key.to_string()));
                    }
                    uri.amount = Some(Amount::from_btc_str(&value)?);
                    continue;
                }
                "label" => &mut uri.label,
                "message" => &mut uri.message,
                "r" => &mut uri.r,
                other if other.starts_with("req-") => {
                    return Err(UriError::UnsupportedRequirement(other.to_string()))
                }
                _ => continue,
            };
            if slot.is_some() {
                return Err(UriError::DuplicateParameter(key.to_string()));
            }
            *slot = Some(value.into_owned());
        }

        if let Some(r) = &uri.r {
            Url::parse(r).map_err(|e| UriError::InvalidUri(format!("r={}: {}", r, e)))?;
        } else if uri.address.is_none() {
            return Err(UriError::MissingAddress);
        }
        Ok(uri)
    }

    /// Whether the URI points at a payment request
    pub fn is_payment_protocol(&self) -> bool {
        self.r.is_some()
    }
}

impl FromStr for PaymentUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PaymentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut url = match Url::parse(&format!(
            "{}:{}",
            SCHEME,
            self.address.map(|a| a.to_string()).unwrap_or_default()
        )) {
            Ok(url) => url,
            Err(_) => return Err(fmt::Error),
        };
        {
            let mut query = url.query_pairs_mut();
            if let Some(amount) = self.amount {
                query.append_pair("amount", &amount.to_string());
            }
            if let Some(label) = &self.label {
                query.append_pair("label", label);
            }
            if let Some(message) = &self.message {
                query.append_pair("message", message);
            }
            if let Some(r) = &self.r {
                query.append_pair("r", r);
            }
        }
        let rendered = url.as_str().trim_end_matches('?');
        f.write_str(rendered)
    }
}
