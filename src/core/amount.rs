//! Satoshi amounts
//!
//! Amounts are `u64` satoshis everywhere. Decimal BTC strings and the
//! high/low 32-bit halves some payment protocol peers exchange are converted
//! only at the edges, never through floating point.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Satoshis in one bitcoin
pub const SATOSHIS_PER_BTC: u64 = 100_000_000;

const DECIMALS: usize = 8;

/// Amount parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid amount: {0}")]
    InvalidFormat(String),
    #[error("Amount has more than 8 decimal places: {0}")]
    TooPrecise(String),
    #[error("Amount too large: {0}")]
    Overflow(String),
}

/// A value in satoshis
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_sat(sat: u64) -> Self {
        Self(sat)
    }

    pub fn to_sat(self) -> u64 {
        self.0
    }

    /// Parse a decimal BTC string such as `0.11`
    pub fn from_btc_str(s: &str) -> Result<Self, AmountError> {
        let invalid = || AmountError::InvalidFormat(s.to_string());
        let (whole, fraction) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        if fraction.len() > DECIMALS {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| AmountError::Overflow(s.to_string()))?
        };
        let fraction: u64 = format!("{:0<width$}", fraction, width = DECIMALS)
            .parse()
            .map_err(|_| invalid())?;

        whole
            .checked_mul(SATOSHIS_PER_BTC)
            .and_then(|sat| sat.checked_add(fraction))
            .map(Amount)
            .ok_or_else(|| AmountError::Overflow(s.to_string()))
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    /// Decimal BTC with all eight places
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:08}",
            self.0 / SATOSHIS_PER_BTC,
            self.0 % SATOSHIS_PER_BTC
        )
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_btc_str(s)
    }
}

impl From<u64> for Amount {
    fn from(sat: u64) -> Self {
        Self(sat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_btc() {
        assert_eq!(Amount::from_btc_str("0.11").unwrap(), Amount(11_000_000));
        assert_eq!(Amount::from_btc_str("1").unwrap(), Amount(SATOSHIS_PER_BTC));
        assert_eq!(Amount::from_btc_str(".5").unwrap(), Amount(50_000_000));
        assert_eq!(Amount::from_btc_str("0.00000001").unwrap(), Amount(1));
        assert_eq!(
            Amount::from_btc_str("20999999.9769").unwrap(),
            Amount(2_099_999_997_690_000)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Amount::from_btc_str("0.000000001"),
            Err(AmountError::TooPrecise(_))
        ));
        assert!(matches!(
            Amount::from_btc_str("1e3"),
            Err(AmountError::InvalidFormat(_))
        ));
        assert!(matches!(
            Amount::from_btc_str("-1"),
            Err(AmountError::InvalidFormat(_))
        ));
        assert!(matches!(
            Amount::from_btc_str("."),
            Err(AmountError::InvalidFormat(_))
        ));
        assert!(matches!(
            Amount::from_btc_str("999999999999999"),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn test_display() {
        assert_eq!(Amount(11_000_000).to_string(), "0.11000000");
        assert_eq!(Amount(123_456_789_012).to_string(), "1234.56789012");
    }
}
