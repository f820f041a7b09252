//! Transaction handling
//!
//! Legacy (pre-segwit) Bitcoin transactions: serialization, parsing, txid and
//! SIGHASH_ALL signature hashes.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::core::script::{Script, SIGHASH_ALL};
use crate::crypto::double_sha256;

// =============================================================================
// Constants
// =============================================================================

/// Transaction version produced by the builder
pub const TX_VERSION: u32 = 1;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction truncated")]
    Truncated,
    #[error("{0} trailing bytes after transaction")]
    TrailingBytes(usize),
    #[error("Input index {index} out of range ({count} inputs)")]
    InputIndexOutOfRange { index: usize, count: usize },
    #[error("Malformed transaction: {0}")]
    Malformed(String),
    #[error("Invalid txid: {0}")]
    InvalidTxid(String),
}

// =============================================================================
// Txid
// =============================================================================

/// Transaction hash, stored in internal byte order and displayed reversed
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn from_internal(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Txid({})", self)
    }
}

impl FromStr for Txid {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransactionError::InvalidTxid(s.to_string()))?;
        let mut hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransactionError::InvalidTxid(s.to_string()))?;
        hash.reverse();
        Ok(Self(hash))
    }
}

impl Serialize for Txid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Txid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub vout: u32,
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Script::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in satoshis
    pub value: u64,
    pub script_pubkey: Script,
}

// =============================================================================
// Transaction
// =============================================================================

/// A legacy Bitcoin transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Wire serialization
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.estimated_len());
        buf.put_u32_le(self.version);
        put_compact_size(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.put_slice(input.previous_output.txid.as_bytes());
            buf.put_u32_le(input.previous_output.vout);
            put_var_bytes(&mut buf, input.script_sig.as_bytes());
            buf.put_u32_le(input.sequence);
        }
        put_compact_size(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.put_u64_le(output.value);
            put_var_bytes(&mut buf, output.script_pubkey.as_bytes());
        }
        buf.put_u32_le(self.lock_time);
        buf
    }

    /// Parse a serialized transaction; the whole buffer must be consumed
    pub fn parse(mut data: &[u8]) -> Result<Self, TransactionError> {
        let buf = &mut data;
        let version = get_u32(buf)?;

        let input_count = get_compact_size(buf)?;
        // Each input needs at least 41 bytes
        if input_count > (buf.remaining() / 41) as u64 {
            return Err(TransactionError::Truncated);
        }
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            if buf.remaining() < 36 {
                return Err(TransactionError::Truncated);
            }
            let mut txid = [0u8; 32];
            buf.copy_to_slice(&mut txid);
            let vout = buf.get_u32_le();
            let script_sig = Script::from_bytes(get_var_bytes(buf)?);
            let sequence = get_u32(buf)?;
            inputs.push(TxIn {
                previous_output: OutPoint {
                    txid: Txid(txid),
                    vout,
                },
                script_sig,
                sequence,
            });
        }

        let output_count = get_compact_size(buf)?;
        if output_count > (buf.remaining() / 9) as u64 {
            return Err(TransactionError::Truncated);
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            if buf.remaining() < 8 {
                return Err(TransactionError::Truncated);
            }
            let value = buf.get_u64_le();
            let script_pubkey = Script::from_bytes(get_var_bytes(buf)?);
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }

        let lock_time = get_u32(buf)?;
        if buf.has_remaining() {
            return Err(TransactionError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn txid(&self) -> Txid {
        Txid(double_sha256(&self.serialize()))
    }

    /// Copy of this transaction with every scriptSig emptied
    pub fn without_script_sigs(&self) -> Self {
        let mut tx = self.clone();
        for input in &mut tx.inputs {
            input.script_sig = Script::new();
        }
        tx
    }

    /// Hash of the transaction with empty scriptSigs; stable while signatures
    /// are being collected
    pub fn ntxid(&self) -> Txid {
        self.without_script_sigs().txid()
    }

    /// Legacy SIGHASH_ALL digest for `input_index`, committing to `script_code`
    pub fn signature_hash(
        &self,
        input_index: usize,
        script_code: &Script,
    ) -> Result<[u8; 32], TransactionError> {
        if input_index >= self.inputs.len() {
            return Err(TransactionError::InputIndexOutOfRange {
                index: input_index,
                count: self.inputs.len(),
            });
        }

        let mut tx = self.without_script_sigs();
        tx.inputs[input_index].script_sig = script_code.clone();

        let mut preimage = tx.serialize();
        preimage.put_u32_le(SIGHASH_ALL as u32);
        Ok(double_sha256(&preimage))
    }

    /// Sum of all output values, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    fn estimated_len(&self) -> usize {
        let inputs: usize = self.inputs.iter().map(|i| 41 + 5 + i.script_sig.len()).sum();
        let outputs: usize = self
            .outputs
            .iter()
            .map(|o| 9 + 5 + o.script_pubkey.len())
            .sum();
        8 + 18 + inputs + outputs
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

/// Append a Bitcoin CompactSize integer
pub fn put_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x10000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

/// Size in bytes of a CompactSize encoding of `n`
pub fn compact_size_len(n: u64) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

fn put_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    put_compact_size(buf, data.len() as u64);
    buf.put_slice(data);
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, TransactionError> {
    if buf.remaining() < 4 {
        return Err(TransactionError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn get_compact_size(buf: &mut &[u8]) -> Result<u64, TransactionError> {
    if !buf.has_remaining() {
        return Err(TransactionError::Truncated);
    }
    let (width, n) = match buf.get_u8() {
        0xfd => (2, None),
        0xfe => (4, None),
        0xff => (8, None),
        small => (0, Some(small as u64)),
    };
    if let Some(n) = n {
        return Ok(n);
    }
    if buf.remaining() < width {
        return Err(TransactionError::Truncated);
    }
    Ok(buf.get_uint_le(width))
}

fn get_var_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, TransactionError> {
    let len = get_compact_size(buf)?;
    if len > buf.remaining() as u64 {
        return Err(TransactionError::Truncated);
    }
    let mut data = vec![0u8; len as usize];
    buf.copy_to_slice(&mut data);
    Ok(data)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        let outpoint = OutPoint {
            txid: Txid([7u8; 32]),
            vout: 1,
        };
        Transaction::new(
            vec![TxIn::new(outpoint)],
            vec![
                TxOut {
                    value: 11_000_000,
                    script_pubkey: Script::p2sh(&[1u8; 20]),
                },
                TxOut {
                    value: 500,
                    script_pubkey: Script::p2pkh(&[2u8; 20]),
                },
            ],
        )
    }

    #[test]
    fn test_serialize_layout() {
        let tx = sample_tx();
        let raw = tx.serialize();

        assert_eq!(&raw[0..4], &[1, 0, 0, 0]);
        assert_eq!(raw[4], 1);
        assert_eq!(&raw[5..37], &[7u8; 32]);
        assert_eq!(&raw[37..41], &[1, 0, 0, 0]);
        assert_eq!(raw[41], 0);
        assert_eq!(&raw[42..46], &[0xff; 4]);
        assert_eq!(raw[46], 2);
        assert_eq!(&raw[47..55], &11_000_000u64.to_le_bytes());
        assert_eq!(&raw[raw.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_parse_roundtrip() {
        let tx = sample_tx();
        let parsed = Transaction::parse(&tx.serialize()).unwrap();
        assert_eq!(parsed, tx);
        assert_eq!(parsed.total_output(), Some(11_000_500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let raw = sample_tx().serialize();
        assert_eq!(
            Transaction::parse(&raw[..raw.len() - 1]),
            Err(TransactionError::Truncated)
        );

        let mut extra = raw.clone();
        extra.push(0);
        assert_eq!(
            Transaction::parse(&extra),
            Err(TransactionError::TrailingBytes(1))
        );

        // Claims a huge input count
        assert_eq!(
            Transaction::parse(&[1, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff, 0xff]),
            Err(TransactionError::Truncated)
        );
    }

    #[test]
    fn test_txid_display_is_reversed() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let txid = Txid(bytes);
        let s = txid.to_string();
        assert!(s.ends_with("ab"));
        assert_eq!(s.parse::<Txid>().unwrap(), txid);
        assert!("zz".parse::<Txid>().is_err());
    }

    #[test]
    fn test_ntxid_ignores_script_sigs() {
        let tx = sample_tx();
        let mut signed = tx.clone();
        signed.inputs[0].script_sig = Script::from_bytes(vec![0x00, 0x01, 0xff]);

        assert_ne!(tx.txid(), signed.txid());
        assert_eq!(tx.ntxid(), signed.ntxid());
    }

    #[test]
    fn test_signature_hash_commits_to_script_code() {
        let tx = sample_tx();
        let a = tx.signature_hash(0, &Script::from_bytes(vec![0x51])).unwrap();
        let b = tx.signature_hash(0, &Script::from_bytes(vec![0x52])).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            tx.signature_hash(3, &Script::new()),
            Err(TransactionError::InputIndexOutOfRange { index: 3, count: 1 })
        ));
    }

    #[test]
    fn test_compact_size() {
        for n in [0u64, 0xfc, 0xfd, 0xffff, 0x10000, 0x1_0000_0000] {
            let mut buf = Vec::new();
            put_compact_size(&mut buf, n);
            assert_eq!(buf.len(), compact_size_len(n));
            let mut slice = buf.as_slice();
            assert_eq!(get_compact_size(&mut slice).unwrap(), n);
        }
    }
}
