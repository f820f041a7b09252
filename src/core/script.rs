//! Script construction for multisig wallets
//!
//! Builds the M-of-N redeem scripts shared by copayers, the P2SH and P2PKH
//! output scripts, and the scriptSigs that spend P2SH multisig outputs.

use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::address::Address;
use crate::core::network::Network;
use crate::crypto::hash160;

// =============================================================================
// Script Constants
// =============================================================================

pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1: u8 = 0x51;
    pub const OP_16: u8 = 0x60;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
}

use opcodes::*;

/// Sign all inputs and all outputs
pub const SIGHASH_ALL: u8 = 0x01;

/// Largest key count a standard CHECKMULTISIG redeem script may carry
pub const MAX_MULTISIG_KEYS: usize = 15;

// =============================================================================
// Script Errors
// =============================================================================

/// Script-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("Invalid key count: expected {expected}, got {got}")]
    InvalidKeyCount { expected: usize, got: usize },
    #[error("Invalid threshold: {required} of {total}")]
    InvalidThreshold { required: u8, total: usize },
    #[error("Invalid public key in script")]
    InvalidPublicKey,
    #[error("Script is not a multisig redeem script")]
    NotMultisig,
    #[error("Script truncated inside a push")]
    Truncated,
}

// =============================================================================
// Script
// =============================================================================

/// Raw script bytes
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Append a single opcode
    pub fn push_opcode(mut self, opcode: u8) -> Self {
        self.0.push(opcode);
        self
    }

    /// Append a data push using the smallest push encoding
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < OP_PUSHDATA1 as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// `OP_HASH160 <hash> OP_EQUAL`
    pub fn p2sh(script_hash: &[u8; 20]) -> Self {
        Self::new()
            .push_opcode(OP_HASH160)
            .push_slice(script_hash)
            .push_opcode(OP_EQUAL)
    }

    /// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`
    pub fn p2pkh(pubkey_hash: &[u8; 20]) -> Self {
        Self::new()
            .push_opcode(OP_DUP)
            .push_opcode(OP_HASH160)
            .push_slice(pubkey_hash)
            .push_opcode(OP_EQUALVERIFY)
            .push_opcode(OP_CHECKSIG)
    }

    /// P2PKH output script paying to a public key
    pub fn p2pkh_for_key(public_key: &PublicKey) -> Self {
        Self::p2pkh(&hash160(&public_key.serialize()))
    }

    /// M-of-N `OP_CHECKMULTISIG` script over the keys in canonical order
    ///
    /// Keys are sorted by their compressed encoding so every copayer builds
    /// byte-identical scripts regardless of the order they learned the keys.
    pub fn multisig(required: u8, public_keys: &[PublicKey]) -> Result<Self, ScriptError> {
        let total = public_keys.len();
        if total == 0 || total > MAX_MULTISIG_KEYS {
            return Err(ScriptError::InvalidKeyCount {
                expected: total.clamp(1, MAX_MULTISIG_KEYS),
                got: total,
            });
        }
        if required == 0 || required as usize > total {
            return Err(ScriptError::InvalidThreshold { required, total });
        }

        let mut sorted: Vec<[u8; 33]> = public_keys.iter().map(|k| k.serialize()).collect();
        sorted.sort();

        let mut script = Self::new().push_opcode(small_int_opcode(required as usize));
        for key in &sorted {
            script = script.push_slice(key);
        }
        Ok(script
            .push_opcode(small_int_opcode(total))
            .push_opcode(OP_CHECKMULTISIG))
    }

    /// HASH160 of the script bytes
    pub fn script_hash(&self) -> [u8; 20] {
        hash160(&self.0)
    }

    pub fn is_p2sh(&self) -> bool {
        self.0.len() == 23 && self.0[0] == OP_HASH160 && self.0[1] == 20 && self.0[22] == OP_EQUAL
    }

    pub fn is_p2pkh(&self) -> bool {
        self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 20
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
    }

    /// The 20-byte hash committed to by a P2SH or P2PKH script
    pub fn committed_hash(&self) -> Option<[u8; 20]> {
        let range = if self.is_p2sh() {
            2..22
        } else if self.is_p2pkh() {
            3..23
        } else {
            return None;
        };
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.0[range]);
        Some(hash)
    }

    /// Iterate over the opcodes and pushes of this script
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions { data: &self.0 }
    }

    /// Decode a multisig redeem script into its threshold and keys
    pub fn parse_multisig(&self) -> Result<(u8, Vec<PublicKey>), ScriptError> {
        let instructions = self
            .instructions()
            .collect::<Result<Vec<_>, ScriptError>>()?;
        if instructions.len() < 4 {
            return Err(ScriptError::NotMultisig);
        }

        let required = match instructions[0] {
            Instruction::Op(op) => small_int_value(op).ok_or(ScriptError::NotMultisig)?,
            Instruction::Push(_) => return Err(ScriptError::NotMultisig),
        };
        let n = instructions.len();
        if instructions[n - 1] != Instruction::Op(OP_CHECKMULTISIG) {
            return Err(ScriptError::NotMultisig);
        }
        let total = match instructions[n - 2] {
            Instruction::Op(op) => small_int_value(op).ok_or(ScriptError::NotMultisig)?,
            Instruction::Push(_) => return Err(ScriptError::NotMultisig),
        };

        let keys = instructions[1..n - 2]
            .iter()
            .map(|ins| match ins {
                Instruction::Push(data) => {
                    PublicKey::from_slice(data).map_err(|_| ScriptError::InvalidPublicKey)
                }
                Instruction::Op(_) => Err(ScriptError::NotMultisig),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if keys.len() != total as usize {
            return Err(ScriptError::InvalidKeyCount {
                expected: total as usize,
                got: keys.len(),
            });
        }
        if required > total {
            return Err(ScriptError::InvalidThreshold {
                required,
                total: keys.len(),
            });
        }
        Ok((required, keys))
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", self.to_hex())
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

fn small_int_opcode(n: usize) -> u8 {
    debug_assert!((1..=16).contains(&n));
    OP_1 + (n as u8 - 1)
}

fn small_int_value(opcode: u8) -> Option<u8> {
    (OP_1..=OP_16)
        .contains(&opcode)
        .then(|| opcode - OP_1 + 1)
}

// =============================================================================
// Instructions
// =============================================================================

/// A decoded script element; `OP_0` decodes as an empty push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Op(u8),
    Push(&'a [u8]),
}

/// Iterator over script instructions
pub struct Instructions<'a> {
    data: &'a [u8],
}

impl<'a> Instructions<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ScriptError> {
        if self.data.len() < len {
            self.data = &[];
            return Err(ScriptError::Truncated);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn take_len(&mut self, width: usize) -> Result<usize, ScriptError> {
        let bytes = self.take(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ScriptError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&opcode, rest) = self.data.split_first()?;
        self.data = rest;

        let len = match opcode {
            OP_0 => return Some(Ok(Instruction::Push(&[]))),
            0x01..=0x4b => Ok(opcode as usize),
            OP_PUSHDATA1 => self.take_len(1),
            OP_PUSHDATA2 => self.take_len(2),
            OP_PUSHDATA4 => self.take_len(4),
            _ => return Some(Ok(Instruction::Op(opcode))),
        };

        Some(len.and_then(|len| self.take(len)).map(Instruction::Push))
    }
}

// =============================================================================
// Script builders
// =============================================================================

/// M-of-N redeem script from the sorted keys
pub fn build_redeem_script(public_keys: &[PublicKey], required: u8) -> Result<Script, ScriptError> {
    Script::multisig(required, public_keys)
}

/// P2SH address for a redeem script
pub fn script_to_address(script: &Script, network: Network) -> Address {
    Address::p2sh(script, network)
}

/// scriptSig spending a P2SH multisig output
///
/// `signatures` holds one slot per key of the redeem script, in script order.
/// Once `required` slots are filled the first `required` signatures are
/// emitted; before that every slot is kept, with `OP_0` for missing ones, so
/// partially signed transactions can be exchanged between copayers.
pub fn multisig_script_sig(
    signatures: &[Option<Vec<u8>>],
    required: u8,
    redeem_script: &Script,
) -> Script {
    let present = signatures.iter().flatten().count();
    let mut script = Script::new().push_opcode(OP_0);

    if present >= required as usize {
        for signature in signatures.iter().flatten().take(required as usize) {
            script = script.push_slice(signature);
        }
    } else {
        for slot in signatures {
            script = match slot {
                Some(signature) => script.push_slice(signature),
                None => script.push_opcode(OP_0),
            };
        }
    }

    script.push_slice(redeem_script.as_bytes())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n).map(|_| KeyPair::generate().public_key).collect()
    }

    #[test]
    fn test_multisig_is_order_independent() {
        let mut pubkeys = keys(3);
        let script1 = build_redeem_script(&pubkeys, 2).unwrap();
        pubkeys.reverse();
        let script2 = build_redeem_script(&pubkeys, 2).unwrap();

        assert_eq!(script1, script2);
        assert_eq!(script1.len(), 3 + 3 * 34);
        assert_eq!(script1.as_bytes()[0], OP_1 + 1);
        assert_eq!(*script1.as_bytes().last().unwrap(), OP_CHECKMULTISIG);
    }

    #[test]
    fn test_multisig_validation() {
        assert!(matches!(
            build_redeem_script(&keys(3), 0),
            Err(ScriptError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            build_redeem_script(&keys(2), 3),
            Err(ScriptError::InvalidThreshold { .. })
        ));
        assert!(matches!(
            build_redeem_script(&[], 1),
            Err(ScriptError::InvalidKeyCount { .. })
        ));
        assert!(matches!(
            build_redeem_script(&keys(16), 2),
            Err(ScriptError::InvalidKeyCount { got: 16, .. })
        ));
    }

    #[test]
    fn test_parse_multisig_roundtrip() {
        let pubkeys = keys(3);
        let script = build_redeem_script(&pubkeys, 2).unwrap();
        let (required, parsed) = script.parse_multisig().unwrap();

        assert_eq!(required, 2);
        assert_eq!(parsed.len(), 3);
        for key in &pubkeys {
            assert!(parsed.contains(key));
        }
        assert_eq!(Script::multisig(required, &parsed).unwrap(), script);
    }

    #[test]
    fn test_standard_output_scripts() {
        let hash = [0x11u8; 20];
        let p2sh = Script::p2sh(&hash);
        let p2pkh = Script::p2pkh(&hash);

        assert!(p2sh.is_p2sh() && !p2sh.is_p2pkh());
        assert!(p2pkh.is_p2pkh() && !p2pkh.is_p2sh());
        assert_eq!(p2sh.committed_hash(), Some(hash));
        assert_eq!(p2pkh.committed_hash(), Some(hash));
        assert!(Script::new().push_opcode(OP_CHECKSIG).committed_hash().is_none());
    }

    #[test]
    fn test_large_push_uses_pushdata2() {
        let redeem = build_redeem_script(&keys(15), 8).unwrap();
        let sig = multisig_script_sig(&[None, None], 2, &redeem);
        let instructions: Vec<_> = sig.instructions().collect::<Result<_, _>>().unwrap();

        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[3], Instruction::Push(redeem.as_bytes()));
    }

    #[test]
    fn test_script_sig_partial_and_final() {
        let redeem = build_redeem_script(&keys(3), 2).unwrap();
        let sig_a = vec![0x30, 0x01, 0x01];
        let sig_b = vec![0x30, 0x02, 0x01];

        let partial = multisig_script_sig(&[None, Some(sig_a.clone()), None], 2, &redeem);
        let ins: Vec<_> = partial.instructions().collect::<Result<_, _>>().unwrap();
        assert_eq!(ins.len(), 5);
        assert_eq!(ins[2], Instruction::Push(&sig_a));

        let full = multisig_script_sig(&[Some(sig_b.clone()), Some(sig_a.clone()), None], 2, &redeem);
        let ins: Vec<_> = full.instructions().collect::<Result<_, _>>().unwrap();
        assert_eq!(
            ins,
            vec![
                Instruction::Push(&[]),
                Instruction::Push(&sig_b),
                Instruction::Push(&sig_a),
                Instruction::Push(redeem.as_bytes()),
            ]
        );
    }

    #[test]
    fn test_truncated_push() {
        let script = Script::from_bytes(vec![0x05, 0x01, 0x02]);
        assert_eq!(
            script.instructions().next(),
            Some(Err(ScriptError::Truncated))
        );
    }
}
