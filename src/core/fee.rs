//! Fee policy
//!
//! Fees are charged per started kilobyte of the estimated signed size, and
//! change below the dust threshold is given to the miner instead of creating
//! an output nobody can afford to spend.

use serde::{Deserialize, Serialize};

use crate::core::transaction::compact_size_len;

// =============================================================================
// Constants
// =============================================================================

/// Default fee rate in satoshis per 1000 bytes
pub const DEFAULT_FEE_PER_KB: u64 = 10_000;

/// Default smallest change output worth creating, in satoshis
pub const DEFAULT_DUST_THRESHOLD: u64 = 5_430;

/// Upper bound of a DER signature plus its hashtype byte
const MAX_SIGNATURE_LEN: usize = 73;

/// Version, locktime and the two count prefixes
const TX_OVERHEAD: usize = 4 + 4 + 1 + 1;

/// Value, script length prefix and a P2PKH script (the larger standard kind)
const OUTPUT_SIZE: usize = 8 + 1 + 25;

// =============================================================================
// Fee Policy
// =============================================================================

/// How fees and change are computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Satoshis charged per started 1000 bytes
    pub fee_per_kb: u64,
    /// Change at or below this value is not emitted
    pub dust_threshold: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_threshold: DEFAULT_DUST_THRESHOLD,
        }
    }
}

impl FeePolicy {
    pub fn new(fee_per_kb: u64, dust_threshold: u64) -> Self {
        Self {
            fee_per_kb,
            dust_threshold,
        }
    }

    /// Fee for a transaction of `size_bytes`, rounded up to whole kilobytes
    pub fn fee_for_size(&self, size_bytes: usize) -> u64 {
        let kilobytes = (size_bytes as u64).div_ceil(1000).max(1);
        self.fee_per_kb.saturating_mul(kilobytes)
    }

    /// Fee for a fully signed M-of-N transaction with the given shape
    pub fn estimate_fee(&self, inputs: usize, outputs: usize, required: u8, total: u8) -> u64 {
        self.fee_for_size(estimate_size(inputs, outputs, required, total))
    }

    /// Whether a change amount is worth an output
    pub fn is_dust(&self, amount: u64) -> bool {
        amount <= self.dust_threshold
    }
}

/// Upper-bound serialized size of a P2SH multisig input once fully signed
pub fn multisig_input_size(required: u8, total: u8) -> usize {
    let redeem_len = 3 + 34 * total as usize;
    let redeem_push = if redeem_len < 0x4c {
        1
    } else if redeem_len <= 0xff {
        2
    } else {
        3
    };
    let script_sig = 1 + (1 + MAX_SIGNATURE_LEN) * required as usize + redeem_push + redeem_len;
    36 + compact_size_len(script_sig as u64) + script_sig + 4
}

/// Upper-bound size of a fully signed transaction
pub fn estimate_size(inputs: usize, outputs: usize, required: u8, total: u8) -> usize {
    TX_OVERHEAD + inputs * multisig_input_size(required, total) + outputs * OUTPUT_SIZE
}
