//! Fee arithmetic for P2WPKH transactions.

use serde::{Deserialize, Serialize};

/// Outputs below this value are uneconomical to spend.
pub const DUST_LIMIT: u64 = 546;

/// Fee rate in satoshi per virtual byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_vb: u64,
}

impl FeeRate {
    pub fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            sat_per_vb,
        }
    }

    pub fn sat_per_vb(&self) -> u64 {
        self.sat_per_vb
    }

    /// Fee for a transaction of the given virtual size.
    pub fn fee_for(&self, vsize: usize) -> u64 {
        self.sat_per_vb * vsize as u64
    }
}

/// Virtual size of a P2WPKH transaction with the given input and output
/// counts.
///
/// Weight units: 42 for the shared frame (version, locktime, counts,
/// segwit marker and flag), 272 per input (41 base bytes plus a 107-byte
/// witness), 124 per output (31 base bytes). vsize is weight / 4 rounded
/// up.
pub fn estimate_vsize(inputs: usize, outputs: usize) -> usize {
    let weight = 42 + 272 * inputs + 124 * outputs;
    (weight + 3) / 4
}
