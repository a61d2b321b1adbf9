//! Common type definitions for the wallet.

use bitcoin::{OutPoint, Txid};
use btc_keys::{Chain, ChainSyncState, HdPath};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an observed output or spend.
///
/// Ordering follows promotion: `Mempool < Pending < Confirmed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TxState {
    /// Unmined.
    Mempool,
    /// Mined with depth below the confirmation threshold.
    Pending,
    /// Mined with sufficient depth.
    Confirmed,
}

impl TxState {
    pub const ALL: [TxState; 3] = [TxState::Mempool, TxState::Pending, TxState::Confirmed];

    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Mempool => "mempool",
            TxState::Pending => "pending",
            TxState::Confirmed => "confirmed",
        }
    }
}

/// Classification of a transaction relative to the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Incoming,
    Outgoing,
    Internal,
    Unknown,
}

/// Signed per-state balance triple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub mempool: i64,
    pub pending: i64,
    pub confirmed: i64,
}

impl Balance {
    pub fn get(&self, state: TxState) -> i64 {
        match state {
            TxState::Mempool => self.mempool,
            TxState::Pending => self.pending,
            TxState::Confirmed => self.confirmed,
        }
    }

    pub fn apply(&mut self, state: TxState, delta: i64) {
        match state {
            TxState::Mempool => self.mempool += delta,
            TxState::Pending => self.pending += delta,
            TxState::Confirmed => self.confirmed += delta,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.mempool == 0 && self.pending == 0 && self.confirmed == 0
    }

    /// Spendable total: everything except unmined debits double-counted.
    pub fn total(&self) -> i64 {
        self.mempool + self.pending + self.confirmed
    }
}

/// Amount credited to one transaction output, with ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub amount: u64,
    pub own_address: bool,
}

/// One wallet-relevant transaction as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    pub txid: Txid,
    pub from_addresses: Vec<String>,
    pub to_addresses: Vec<String>,
    pub to_address_meta: Vec<OutputMeta>,
    /// Miner fee in satoshi, zero when input values were unresolvable.
    pub fee: u64,
    /// Wallet-relative amount per the direction classification.
    pub amount: u64,
    /// Block height; zero while in the mempool.
    pub height: u32,
    pub direction: Direction,
}

/// A spendable output owned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    /// Value in satoshi.
    pub value: u64,
    pub address: String,
    /// Compressed public key, hex.
    pub public_key: String,
    pub path: HdPath,
    /// Output script hex, consumed by the BIP143 sighash.
    pub script_hex: String,
    pub state: TxState,
    pub locked: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.vout,
        }
    }

    pub fn key(&self) -> String {
        outpoint_key(&self.outpoint())
    }
}

/// Canonical `txid:vout` key used across the ledgers and the UTXO set.
pub fn outpoint_key(outpoint: &OutPoint) -> String {
    format!("{}:{}", outpoint.txid, outpoint.vout)
}

/// Record of a transaction built and broadcast by this wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    pub txid: Txid,
    pub hex: String,
    pub vsize: usize,
    /// Satoshi per virtual byte used for this send.
    pub fee_rate: u64,
    pub fee: u64,
    /// Outpoints consumed by this send.
    pub utxos: Vec<String>,
    /// Output values in order, for comparison with the node's echo.
    pub vout_values: Vec<u64>,
    pub change_address: Option<String>,
    /// Amount leaving the wallet: destination amount plus fee.
    pub total_spent: u64,
    /// Whether the broadcast echo agreed with the builder's txid.
    pub is_valid: bool,
    pub to_addresses: Vec<String>,
    pub from_addresses: Vec<String>,
    /// Amount delivered to the destination.
    pub amount: u64,
}

/// Events emitted by the wallet.
#[derive(Debug, Clone)]
pub enum WalletEvent {
    /// Stores opened and watched script-hashes re-subscribed.
    Ready,
    NewBlock {
        height: u32,
    },
    /// One path visited during an account scan.
    SyncedPath {
        chain: Chain,
        path: HdPath,
        has_tx: bool,
        state: ChainSyncState,
    },
    /// A transaction first observed in the mempool.
    NewTx(TxEntry),
    /// An account scan finished or was paused.
    SyncEnd,
    /// A watched transaction was seen in the provider's mempool.
    TxMempool(Txid),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_state_ordering_follows_promotion() {
        assert!(TxState::Mempool < TxState::Pending);
        assert!(TxState::Pending < TxState::Confirmed);
    }

    #[test]
    fn test_balance_apply() {
        let mut b = Balance::default();
        b.apply(TxState::Mempool, 100);
        b.apply(TxState::Mempool, -40);
        b.apply(TxState::Confirmed, 7);
        assert_eq!(b.mempool, 60);
        assert_eq!(b.confirmed, 7);
        assert_eq!(b.get(TxState::Pending), 0);
        assert!(!b.is_zero());
    }

    #[test]
    fn test_outpoint_key() {
        let txid = Txid::from_str(
            "0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        let op = OutPoint {
            txid,
            vout: 3,
        };
        assert_eq!(
            outpoint_key(&op),
            "0000000000000000000000000000000000000000000000000000000000000001:3"
        );
    }
}
