//! History provider abstraction.
//!
//! The wallet talks to a full-index provider (an Electrum-style server)
//! through this trait. Implementations resolve each transaction into the
//! enriched form the sync core consumes: every input and output carries
//! the counterparty address and value as reported by the provider.

pub mod electrum;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderResult;

pub use electrum::ElectrumProvider;

/// One resolved transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
    /// Address of the spent output, when the provider could resolve it.
    pub address: Option<String>,
    /// Value of the spent output in satoshi; zero when unresolvable.
    pub value: u64,
}

/// One transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub index: u32,
    /// Address encoded by the output script, when standard.
    pub address: Option<String>,
    pub value: u64,
}

/// A transaction as delivered to the sync core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetail {
    pub txid: Txid,
    pub hex: String,
    pub vsize: usize,
    /// Block height; zero while unmined.
    pub height: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// Per-script-hash balance as reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBalance {
    pub confirmed: u64,
    pub unconfirmed: i64,
}

impl ScriptBalance {
    pub fn is_zero(&self) -> bool {
        self.confirmed == 0 && self.unconfirmed == 0
    }
}

/// Push notifications from the provider.
#[derive(Debug, Clone)]
pub enum ProviderNotification {
    /// A new chain tip.
    NewBlock {
        height: u32,
    },
    /// A subscribed script-hash's status changed.
    ScriptHashChanged {
        script_hash: String,
        status: Option<String>,
    },
    /// The transport reconnected; subscriptions must be re-established.
    Reconnected,
}

/// The provider contract.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Subscribe to chain tips; returns the current height.
    async fn subscribe_headers(&self) -> ProviderResult<u32>;

    /// Subscribe to a script-hash; returns its current status hash.
    async fn subscribe_script_hash(&self, script_hash: &str) -> ProviderResult<Option<String>>;

    /// Full resolved history for a script-hash. With `use_cache` the
    /// provider may serve a previously fetched history.
    async fn get_history(&self, script_hash: &str, use_cache: bool)
        -> ProviderResult<Vec<TxDetail>>;

    /// Unconfirmed transactions touching a script-hash. Never cached.
    async fn get_mempool(&self, script_hash: &str) -> ProviderResult<Vec<TxDetail>>;

    /// Balance of a script-hash as the provider sees it.
    async fn get_balance(&self, script_hash: &str) -> ProviderResult<ScriptBalance>;

    /// One resolved transaction. With `use_cache` false the provider must
    /// refetch, picking up confirmation changes.
    async fn get_transaction(&self, txid: &Txid, use_cache: bool) -> ProviderResult<TxDetail>;

    /// Broadcast a raw transaction; returns the txid the node accepted.
    async fn broadcast(&self, hex: &str) -> ProviderResult<Txid>;

    /// Keepalive.
    async fn ping(&self) -> ProviderResult<()>;

    /// Drop any cached histories and transactions.
    async fn clear_cache(&self) -> ProviderResult<()>;

    /// Take the notification stream. Yields `None` after the first call.
    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderNotification>>;
}
