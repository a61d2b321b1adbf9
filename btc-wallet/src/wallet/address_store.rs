//! Per-address ledgers and the wallet transaction log.
//!
//! Each address record carries three ledgers keyed by outpoint and
//! bucketed by lifecycle state: `received` (outputs credited to the
//! address), `spent` (inputs consuming its outputs) and `fees`. The store
//! also keeps the transaction log with a height index for the new-block
//! rescan, and a cache of builder-side metadata for sent transactions.

use std::collections::{BTreeMap, HashMap};

use bitcoin::Txid;
use btc_keys::HdPath;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::StoreHandle;
use crate::types::{Balance, SendRecord, TxEntry, TxState};

/// Ledger entries bucketed by lifecycle state, `outpoint key → satoshi`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBuckets {
    pub mempool: BTreeMap<String, u64>,
    pub pending: BTreeMap<String, u64>,
    pub confirmed: BTreeMap<String, u64>,
}

impl StateBuckets {
    pub fn bucket(&self, state: TxState) -> &BTreeMap<String, u64> {
        match state {
            TxState::Mempool => &self.mempool,
            TxState::Pending => &self.pending,
            TxState::Confirmed => &self.confirmed,
        }
    }

    fn bucket_mut(&mut self, state: TxState) -> &mut BTreeMap<String, u64> {
        match state {
            TxState::Mempool => &mut self.mempool,
            TxState::Pending => &mut self.pending,
            TxState::Confirmed => &mut self.confirmed,
        }
    }

    /// The single bucket an outpoint currently sits in, if any.
    pub fn state_of(&self, key: &str) -> Option<(TxState, u64)> {
        for state in TxState::ALL {
            if let Some(amount) = self.bucket(state).get(key) {
                return Some((state, *amount));
            }
        }
        None
    }

    pub fn insert(&mut self, state: TxState, key: String, amount: u64) {
        self.bucket_mut(state).insert(key, amount);
    }

    pub fn remove(&mut self, state: TxState, key: &str) -> Option<u64> {
        self.bucket_mut(state).remove(key)
    }

    pub fn total(&self, state: TxState) -> u64 {
        self.bucket(state).values().sum()
    }
}

/// Persistent ledger for one wallet address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub path: HdPath,
    /// Compressed public key, hex.
    pub public_key: String,
    /// The provider's index key for this address.
    pub script_hash: String,
    /// Outputs credited to this address.
    pub received: StateBuckets,
    /// Inputs spending this address's outputs.
    pub spent: StateBuckets,
    /// Fees attributed to spends from this address.
    pub fees: StateBuckets,
    /// Set the first time any history is observed for the address.
    pub has_tx: bool,
}

impl AddressRecord {
    pub fn new(address: String, path: HdPath, public_key: String, script_hash: String) -> Self {
        Self {
            address,
            path,
            public_key,
            script_hash,
            received: StateBuckets::default(),
            spent: StateBuckets::default(),
            fees: StateBuckets::default(),
            has_tx: false,
        }
    }

    /// Net contribution of this address to one balance state.
    pub fn net(&self, state: TxState) -> i64 {
        self.received.total(state) as i64 - self.spent.total(state) as i64
    }

    pub fn balance(&self) -> Balance {
        Balance {
            mempool: self.net(TxState::Mempool),
            pending: self.net(TxState::Pending),
            confirmed: self.net(TxState::Confirmed),
        }
    }
}

/// Result of folding a transaction entry into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLogChange {
    /// First observation of this txid.
    New,
    /// Known txid whose recorded height changed (e.g. it was mined).
    HeightChanged {
        previous: u32,
    },
    Unchanged,
}

/// Address records plus the wallet's transaction log.
pub struct AddressStore {
    store: StoreHandle,
    records: HashMap<String, AddressRecord>,
    tx_log: HashMap<Txid, TxEntry>,
    /// Secondary index for the new-block rescan.
    height_index: BTreeMap<u32, Vec<Txid>>,
    sent: HashMap<Txid, SendRecord>,
}

impl AddressStore {
    pub async fn open(store: StoreHandle) -> Result<Self> {
        let mut records = HashMap::new();
        for (key, bytes) in store.entries("addr/").await? {
            match serde_json::from_slice::<AddressRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.address.clone(), record);
                }
                Err(e) => tracing::warn!("Skipping undecodable address record {}: {}", key, e),
            }
        }

        let mut tx_log = HashMap::new();
        let mut height_index: BTreeMap<u32, Vec<Txid>> = BTreeMap::new();
        for (key, bytes) in store.entries("tx/").await? {
            match serde_json::from_slice::<TxEntry>(&bytes) {
                Ok(entry) => {
                    height_index.entry(entry.height).or_default().push(entry.txid);
                    tx_log.insert(entry.txid, entry);
                }
                Err(e) => tracing::warn!("Skipping undecodable tx entry {}: {}", key, e),
            }
        }

        let mut sent = HashMap::new();
        for (key, bytes) in store.entries("sent/").await? {
            match serde_json::from_slice::<SendRecord>(&bytes) {
                Ok(record) => {
                    sent.insert(record.txid, record);
                }
                Err(e) => tracing::warn!("Skipping undecodable sent record {}: {}", key, e),
            }
        }

        Ok(Self {
            store,
            records,
            tx_log,
            height_index,
            sent,
        })
    }

    pub fn contains(&self, address: &str) -> bool {
        self.records.contains_key(address)
    }

    pub fn record(&self, address: &str) -> Option<&AddressRecord> {
        self.records.get(address)
    }

    pub fn record_mut(&mut self, address: &str) -> Option<&mut AddressRecord> {
        self.records.get_mut(address)
    }

    pub fn records(&self) -> impl Iterator<Item = &AddressRecord> {
        self.records.values()
    }

    /// Get or create the record for an address.
    pub fn ensure_record(
        &mut self,
        address: &str,
        path: HdPath,
        public_key: String,
        script_hash: String,
    ) -> &mut AddressRecord {
        self.records.entry(address.to_string()).or_insert_with(|| {
            AddressRecord::new(address.to_string(), path, public_key, script_hash)
        })
    }

    /// Write one record through to storage.
    pub async fn persist_record(&self, address: &str) -> Result<()> {
        if let Some(record) = self.records.get(address) {
            self.store.set_json(&format!("addr/{}", address), record).await?;
        }
        Ok(())
    }

    /// Fold a transaction entry into the log, maintaining the height index.
    pub async fn upsert_tx(&mut self, entry: TxEntry) -> Result<TxLogChange> {
        let change = match self.tx_log.get(&entry.txid) {
            None => TxLogChange::New,
            Some(existing) if existing.height != entry.height => TxLogChange::HeightChanged {
                previous: existing.height,
            },
            Some(existing) if *existing == entry => return Ok(TxLogChange::Unchanged),
            Some(_) => TxLogChange::Unchanged,
        };

        if let TxLogChange::HeightChanged {
            previous,
        } = change
        {
            if let Some(txids) = self.height_index.get_mut(&previous) {
                txids.retain(|t| *t != entry.txid);
                if txids.is_empty() {
                    self.height_index.remove(&previous);
                }
            }
        }
        if !matches!(change, TxLogChange::Unchanged) {
            let slot = self.height_index.entry(entry.height).or_default();
            if !slot.contains(&entry.txid) {
                slot.push(entry.txid);
            }
        }

        self.store.set_json(&format!("tx/{}", entry.txid), &entry).await?;
        self.tx_log.insert(entry.txid, entry);
        Ok(change)
    }

    pub fn tx(&self, txid: &Txid) -> Option<&TxEntry> {
        self.tx_log.get(txid)
    }

    /// Paginated transaction log ordered by height. Default order is
    /// newest first (mempool entries lead); `reverse` flips to oldest
    /// first.
    pub fn get_transactions(&self, limit: usize, offset: usize, reverse: bool) -> Vec<TxEntry> {
        let mut entries: Vec<&TxEntry> = self.tx_log.values().collect();
        // Height 0 means unmined, which sorts as newest.
        let sort_height = |e: &TxEntry| {
            if e.height == 0 {
                u32::MAX
            } else {
                e.height
            }
        };
        entries.sort_by(|a, b| {
            let ord = sort_height(a).cmp(&sort_height(b)).then(a.txid.cmp(&b.txid));
            if reverse {
                ord
            } else {
                ord.reverse()
            }
        });
        entries.into_iter().skip(offset).take(limit).cloned().collect()
    }

    /// Txids currently recorded as unmined.
    pub fn mempool_txids(&self) -> Vec<Txid> {
        self.height_index.get(&0).cloned().unwrap_or_default()
    }

    /// Txids recorded in the inclusive height window.
    pub fn txids_in_heights(&self, from: u32, to: u32) -> Vec<Txid> {
        let from = from.max(1);
        self.height_index
            .range(from..=to)
            .flat_map(|(_, txids)| txids.iter().copied())
            .collect()
    }

    /// Cache builder-side metadata for a transaction we broadcast.
    pub async fn add_sent_tx(&mut self, record: SendRecord) -> Result<()> {
        self.store.set_json(&format!("sent/{}", record.txid), &record).await?;
        self.sent.insert(record.txid, record);
        Ok(())
    }

    pub fn get_sent_tx(&self, txid: &Txid) -> Option<&SendRecord> {
        self.sent.get(txid)
    }

    /// Sum of every record's net, per state. Matches the running
    /// `TotalBalance` at quiescence.
    pub fn aggregate_balance(&self) -> Balance {
        let mut total = Balance::default();
        for record in self.records.values() {
            for state in TxState::ALL {
                total.apply(state, record.net(state));
            }
        }
        total
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.records.clear();
        self.tx_log.clear();
        self.height_index.clear();
        self.sent.clear();
        self.store.clear().await?;
        Ok(())
    }
}
