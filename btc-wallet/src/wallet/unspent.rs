//! The live UTXO set.
//!
//! Outputs credited to the wallet live here until a spending input is
//! observed. A builder reserving coins locks them; locked outputs are
//! invisible to further selections until spent through or unlocked.

use std::collections::{HashMap, HashSet};

use crate::error::{BuildError, Result};
use crate::storage::StoreHandle;
use crate::tx::fee::{estimate_vsize, FeeRate};
use crate::types::{TxState, Utxo};

const SPENT_KEY: &str = "spent_outpoints";

/// UTXO selection strategy. A single strategy is supported: accumulate
/// the largest outputs first, minimising input count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionStrategy {
    #[default]
    LargestFirst,
}

/// A set of locked UTXOs covering a payment.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub utxos: Vec<Utxo>,
    /// Sum of the selected values.
    pub total: u64,
    /// Fee estimate the selection solved for.
    pub fee: u64,
    /// `total - target - fee` at selection time.
    pub change: u64,
    /// The requested payment value.
    pub target: u64,
}

/// Persistent UTXO set with reservation support.
pub struct UnspentStore {
    store: StoreHandle,
    utxos: HashMap<String, Utxo>,
    /// Outpoints whose spending input has been observed. An output landing
    /// here is dead even if its crediting tx is processed afterwards.
    spent: HashSet<String>,
    locked: HashSet<String>,
}

impl UnspentStore {
    pub async fn open(store: StoreHandle) -> Result<Self> {
        let mut utxos = HashMap::new();
        for (key, bytes) in store.entries("utxo/").await? {
            match serde_json::from_slice::<Utxo>(&bytes) {
                Ok(utxo) => {
                    utxos.insert(utxo.key(), utxo);
                }
                Err(e) => tracing::warn!("Skipping undecodable UTXO {}: {}", key, e),
            }
        }
        let spent: HashSet<String> = store.get_json(SPENT_KEY).await?.unwrap_or_default();
        Ok(Self {
            store,
            utxos,
            spent,
            locked: HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Utxo> {
        self.utxos.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    /// Track a newly observed output. No-op if its spend was already seen.
    pub async fn add(&mut self, utxo: Utxo) -> Result<()> {
        let key = utxo.key();
        if self.spent.contains(&key) {
            tracing::debug!("Output {} already spent, not tracking", key);
            return Ok(());
        }
        self.store.set_json(&format!("utxo/{}", key), &utxo).await?;
        self.utxos.insert(key, utxo);
        Ok(())
    }

    /// Promote a tracked output to a later lifecycle state.
    pub async fn set_state(&mut self, key: &str, state: TxState) -> Result<()> {
        if let Some(utxo) = self.utxos.get_mut(key) {
            if utxo.state < state {
                utxo.state = state;
                let utxo = utxo.clone();
                self.store.set_json(&format!("utxo/{}", key), &utxo).await?;
            }
        }
        Ok(())
    }

    /// Record a spending input: the output is removed from the live set
    /// (now or when it is eventually observed).
    pub async fn remove_spent(&mut self, key: &str) -> Result<()> {
        if self.spent.insert(key.to_string()) {
            self.store.set_json(SPENT_KEY, &self.spent).await?;
        }
        if self.utxos.remove(key).is_some() {
            self.store.delete(&format!("utxo/{}", key)).await?;
            self.locked.remove(key);
        }
        Ok(())
    }

    /// Reconcile: drop any tracked output whose spend has been observed.
    /// Run after every batch of history processing.
    pub async fn process(&mut self) -> Result<()> {
        let dead: Vec<String> =
            self.utxos.keys().filter(|k| self.spent.contains(*k)).cloned().collect();
        for key in dead {
            self.utxos.remove(&key);
            self.locked.remove(&key);
            self.store.delete(&format!("utxo/{}", key)).await?;
            tracing::debug!("Swept spent output {}", key);
        }
        Ok(())
    }

    /// Reserve outputs covering `value` plus fees at `fee_rate`.
    ///
    /// Confirmed outputs are used first, then pending, then mempool-state
    /// change. The fee target is recomputed as every input is added, since
    /// each input grows the transaction. Selected outputs are locked until
    /// [`Self::unlock`] or spend-through.
    pub fn get_utxo_for_amount(
        &mut self,
        value: u64,
        fee_rate: FeeRate,
        _strategy: SelectionStrategy,
    ) -> std::result::Result<Reservation, BuildError> {
        let mut candidates: Vec<&Utxo> = Vec::new();
        for state in [TxState::Confirmed, TxState::Pending, TxState::Mempool] {
            let mut tier: Vec<&Utxo> = self
                .utxos
                .values()
                .filter(|u| u.state == state && !u.locked && !self.locked.contains(&u.key()))
                .collect();
            tier.sort_by(|a, b| b.value.cmp(&a.value));
            candidates.extend(tier);
        }

        let mut selected: Vec<Utxo> = Vec::new();
        let mut total = 0u64;
        let mut fee = fee_rate.fee_for(estimate_vsize(1, 2));
        for utxo in candidates {
            selected.push(utxo.clone());
            total += utxo.value;
            fee = fee_rate.fee_for(estimate_vsize(selected.len(), 2));
            if total >= value.saturating_add(fee) {
                for u in &mut selected {
                    u.locked = true;
                    self.locked.insert(u.key());
                }
                return Ok(Reservation {
                    total,
                    fee,
                    change: total - value - fee,
                    target: value,
                    utxos: selected,
                });
            }
        }

        Err(BuildError::InsufficientFunds {
            available: total,
            required: value.saturating_add(fee),
        })
    }

    /// Release a reservation after a failed spend.
    pub fn unlock(&mut self, reservation: &Reservation) {
        for utxo in &reservation.utxos {
            self.locked.remove(&utxo.key());
        }
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.utxos.clear();
        self.spent.clear();
        self.locked.clear();
        self.store.clear().await?;
        Ok(())
    }
}
