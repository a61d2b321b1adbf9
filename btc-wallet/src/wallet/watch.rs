//! Script-hash subscription tracking.
//!
//! Keeps a bounded FIFO ring of subscribed script-hashes per chain with
//! the last status hash the provider reported for each. The ring is
//! persisted so a restarted wallet re-subscribes to everything it was
//! watching.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use btc_keys::Chain;

use crate::error::Result;
use crate::provider::Provider;
use crate::storage::StoreHandle;

const WATCH_KEY: &str = "watched_scripts";

/// One watched script-hash and the status last seen for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEntry {
    pub script_hash: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WatchState {
    external: VecDeque<WatchEntry>,
    internal: VecDeque<WatchEntry>,
}

/// Bounded per-chain subscription ring.
pub struct AddressWatch {
    store: StoreHandle,
    max_per_chain: usize,
    state: WatchState,
}

impl AddressWatch {
    pub async fn open(store: StoreHandle, max_per_chain: usize) -> Result<Self> {
        let state = store.get_json(WATCH_KEY).await?.unwrap_or_default();
        Ok(Self {
            store,
            max_per_chain,
            state,
        })
    }

    fn ring(&self, chain: Chain) -> &VecDeque<WatchEntry> {
        match chain {
            Chain::External => &self.state.external,
            Chain::Internal => &self.state.internal,
        }
    }

    fn ring_mut(&mut self, chain: Chain) -> &mut VecDeque<WatchEntry> {
        match chain {
            Chain::External => &mut self.state.external,
            Chain::Internal => &mut self.state.internal,
        }
    }

    async fn persist(&self) -> Result<()> {
        self.store.set_json(WATCH_KEY, &self.state).await?;
        Ok(())
    }

    /// Track a script-hash on the given chain. The oldest entry falls off
    /// when the ring is full.
    pub async fn watch(
        &mut self,
        script_hash: &str,
        chain: Chain,
        status: Option<String>,
    ) -> Result<()> {
        let max = self.max_per_chain;
        let ring = self.ring_mut(chain);
        if let Some(entry) = ring.iter_mut().find(|e| e.script_hash == script_hash) {
            entry.status = status;
        } else {
            ring.push_back(WatchEntry {
                script_hash: script_hash.to_string(),
                status,
            });
            while ring.len() > max {
                let evicted = ring.pop_front();
                if let Some(evicted) = evicted {
                    tracing::debug!("Watch ring full, dropping {}", evicted.script_hash);
                }
            }
        }
        self.persist().await
    }

    /// Chain and last status of a watched script-hash.
    pub fn find(&self, script_hash: &str) -> Option<(Chain, Option<String>)> {
        for chain in [Chain::External, Chain::Internal] {
            if let Some(entry) = self.ring(chain).iter().find(|e| e.script_hash == script_hash) {
                return Some((chain, entry.status.clone()));
            }
        }
        None
    }

    pub async fn update_status(&mut self, script_hash: &str, status: Option<String>) -> Result<()> {
        for chain in [Chain::External, Chain::Internal] {
            if let Some(entry) =
                self.ring_mut(chain).iter_mut().find(|e| e.script_hash == script_hash)
            {
                entry.status = status;
                return self.persist().await;
            }
        }
        Ok(())
    }

    /// Stop tracking a script-hash (its balance was consumed).
    pub async fn remove(&mut self, script_hash: &str) -> Result<()> {
        for chain in [Chain::External, Chain::Internal] {
            self.ring_mut(chain).retain(|e| e.script_hash != script_hash);
        }
        self.persist().await
    }

    pub fn watched(&self) -> Vec<(Chain, String)> {
        let mut all = Vec::new();
        for chain in [Chain::External, Chain::Internal] {
            all.extend(self.ring(chain).iter().map(|e| (chain, e.script_hash.clone())));
        }
        all
    }

    pub fn len(&self) -> usize {
        self.state.external.len() + self.state.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-subscribe every tracked script-hash, refreshing stored statuses.
    /// Called on open and after a provider reconnect.
    pub async fn resubscribe<P: Provider>(&mut self, provider: &P) -> Result<()> {
        let watched = self.watched();
        for (_, script_hash) in &watched {
            match provider.subscribe_script_hash(script_hash).await {
                Ok(status) => {
                    for chain in [Chain::External, Chain::Internal] {
                        if let Some(entry) =
                            self.ring_mut(chain).iter_mut().find(|e| &e.script_hash == script_hash)
                        {
                            entry.status = status.clone();
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Re-subscription of {} failed: {}", script_hash, e);
                }
            }
        }
        if !watched.is_empty() {
            self.persist().await?;
            tracing::info!("Re-subscribed {} watched script-hashes", watched.len());
        }
        Ok(())
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.state = WatchState::default();
        self.persist().await
    }
}
