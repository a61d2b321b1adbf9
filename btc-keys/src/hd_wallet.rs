//! Gap-limit-aware HD wallet cursor.
//!
//! Tracks, per chain, how far the account has been scanned, which index
//! was last seen carrying a transaction, and which indices have already
//! been handed out to callers. The scan state is serializable so a
//! restarted wallet resumes at the next unvisited path.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::deriver::{DerivedAddress, KeyDeriver};
use crate::error::Result;
use crate::path::{Chain, HdPath};

/// Default number of consecutive unused addresses before a chain scan stops.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Outcome of visiting one path during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    /// The path's script-hash has history; reset the gap counter.
    HasTx,
    /// Nothing observed at this path; widen the gap.
    NoTx,
    /// Abort the scan cooperatively.
    Stop,
}

/// Per-chain scan and hand-out state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSyncState {
    /// Next index the scan will visit.
    pub next_index: u32,
    /// Consecutive unused addresses seen by the current scan.
    pub gap_count: u32,
    /// Highest index ever observed with a transaction.
    pub highest_used: Option<u32>,
    /// Lowest index never handed out by `get_new_address`.
    pub next_handout: u32,
}

/// Serializable snapshot of both chains, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdSyncState {
    pub external: ChainSyncState,
    pub internal: ChainSyncState,
}

impl HdSyncState {
    pub fn chain(&self, chain: Chain) -> &ChainSyncState {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn chain_mut(&mut self, chain: Chain) -> &mut ChainSyncState {
        match chain {
            Chain::External => &mut self.external,
            Chain::Internal => &mut self.internal,
        }
    }
}

/// HD account wrapper: derivation plus scan bookkeeping.
pub struct HdWallet {
    deriver: KeyDeriver,
    gap_limit: u32,
    state: HdSyncState,
    /// Every address this wallet has derived, by bech32 string.
    addresses: HashMap<String, HdPath>,
    scan_stopped: bool,
}

impl HdWallet {
    pub fn new(deriver: KeyDeriver, gap_limit: u32) -> Self {
        Self {
            deriver,
            gap_limit,
            state: HdSyncState::default(),
            addresses: HashMap::new(),
            scan_stopped: false,
        }
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    /// Lowest-index path on `chain` that has never carried a transaction
    /// and has never been handed out before.
    pub fn get_new_address(&mut self, chain: Chain) -> Result<DerivedAddress> {
        let network = self.deriver.network();
        let st = self.state.chain_mut(chain);
        let index = st.next_handout.max(st.highest_used.map_or(0, |h| h + 1));
        st.next_handout = index + 1;
        self.ensure_derived(&HdPath::new(network, chain, index))
    }

    /// All addresses this wallet instance has derived so far.
    pub fn get_all_addresses(&self) -> Vec<String> {
        self.addresses.keys().cloned().collect()
    }

    /// The most recently issued or observed external path, if any.
    pub fn last_ext_path(&self) -> Option<HdPath> {
        let st = &self.state.external;
        let last = st.next_handout.checked_sub(1).or(st.highest_used)?;
        let last = st.highest_used.map_or(last, |h| last.max(h));
        Some(HdPath::new(self.deriver.network(), Chain::External, last))
    }

    /// Reset both chain cursors so the next scan starts from index 0.
    /// Hand-out watermarks are kept so issued addresses stay unique.
    pub fn reset_sync_state(&mut self) {
        for chain in [Chain::External, Chain::Internal] {
            let st = self.state.chain_mut(chain);
            st.next_index = 0;
            st.gap_count = 0;
            st.highest_used = None;
        }
        self.scan_stopped = false;
    }

    pub fn snapshot(&self) -> HdSyncState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: HdSyncState) {
        self.state = state;
    }

    pub fn chain_state(&self, chain: Chain) -> &ChainSyncState {
        self.state.chain(chain)
    }

    /// Whether this bech32 address was derived by this wallet.
    pub fn is_own(&self, address: &str) -> bool {
        self.addresses.contains_key(address)
    }

    pub fn path_of(&self, address: &str) -> Option<&HdPath> {
        self.addresses.get(address)
    }

    /// Derive a path and remember its address as ours.
    pub fn ensure_derived(&mut self, path: &HdPath) -> Result<DerivedAddress> {
        let derived = self.deriver.derive(path)?;
        self.addresses.insert(derived.address.to_string(), *path);
        Ok(derived)
    }

    /// Record that a transaction was observed at `chain`/`index` outside a
    /// scan (e.g. a mempool notification for a watched script-hash).
    pub fn mark_used(&mut self, chain: Chain, index: u32) {
        let st = self.state.chain_mut(chain);
        st.highest_used = Some(st.highest_used.map_or(index, |h| h.max(index)));
    }

    /// Prepare a scan. With `from_start` the cursors rewind to index 0;
    /// otherwise the scan resumes from the persisted position, gap
    /// counters included, so a finished account is not re-walked.
    pub fn begin_scan(&mut self, from_start: bool) {
        if from_start {
            self.reset_sync_state();
        }
        self.scan_stopped = false;
    }

    /// Next path the scan should visit: the external chain runs to its gap
    /// limit before the internal chain starts.
    pub fn next_scan_path(&self) -> Option<HdPath> {
        if self.scan_stopped {
            return None;
        }
        let network = self.deriver.network();
        for chain in [Chain::External, Chain::Internal] {
            let st = self.state.chain(chain);
            if st.gap_count < self.gap_limit {
                return Some(HdPath::new(network, chain, st.next_index));
            }
        }
        None
    }

    /// Fold one visit result into the cursor.
    pub fn record_scan(&mut self, path: &HdPath, signal: ScanSignal) {
        match signal {
            ScanSignal::HasTx => {
                let st = self.state.chain_mut(path.chain);
                st.gap_count = 0;
                st.highest_used = Some(st.highest_used.map_or(path.index, |h| h.max(path.index)));
                st.next_index = path.index + 1;
            }
            ScanSignal::NoTx => {
                let st = self.state.chain_mut(path.chain);
                st.gap_count += 1;
                st.next_index = path.index + 1;
            }
            ScanSignal::Stop => {
                self.scan_stopped = true;
            }
        }
    }

    /// Drive a full gap-limit scan through an async visitor. The visitor
    /// receives the derived path and a snapshot of the scan state and
    /// answers with a [`ScanSignal`].
    pub async fn for_each_account<F, Fut>(&mut self, from_start: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(DerivedAddress, HdSyncState) -> Fut,
        Fut: Future<Output = ScanSignal>,
    {
        self.begin_scan(from_start);
        while let Some(path) = self.next_scan_path() {
            let derived = self.ensure_derived(&path)?;
            let signal = visit(derived, self.snapshot()).await;
            self.record_scan(&path, signal);
            if signal == ScanSignal::Stop {
                break;
            }
        }
        Ok(())
    }
}
