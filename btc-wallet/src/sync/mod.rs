//! Account synchronization.
//!
//! The [`SyncManager`] owns every sub-store and is the only component
//! that mutates monetary state. It drives the gap-limit path scan,
//! ingests histories pushed or fetched from the provider, classifies each
//! transaction, and keeps the address ledgers, the UTXO set and the
//! aggregate balance consistent with one another.

pub mod send;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::{OutPoint, Txid};
use tokio::sync::{mpsc, oneshot, Notify};

use btc_keys::{Chain, DerivedAddress, HdPath, HdSyncState, HdWallet, KeyDeriver, ScanSignal};

use crate::config::Config;
use crate::error::{Result, SyncError, WalletError};
use crate::provider::{Provider, ProviderNotification, TxDetail};
use crate::storage::StoreHandle;
use crate::tx::fee::FeeRate;
use crate::types::{
    outpoint_key, Balance, Direction, OutputMeta, TxEntry, TxState, Utxo, WalletEvent,
};
use crate::wallet::address_store::TxLogChange;
use crate::wallet::{
    AddressStore, AddressWatch, Reservation, SelectionStrategy, TotalBalance, UnspentStore,
};

pub use send::{PendingSend, SendOptions};

const HD_STATE_KEY: &str = "sync_state";
const LAST_HEIGHT_KEY: &str = "last_height";

/// Options for [`SyncManager::sync_account`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Rewind the HD cursor and rescan from index 0, keeping stores.
    pub reset: bool,
    /// Drop all derived state (ledgers, UTXO set, totals, provider cache)
    /// and rebuild from a full rescan.
    pub restart: bool,
}

/// Pagination for the transaction log.
#[derive(Debug, Clone, Copy)]
pub struct TransactionQuery {
    pub limit: usize,
    pub offset: usize,
    /// Oldest-first when set; newest-first otherwise.
    pub reverse: bool,
}

impl Default for TransactionQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            reverse: false,
        }
    }
}

/// Cloneable handle for cooperative pause from other tasks.
#[derive(Clone, Default)]
pub struct SyncControl {
    halt: Arc<AtomicBool>,
    syncing: Arc<AtomicBool>,
    ended: Arc<Notify>,
}

impl SyncControl {
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn halt_requested(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    /// Request a pause and wait for the in-flight path to finish. Resolves
    /// immediately when no sync is running.
    pub async fn pause(&self) {
        if !self.is_syncing() {
            return;
        }
        self.halt.store(true, Ordering::SeqCst);
        loop {
            let ended = self.ended.notified();
            if !self.is_syncing() {
                return;
            }
            ended.await;
        }
    }
}

/// Which ledger a history item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerSide {
    /// Transaction outputs: credits.
    Out,
    /// Transaction inputs: debits.
    In,
}

/// Outcome of one ledger mutation, applied to the dependent stores after
/// the record borrow ends.
enum LedgerEffect {
    Skip,
    Recorded(u64),
    Promoted {
        from: TxState,
        amount: u64,
    },
}

/// The wallet's synchronization and accounting core.
pub struct SyncManager<P: Provider> {
    config: Config,
    provider: Arc<P>,
    hd: HdWallet,
    addresses: AddressStore,
    unspent: UnspentStore,
    total: TotalBalance,
    watch: AddressWatch,
    hd_store: StoreHandle,
    state_store: StoreHandle,
    control: SyncControl,
    /// Current chain tip as reported by the provider.
    tip_height: u32,
    /// Tip processed by the previous new-block pass.
    last_height: u32,
    events_tx: mpsc::UnboundedSender<WalletEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<WalletEvent>>,
    mempool_waiters: HashMap<Txid, Vec<oneshot::Sender<()>>>,
}

impl<P: Provider> SyncManager<P> {
    /// Open all sub-stores, restore persisted state, re-subscribe watched
    /// script-hashes and report readiness.
    pub async fn open(
        config: Config,
        provider: Arc<P>,
        store: StoreHandle,
        deriver: KeyDeriver,
    ) -> Result<Self> {
        config.validate()?;
        if deriver.network() != config.network {
            return Err(WalletError::Config(format!(
                "key network {:?} does not match configured {:?}",
                deriver.network(),
                config.network
            )));
        }

        let hd_store = store.namespace("hdwallet");
        let state_store = store.namespace("state");
        let addresses = AddressStore::open(store.namespace("address")).await?;
        let unspent = UnspentStore::open(store.namespace("unspent")).await?;
        let total = TotalBalance::open(state_store.clone()).await?;
        let mut watch = AddressWatch::open(state_store.clone(), config.max_script_watch).await?;

        let mut hd = HdWallet::new(deriver, config.gap_limit);
        if let Some(snapshot) = hd_store.get_json::<HdSyncState>(HD_STATE_KEY).await? {
            hd.restore(snapshot);
        }
        // Re-derive persisted records so ownership checks recognise them.
        let known_paths: Vec<HdPath> = addresses.records().map(|r| r.path).collect();
        for path in known_paths {
            hd.ensure_derived(&path)?;
        }

        let tip_height = provider.subscribe_headers().await?;
        let last_height = state_store.get_json(LAST_HEIGHT_KEY).await?.unwrap_or(0);
        watch.resubscribe(provider.as_ref()).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            config,
            provider,
            hd,
            addresses,
            unspent,
            total,
            watch,
            hd_store,
            state_store,
            control: SyncControl::default(),
            tip_height,
            last_height,
            events_tx,
            events_rx: Some(events_rx),
            mempool_waiters: HashMap::new(),
        };
        manager.emit(WalletEvent::Ready);
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tip_height(&self) -> u32 {
        self.tip_height
    }

    pub fn hd_wallet(&self) -> &HdWallet {
        &self.hd
    }

    pub fn address_store(&self) -> &AddressStore {
        &self.addresses
    }

    pub fn unspent_store(&self) -> &UnspentStore {
        &self.unspent
    }

    /// Handle for pausing a running sync from another task.
    pub fn control(&self) -> SyncControl {
        self.control.clone()
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<WalletEvent>> {
        self.events_rx.take()
    }

    fn emit(&self, event: WalletEvent) {
        tracing::trace!("Emitting event: {:?}", event);
        let _ = self.events_tx.send(event);
    }

    /// Scan the account's paths against the provider.
    ///
    /// Visits paths in ascending index order, external chain first, until
    /// the gap limit is reached on both chains. Honours the pause flag
    /// between paths and always finishes with a `SyncEnd` event.
    pub async fn sync_account(&mut self, options: SyncOptions) -> Result<()> {
        if self.control.is_syncing() || self.control.halt_requested() {
            return Err(SyncError::SyncInProgress.into());
        }

        if options.restart {
            tracing::info!("Restarting account state from scratch");
            self.provider.clear_cache().await.map_err(WalletError::Provider)?;
            self.addresses.clear().await?;
            self.unspent.clear().await?;
            self.total.reset().await?;
            self.hd.reset_sync_state();
        } else if options.reset {
            self.hd.reset_sync_state();
        }

        self.control.syncing.store(true, Ordering::SeqCst);
        let result = self.run_scan().await;
        self.control.syncing.store(false, Ordering::SeqCst);
        self.control.halt.store(false, Ordering::SeqCst);
        self.emit(WalletEvent::SyncEnd);
        self.control.ended.notify_waiters();
        result
    }

    async fn run_scan(&mut self) -> Result<()> {
        self.hd.begin_scan(false);
        while let Some(path) = self.hd.next_scan_path() {
            if self.control.halt_requested() {
                tracing::info!("Sync paused before {}", path);
                break;
            }
            let derived = self.hd.ensure_derived(&path)?;
            let script_hash = derived.script_hash.clone();

            // A provider failure leaves the path unobserved rather than
            // aborting the whole scan.
            let history = match self.provider.get_history(&script_hash, true).await {
                Ok(history) => history,
                Err(e) => {
                    tracing::warn!("History fetch for {} failed: {}", path, e);
                    Vec::new()
                }
            };

            let has_tx = !history.is_empty();
            if has_tx {
                self.process_history(&history, Some(&path)).await?;
                if let Err(e) = self.watch_address(&script_hash, path.chain).await {
                    tracing::warn!("Subscription of {} failed: {}", path, e);
                }
            }
            self.hd.record_scan(
                &path,
                if has_tx {
                    ScanSignal::HasTx
                } else {
                    ScanSignal::NoTx
                },
            );
            self.hd_store.set_json(HD_STATE_KEY, &self.hd.snapshot()).await?;
            self.emit(WalletEvent::SyncedPath {
                chain: path.chain,
                path,
                has_tx,
                state: self.hd.chain_state(path.chain).clone(),
            });
        }
        self.unspent.process().await?;
        Ok(())
    }

    /// Feed a batch of transactions through the accounting core, mined
    /// transactions first in height order, mempool entries last.
    pub async fn process_history(
        &mut self,
        txs: &[TxDetail],
        path: Option<&HdPath>,
    ) -> Result<()> {
        let mut ordered: Vec<&TxDetail> = txs.iter().collect();
        ordered.sort_by_key(|tx| (tx.height == 0, tx.height));
        for tx in ordered {
            self.process_transaction(tx, path).await?;
        }
        Ok(())
    }

    /// Lifecycle state for a transaction at the given height.
    fn tx_state(&self, height: u32) -> TxState {
        if height == 0 {
            TxState::Mempool
        } else if self.tip_height >= height
            && self.tip_height - height >= self.config.min_block_confirm
        {
            TxState::Confirmed
        } else {
            TxState::Pending
        }
    }

    fn is_own_address(&self, address: &str) -> bool {
        self.hd.is_own(address) || self.addresses.contains(address)
    }

    async fn process_transaction(&mut self, tx: &TxDetail, path: Option<&HdPath>) -> Result<()> {
        if let Some(path) = path {
            self.hd.ensure_derived(path)?;
        }
        let state = self.tx_state(tx.height);

        let input_total: u64 = tx.inputs.iter().map(|i| i.value).sum();
        let output_total: u64 = tx.outputs.iter().map(|o| o.value).sum();
        let fee = if input_total > 0 {
            input_total.saturating_sub(output_total)
        } else {
            0
        };

        self.process_utxo(tx, LedgerSide::Out, state, 0).await?;
        self.process_utxo(tx, LedgerSide::In, state, fee).await?;

        let own = |address: &Option<String>| {
            address.as_deref().map(|a| self.is_own_address(a)).unwrap_or(false)
        };
        let inputs_any_own = tx.inputs.iter().any(|i| own(&i.address));
        let inputs_all_own = !tx.inputs.is_empty() && tx.inputs.iter().all(|i| own(&i.address));
        let outputs_all_own =
            !tx.outputs.is_empty() && tx.outputs.iter().all(|o| own(&o.address));

        let direction = if inputs_all_own && outputs_all_own {
            Direction::Internal
        } else if !inputs_any_own {
            Direction::Incoming
        } else if !tx.outputs.is_empty() {
            Direction::Outgoing
        } else {
            Direction::Unknown
        };

        let amount: u64 = tx
            .outputs
            .iter()
            .filter(|o| match direction {
                Direction::Incoming | Direction::Internal => own(&o.address),
                Direction::Outgoing => !own(&o.address),
                Direction::Unknown => false,
            })
            .map(|o| o.value)
            .sum();

        let mut from_addresses = Vec::new();
        for input in &tx.inputs {
            if let Some(address) = &input.address {
                if !from_addresses.contains(address) {
                    from_addresses.push(address.clone());
                }
            }
        }
        let entry = TxEntry {
            txid: tx.txid,
            from_addresses,
            to_addresses: tx.outputs.iter().filter_map(|o| o.address.clone()).collect(),
            to_address_meta: tx
                .outputs
                .iter()
                .map(|o| OutputMeta {
                    amount: o.value,
                    own_address: own(&o.address),
                })
                .collect(),
            fee,
            amount,
            height: tx.height,
            direction,
        };

        let change = self.addresses.upsert_tx(entry.clone()).await?;
        if tx.height == 0 {
            if matches!(change, TxLogChange::New) {
                self.emit(WalletEvent::NewTx(entry));
            }
            if let Some(waiters) = self.mempool_waiters.remove(&tx.txid) {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                self.emit(WalletEvent::TxMempool(tx.txid));
            }
        }
        Ok(())
    }

    /// The sole mutator of monetary state.
    ///
    /// Records each item of one side of a transaction into its address
    /// ledger, keyed by outpoint, and mirrors the change into the running
    /// total and the UTXO set. Replaying the same item is a no-op; an item
    /// reappearing in a later lifecycle state moves buckets, never
    /// regressing. Items without a resolvable own address are skipped.
    async fn process_utxo(
        &mut self,
        tx: &TxDetail,
        side: LedgerSide,
        state: TxState,
        fee: u64,
    ) -> Result<()> {
        let items: Vec<(Option<String>, OutPoint, u64)> = match side {
            LedgerSide::Out => tx
                .outputs
                .iter()
                .map(|o| {
                    (
                        o.address.clone(),
                        OutPoint {
                            txid: tx.txid,
                            vout: o.index,
                        },
                        o.value,
                    )
                })
                .collect(),
            LedgerSide::In => tx
                .inputs
                .iter()
                .map(|i| {
                    (
                        i.address.clone(),
                        OutPoint {
                            txid: i.prev_txid,
                            vout: i.prev_vout,
                        },
                        i.value,
                    )
                })
                .collect(),
        };

        for (address, outpoint, value) in items {
            let Some(address) = address else {
                continue;
            };
            let hd_path = self.hd.path_of(&address).copied();
            if hd_path.is_none() && !self.addresses.contains(&address) {
                // Counterparty address: shows up in the tx entry only.
                continue;
            }

            if !self.addresses.contains(&address) {
                let Some(path) = hd_path else {
                    continue;
                };
                let derived = self.hd.deriver().derive(&path)?;
                self.addresses.ensure_record(
                    &address,
                    path,
                    derived.public_key.to_string(),
                    derived.script_hash,
                );
            }
            if let Some(path) = hd_path {
                self.hd.mark_used(path.chain, path.index);
            }

            let key = outpoint_key(&outpoint);
            let effect = {
                let Some(record) = self.addresses.record_mut(&address) else {
                    continue;
                };
                record.has_tx = true;
                let buckets = match side {
                    LedgerSide::Out => &mut record.received,
                    LedgerSide::In => &mut record.spent,
                };
                match buckets.state_of(&key) {
                    Some((existing, _)) if existing >= state => LedgerEffect::Skip,
                    Some((existing, amount)) => {
                        buckets.remove(existing, &key);
                        buckets.insert(state, key.clone(), amount);
                        if side == LedgerSide::In {
                            if let Some(fee_amount) = record.fees.remove(existing, &key) {
                                record.fees.insert(state, key.clone(), fee_amount);
                            }
                        }
                        LedgerEffect::Promoted {
                            from: existing,
                            amount,
                        }
                    }
                    None => {
                        buckets.insert(state, key.clone(), value);
                        if side == LedgerSide::In && fee > 0 {
                            record.fees.insert(state, key.clone(), fee);
                        }
                        LedgerEffect::Recorded(value)
                    }
                }
            };

            let sign = match side {
                LedgerSide::Out => 1i64,
                LedgerSide::In => -1i64,
            };
            match effect {
                LedgerEffect::Skip => {}
                LedgerEffect::Recorded(amount) => {
                    self.total.apply(state, sign * amount as i64).await?;
                    self.addresses.persist_record(&address).await?;
                    match side {
                        LedgerSide::Out => {
                            let (record_path, public_key) = match self.addresses.record(&address)
                            {
                                Some(r) => (r.path, r.public_key.clone()),
                                None => continue,
                            };
                            let derived = self.hd.deriver().derive(&record_path)?;
                            self.unspent
                                .add(Utxo {
                                    txid: outpoint.txid,
                                    vout: outpoint.vout,
                                    value: amount,
                                    address: address.clone(),
                                    public_key,
                                    path: record_path,
                                    script_hex: hex::encode(derived.script_pubkey.as_bytes()),
                                    state,
                                    locked: false,
                                })
                                .await?;
                        }
                        LedgerSide::In => {
                            self.unspent.remove_spent(&key).await?;
                        }
                    }
                }
                LedgerEffect::Promoted {
                    from,
                    amount,
                } => {
                    self.total.apply(from, -sign * amount as i64).await?;
                    self.total.apply(state, sign * amount as i64).await?;
                    self.addresses.persist_record(&address).await?;
                    if side == LedgerSide::Out {
                        self.unspent.set_state(&key, state).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// React to a provider push.
    pub async fn handle_notification(
        &mut self,
        notification: ProviderNotification,
    ) -> Result<()> {
        match notification {
            ProviderNotification::NewBlock {
                height,
            } => self.on_new_block(height).await,
            ProviderNotification::ScriptHashChanged {
                script_hash,
                status,
            } => self.on_script_hash_change(&script_hash, status).await,
            ProviderNotification::Reconnected => {
                tracing::info!("Provider reconnected, re-establishing subscriptions");
                self.tip_height = self.provider.subscribe_headers().await?;
                self.watch.resubscribe(self.provider.as_ref()).await?;
                Ok(())
            }
        }
    }

    /// Refetch every transaction that may have been promoted by the new
    /// block: everything unmined plus everything recorded inside the
    /// `[last, current]` window. Cache is bypassed so heights are fresh.
    async fn on_new_block(&mut self, height: u32) -> Result<()> {
        let last = self.last_height;
        self.tip_height = self.tip_height.max(height);
        self.emit(WalletEvent::NewBlock {
            height,
        });

        if last > 0 && height > last {
            let mut txids = self.addresses.mempool_txids();
            for txid in self.addresses.txids_in_heights(last, height) {
                if !txids.contains(&txid) {
                    txids.push(txid);
                }
            }
            tracing::debug!("Block {}: re-checking {} transactions", height, txids.len());
            for txid in txids {
                match self.provider.get_transaction(&txid, false).await {
                    Ok(tx) => self.process_history(std::slice::from_ref(&tx), None).await?,
                    Err(e) => tracing::warn!("Refetch of {} failed: {}", txid, e),
                }
            }
            self.unspent.process().await?;
        }

        self.last_height = height;
        self.state_store.set_json(LAST_HEIGHT_KEY, &self.last_height).await?;
        Ok(())
    }

    /// A watched script-hash changed: ingest its mempool view and drop
    /// consumed internal-chain subscriptions.
    async fn on_script_hash_change(
        &mut self,
        script_hash: &str,
        status: Option<String>,
    ) -> Result<()> {
        if let Some((chain, stored_status)) = self.watch.find(script_hash) {
            if stored_status != status {
                match self.provider.get_mempool(script_hash).await {
                    Ok(txs) => self.process_history(&txs, None).await?,
                    Err(e) => {
                        tracing::warn!("Mempool fetch for {} failed: {}", script_hash, e)
                    }
                }
                self.watch.update_status(script_hash, status).await?;

                if chain == Chain::Internal {
                    if let Ok(balance) = self.provider.get_balance(script_hash).await {
                        if balance.is_zero() {
                            self.watch.remove(script_hash).await?;
                            tracing::debug!("Dropped consumed change watch {}", script_hash);
                        }
                    }
                }
            }
        }
        self.unspent.process().await?;
        Ok(())
    }

    /// Wallet balance, or one address's net ledger when given.
    pub fn get_balance(&self, address: Option<&str>) -> Result<Balance> {
        match address {
            None => Ok(self.total.get()),
            Some(address) => self
                .addresses
                .record(address)
                .map(|r| r.balance())
                .ok_or_else(|| SyncError::AddressUnknown(address.to_string()).into()),
        }
    }

    /// Paginated transaction log.
    pub fn get_transactions(&self, query: TransactionQuery) -> Vec<TxEntry> {
        self.addresses.get_transactions(query.limit, query.offset, query.reverse)
    }

    /// Subscribe a script-hash and track it in the bounded watch ring.
    pub async fn watch_address(&mut self, script_hash: &str, chain: Chain) -> Result<()> {
        let status =
            self.provider.subscribe_script_hash(script_hash).await.map_err(WalletError::Provider)?;
        self.watch.watch(script_hash, chain, status).await
    }

    /// Reserve UTXOs covering `value` at the given fee rate.
    pub fn utxo_for_amount(
        &mut self,
        value: u64,
        fee_rate: u64,
        strategy: SelectionStrategy,
    ) -> Result<Reservation> {
        self.unspent
            .get_utxo_for_amount(value, FeeRate::from_sat_per_vb(fee_rate), strategy)
            .map_err(WalletError::Build)
    }

    /// Register for a one-shot signal when `txid` is seen in the mempool.
    pub fn watch_tx_mempool(&mut self, txid: Txid) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.mempool_waiters.entry(txid).or_default().push(tx);
        rx
    }

    /// Issue a fresh address on the given chain and subscribe to it.
    pub async fn get_new_address(&mut self, chain: Chain) -> Result<DerivedAddress> {
        let derived = self.hd.get_new_address(chain)?;
        self.hd_store.set_json(HD_STATE_KEY, &self.hd.snapshot()).await?;
        if let Err(e) = self.watch_address(&derived.script_hash, chain).await {
            tracing::warn!("Subscription of new address failed: {}", e);
        }
        Ok(derived)
    }

    /// Request a pause of a running scan and wait for it to yield.
    pub async fn pause_sync(&self) {
        self.control.pause().await;
    }
}
