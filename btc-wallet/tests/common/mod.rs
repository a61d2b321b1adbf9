//! Shared test fixtures: a scripted in-process provider and wallet setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::{Address, Network, Transaction, Txid};
use tokio::sync::mpsc;

use btc_keys::{script_hash_hex, DerivedAddress, KeyDeriver};
use btc_wallet::error::{ProviderError, ProviderResult};
use btc_wallet::provider::{
    Provider, ProviderNotification, ScriptBalance, TxDetail, TxInput, TxOutput,
};
use btc_wallet::storage::MemoryStore;
use btc_wallet::{Config, SyncManager};

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

#[derive(Debug, Clone)]
pub struct MockOutput {
    pub index: u32,
    pub address: Option<String>,
    pub value: u64,
    pub script_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockTx {
    pub txid: Txid,
    pub hex: String,
    pub vsize: usize,
    /// Zero while in the mempool.
    pub height: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<MockOutput>,
}

impl MockTx {
    fn detail(&self) -> TxDetail {
        TxDetail {
            txid: self.txid,
            hex: self.hex.clone(),
            vsize: self.vsize,
            height: self.height,
            inputs: self.inputs.clone(),
            outputs: self
                .outputs
                .iter()
                .map(|o| TxOutput {
                    index: o.index,
                    address: o.address.clone(),
                    value: o.value,
                })
                .collect(),
        }
    }
}

#[derive(Default)]
struct MockChain {
    height: u32,
    txs: HashMap<Txid, MockTx>,
    /// Txids touching each script-hash, in insertion order.
    script_history: HashMap<String, Vec<Txid>>,
    broadcasts: Vec<String>,
    fail_next_broadcast: Option<String>,
}

impl MockChain {
    fn status_for(&self, script_hash: &str) -> Option<String> {
        let txids = self.script_history.get(script_hash)?;
        if txids.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = txids
            .iter()
            .filter_map(|txid| self.txs.get(txid))
            .map(|tx| format!("{}:{}", tx.txid, tx.height))
            .collect();
        parts.sort();
        Some(parts.join(","))
    }

    fn register(&mut self, script_hash: &str, txid: Txid) {
        let history = self.script_history.entry(script_hash.to_string()).or_default();
        if !history.contains(&txid) {
            history.push(txid);
        }
    }
}

/// Scripted provider: the test controls the chain, the wallet observes it.
pub struct MockProvider {
    network: Network,
    chain: Mutex<MockChain>,
    next_txid: AtomicU64,
    notif_tx: mpsc::UnboundedSender<ProviderNotification>,
    notif_rx: Mutex<Option<mpsc::UnboundedReceiver<ProviderNotification>>>,
}

impl MockProvider {
    pub fn new(network: Network, height: u32) -> Self {
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        Self {
            network,
            chain: Mutex::new(MockChain {
                height,
                ..MockChain::default()
            }),
            next_txid: AtomicU64::new(1),
            notif_tx,
            notif_rx: Mutex::new(Some(notif_rx)),
        }
    }

    fn fresh_txid(&self) -> Txid {
        let n = self.next_txid.fetch_add(1, Ordering::SeqCst);
        Txid::from_str(&format!("{:064x}", 0xf000_0000u64 + n)).unwrap()
    }

    /// Credit `value` satoshi to a wallet address via a synthetic incoming
    /// transaction from a foreign source. `height` zero leaves it unmined.
    pub fn fund_address(&self, derived: &DerivedAddress, value: u64, height: u32) -> Txid {
        let txid = self.fresh_txid();
        let funding_source = self.fresh_txid();
        let tx = MockTx {
            txid,
            hex: String::new(),
            vsize: 141,
            height,
            inputs: vec![TxInput {
                prev_txid: funding_source,
                prev_vout: 0,
                address: Some("mock-foreign-source".to_string()),
                value: value + 1_000,
            }],
            outputs: vec![MockOutput {
                index: 0,
                address: Some(derived.address.to_string()),
                value,
                script_hash: Some(derived.script_hash.clone()),
            }],
        };
        let mut chain = self.chain.lock().unwrap();
        chain.register(&derived.script_hash, txid);
        chain.txs.insert(txid, tx);
        txid
    }

    pub fn set_tx_height(&self, txid: Txid, height: u32) {
        let mut chain = self.chain.lock().unwrap();
        if let Some(tx) = chain.txs.get_mut(&txid) {
            tx.height = height;
        }
    }

    pub fn set_height(&self, height: u32) {
        self.chain.lock().unwrap().height = height;
    }

    pub fn height(&self) -> u32 {
        self.chain.lock().unwrap().height
    }

    pub fn broadcast_count(&self) -> usize {
        self.chain.lock().unwrap().broadcasts.len()
    }

    pub fn fail_next_broadcast(&self, message: &str) {
        self.chain.lock().unwrap().fail_next_broadcast = Some(message.to_string());
    }

    pub fn tx(&self, txid: &Txid) -> Option<MockTx> {
        self.chain.lock().unwrap().txs.get(txid).cloned()
    }

    pub fn status_of(&self, script_hash: &str) -> Option<String> {
        self.chain.lock().unwrap().status_for(script_hash)
    }

    /// Advance the tip and push the headers notification.
    pub fn push_new_block(&self, height: u32) {
        self.set_height(height);
        let _ = self.notif_tx.send(ProviderNotification::NewBlock {
            height,
        });
    }

    /// Push a script-hash change notification with the current status.
    pub fn push_script_change(&self, script_hash: &str) {
        let status = self.status_of(script_hash);
        let _ = self.notif_tx.send(ProviderNotification::ScriptHashChanged {
            script_hash: script_hash.to_string(),
            status,
        });
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn subscribe_headers(&self) -> ProviderResult<u32> {
        Ok(self.chain.lock().unwrap().height)
    }

    async fn subscribe_script_hash(&self, script_hash: &str) -> ProviderResult<Option<String>> {
        Ok(self.chain.lock().unwrap().status_for(script_hash))
    }

    async fn get_history(
        &self,
        script_hash: &str,
        _use_cache: bool,
    ) -> ProviderResult<Vec<TxDetail>> {
        // Yield so cooperative pauses can interleave with a running scan.
        tokio::task::yield_now().await;
        let chain = self.chain.lock().unwrap();
        let txids = chain.script_history.get(script_hash).cloned().unwrap_or_default();
        Ok(txids.iter().filter_map(|t| chain.txs.get(t)).map(MockTx::detail).collect())
    }

    async fn get_mempool(&self, script_hash: &str) -> ProviderResult<Vec<TxDetail>> {
        let chain = self.chain.lock().unwrap();
        let txids = chain.script_history.get(script_hash).cloned().unwrap_or_default();
        Ok(txids
            .iter()
            .filter_map(|t| chain.txs.get(t))
            .filter(|tx| tx.height == 0)
            .map(MockTx::detail)
            .collect())
    }

    async fn get_balance(&self, script_hash: &str) -> ProviderResult<ScriptBalance> {
        let chain = self.chain.lock().unwrap();
        let mut confirmed: i64 = 0;
        let mut unconfirmed: i64 = 0;
        for tx in chain.txs.values() {
            let mined = tx.height > 0;
            for output in &tx.outputs {
                if output.script_hash.as_deref() == Some(script_hash) {
                    if mined {
                        confirmed += output.value as i64;
                    } else {
                        unconfirmed += output.value as i64;
                    }
                }
            }
            for input in &tx.inputs {
                let Some(prev) = chain.txs.get(&input.prev_txid) else {
                    continue;
                };
                let Some(prev_out) =
                    prev.outputs.iter().find(|o| o.index == input.prev_vout)
                else {
                    continue;
                };
                if prev_out.script_hash.as_deref() == Some(script_hash) {
                    if mined {
                        confirmed -= prev_out.value as i64;
                    } else {
                        unconfirmed -= prev_out.value as i64;
                    }
                }
            }
        }
        Ok(ScriptBalance {
            confirmed: confirmed.max(0) as u64,
            unconfirmed,
        })
    }

    async fn get_transaction(&self, txid: &Txid, _use_cache: bool) -> ProviderResult<TxDetail> {
        self.chain
            .lock()
            .unwrap()
            .txs
            .get(txid)
            .map(MockTx::detail)
            .ok_or_else(|| ProviderError::Rpc(format!("unknown transaction {}", txid)))
    }

    async fn broadcast(&self, hex: &str) -> ProviderResult<Txid> {
        let mut chain = self.chain.lock().unwrap();
        if let Some(message) = chain.fail_next_broadcast.take() {
            return Err(ProviderError::Rpc(message));
        }

        let bytes =
            hex::decode(hex).map_err(|e| ProviderError::Rpc(format!("bad hex: {}", e)))?;
        let tx: Transaction = bitcoin::consensus::encode::deserialize(&bytes)
            .map_err(|e| ProviderError::Rpc(format!("bad transaction: {}", e)))?;
        let txid = tx.compute_txid();

        let mut inputs = Vec::new();
        let mut touched = Vec::new();
        for input in &tx.input {
            let prev = chain.txs.get(&input.previous_output.txid);
            let prev_out = prev.and_then(|p| {
                p.outputs.iter().find(|o| o.index == input.previous_output.vout)
            });
            if let Some(prev_out) = prev_out {
                if let Some(script_hash) = &prev_out.script_hash {
                    touched.push(script_hash.clone());
                }
                inputs.push(TxInput {
                    prev_txid: input.previous_output.txid,
                    prev_vout: input.previous_output.vout,
                    address: prev_out.address.clone(),
                    value: prev_out.value,
                });
            } else {
                inputs.push(TxInput {
                    prev_txid: input.previous_output.txid,
                    prev_vout: input.previous_output.vout,
                    address: None,
                    value: 0,
                });
            }
        }

        let mut outputs = Vec::new();
        for (index, output) in tx.output.iter().enumerate() {
            let script_hash = script_hash_hex(&output.script_pubkey);
            let address = Address::from_script(&output.script_pubkey, self.network)
                .map(|a| a.to_string())
                .ok();
            touched.push(script_hash.clone());
            outputs.push(MockOutput {
                index: index as u32,
                address,
                value: output.value.to_sat(),
                script_hash: Some(script_hash),
            });
        }

        let mock_tx = MockTx {
            txid,
            hex: hex.to_string(),
            vsize: tx.vsize(),
            height: 0,
            inputs,
            outputs,
        };
        for script_hash in touched {
            chain.register(&script_hash, txid);
        }
        chain.txs.insert(txid, mock_tx);
        chain.broadcasts.push(hex.to_string());
        Ok(txid)
    }

    async fn ping(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn clear_cache(&self) -> ProviderResult<()> {
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderNotification>> {
        self.notif_rx.lock().ok()?.take()
    }
}

pub struct Fixture {
    pub provider: Arc<MockProvider>,
    pub manager: SyncManager<MockProvider>,
    pub deriver: KeyDeriver,
}

/// A regtest wallet with a small gap limit against a fresh mock chain.
pub async fn fixture_at_height(height: u32, gap_limit: u32) -> Fixture {
    let network = Network::Regtest;
    let config = Config::with_network(network).with_gap_limit(gap_limit);
    let provider = Arc::new(MockProvider::new(network, height));
    let backend = Arc::new(MemoryStore::new());
    let deriver = KeyDeriver::from_mnemonic(MNEMONIC, "", network).unwrap();
    let manager = SyncManager::open(
        config,
        Arc::clone(&provider),
        btc_wallet::storage::StoreHandle::new(backend),
        KeyDeriver::from_mnemonic(MNEMONIC, "", network).unwrap(),
    )
    .await
    .unwrap();
    Fixture {
        provider,
        manager,
        deriver,
    }
}

/// Derived address for a path on the fixture wallet's seed.
pub fn derive(deriver: &KeyDeriver, chain: btc_keys::Chain, index: u32) -> DerivedAddress {
    deriver.derive(&btc_keys::HdPath::new(Network::Regtest, chain, index)).unwrap()
}
