//! Electrum provider: line-delimited JSON-RPC 2.0 over TCP.
//!
//! Requests are matched to responses by numeric id; subscription pushes
//! arrive as method-named notifications. The client reconnects with linear
//! backoff and emits [`ProviderNotification::Reconnected`] so the wallet
//! can re-establish its subscriptions.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::Txid;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{
    Provider, ProviderNotification, ScriptBalance, TxDetail, TxInput, TxOutput,
};
use crate::storage::StoreHandle;

/// Maximum reconnection attempts before giving up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Base delay between reconnection attempts; attempt `n` waits `n` times this.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type PendingMap = HashMap<u64, oneshot::Sender<ProviderResult<Value>>>;

struct Inner {
    address: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    /// Last chain tip seen, used to turn confirmations into heights.
    tip: AtomicU32,
    notif_tx: mpsc::UnboundedSender<ProviderNotification>,
    notif_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ProviderNotification>>>,
    /// Script-hash history cache, `txid` with the height the server reported.
    history_cache: RwLock<HashMap<String, Vec<(Txid, i64)>>>,
    /// Raw verbose transactions by txid.
    tx_cache: RwLock<HashMap<Txid, Value>>,
    /// Optional write-through persistence for the history cache.
    cache_store: Option<StoreHandle>,
}

/// Electrum-protocol provider client.
pub struct ElectrumProvider {
    inner: Arc<Inner>,
}

impl ElectrumProvider {
    /// Connect to `host:port`, retrying with backoff.
    pub async fn connect(address: &str) -> ProviderResult<Self> {
        Self::connect_with_cache(address, None).await
    }

    /// Connect with a persistent history cache (the wallet hands in its
    /// `provider_cache` storage namespace).
    pub async fn connect_with_cache(
        address: &str,
        cache_store: Option<StoreHandle>,
    ) -> ProviderResult<Self> {
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            address: address.to_string(),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tip: AtomicU32::new(0),
            notif_tx,
            notif_rx: std::sync::Mutex::new(Some(notif_rx)),
            history_cache: RwLock::new(HashMap::new()),
            tx_cache: RwLock::new(HashMap::new()),
            cache_store,
        });
        Inner::establish(&inner).await?;
        Ok(Self {
            inner,
        })
    }
}

impl Inner {
    fn establish<'a>(
        inner: &'a Arc<Inner>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ProviderResult<()>> + Send + 'a>> {
        Box::pin(Self::establish_inner(inner))
    }

    async fn establish_inner(inner: &Arc<Inner>) -> ProviderResult<()> {
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            match TcpStream::connect(&inner.address).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    *inner.writer.lock().await = Some(writer);
                    let reader_inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        Inner::read_loop(reader_inner, reader).await;
                    });
                    tracing::info!("Connected to provider {}", inner.address);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Connection attempt {}/{} to {} failed: {}",
                        attempt,
                        MAX_RECONNECT_ATTEMPTS,
                        inner.address,
                        e
                    );
                    if attempt < MAX_RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(ProviderError::Unavailable(format!(
            "no connection to {} after {} attempts",
            inner.address, MAX_RECONNECT_ATTEMPTS
        )))
    }

    async fn read_loop(inner: Arc<Inner>, reader: OwnedReadHalf) {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => inner.dispatch_line(&line).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Provider read error: {}", e);
                    break;
                }
            }
        }

        *inner.writer.lock().await = None;
        inner.fail_pending().await;
        tracing::warn!("Connection to {} lost, reconnecting", inner.address);
        if Inner::establish(&inner).await.is_ok() {
            let _ = inner.notif_tx.send(ProviderNotification::Reconnected);
        } else {
            tracing::error!("Could not re-establish connection to {}", inner.address);
        }
    }

    async fn dispatch_line(&self, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Discarding unparsable provider message: {}", e);
                return;
            }
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if let Some(sender) = self.pending.lock().await.remove(&id) {
                let result = match value.get("error") {
                    Some(err) if !err.is_null() => Err(ProviderError::Rpc(err.to_string())),
                    _ => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = sender.send(result);
            }
            return;
        }

        let Some(method) = value.get("method").and_then(Value::as_str) else {
            return;
        };
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        match method {
            "blockchain.headers.subscribe" => {
                if let Some(height) =
                    params.get(0).and_then(|p| p.get("height")).and_then(Value::as_u64)
                {
                    self.tip.store(height as u32, Ordering::SeqCst);
                    let _ = self.notif_tx.send(ProviderNotification::NewBlock {
                        height: height as u32,
                    });
                }
            }
            "blockchain.scripthash.subscribe" => {
                let script_hash = params.get(0).and_then(Value::as_str).map(str::to_string);
                let status = params.get(1).and_then(Value::as_str).map(str::to_string);
                if let Some(script_hash) = script_hash {
                    let _ = self.notif_tx.send(ProviderNotification::ScriptHashChanged {
                        script_hash,
                        status,
                    });
                }
            }
            other => tracing::trace!("Ignoring notification {}", other),
        }
    }

    async fn fail_pending(&self) {
        for (_, sender) in self.pending.lock().await.drain() {
            let _ = sender.send(Err(ProviderError::NotConnected));
        }
    }

    async fn request(&self, method: &str, params: Value) -> ProviderResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let line = format!("{}\n", message);

        let write_result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) => writer.write_all(line.as_bytes()).await.map_err(Into::into),
                None => Err(ProviderError::NotConnected),
            }
        };
        if let Err(e) = write_result {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        rx.await.map_err(|_| ProviderError::ChannelClosed)?
    }

    /// History items `(txid, reported_height)` for a script-hash.
    async fn history_items(
        &self,
        script_hash: &str,
        use_cache: bool,
    ) -> ProviderResult<Vec<(Txid, i64)>> {
        if use_cache {
            if let Some(items) = self.history_cache.read().await.get(script_hash) {
                return Ok(items.clone());
            }
            if let Some(store) = &self.cache_store {
                if let Ok(Some(items)) =
                    store.get_json::<Vec<(Txid, i64)>>(&format!("history/{}", script_hash)).await
                {
                    self.history_cache.write().await.insert(script_hash.to_string(), items.clone());
                    return Ok(items);
                }
            }
        }

        let result =
            self.request("blockchain.scripthash.get_history", json!([script_hash])).await?;
        let items = parse_history_items(&result)?;

        self.history_cache.write().await.insert(script_hash.to_string(), items.clone());
        if let Some(store) = &self.cache_store {
            if let Err(e) = store.set_json(&format!("history/{}", script_hash), &items).await {
                tracing::debug!("History cache write failed: {}", e);
            }
        }
        Ok(items)
    }

    /// Raw verbose transaction, optionally served from cache.
    async fn verbose_transaction(&self, txid: &Txid, use_cache: bool) -> ProviderResult<Value> {
        if use_cache {
            if let Some(raw) = self.tx_cache.read().await.get(txid) {
                return Ok(raw.clone());
            }
        }
        let raw =
            self.request("blockchain.transaction.get", json!([txid.to_string(), true])).await?;
        self.tx_cache.write().await.insert(*txid, raw.clone());
        Ok(raw)
    }

    /// Turn a verbose transaction into the enriched detail, resolving each
    /// input's address and value from its previous transaction.
    async fn resolve_detail(
        &self,
        raw: &Value,
        height: u32,
        use_cache: bool,
    ) -> ProviderResult<TxDetail> {
        let txid = parse_txid(raw.get("txid").and_then(Value::as_str))?;
        let hex = raw.get("hex").and_then(Value::as_str).unwrap_or_default().to_string();
        let vsize = raw.get("vsize").and_then(Value::as_u64).unwrap_or(0) as usize;
        let outputs = parse_outputs(raw);

        let mut inputs = Vec::new();
        for vin in raw.get("vin").and_then(Value::as_array).into_iter().flatten() {
            if vin.get("coinbase").is_some() {
                continue;
            }
            let Ok(prev_txid) = parse_txid(vin.get("txid").and_then(Value::as_str)) else {
                continue;
            };
            let prev_vout = vin.get("vout").and_then(Value::as_u64).unwrap_or(0) as u32;

            let (address, value) = match self.verbose_transaction(&prev_txid, use_cache).await {
                Ok(prev) => {
                    let prev_outputs = parse_outputs(&prev);
                    prev_outputs
                        .into_iter()
                        .find(|o| o.index == prev_vout)
                        .map(|o| (o.address, o.value))
                        .unwrap_or((None, 0))
                }
                Err(e) => {
                    tracing::debug!("Could not resolve input {}:{}: {}", prev_txid, prev_vout, e);
                    (None, 0)
                }
            };
            inputs.push(TxInput {
                prev_txid,
                prev_vout,
                address,
                value,
            });
        }

        Ok(TxDetail {
            txid,
            hex,
            vsize,
            height,
            inputs,
            outputs,
        })
    }

    async fn details_for_items(
        &self,
        items: &[(Txid, i64)],
        use_cache: bool,
    ) -> ProviderResult<Vec<TxDetail>> {
        let mut details = Vec::with_capacity(items.len());
        for (txid, reported_height) in items {
            let height = (*reported_height).max(0) as u32;
            let raw = self.verbose_transaction(txid, use_cache).await?;
            details.push(self.resolve_detail(&raw, height, use_cache).await?);
        }
        Ok(details)
    }
}

#[async_trait::async_trait]
impl Provider for ElectrumProvider {
    async fn subscribe_headers(&self) -> ProviderResult<u32> {
        let result = self.inner.request("blockchain.headers.subscribe", json!([])).await?;
        let height = result
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProviderError::Rpc("headers.subscribe: no height".into()))?
            as u32;
        self.inner.tip.store(height, Ordering::SeqCst);
        Ok(height)
    }

    async fn subscribe_script_hash(&self, script_hash: &str) -> ProviderResult<Option<String>> {
        let result =
            self.inner.request("blockchain.scripthash.subscribe", json!([script_hash])).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn get_history(
        &self,
        script_hash: &str,
        use_cache: bool,
    ) -> ProviderResult<Vec<TxDetail>> {
        let items = self.inner.history_items(script_hash, use_cache).await?;
        self.inner.details_for_items(&items, use_cache).await
    }

    async fn get_mempool(&self, script_hash: &str) -> ProviderResult<Vec<TxDetail>> {
        let result =
            self.inner.request("blockchain.scripthash.get_mempool", json!([script_hash])).await?;
        let items = parse_history_items(&result)?;
        // Mempool data is never served from cache.
        self.inner.details_for_items(&items, false).await
    }

    async fn get_balance(&self, script_hash: &str) -> ProviderResult<ScriptBalance> {
        let result =
            self.inner.request("blockchain.scripthash.get_balance", json!([script_hash])).await?;
        Ok(ScriptBalance {
            confirmed: result.get("confirmed").and_then(Value::as_u64).unwrap_or(0),
            unconfirmed: result.get("unconfirmed").and_then(Value::as_i64).unwrap_or(0),
        })
    }

    async fn get_transaction(&self, txid: &Txid, use_cache: bool) -> ProviderResult<TxDetail> {
        let raw = self.inner.verbose_transaction(txid, use_cache).await?;
        let confirmations = raw.get("confirmations").and_then(Value::as_u64).unwrap_or(0);
        let tip = self.inner.tip.load(Ordering::SeqCst);
        let height = if confirmations >= 1 {
            (tip as u64 + 1).saturating_sub(confirmations) as u32
        } else {
            0
        };
        self.inner.resolve_detail(&raw, height, use_cache).await
    }

    async fn broadcast(&self, hex: &str) -> ProviderResult<Txid> {
        let result = self.inner.request("blockchain.transaction.broadcast", json!([hex])).await?;
        parse_txid(result.as_str())
    }

    async fn ping(&self) -> ProviderResult<()> {
        self.inner.request("server.ping", json!([])).await?;
        Ok(())
    }

    async fn clear_cache(&self) -> ProviderResult<()> {
        self.inner.history_cache.write().await.clear();
        self.inner.tx_cache.write().await.clear();
        if let Some(store) = &self.inner.cache_store {
            store.clear().await.map_err(|e| ProviderError::Rpc(e.to_string()))?;
        }
        Ok(())
    }

    fn take_notifications(&self) -> Option<mpsc::UnboundedReceiver<ProviderNotification>> {
        self.inner.notif_rx.lock().ok()?.take()
    }
}

fn parse_txid(s: Option<&str>) -> ProviderResult<Txid> {
    let s = s.ok_or_else(|| ProviderError::Rpc("missing txid".into()))?;
    Txid::from_str(s).map_err(|e| ProviderError::Rpc(format!("bad txid {}: {}", s, e)))
}

/// Parse a `get_history`/`get_mempool` result into `(txid, height)` pairs.
fn parse_history_items(result: &Value) -> ProviderResult<Vec<(Txid, i64)>> {
    let array = result
        .as_array()
        .ok_or_else(|| ProviderError::Rpc("history: expected array".into()))?;
    let mut items = Vec::with_capacity(array.len());
    for item in array {
        let txid = parse_txid(item.get("tx_hash").and_then(Value::as_str))?;
        let height = item.get("height").and_then(Value::as_i64).unwrap_or(0);
        items.push((txid, height));
    }
    Ok(items)
}

/// Outputs of a verbose transaction. BTC-denominated values are converted
/// to satoshi.
fn parse_outputs(raw: &Value) -> Vec<TxOutput> {
    let mut outputs = Vec::new();
    for vout in raw.get("vout").and_then(Value::as_array).into_iter().flatten() {
        let index = vout.get("n").and_then(Value::as_u64).unwrap_or(0) as u32;
        let value = vout.get("value").and_then(Value::as_f64).map(sats_from_btc).unwrap_or(0);
        let script = vout.get("scriptPubKey");
        let address = script
            .and_then(|s| s.get("address"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                script
                    .and_then(|s| s.get("addresses"))
                    .and_then(Value::as_array)
                    .and_then(|a| a.first())
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        outputs.push(TxOutput {
            index,
            address,
            value,
        });
    }
    outputs
}

fn sats_from_btc(value: f64) -> u64 {
    (value * 100_000_000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_history_items() {
        let result = json!([
            {"tx_hash": "0000000000000000000000000000000000000000000000000000000000000001", "height": 100},
            {"tx_hash": "0000000000000000000000000000000000000000000000000000000000000002", "height": 0},
        ]);
        let items = parse_history_items(&result).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].1, 100);
        assert_eq!(items[1].1, 0);
        assert!(parse_history_items(&json!({})).is_err());
    }

    #[test]
    fn test_parse_outputs() {
        let raw = json!({
            "vout": [
                {"n": 0, "value": 0.1, "scriptPubKey": {"address": "bcrt1qtest"}},
                {"n": 1, "value": 0.00000546, "scriptPubKey": {"addresses": ["bcrt1qother"]}},
                {"n": 2, "value": 0.0, "scriptPubKey": {}},
            ]
        });
        let outputs = parse_outputs(&raw);
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].value, 10_000_000);
        assert_eq!(outputs[0].address.as_deref(), Some("bcrt1qtest"));
        assert_eq!(outputs[1].value, 546);
        assert_eq!(outputs[1].address.as_deref(), Some("bcrt1qother"));
        assert_eq!(outputs[2].address, None);
    }

    #[test]
    fn test_sats_from_btc_rounding() {
        assert_eq!(sats_from_btc(0.1), 10_000_000);
        assert_eq!(sats_from_btc(0.00000001), 1);
        assert_eq!(sats_from_btc(20.99999999), 2_099_999_999);
    }
}
