//! Electrum-backed Bitcoin payment wallet core.
//!
//! This library keeps a consistent local view of a BIP84 wallet against a
//! remote full-index provider:
//!
//! - gap-limit account scans over the external and internal chains
//! - per-address ledgers with a three-state output lifecycle
//!   (mempool, pending, confirmed)
//! - a live UTXO set with atomic reservations for spending
//! - a transaction builder that selects coins, returns change, signs,
//!   broadcasts and observes mempool ingestion
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use btc_keys::KeyDeriver;
//! use btc_wallet::provider::ElectrumProvider;
//! use btc_wallet::storage::MemoryStore;
//! use btc_wallet::{Config, SyncOptions, WalletClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("regtest")?;
//!     let deriver = KeyDeriver::from_mnemonic("abandon ...", "", config.network)?;
//!     let provider = Arc::new(ElectrumProvider::connect("127.0.0.1:50001").await?);
//!     let backend = Arc::new(MemoryStore::new());
//!
//!     let mut wallet = WalletClient::open(config, provider, backend, deriver).await?;
//!     wallet.manager_mut().sync_account(SyncOptions::default()).await?;
//!     println!("balance: {:?}", wallet.manager().get_balance(None)?);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod provider;
pub mod storage;
pub mod sync;
pub mod tx;
pub mod types;
pub mod wallet;

pub use client::WalletClient;
pub use config::Config;
pub use error::{
    BuildError, ProviderError, Result, StorageError, SyncError, WalletError,
};
pub use logging::init_console_logging;
pub use sync::{
    PendingSend, SendOptions, SyncControl, SyncManager, SyncOptions, TransactionQuery,
};
pub use types::{
    Balance, Direction, OutputMeta, SendRecord, TxEntry, TxState, Utxo, WalletEvent,
};

// Re-export the primitive types used across the public surface.
pub use bitcoin::{Network, OutPoint, Txid};
pub use btc_keys::{Chain, Currency, HdPath, KeyDeriver, Unit};

/// Current version of the wallet library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
