//! Key material and HD derivation for the wallet.
//!
//! This crate holds everything that can be computed from a seed alone:
//! satoshi arithmetic with display units, BIP84 derivation paths, the
//! key deriver that maps a path to an address and its provider
//! script-hash, and the gap-limit-aware HD wallet cursor.

pub mod amount;
pub mod deriver;
pub mod error;
pub mod hd_wallet;
pub mod path;

pub use amount::{Currency, Unit};
pub use deriver::{script_hash_hex, DerivedAddress, KeyDeriver};
pub use error::{KeyError, Result};
pub use hd_wallet::{ChainSyncState, HdSyncState, HdWallet, ScanSignal};
pub use path::{Chain, HdPath, ACCOUNT_INDEX, BIP84_PURPOSE};

// Re-export the primitives callers need to talk to this crate.
pub use bitcoin::{Address, Network};
