//! Wallet accounting: per-address ledgers, the live UTXO set and the
//! aggregate balance.

pub mod address_store;
pub mod balance;
pub mod unspent;
pub mod watch;

pub use address_store::{AddressRecord, AddressStore, StateBuckets, TxLogChange};
pub use balance::TotalBalance;
pub use unspent::{Reservation, SelectionStrategy, UnspentStore};
pub use watch::AddressWatch;
