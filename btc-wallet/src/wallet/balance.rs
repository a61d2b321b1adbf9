//! Wallet-wide aggregate balance.

use crate::error::Result;
use crate::storage::StoreHandle;
use crate::types::{Balance, TxState};

const BALANCE_KEY: &str = "total_balance";

/// Persisted sum of every address ledger, per lifecycle state.
///
/// Kept in lockstep with the ledgers by the sync core: every ledger
/// mutation applies the same signed delta here.
pub struct TotalBalance {
    store: StoreHandle,
    balance: Balance,
}

impl TotalBalance {
    pub async fn open(store: StoreHandle) -> Result<Self> {
        let balance = store.get_json(BALANCE_KEY).await?.unwrap_or_default();
        Ok(Self {
            store,
            balance,
        })
    }

    pub fn get(&self) -> Balance {
        self.balance
    }

    /// Apply a signed satoshi delta to one state and persist.
    pub async fn apply(&mut self, state: TxState, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.balance.apply(state, delta);
        self.store.set_json(BALANCE_KEY, &self.balance).await?;
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<()> {
        self.balance = Balance::default();
        self.store.set_json(BALANCE_KEY, &self.balance).await?;
        Ok(())
    }
}
