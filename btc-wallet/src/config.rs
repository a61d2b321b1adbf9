//! Configuration for the wallet client.

use bitcoin::Network;

use crate::error::{Result, WalletError};

/// Default empty-address lookahead for account scans.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Default depth at which an output is considered confirmed.
pub const DEFAULT_MIN_BLOCK_CONFIRM: u32 = 1;

/// Default size of the per-chain script-hash subscription ring.
pub const DEFAULT_MAX_SCRIPT_WATCH: usize = 10;

/// Wallet configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network the wallet operates on.
    pub network: Network,

    /// Consecutive unused addresses scanned before a chain is exhausted.
    pub gap_limit: u32,

    /// Depth required to reach the confirmed state.
    pub min_block_confirm: u32,

    /// Bounded per-chain subscription ring size.
    pub max_script_watch: usize,
}

impl Config {
    /// Build a configuration for the named network. Accepts
    /// `regtest`, `testnet`, `signet`, `mainnet` and `bitcoin`.
    pub fn new(network: &str) -> Result<Self> {
        Ok(Self {
            network: parse_network(network)?,
            gap_limit: DEFAULT_GAP_LIMIT,
            min_block_confirm: DEFAULT_MIN_BLOCK_CONFIRM,
            max_script_watch: DEFAULT_MAX_SCRIPT_WATCH,
        })
    }

    pub fn with_network(network: Network) -> Self {
        Self {
            network,
            gap_limit: DEFAULT_GAP_LIMIT,
            min_block_confirm: DEFAULT_MIN_BLOCK_CONFIRM,
            max_script_watch: DEFAULT_MAX_SCRIPT_WATCH,
        }
    }

    pub fn with_gap_limit(mut self, gap_limit: u32) -> Self {
        self.gap_limit = gap_limit;
        self
    }

    pub fn with_min_block_confirm(mut self, depth: u32) -> Self {
        self.min_block_confirm = depth;
        self
    }

    pub fn with_max_script_watch(mut self, size: usize) -> Self {
        self.max_script_watch = size;
        self
    }

    /// Check the configuration for nonsensical values.
    pub fn validate(&self) -> Result<()> {
        if self.gap_limit == 0 {
            return Err(WalletError::Config("gap_limit must be at least 1".into()));
        }
        if self.max_script_watch == 0 {
            return Err(WalletError::Config("max_script_watch must be at least 1".into()));
        }
        Ok(())
    }
}

/// Parse a network name as accepted at construction.
pub fn parse_network(name: &str) -> Result<Network> {
    match name {
        "regtest" => Ok(Network::Regtest),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        other => Err(WalletError::Config(format!("unknown network: {}", other))),
    }
}
