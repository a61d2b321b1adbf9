//! Error types for the wallet client.

use std::io;
use thiserror::Error;

/// Main error type for the wallet.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Build error: {0}")]
    Build(#[from] BuildError),

    #[error("Key error: {0}")]
    Key(#[from] btc_keys::KeyError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wallet is not ready")]
    NotReady,
}

/// Errors from the history provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider RPC error: {0}")]
    Rpc(String),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Malformed response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Response channel closed")]
    ChannelClosed,
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Synchronization-related errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync already in progress")]
    SyncInProgress,

    #[error("Unknown address: {0}")]
    AddressUnknown(String),
}

/// Transaction-building errors.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Insufficient funds: {available} sat available, {required} sat required")]
    InsufficientFunds {
        available: u64,
        required: u64,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address is for the wrong network: {0}")]
    InvalidNetwork(String),

    #[error("Output below dust limit: {amount} sat")]
    DustOutput {
        amount: u64,
    },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Fee estimation failed: {0}")]
    FeeEstimation(String),

    #[error("Broadcast rejected: {0}")]
    Broadcast(String),
}

/// Type alias for Result with WalletError.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Type alias for provider operation results.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for build operation results.
pub type BuildResult<T> = std::result::Result<T, BuildError>;
