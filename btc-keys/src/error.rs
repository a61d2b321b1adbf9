//! Error types for key derivation and amount handling.

use thiserror::Error;

/// Errors surfaced by the key and amount primitives.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(#[from] bip39::Error),

    #[error("Derivation error: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Type alias for Result with KeyError.
pub type Result<T> = std::result::Result<T, KeyError>;
