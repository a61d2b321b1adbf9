//! BIP84 derivation paths.
//!
//! Every wallet key lives at `m/84'/coin_type'/0'/chain/index`, where
//! `chain` 0 is the external (receive) chain and 1 the internal (change)
//! chain. Only account 0 is supported.

use core::fmt;
use core::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

/// BIP84 purpose level (native SegWit).
pub const BIP84_PURPOSE: u32 = 84;

/// The single supported account.
pub const ACCOUNT_INDEX: u32 = 0;

/// Address chain within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Receive addresses.
    External,
    /// Change addresses.
    Internal,
}

impl Chain {
    pub fn as_u32(self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Chain::External),
            1 => Ok(Chain::Internal),
            other => Err(KeyError::InvalidPath(format!("chain must be 0 or 1, got {}", other))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Chain::External => "ext",
            Chain::Internal => "in",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SLIP44 coin type for a network: 0 on mainnet, 1 on every test network.
pub fn coin_type_for(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// A fully-qualified BIP84 path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HdPath {
    pub coin_type: u32,
    pub chain: Chain,
    pub index: u32,
}

impl HdPath {
    pub fn new(network: Network, chain: Chain, index: u32) -> Self {
        Self {
            coin_type: coin_type_for(network),
            chain,
            index,
        }
    }

    /// The path as bitcoin's `DerivationPath`.
    pub fn derivation_path(&self) -> Result<DerivationPath> {
        let components = vec![
            ChildNumber::from_hardened_idx(BIP84_PURPOSE)?,
            ChildNumber::from_hardened_idx(self.coin_type)?,
            ChildNumber::from_hardened_idx(ACCOUNT_INDEX)?,
            ChildNumber::from_normal_idx(self.chain.as_u32())?,
            ChildNumber::from_normal_idx(self.index)?,
        ];
        Ok(DerivationPath::from(components))
    }
}

impl fmt::Display for HdPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "m/{}'/{}'/{}'/{}/{}",
            BIP84_PURPOSE,
            self.coin_type,
            ACCOUNT_INDEX,
            self.chain.as_u32(),
            self.index
        )
    }
}

impl FromStr for HdPath {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || KeyError::InvalidPath(format!("not a BIP84 path: {}", s));
        let mut parts = s.split('/');
        if parts.next() != Some("m") {
            return Err(bad());
        }
        let hardened = |p: Option<&str>| -> Result<u32> {
            let p = p.ok_or_else(bad)?;
            let p = p.strip_suffix('\'').or_else(|| p.strip_suffix('h')).ok_or_else(bad)?;
            p.parse().map_err(|_| bad())
        };
        let normal = |p: Option<&str>| -> Result<u32> {
            p.ok_or_else(bad)?.parse().map_err(|_| bad())
        };

        let purpose = hardened(parts.next())?;
        let coin_type = hardened(parts.next())?;
        let account = hardened(parts.next())?;
        let chain = Chain::from_u32(normal(parts.next())?)?;
        let index = normal(parts.next())?;
        if parts.next().is_some() || purpose != BIP84_PURPOSE || account != ACCOUNT_INDEX {
            return Err(bad());
        }
        if coin_type > 1 {
            return Err(KeyError::InvalidPath(format!("unsupported coin type: {}", coin_type)));
        }
        Ok(HdPath {
            coin_type,
            chain,
            index,
        })
    }
}
