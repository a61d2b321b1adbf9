//! Fixed-point satoshi arithmetic with display units.
//!
//! All wallet math happens in base units (satoshi). The `main` unit (BTC)
//! exists only at the API boundary: parsing caller-supplied amounts and
//! rendering balances. Conversions from base to main are lossless.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

/// Satoshis per BTC.
pub const SATS_PER_MAIN: u64 = 100_000_000;

/// Upper bound on any amount (21 million BTC).
pub const MAX_MONEY: u64 = 21_000_000 * SATS_PER_MAIN;

/// Unit tag for caller-facing amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// BTC, 1e8 satoshi.
    Main,
    /// Satoshi.
    Base,
}

impl FromStr for Unit {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(Unit::Main),
            "base" => Ok(Unit::Base),
            other => Err(KeyError::InvalidAmount(format!("unknown unit: {}", other))),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Main => write!(f, "main"),
            Unit::Base => write!(f, "base"),
        }
    }
}

/// A non-negative wallet amount, stored in satoshi.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Currency {
    sats: u64,
}

impl Currency {
    pub const ZERO: Currency = Currency {
        sats: 0,
    };

    /// Construct from base units.
    pub fn from_sat(sats: u64) -> Self {
        Self {
            sats,
        }
    }

    /// Construct from a numeric value in the given unit.
    ///
    /// Main-unit values are rounded to the nearest satoshi; negative,
    /// non-finite or out-of-range values are rejected.
    pub fn with_unit(value: f64, unit: Unit) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(KeyError::InvalidAmount(format!("not a valid amount: {}", value)));
        }
        let sats = match unit {
            Unit::Base => {
                if value.fract() != 0.0 {
                    return Err(KeyError::InvalidAmount(
                        "base amounts must be whole satoshi".into(),
                    ));
                }
                value as u64
            }
            Unit::Main => (value * SATS_PER_MAIN as f64).round() as u64,
        };
        if sats > MAX_MONEY {
            return Err(KeyError::InvalidAmount(format!("amount exceeds max money: {}", sats)));
        }
        Ok(Self {
            sats,
        })
    }

    /// Parse a decimal main-unit string without going through floats.
    pub fn from_main_str(s: &str) -> Result<Self> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(KeyError::InvalidAmount(format!("empty amount: {:?}", s)));
        }
        if frac_part.len() > 8 {
            return Err(KeyError::InvalidAmount(format!("sub-satoshi precision: {}", s)));
        }
        let whole: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| KeyError::InvalidAmount(format!("bad integer part: {}", s)))?
        };
        let mut frac: u64 = if frac_part.is_empty() {
            0
        } else {
            frac_part
                .parse()
                .map_err(|_| KeyError::InvalidAmount(format!("bad fraction part: {}", s)))?
        };
        for _ in frac_part.len()..8 {
            frac *= 10;
        }
        let sats = whole
            .checked_mul(SATS_PER_MAIN)
            .and_then(|w| w.checked_add(frac))
            .filter(|&v| v <= MAX_MONEY)
            .ok_or_else(|| KeyError::InvalidAmount(format!("amount out of range: {}", s)))?;
        Ok(Self {
            sats,
        })
    }

    /// Value in base units.
    pub fn to_sat(self) -> u64 {
        self.sats
    }

    /// Lossless main-unit rendering, always 8 decimal places.
    pub fn to_main_string(self) -> String {
        format!("{}.{:08}", self.sats / SATS_PER_MAIN, self.sats % SATS_PER_MAIN)
    }

    pub fn checked_add(self, other: Currency) -> Option<Currency> {
        self.sats.checked_add(other.sats).map(Currency::from_sat)
    }

    pub fn checked_sub(self, other: Currency) -> Option<Currency> {
        self.sats.checked_sub(other.sats).map(Currency::from_sat)
    }

    pub fn saturating_sub(self, other: Currency) -> Currency {
        Currency::from_sat(self.sats.saturating_sub(other.sats))
    }

    pub fn is_zero(self) -> bool {
        self.sats == 0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.sats)
    }
}

impl core::iter::Sum for Currency {
    fn sum<I: Iterator<Item = Currency>>(iter: I) -> Self {
        Currency::from_sat(iter.map(|c| c.sats).sum())
    }
}
