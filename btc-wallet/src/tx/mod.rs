//! Transaction construction: fee model and the P2WPKH builder.

pub mod builder;
pub mod fee;

pub use builder::TxBuilder;
pub use fee::{estimate_vsize, FeeRate, DUST_LIMIT};
