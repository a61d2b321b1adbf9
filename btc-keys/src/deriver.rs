//! Path-to-address derivation.
//!
//! The deriver owns the master key and maps a [`HdPath`] to the triple the
//! rest of the wallet works with: the bech32 address, its output script,
//! and the provider's index key (sha256 of the script, byte-reversed hex).

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Address, Network, Script, ScriptBuf};

use crate::error::Result;
use crate::path::HdPath;

/// Everything derived from one path.
#[derive(Debug, Clone)]
pub struct DerivedAddress {
    pub address: Address,
    pub path: HdPath,
    pub public_key: CompressedPublicKey,
    pub script_pubkey: ScriptBuf,
    /// The provider's index key for this address.
    pub script_hash: String,
}

/// sha256 of an output script, byte-reversed hex.
pub fn script_hash_hex(script: &Script) -> String {
    let mut digest = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    digest.reverse();
    hex::encode(digest)
}

/// BIP32/BIP84 key deriver rooted at a master key.
pub struct KeyDeriver {
    secp: Secp256k1<All>,
    master: Xpriv,
    network: Network,
}

impl KeyDeriver {
    /// Build from a BIP39 mnemonic phrase.
    pub fn from_mnemonic(phrase: &str, passphrase: &str, network: Network) -> Result<Self> {
        let mnemonic = bip39::Mnemonic::parse_normalized(phrase)?;
        let seed = mnemonic.to_seed_normalized(passphrase);
        Self::from_seed(&seed, network)
    }

    /// Build from a raw seed.
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        let master = Xpriv::new_master(network, seed)?;
        Ok(Self {
            secp: Secp256k1::new(),
            master,
            network,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Derive address, script and script-hash for a path.
    pub fn derive(&self, path: &HdPath) -> Result<DerivedAddress> {
        let (_, public_key) = self.keypair(path)?;
        let address = Address::p2wpkh(&public_key, self.network);
        let script_pubkey = address.script_pubkey();
        let script_hash = script_hash_hex(&script_pubkey);
        Ok(DerivedAddress {
            address,
            path: *path,
            public_key,
            script_pubkey,
            script_hash,
        })
    }

    /// The signing keypair for a path.
    pub fn keypair(&self, path: &HdPath) -> Result<(SecretKey, CompressedPublicKey)> {
        let child = self.master.derive_priv(&self.secp, &path.derivation_path()?)?;
        let xpub = Xpub::from_priv(&self.secp, &child);
        Ok((child.private_key, CompressedPublicKey(xpub.public_key)))
    }

    /// Shortcut used by the path scan: only the provider index key.
    pub fn path_to_script_hash(&self, path: &HdPath) -> Result<String> {
        Ok(self.derive(path)?.script_hash)
    }
}
