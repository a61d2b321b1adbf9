//! Witness transaction construction and BIP143 signing.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::error::{BuildError, BuildResult};
use crate::types::Utxo;

/// Builder for a P2WPKH spend. Inputs carry the key material needed for
/// their BIP143 signatures; outputs are plain `(address, value)` pairs in
/// final order.
pub struct TxBuilder {
    secp: Secp256k1<All>,
    inputs: Vec<(Utxo, SecretKey, CompressedPublicKey)>,
    outputs: Vec<(Address, u64)>,
}

impl TxBuilder {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn add_input(
        mut self,
        utxo: Utxo,
        secret_key: SecretKey,
        public_key: CompressedPublicKey,
    ) -> Self {
        self.inputs.push((utxo, secret_key, public_key));
        self
    }

    pub fn add_output(mut self, address: Address, value: u64) -> Self {
        self.outputs.push((address, value));
        self
    }

    /// Build the unsigned transaction.
    pub fn unsigned(&self) -> BuildResult<Transaction> {
        if self.inputs.is_empty() {
            return Err(BuildError::Signing("no inputs".into()));
        }
        if self.outputs.is_empty() {
            return Err(BuildError::Signing("no outputs".into()));
        }

        let input: Vec<TxIn> = self
            .inputs
            .iter()
            .map(|(utxo, _, _)| TxIn {
                previous_output: OutPoint {
                    txid: utxo.txid,
                    vout: utxo.vout,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect();

        let output: Vec<TxOut> = self
            .outputs
            .iter()
            .map(|(address, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: address.script_pubkey(),
            })
            .collect();

        Ok(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        })
    }

    /// Build and sign every input with its segwit v0 sighash.
    pub fn build_signed(&self) -> BuildResult<Transaction> {
        let mut tx = self.unsigned()?;

        let mut witnesses = Vec::with_capacity(self.inputs.len());
        {
            let mut cache = SighashCache::new(&tx);
            for (index, (utxo, secret_key, public_key)) in self.inputs.iter().enumerate() {
                let script_bytes = hex::decode(&utxo.script_hex)
                    .map_err(|e| BuildError::Signing(format!("bad input script hex: {}", e)))?;
                let script_pubkey = ScriptBuf::from_bytes(script_bytes);

                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &script_pubkey,
                        Amount::from_sat(utxo.value),
                        EcdsaSighashType::All,
                    )
                    .map_err(|e| BuildError::Signing(format!("sighash failed: {}", e)))?;

                let message = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: self.secp.sign_ecdsa(&message, secret_key),
                    sighash_type: EcdsaSighashType::All,
                };
                witnesses.push(Witness::p2wpkh(&signature, &public_key.0));
            }
        }

        for (index, witness) in witnesses.into_iter().enumerate() {
            tx.input[index].witness = witness;
        }
        Ok(tx)
    }
}

impl Default for TxBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::fee::estimate_vsize;
    use bitcoin::{Network, Txid};
    use btc_keys::{Chain, HdPath, KeyDeriver};

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn funded_input(deriver: &KeyDeriver, index: u32, value: u64) -> (Utxo, SecretKey, CompressedPublicKey) {
        let path = HdPath::new(Network::Regtest, Chain::External, index);
        let derived = deriver.derive(&path).unwrap();
        let (secret_key, public_key) = deriver.keypair(&path).unwrap();
        let utxo = Utxo {
            txid: Txid::all_zeros(),
            vout: index,
            value,
            address: derived.address.to_string(),
            public_key: public_key.to_string(),
            path,
            script_hex: hex::encode(derived.script_pubkey.as_bytes()),
            state: crate::types::TxState::Confirmed,
            locked: true,
        };
        (utxo, secret_key, public_key)
    }

    fn dest(deriver: &KeyDeriver) -> Address {
        deriver.derive(&HdPath::new(Network::Regtest, Chain::External, 50)).unwrap().address
    }

    #[test]
    fn test_signed_tx_shape() {
        let deriver = KeyDeriver::from_mnemonic(MNEMONIC, "", Network::Regtest).unwrap();
        let (utxo, sk, pk) = funded_input(&deriver, 0, 100_000);
        let change = deriver.derive(&HdPath::new(Network::Regtest, Chain::Internal, 0)).unwrap();

        let tx = TxBuilder::new()
            .add_input(utxo, sk, pk)
            .add_output(dest(&deriver), 40_000)
            .add_output(change.address, 58_000)
            .build_signed()
            .unwrap();

        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value.to_sat(), 40_000);
        assert_eq!(tx.output[1].value.to_sat(), 58_000);
        // Witness carries signature + pubkey.
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_vsize_close_to_estimate() {
        let deriver = KeyDeriver::from_mnemonic(MNEMONIC, "", Network::Regtest).unwrap();
        let (utxo, sk, pk) = funded_input(&deriver, 0, 100_000);
        let change = deriver.derive(&HdPath::new(Network::Regtest, Chain::Internal, 0)).unwrap();

        let tx = TxBuilder::new()
            .add_input(utxo, sk, pk)
            .add_output(dest(&deriver), 40_000)
            .add_output(change.address, 58_000)
            .build_signed()
            .unwrap();

        // DER signatures vary by a byte; the estimate is an upper bound
        // within a small tolerance.
        let estimate = estimate_vsize(1, 2);
        assert!(tx.vsize() <= estimate);
        assert!(tx.vsize() >= estimate - 2);
    }

    #[test]
    fn test_empty_builder_rejected() {
        assert!(TxBuilder::new().unsigned().is_err());
    }
}
