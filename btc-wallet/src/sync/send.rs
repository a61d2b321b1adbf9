//! The spend pipeline.
//!
//! Validates the destination, reserves coins, derives change, builds and
//! signs the witness transaction, broadcasts it and arranges the mempool
//! observation. Broadcast failure releases the reservation.

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Transaction};
use tokio::sync::oneshot;

use btc_keys::{Chain, Currency, DerivedAddress, Unit};

use crate::error::{BuildError, ProviderError, Result, WalletError};
use crate::provider::Provider;
use crate::sync::SyncManager;
use crate::tx::fee::{estimate_vsize, FeeRate, DUST_LIMIT};
use crate::tx::TxBuilder;
use crate::types::SendRecord;
use crate::wallet::{Reservation, SelectionStrategy};

/// Parameters for [`SyncManager::send`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Destination address (bech32, validated against the network).
    pub address: String,
    /// Amount in `unit`.
    pub amount: f64,
    pub unit: Unit,
    /// Fee rate in satoshi per virtual byte.
    pub fee_rate: u64,
    /// Pay the fee out of the destination amount instead of on top.
    pub deduct_fee: bool,
}

/// A broadcast-accepted spend awaiting mempool observation.
///
/// [`SyncManager::send`] resolves once the node accepted the broadcast;
/// [`PendingSend::mempool_seen`] resolves once the provider's mempool
/// notification confirmed ingestion.
pub struct PendingSend {
    pub record: SendRecord,
    seen: oneshot::Receiver<()>,
}

impl std::fmt::Debug for PendingSend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSend").field("record", &self.record).finish()
    }
}

impl PendingSend {
    pub fn record(&self) -> &SendRecord {
        &self.record
    }

    /// Wait until the transaction was observed in the provider's mempool.
    pub async fn mempool_seen(self) -> Result<SendRecord> {
        self.seen
            .await
            .map_err(|_| WalletError::Provider(ProviderError::ChannelClosed))?;
        Ok(self.record)
    }
}

struct SpendParts {
    tx: Transaction,
    /// Fee actually paid (includes dust absorbed into it).
    fee: u64,
    dest_value: u64,
    change_value: Option<u64>,
}

impl<P: Provider> SyncManager<P> {
    /// Build, sign and broadcast a payment.
    pub async fn send(&mut self, options: SendOptions) -> Result<PendingSend> {
        let dest = options
            .address
            .parse::<Address<NetworkUnchecked>>()
            .map_err(|e| BuildError::InvalidAddress(format!("{}: {}", options.address, e)))?
            .require_network(self.config.network)
            .map_err(|_| BuildError::InvalidNetwork(options.address.clone()))?;

        let amount = Currency::with_unit(options.amount, options.unit)?.to_sat();
        if amount < DUST_LIMIT {
            return Err(BuildError::DustOutput {
                amount,
            }
            .into());
        }
        let fee_rate = FeeRate::from_sat_per_vb(options.fee_rate);

        let reservation = self
            .unspent
            .get_utxo_for_amount(amount, fee_rate, SelectionStrategy::default())
            .map_err(WalletError::Build)?;

        // Fresh internal address; also subscribes it so the wallet hears
        // about the change output entering the mempool.
        let change = match self.get_new_address(Chain::Internal).await {
            Ok(change) => change,
            Err(e) => {
                self.unspent.unlock(&reservation);
                return Err(e);
            }
        };

        let parts = match self.build_spend(
            &reservation,
            &dest,
            amount,
            fee_rate,
            options.deduct_fee,
            &change,
        ) {
            Ok(parts) => parts,
            Err(e) => {
                self.unspent.unlock(&reservation);
                return Err(e.into());
            }
        };

        let txid = parts.tx.compute_txid();
        let hex = bitcoin::consensus::encode::serialize_hex(&parts.tx);

        let echoed = match self.provider.broadcast(&hex).await {
            Ok(echoed) => echoed,
            Err(e) => {
                self.unspent.unlock(&reservation);
                return Err(BuildError::Broadcast(e.to_string()).into());
            }
        };
        let is_valid = echoed == txid;
        if !is_valid {
            tracing::warn!("Broadcast echoed {} for our {}", echoed, txid);
        }

        let seen = self.watch_tx_mempool(txid);

        let mut from_addresses = Vec::new();
        for utxo in &reservation.utxos {
            if !from_addresses.contains(&utxo.address) {
                from_addresses.push(utxo.address.clone());
            }
        }
        let record = SendRecord {
            txid,
            vsize: parts.tx.vsize(),
            hex,
            fee_rate: options.fee_rate,
            fee: parts.fee,
            utxos: reservation.utxos.iter().map(|u| u.key()).collect(),
            vout_values: parts.tx.output.iter().map(|o| o.value.to_sat()).collect(),
            change_address: parts.change_value.map(|_| change.address.to_string()),
            total_spent: parts.dest_value + parts.fee,
            is_valid,
            to_addresses: vec![dest.to_string()],
            from_addresses,
            amount: parts.dest_value,
        };
        self.addresses.add_sent_tx(record.clone()).await?;
        tracing::info!(
            "Broadcast {}: {} sat to {}, fee {} sat",
            txid,
            record.amount,
            dest,
            record.fee
        );

        Ok(PendingSend {
            record,
            seen,
        })
    }

    /// Construct and sign the spend, iterating the fee until the rate
    /// implied by the real signed vsize is covered.
    fn build_spend(
        &self,
        reservation: &Reservation,
        dest: &Address,
        amount: u64,
        fee_rate: FeeRate,
        deduct_fee: bool,
        change: &DerivedAddress,
    ) -> std::result::Result<SpendParts, BuildError> {
        let total = reservation.total;
        let mut fee = fee_rate.fee_for(estimate_vsize(reservation.utxos.len(), 2));

        for _ in 0..4 {
            let (dest_value, change_value) = if deduct_fee {
                let dest_value =
                    amount.checked_sub(fee).ok_or(BuildError::InsufficientFunds {
                        available: amount,
                        required: fee,
                    })?;
                (dest_value, total.saturating_sub(amount))
            } else {
                let change_value =
                    total.checked_sub(amount + fee).ok_or(BuildError::InsufficientFunds {
                        available: total,
                        required: amount + fee,
                    })?;
                (amount, change_value)
            };
            if dest_value < DUST_LIMIT {
                return Err(BuildError::DustOutput {
                    amount: dest_value,
                });
            }
            let include_change = change_value >= DUST_LIMIT;

            let mut builder = TxBuilder::new();
            for utxo in &reservation.utxos {
                let (secret_key, public_key) = self
                    .hd
                    .deriver()
                    .keypair(&utxo.path)
                    .map_err(|e| BuildError::Signing(e.to_string()))?;
                builder = builder.add_input(utxo.clone(), secret_key, public_key);
            }
            builder = builder.add_output(dest.clone(), dest_value);
            if include_change {
                builder = builder.add_output(change.address.clone(), change_value);
            }
            let tx = builder.build_signed()?;

            let required = fee_rate.fee_for(tx.vsize());
            if required > fee {
                fee = required;
                continue;
            }

            let outputs_sum: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
            return Ok(SpendParts {
                fee: total - outputs_sum,
                tx,
                dest_value,
                change_value: include_change.then_some(change_value),
            });
        }

        Err(BuildError::FeeEstimation(
            "fee did not stabilise against transaction size".into(),
        ))
    }
}
