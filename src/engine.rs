use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    path::PathBuf,
};

use bitcoin::{Amount, Denomination};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::{
    error::{EngineError, JournalError, PolicyError},
    journal::Journal,
    policy,
    traits::{Broadcaster, PoolApi, Reader, Signer, Wallet},
    types::{
        CreateRawTransactionInput, Obligation, PaymentResult, PaymentStatus, TxOutput,
        UnspentOutput,
    },
};

/// This is an alias for the result type returned by the [`Engine`].
pub type EngineResult<T> = Result<T, EngineError>;

/// Knobs of one [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The pool whose obligations this engine settles.
    pub pool_id: String,
    /// Fee rate applied by the estimator.
    pub fee_per_byte: Amount,
    /// Outputs at or below this value are surrendered to fee.
    pub dust_threshold: Amount,
    /// Minimum confirmations for a UTXO to be selectable.
    pub min_confirmations: u32,
    /// Where change goes; a fresh wallet address is generated per batch when
    /// unset.
    pub change_address: Option<String>,
    /// Append-only operator log of obligations a batch left unfinished.
    pub failed_log_path: PathBuf,
}

/// Per-batch, in-memory progress. Never persisted: the journal and the
/// chain's own UTXO set are the only durable signals across runs.
struct BatchState {
    progress: BTreeMap<u64, Amount>,
    attributed: BTreeMap<u64, Vec<String>>,
    successful_txids: Vec<String>,
}

impl BatchState {
    fn new(working: &[Obligation]) -> Self {
        Self {
            progress: working.iter().map(|o| (o.id, Amount::ZERO)).collect(),
            attributed: working.iter().map(|o| (o.id, Vec::new())).collect(),
            successful_txids: Vec::new(),
        }
    }

    fn progress(&self, id: u64) -> Amount {
        self.progress.get(&id).copied().unwrap_or(Amount::ZERO)
    }

    fn record(&mut self, id: u64, pay: Amount, txid: String) {
        if let Some(progress) = self.progress.get_mut(&id) {
            *progress += pay;
        }
        self.attributed.entry(id).or_default().push(txid.clone());
        self.successful_txids.push(txid);
    }

    fn attributed(&self, id: u64) -> Vec<String> {
        self.attributed.get(&id).cloned().unwrap_or_default()
    }
}

/// The payment state machine: validates a batch of obligations, selects
/// inputs, constructs/signs/broadcasts transactions, journals completions
/// and acknowledges them to the pool.
///
/// Collaborators are explicit handles; the engine holds no global state and
/// a single instance serves any number of sequential batches.
pub struct Engine<C, P> {
    chain: C,
    pool: P,
    journal: Journal,
    cfg: EngineConfig,
}

impl<C, P> Engine<C, P>
where
    C: Reader + Wallet + Signer + Broadcaster + Send + Sync,
    P: PoolApi + Send + Sync,
{
    pub fn new(chain: C, pool: P, journal: Journal, cfg: EngineConfig) -> Self {
        Self {
            chain,
            pool,
            journal,
            cfg,
        }
    }

    /// The chain gateway handle, for callers that poll chain state.
    pub fn chain(&self) -> &C {
        &self.chain
    }

    /// The pool gateway handle, for callers that poll pending work.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// The completion journal.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Releases the gateway handles, dropping the journal handle.
    pub fn into_parts(self) -> (C, P) {
        (self.chain, self.pool)
    }

    /// Settles one batch of obligations and reports one result per
    /// obligation, in the supplied order.
    ///
    /// `cancel` is honored between broadcasts, never between a broadcast
    /// returning and its journal write: that window must run to completion
    /// or the at-most-once guarantee is lost.
    pub async fn run_batch(
        &self,
        obligations: Vec<Obligation>,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<PaymentResult>> {
        let order: Vec<u64> = obligations.iter().map(|o| o.id).collect();
        let mut results: BTreeMap<u64, PaymentResult> = BTreeMap::new();

        // journal pre-scan: completed obligations never touch the chain
        let mut working: Vec<Obligation> = Vec::with_capacity(obligations.len());
        for o in obligations {
            match self.journal.transaction_of(o.id).await {
                Some(txid) => {
                    info!(id = o.id, %txid, "Obligation already completed, skipping");
                    results.insert(
                        o.id,
                        PaymentResult {
                            obligation_id: o.id,
                            status: PaymentStatus::AlreadyCompleted,
                            completed_amount: Amount::ZERO,
                            transaction_ids: vec![txid],
                            error: None,
                        },
                    );
                }
                None => working.push(o),
            }
        }

        if !working.is_empty() {
            self.dispatch(&working, cancel, &mut results).await?;
            self.log_residuals(&working, &results);
        }

        Ok(order
            .iter()
            .filter_map(|id| results.remove(id))
            .collect())
    }

    async fn dispatch(
        &self,
        working: &[Obligation],
        cancel: &CancellationToken,
        results: &mut BTreeMap<u64, PaymentResult>,
    ) -> EngineResult<()> {
        // validation, fail-fast: invalid data must never be silently skipped
        for o in working {
            if o.amount == Amount::ZERO {
                self.fail_all(
                    working,
                    results,
                    format!("InvalidAmount: obligation {} has a non-positive amount", o.id),
                );
                return Ok(());
            }
            match self.chain.validate_address(&o.address).await {
                Ok(true) => {}
                Ok(false) => {
                    self.fail_all(
                        working,
                        results,
                        format!(
                            "InvalidAddress: obligation {} pays {:?}",
                            o.id, o.address
                        ),
                    );
                    return Ok(());
                }
                Err(e) => {
                    // the gateway already retried transport errors; failing
                    // closed here beats paying a garbage address
                    warn!(id = o.id, %e, "Address validation unavailable, failing closed");
                    self.fail_all(
                        working,
                        results,
                        format!("AddressValidationUnavailable: {e}"),
                    );
                    return Ok(());
                }
            }
        }

        // capacity check
        let total: u64 = working.iter().map(|o| o.amount.to_sat()).sum();
        let total = Amount::from_sat(total);
        let distinct_addresses: BTreeSet<&str> =
            working.iter().map(|o| o.address.as_str()).collect();
        let fee = policy::estimate_fee(
            distinct_addresses.len().max(1),
            distinct_addresses.len(),
            self.cfg.fee_per_byte,
        )?;
        let required = Amount::from_sat(total.to_sat().saturating_add(fee.to_sat()));

        let balance = self.chain.get_balance().await?;
        if balance < required {
            self.fail_all(
                working,
                results,
                format!(
                    "InsufficientBalance: required {}, wallet holds {}",
                    display(required),
                    display(balance)
                ),
            );
            return Ok(());
        }

        // input selection
        let unspent = self.chain.list_unspent().await?;
        let selection =
            match policy::select_utxos(&unspent, required, self.cfg.min_confirmations) {
                Ok(selection) => selection,
                Err(e @ PolicyError::InsufficientFunds { .. }) => {
                    self.fail_all(working, results, format!("InsufficientUtxos: {e}"));
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
        debug!(
            inputs = selection.len(),
            required = %display(required),
            "Selected unspent outputs"
        );

        if selection.len() == 1 {
            self.dispatch_aggregated(working, &selection[0], results)
                .await
        } else {
            self.dispatch_streaming(working, &selection, cancel, results)
                .await
        }
    }

    /// Pays the whole batch from a single input: one output per distinct
    /// address, change back to the wallet when above the dust threshold.
    async fn dispatch_aggregated(
        &self,
        working: &[Obligation],
        utxo: &UnspentOutput,
        results: &mut BTreeMap<u64, PaymentResult>,
    ) -> EngineResult<()> {
        let mut per_address: BTreeMap<&str, u64> = BTreeMap::new();
        for o in working {
            *per_address.entry(o.address.as_str()).or_default() += o.amount.to_sat();
        }
        let paid: u64 = per_address.values().sum();

        // second fee pass with the actual shape, change slot included
        let fee = policy::estimate_fee(1, per_address.len() + 1, self.cfg.fee_per_byte)?;

        let mut outputs: Vec<TxOutput> = per_address
            .iter()
            .map(|(address, sats)| TxOutput {
                address: (*address).to_string(),
                amount: Amount::from_sat(*sats),
            })
            .collect();

        let mut change_cache = None;
        let change = utxo
            .amount
            .to_sat()
            .checked_sub(paid)
            .and_then(|rest| rest.checked_sub(fee.to_sat()))
            .map(Amount::from_sat)
            .unwrap_or(Amount::ZERO);
        if change > self.cfg.dust_threshold {
            match self.change_address(&mut change_cache).await {
                Ok(address) => outputs.push(TxOutput {
                    address,
                    amount: change,
                }),
                Err(e) => {
                    warn!(%e, "Could not resolve a change address, aborting batch");
                    self.fail_all(working, results, format!("ChangeAddressUnavailable: {e}"));
                    return Ok(());
                }
            }
        }

        let inputs = vec![CreateRawTransactionInput {
            txid: utxo.txid.to_string(),
            vout: utxo.vout,
        }];
        let txid = match self.broadcast(&inputs, &outputs).await {
            Ok(txid) => txid.to_string(),
            Err(e) => {
                warn!(%e, "Aggregated dispatch failed, nothing was journaled");
                self.fail_all(working, results, format!("BroadcastFailed: {e}"));
                return Ok(());
            }
        };
        info!(
            %txid,
            obligations = working.len(),
            amount = %display(Amount::from_sat(paid)),
            "Aggregated payment broadcast"
        );

        // journal barrier: every obligation is durable before any pool
        // acknowledgement is attempted
        for o in working {
            self.complete(o, o.amount, &txid, vec![txid.clone()], results)
                .await?;
        }
        Ok(())
    }

    /// Pays obligations through a chain of single-input transactions,
    /// tracking progress in memory only. Each broadcast consumes its input,
    /// so no transaction can ever be paid twice.
    async fn dispatch_streaming(
        &self,
        working: &[Obligation],
        selection: &[UnspentOutput],
        cancel: &CancellationToken,
        results: &mut BTreeMap<u64, PaymentResult>,
    ) -> EngineResult<()> {
        let mut batch = BatchState::new(working);
        let fee_single = policy::estimate_fee(1, 2, self.cfg.fee_per_byte)?;
        let dust = self.cfg.dust_threshold;
        let mut change_cache = None;

        for utxo in selection {
            if cancel.is_cancelled() {
                info!("Cancellation requested, ending streaming dispatch");
                break;
            }

            let available = match utxo.amount.checked_sub(fee_single) {
                Some(a) if a > Amount::ZERO => a,
                _ => {
                    debug!(txid = %utxo.txid, "Output cannot cover its own fee, skipping");
                    continue;
                }
            };

            // first obligation still worth paying; sub-dust remainders are
            // surrendered rather than emitted
            let Some(target) = working.iter().find(|o| {
                let progress = batch.progress(o.id);
                progress < o.amount && o.amount - progress > dust
            }) else {
                debug!("No payable obligation remains, leaving surplus outputs unused");
                break;
            };

            let remaining = target.amount - batch.progress(target.id);
            let pay = available.min(remaining);

            let mut outputs = vec![TxOutput {
                address: target.address.clone(),
                amount: pay,
            }];
            let residue = utxo
                .amount
                .checked_sub(pay)
                .and_then(|rest| rest.checked_sub(fee_single))
                .unwrap_or(Amount::ZERO);
            if residue > dust {
                match self.change_address(&mut change_cache).await {
                    Ok(address) => outputs.push(TxOutput {
                        address,
                        amount: residue,
                    }),
                    Err(e) => {
                        warn!(txid = %utxo.txid, %e, "No change address, abandoning this output");
                        continue;
                    }
                }
            }

            let inputs = vec![CreateRawTransactionInput {
                txid: utxo.txid.to_string(),
                vout: utxo.vout,
            }];
            let txid = match self.broadcast(&inputs, &outputs).await {
                Ok(txid) => txid.to_string(),
                Err(e) => {
                    // this output is abandoned for the batch; progress is
                    // untouched and the next one may still complete the payment
                    warn!(txid = %utxo.txid, vout = utxo.vout, %e, "Broadcast failed, trying next output");
                    continue;
                }
            };

            batch.record(target.id, pay, txid.clone());
            let progress = batch.progress(target.id);
            debug!(
                id = target.id,
                %txid,
                paid = %display(pay),
                progress = %display(progress),
                owed = %display(target.amount),
                "Streaming payment broadcast"
            );

            if progress >= target.amount {
                // completion: journal now, with the last contributing txid.
                // Cancellation is not consulted between the broadcast above
                // and this write.
                self.complete(target, progress, &txid, batch.attributed(target.id), results)
                    .await?;
            }
        }

        for o in working {
            if results.contains_key(&o.id) {
                continue;
            }
            let progress = batch.progress(o.id);
            info!(
                id = o.id,
                progress = %display(progress),
                owed = %display(o.amount),
                "Obligation left partially paid, will be re-attempted"
            );
            results.insert(
                o.id,
                PaymentResult {
                    obligation_id: o.id,
                    status: PaymentStatus::PartiallyPaid,
                    completed_amount: progress,
                    transaction_ids: batch.attributed(o.id),
                    error: None,
                },
            );
        }

        info!(
            broadcasts = batch.successful_txids.len(),
            "Streaming dispatch finished"
        );
        Ok(())
    }

    /// Journals a completed obligation, acknowledges it to the pool and
    /// records its result. A journal conflict downgrades to
    /// `AlreadyCompleted` with the journaled txid.
    async fn complete(
        &self,
        obligation: &Obligation,
        completed_amount: Amount,
        txid: &str,
        transaction_ids: Vec<String>,
        results: &mut BTreeMap<u64, PaymentResult>,
    ) -> EngineResult<()> {
        match self.journal.mark_completed(obligation.id, txid).await {
            Ok(()) => {
                self.acknowledge(obligation.id, txid).await;
                results.insert(
                    obligation.id,
                    PaymentResult {
                        obligation_id: obligation.id,
                        status: PaymentStatus::Succeeded,
                        completed_amount,
                        transaction_ids,
                        error: None,
                    },
                );
                Ok(())
            }
            Err(JournalError::Conflict { existing, new, .. }) => {
                error!(
                    id = obligation.id,
                    %existing,
                    refused = %new,
                    "Journal conflict; keeping the existing record"
                );
                results.insert(
                    obligation.id,
                    PaymentResult {
                        obligation_id: obligation.id,
                        status: PaymentStatus::AlreadyCompleted,
                        completed_amount: Amount::ZERO,
                        transaction_ids: vec![existing],
                        error: None,
                    },
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn broadcast(
        &self,
        inputs: &[CreateRawTransactionInput],
        outputs: &[TxOutput],
    ) -> crate::client::ClientResult<bitcoin::Txid> {
        let raw = self.chain.create_raw_transaction(inputs, outputs).await?;
        let signed = self.chain.sign_raw_transaction(&raw).await?;
        self.chain.send_raw_transaction(&signed).await
    }

    async fn acknowledge(&self, obligation_id: u64, txid: &str) {
        match self
            .pool
            .mark_completed(&self.cfg.pool_id, obligation_id, txid)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(%obligation_id, "Pool declined the completion acknowledgement")
            }
            Err(e) => warn!(%obligation_id, %e, "Pool acknowledgement failed"),
        }
    }

    async fn change_address(
        &self,
        cache: &mut Option<String>,
    ) -> crate::client::ClientResult<String> {
        if let Some(address) = cache {
            return Ok(address.clone());
        }
        let address = match &self.cfg.change_address {
            Some(configured) => configured.clone(),
            None => self.chain.get_new_address().await?,
        };
        *cache = Some(address.clone());
        Ok(address)
    }

    fn fail_all(
        &self,
        working: &[Obligation],
        results: &mut BTreeMap<u64, PaymentResult>,
        reason: String,
    ) {
        error!(%reason, obligations = working.len(), "Aborting batch");
        for o in working {
            results.entry(o.id).or_insert_with(|| PaymentResult {
                obligation_id: o.id,
                status: PaymentStatus::Failed,
                completed_amount: Amount::ZERO,
                transaction_ids: Vec::new(),
                error: Some(reason.clone()),
            });
        }
    }

    /// Appends obligations the batch left unfinished to the operator log.
    /// Best effort: a logging failure never affects payment state.
    fn log_residuals(&self, working: &[Obligation], results: &BTreeMap<u64, PaymentResult>) {
        let mut lines = String::new();
        for o in working {
            let Some(result) = results.get(&o.id) else {
                continue;
            };
            if !matches!(
                result.status,
                PaymentStatus::Failed | PaymentStatus::PartiallyPaid
            ) {
                continue;
            }
            let remaining = o
                .amount
                .checked_sub(result.completed_amount)
                .unwrap_or(Amount::ZERO);
            lines.push_str(&format!(
                "{}|{}|{}|{}|{}|{}|{}|{}\n",
                Utc::now().to_rfc3339(),
                o.id,
                o.address,
                display(o.amount),
                display(result.completed_amount),
                display(remaining),
                result.transaction_ids.join(","),
                result.error.as_deref().unwrap_or("incomplete"),
            ));
        }
        if lines.is_empty() {
            return;
        }
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.cfg.failed_log_path)
            .and_then(|mut file| file.write_all(lines.as_bytes()));
        if let Err(e) = appended {
            warn!(path = %self.cfg.failed_log_path.display(), %e, "Could not append to the failed-payment log");
        }
    }
}

fn display(amount: Amount) -> String {
    amount.to_string_in(Denomination::Bitcoin)
}
