use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use oracle_core::Address;

use crate::{
    classify_send_error, initial_gas_price, manager::TxmContext, EthTx, EthTxAttempt,
    EthTxState, FatalSendReason, NewAttempt, SendErrorClass, TxmError, TxmResult,
};

/// Assigns nonces to and broadcasts the unstarted txs of one address.
#[derive(Debug)]
pub(crate) struct AddressBroadcaster {
    address: Address,
    ctx: Arc<TxmContext>,
}

impl AddressBroadcaster {
    pub fn new(address: Address, ctx: Arc<TxmContext>) -> Self {
        Self { address, ctx }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if let Err(err) = self.sync_nonce().await {
            warn!(?err, "Failed to sync nonce with the chain");
        }
        let trigger = self.ctx.trigger_for(self.address);
        let base = self.ctx.config.retry_backoff;
        let mut backoff: Option<Duration> = None;
        loop {
            // a send cut short here is finished from its saved in-progress
            // attempt on the next start
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.process() => result,
            };
            match result {
                Ok(()) => backoff = None,
                Err(err) => {
                    let delay = backoff
                        .map(|d| (d * 2).min(self.ctx.config.max_retry_backoff))
                        .unwrap_or(base);
                    warn!(?err, ?delay, "Broadcast failed, backing off");
                    backoff = Some(delay);
                }
            }
            match backoff {
                Some(delay) => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = trigger.notified() => {}
                    _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
                },
            }
        }
        debug!("Broadcaster stopped");
    }

    /// Moves the stored next nonce up to the node's pending nonce.
    #[instrument(skip(self), fields(address = ?self.address))]
    pub async fn sync_nonce(&self) -> TxmResult<()> {
        let lock = self.ctx.lock_for(self.address);
        let _guard = lock.lock().await;
        let key = self.ctx.store.ensure_key_state(self.address).await?;
        let pending = self.ctx.chain.pending_nonce_at(self.address).await?;
        if pending > key.next_nonce {
            warn!(
                stored = key.next_nonce,
                pending, "Nonce gap between store and chain, syncing forward"
            );
            self.ctx
                .store
                .sync_next_nonce_forward(self.address, pending)
                .await?;
        }
        self.ctx
            .metrics
            .next_nonce
            .with_label_values(&[&format!("{:?}", self.address)])
            .set(pending.max(key.next_nonce) as i64);
        Ok(())
    }

    /// Broadcasts until nothing is left, the in-flight limit is hit, the key
    /// is disabled or the chain is unavailable. An error means a transient
    /// failure; the tx it concerns stays in progress.
    pub async fn process(&self) -> TxmResult<()> {
        let lock = self.ctx.lock_for(self.address);
        let _guard = lock.lock().await;
        loop {
            if !self.ctx.chain_available() {
                debug!("Chain unavailable, not broadcasting");
                return Ok(());
            }
            let key = self.ctx.store.ensure_key_state(self.address).await?;
            if key.disabled {
                return Ok(());
            }
            if let Some((tx, attempt)) = self.ctx.store.in_progress_tx(self.address).await? {
                info!(id = tx.id, nonce = ?tx.nonce, "Resuming in-progress transaction");
                self.send_first_attempt(&tx, &attempt).await?;
                continue;
            }
            let in_flight = self
                .ctx
                .store
                .count_txs(self.address, EthTxState::Unconfirmed)
                .await?;
            if in_flight >= self.ctx.config.max_in_flight_transactions {
                debug!(in_flight, "In-flight limit reached, pausing");
                return Ok(());
            }
            let Some(tx) = self.ctx.store.next_unstarted_tx(self.address).await? else {
                return Ok(());
            };
            self.start_tx(tx, key.next_nonce).await?;
        }
    }

    #[instrument(skip_all, fields(id = tx.id, nonce = nonce))]
    async fn start_tx(&self, tx: EthTx, nonce: u64) -> TxmResult<()> {
        let gas_price = initial_gas_price(&self.ctx.config);
        let unsigned = TxmContext::unsigned(&tx, nonce, gas_price);
        let signed = match self
            .ctx
            .keys
            .sign_tx(self.address, &unsigned, self.ctx.config.chain_id)
            .await
        {
            Ok(signed) => signed,
            Err(err) => {
                error!(?err, "Failed to sign transaction");
                let msg = err.to_string();
                self.ctx.store.fail_tx(tx.id, None, &msg).await?;
                self.ctx.metrics.transition(EthTxState::FatalError);
                self.ctx.resume(tx.task_run_id, Err(msg)).await;
                return Ok(());
            }
        };
        let new_attempt = NewAttempt {
            hash: signed.hash,
            gas_price,
            signed_raw_tx: signed.raw,
        };
        let Some(attempt) = self
            .ctx
            .store
            .save_in_progress(tx.id, self.address, nonce, &new_attempt)
            .await?
        else {
            warn!("Next nonce changed while signing, retrying");
            return Ok(());
        };
        self.ctx.metrics.transition(EthTxState::InProgress);
        let tx = EthTx {
            nonce: Some(nonce),
            state: EthTxState::InProgress,
            ..tx
        };
        self.send_first_attempt(&tx, &attempt).await
    }

    async fn send_first_attempt(&self, tx: &EthTx, attempt: &EthTxAttempt) -> TxmResult<()> {
        let nonce = tx
            .nonce
            .ok_or_else(|| TxmError::Validation(format!("in-progress tx {} has no nonce", tx.id)))?;
        if let Err(err) = self
            .ctx
            .chain
            .send_raw_transaction(attempt.signed_raw_tx.clone())
            .await
        {
            match classify_send_error(&err) {
                SendErrorClass::Accepted => {
                    debug!(?err, "Node already knows the transaction");
                }
                SendErrorClass::Fatal(reason) => {
                    self.ctx
                        .metrics
                        .send_errors
                        .with_label_values(&["fatal"])
                        .inc();
                    let err = match reason {
                        FatalSendReason::InsufficientFunds => {
                            TxmError::InsufficientFunds(err.to_string())
                        }
                        _ => TxmError::FatalSend(err.to_string()),
                    };
                    error!(%err, id = tx.id, nonce, "Transaction rejected");
                    let msg = err.to_string();
                    self.ctx.store.fail_tx(tx.id, Some(attempt.id), &msg).await?;
                    self.ctx.metrics.transition(EthTxState::FatalError);
                    self.ctx.resume(tx.task_run_id, Err(msg)).await;
                    return Ok(());
                }
                SendErrorClass::Transient => {
                    self.ctx
                        .metrics
                        .send_errors
                        .with_label_values(&["transient"])
                        .inc();
                    return Err(err.into());
                }
            }
        }
        self.ctx
            .store
            .mark_broadcast(tx.id, attempt.id, self.address, nonce)
            .await?;
        self.ctx.metrics.attempts_broadcast.inc();
        self.ctx.metrics.transition(EthTxState::Unconfirmed);
        self.ctx
            .metrics
            .next_nonce
            .with_label_values(&[&format!("{:?}", self.address)])
            .set(nonce as i64 + 1);
        info!(id = tx.id, nonce, hash = ?attempt.hash, gas_price = %attempt.gas_price, "Broadcast transaction");
        Ok(())
    }
}
