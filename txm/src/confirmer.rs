use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use derive_new::new;
use tracing::{debug, info, instrument, warn};

use headtracker::HeadTrackable;
use oracle_core::Head;

use crate::{
    bumped_gas_price, classify_send_error, manager::TxmContext, should_bump, AttemptState,
    EthTx, EthTxAttempt, EthTxState, NewAttempt, SendErrorClass, StoredReceipt, TxmError,
    TxmResult,
};

/// Drives unconfirmed txs on every new head: stores receipts, confirms,
/// bumps gas on stalls, resends and undoes confirmations lost to reorgs.
#[derive(Debug, new)]
pub(crate) struct Confirmer {
    ctx: Arc<TxmContext>,
}

#[async_trait]
impl HeadTrackable for Confirmer {
    async fn on_new_longest_chain(&self, head: &Head) {
        if let Err(err) = self.process_head(head).await {
            warn!(?err, number = head.number, "Failed to process head in confirmer");
        }
        // confirmations may have freed in-flight slots
        self.ctx.trigger_all();
    }
}

impl Confirmer {
    #[instrument(skip_all, fields(number = head.number))]
    pub async fn process_head(&self, head: &Head) -> TxmResult<()> {
        let stamped = self
            .ctx
            .store
            .set_broadcast_before_block(head.number)
            .await?;
        if stamped > 0 {
            debug!(stamped, "Stamped broadcast attempts with block");
        }
        for tx in self.ctx.store.unconfirmed_txs().await? {
            if let Err(err) = self.check_tx(&tx, head).await {
                warn!(?err, id = tx.id, "Failed to check transaction");
            }
        }
        self.check_reorgs(head).await
    }

    async fn check_tx(&self, tx: &EthTx, head: &Head) -> TxmResult<()> {
        let attempts = self.ctx.store.attempts_for_tx(tx.id).await?;
        let min_confirmations = tx
            .min_confirmations
            .unwrap_or(self.ctx.config.min_confirmations);

        let broadcast: Vec<&EthTxAttempt> = attempts
            .iter()
            .filter(|a| a.state == AttemptState::Broadcast)
            .collect();
        for attempt in broadcast {
            let receipt = match self.ctx.chain.transaction_receipt(attempt.hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                Err(err) => {
                    debug!(?err, hash = ?attempt.hash, "Failed to fetch receipt");
                    continue;
                }
            };
            let (Some(block_hash), Some(block_number)) = (receipt.block_hash, receipt.block_number)
            else {
                continue;
            };
            self.ctx
                .store
                .save_receipt(&StoredReceipt {
                    tx_hash: attempt.hash,
                    block_hash,
                    block_number,
                    tx_index: receipt.tx_index,
                    status: receipt.status,
                })
                .await?;
            let confirmations = receipt.confirmations_at(head.number).unwrap_or_default();
            if confirmations >= min_confirmations {
                self.confirm(tx, attempt, receipt.reverted()).await?;
            } else {
                debug!(id = tx.id, confirmations, min_confirmations, "Waiting for confirmations");
            }
            // a mined attempt is never bumped
            return Ok(());
        }

        let mut unsent = attempts
            .iter()
            .filter(|a| a.state == AttemptState::InProgress)
            .collect::<Vec<&EthTxAttempt>>()
            .into_iter()
            .peekable();
        if unsent.peek().is_some() {
            let mut still_unsent = false;
            for attempt in unsent {
                still_unsent |= !self.send_attempt(tx, attempt).await?;
            }
            if still_unsent {
                return Ok(());
            }
        }

        let attempts = self.ctx.store.attempts_for_tx(tx.id).await?;
        let Some(newest) = attempts.iter().find(|a| a.state == AttemptState::Broadcast) else {
            return Ok(());
        };
        if should_bump(
            head.number,
            newest.broadcast_before_block_number,
            self.ctx.config.gas_bump_threshold,
        ) {
            self.bump(tx, newest).await
        } else if self.resend_due(newest) {
            if self.send_attempt(tx, newest).await? {
                self.ctx.metrics.resends.inc();
                info!(id = tx.id, hash = ?newest.hash, "Resent unmined attempt");
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    fn resend_due(&self, attempt: &EthTxAttempt) -> bool {
        let Some(at) = attempt.broadcast_at else {
            return false;
        };
        let Ok(threshold) = chrono::Duration::from_std(self.ctx.config.resend_after_threshold)
        else {
            return false;
        };
        Utc::now() - at >= threshold
    }

    async fn confirm(&self, tx: &EthTx, attempt: &EthTxAttempt, reverted: bool) -> TxmResult<()> {
        if reverted {
            let err = TxmError::Reverted.to_string();
            self.ctx
                .store
                .confirm_tx(tx.id, attempt.id, Some(&err))
                .await?;
            self.ctx.metrics.transition(EthTxState::FatalError);
            warn!(id = tx.id, hash = ?attempt.hash, "Transaction reverted");
            if !tx.abandoned() {
                self.ctx.resume(tx.task_run_id, Err(err)).await;
            }
        } else {
            self.ctx.store.confirm_tx(tx.id, attempt.id, None).await?;
            self.ctx.metrics.transition(EthTxState::Confirmed);
            if tx.abandoned() {
                info!(id = tx.id, hash = ?attempt.hash, "Abandoned transaction confirmed");
                return Ok(());
            }
            info!(id = tx.id, hash = ?attempt.hash, "Transaction confirmed");
            self.ctx.resume(tx.task_run_id, Ok(attempt.hash)).await;
        }
        Ok(())
    }

    /// Replaces `previous` with a higher priced attempt and sends it.
    #[instrument(skip_all, fields(id = tx.id, previous = %previous.gas_price))]
    async fn bump(&self, tx: &EthTx, previous: &EthTxAttempt) -> TxmResult<()> {
        let Some(gas_price) = bumped_gas_price(previous.gas_price, &self.ctx.config) else {
            self.ctx.metrics.gas_cap_reached.inc();
            let err = TxmError::GasCapReached {
                price: previous.gas_price,
                cap: self.ctx.config.max_gas_price_wei,
            };
            warn!(%err, "Not bumping gas price");
            return Ok(());
        };
        let nonce = tx
            .nonce
            .ok_or_else(|| TxmError::Validation(format!("tx {} has no nonce", tx.id)))?;
        let unsigned = TxmContext::unsigned(tx, nonce, gas_price);
        let signed = self
            .ctx
            .keys
            .sign_tx(tx.from, &unsigned, self.ctx.config.chain_id)
            .await?;
        let attempt = self
            .ctx
            .store
            .insert_attempt(
                tx.id,
                &NewAttempt {
                    hash: signed.hash,
                    gas_price,
                    signed_raw_tx: signed.raw,
                },
            )
            .await?;
        self.ctx.metrics.gas_bumps.inc();
        info!(%gas_price, hash = ?attempt.hash, "Bumped gas price");
        self.send_attempt(tx, &attempt).await?;
        Ok(())
    }

    /// Sends an attempt of an already broadcast tx. Returns whether the node
    /// holds it afterwards.
    async fn send_attempt(&self, tx: &EthTx, attempt: &EthTxAttempt) -> TxmResult<bool> {
        let accepted = match self
            .ctx
            .chain
            .send_raw_transaction(attempt.signed_raw_tx.clone())
            .await
        {
            Ok(_) => true,
            Err(err) => match classify_send_error(&err) {
                SendErrorClass::Accepted => true,
                SendErrorClass::Fatal(reason) => {
                    self.ctx
                        .metrics
                        .send_errors
                        .with_label_values(&["fatal"])
                        .inc();
                    warn!(?err, ?reason, id = tx.id, hash = ?attempt.hash, "Attempt rejected");
                    if attempt.state == AttemptState::InProgress {
                        self.ctx.store.delete_attempt(attempt.id).await?;
                    }
                    return Ok(false);
                }
                SendErrorClass::Transient => {
                    self.ctx
                        .metrics
                        .send_errors
                        .with_label_values(&["transient"])
                        .inc();
                    warn!(?err, id = tx.id, hash = ?attempt.hash, "Failed to send attempt");
                    return Ok(false);
                }
            },
        };
        if accepted {
            self.ctx.store.mark_attempt_broadcast(attempt.id).await?;
            self.ctx.metrics.attempts_broadcast.inc();
        }
        Ok(accepted)
    }

    /// Re-checks confirmed txs still within the finality depth.
    async fn check_reorgs(&self, head: &Head) -> TxmResult<()> {
        let since = head.number.saturating_sub(self.ctx.config.finality_depth);
        for (tx, attempt, stored) in self.ctx.store.confirmed_txs_since(since).await? {
            let current = match self.ctx.chain.transaction_receipt(attempt.hash).await {
                Ok(current) => current,
                Err(err) => {
                    debug!(?err, id = tx.id, "Failed to re-fetch receipt");
                    continue;
                }
            };
            if current.and_then(|r| r.block_hash) == Some(stored.block_hash) {
                continue;
            }
            warn!(
                id = tx.id,
                hash = ?attempt.hash,
                block = stored.block_number,
                "Confirmed transaction reorged out"
            );
            self.ctx.store.unconfirm_tx(tx.id, &attempt).await?;
            self.ctx.metrics.reorged_txs.inc();
            self.ctx.metrics.transition(EthTxState::Unconfirmed);

            let tx = EthTx {
                state: EthTxState::Unconfirmed,
                ..tx
            };
            let attempts = self.ctx.store.attempts_for_tx(tx.id).await?;
            if let Some(newest) = attempts.iter().find(|a| a.state == AttemptState::Broadcast) {
                if let Err(err) = self.bump(&tx, newest).await {
                    warn!(?err, id = tx.id, "Failed to bump reorged transaction");
                }
            }
        }
        Ok(())
    }
}
