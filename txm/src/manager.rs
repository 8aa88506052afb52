use std::{collections::HashMap, fmt::Debug, ops::RangeInclusive, sync::Arc};

use async_trait::async_trait;
use auto_impl::auto_impl;
use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::{watch, Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use headtracker::HeadTrackable;
use oracle_core::{
    Address, Bytes, ChainClient, ChainHealth, KeyStore, UnsignedTx, H256, U256,
};

use crate::{
    broadcaster::AddressBroadcaster, confirmer::Confirmer, AttemptState, EthTx, EthTxAttempt,
    EthTxState, KeyState, NewTx, TxOutcome, TxStore, TxmConfig, TxmError, TxmMetrics,
    TxmResult,
};

/// Receives the outcome of a tx enqueued on behalf of a pipeline task.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait ResumeCallback: Send + Sync + Debug {
    /// Resumes the suspended task run `task_run_id` with the confirmed hash
    /// or the failure.
    async fn resume(&self, task_run_id: Uuid, outcome: TxOutcome) -> eyre::Result<()>;
}

/// State shared by the broadcasters and the confirmer.
#[derive(Debug)]
pub(crate) struct TxmContext {
    pub store: Arc<dyn TxStore>,
    pub chain: Arc<dyn ChainClient>,
    pub keys: Arc<dyn KeyStore>,
    pub config: TxmConfig,
    pub metrics: TxmMetrics,
    pub health: watch::Receiver<ChainHealth>,
    resume: RwLock<Option<Arc<dyn ResumeCallback>>>,
    locks: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
    triggers: Mutex<HashMap<Address, Arc<Notify>>>,
}

impl TxmContext {
    /// The mutex guarding nonce assignment of `address`.
    pub fn lock_for(&self, address: Address) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(address).or_default().clone()
    }

    pub fn trigger_for(&self, address: Address) -> Arc<Notify> {
        self.triggers.lock().entry(address).or_default().clone()
    }

    /// Wakes the broadcaster of `address`.
    pub fn trigger(&self, address: Address) {
        self.trigger_for(address).notify_one();
    }

    pub fn trigger_all(&self) {
        for notify in self.triggers.lock().values() {
            notify.notify_one();
        }
    }

    pub fn chain_available(&self) -> bool {
        *self.health.borrow() == ChainHealth::Healthy
    }

    /// Hands `outcome` to the waiting task run, if any.
    pub async fn resume(&self, task_run_id: Option<Uuid>, outcome: TxOutcome) {
        let Some(task_run_id) = task_run_id else {
            return;
        };
        let callback = self.resume.read().clone();
        let Some(callback) = callback else {
            warn!(%task_run_id, "No resume callback registered");
            return;
        };
        if let Err(err) = callback.resume(task_run_id, outcome).await {
            warn!(?err, %task_run_id, "Failed to resume task run");
        }
    }

    pub fn unsigned(tx: &EthTx, nonce: u64, gas_price: U256) -> UnsignedTx {
        UnsignedTx {
            nonce,
            to: tx.to,
            value: tx.value,
            data: tx.payload.clone(),
            gas_limit: tx.gas_limit,
            gas_price,
        }
    }
}

/// Entry point of the transaction manager.
///
/// Owns one broadcaster task per sending key and the head driven
/// confirmer. Obtain the confirmer with [`TxManager::confirmer`] and
/// subscribe it to the head broadcaster.
#[derive(Debug, Clone)]
pub struct TxManager {
    ctx: Arc<TxmContext>,
}

impl TxManager {
    /// Creates a manager; nothing is broadcast until [`Self::start`].
    pub fn new(
        store: Arc<dyn TxStore>,
        chain: Arc<dyn ChainClient>,
        keys: Arc<dyn KeyStore>,
        config: TxmConfig,
        metrics: TxmMetrics,
        health: watch::Receiver<ChainHealth>,
    ) -> Self {
        Self {
            ctx: Arc::new(TxmContext {
                store,
                chain,
                keys,
                config,
                metrics,
                health,
                resume: RwLock::new(None),
                locks: Default::default(),
                triggers: Default::default(),
            }),
        }
    }

    /// Registers the receiver of tx outcomes.
    pub fn set_resume_callback(&self, callback: Arc<dyn ResumeCallback>) {
        *self.ctx.resume.write() = Some(callback);
    }

    /// The head subscriber confirming, bumping and reorg checking txs.
    pub fn confirmer(&self) -> Arc<dyn HeadTrackable> {
        Arc::new(Confirmer::new(self.ctx.clone()))
    }

    /// Configuration in use.
    pub fn config(&self) -> &TxmConfig {
        &self.ctx.config
    }

    #[cfg(test)]
    pub(crate) fn broadcaster(&self, address: Address) -> AddressBroadcaster {
        AddressBroadcaster::new(address, self.ctx.clone())
    }

    /// Spawns a broadcaster for every sending key.
    pub async fn start(&self, cancel: CancellationToken) -> TxmResult<Vec<JoinHandle<()>>> {
        let keys = self.ctx.keys.sending_keys().await?;
        let mut handles = Vec::with_capacity(keys.len());
        for address in keys {
            self.ctx.store.ensure_key_state(address).await?;
            let broadcaster = AddressBroadcaster::new(address, self.ctx.clone());
            handles.push(tokio::spawn(
                broadcaster
                    .run(cancel.clone())
                    .instrument(info_span!("EthBroadcaster", ?address)),
            ));
        }
        info!(keys = handles.len(), "Transaction manager started");
        Ok(handles)
    }

    /// Queues a tx for broadcast.
    #[instrument(skip_all, fields(from = ?tx.from, to = ?tx.to))]
    pub async fn enqueue(&self, tx: NewTx) -> TxmResult<EthTx> {
        let keys = self.ctx.keys.sending_keys().await?;
        if !keys.contains(&tx.from) {
            return Err(TxmError::Validation(format!(
                "{:?} is not a sending key",
                tx.from
            )));
        }
        let key = self.ctx.store.ensure_key_state(tx.from).await?;
        if key.disabled {
            return Err(TxmError::Validation(format!(
                "sending key {:?} is disabled",
                tx.from
            )));
        }
        let gas_limit = tx.gas_limit.unwrap_or(self.ctx.config.gas_limit_default);
        if gas_limit == 0 {
            return Err(TxmError::Validation("gas limit must be positive".into()));
        }
        let limit = self.ctx.config.max_queued_transactions;
        let Some(stored) = self
            .ctx
            .store
            .insert_unstarted_tx(&tx, gas_limit, limit)
            .await?
        else {
            warn!(limit, "Transaction queue full");
            return Err(TxmError::QueueFull {
                address: tx.from,
                limit,
            });
        };
        self.ctx.metrics.txs_enqueued.inc();
        self.ctx.metrics.transition(EthTxState::Unstarted);
        info!(id = stored.id, "Enqueued transaction");
        self.ctx.trigger(tx.from);
        Ok(stored)
    }

    /// The tx owning the attempt with `hash`, with all its attempts.
    pub async fn get_transaction(&self, hash: H256) -> TxmResult<(EthTx, Vec<EthTxAttempt>)> {
        let tx = self
            .ctx
            .store
            .tx_by_attempt_hash(hash)
            .await?
            .ok_or_else(|| TxmError::NotFound(format!("transaction {hash:?}")))?;
        let attempts = self.ctx.store.attempts_for_tx(tx.id).await?;
        Ok((tx, attempts))
    }

    /// A page of attempts, newest first, with the total count.
    pub async fn list_attempts(
        &self,
        offset: u64,
        limit: u64,
    ) -> TxmResult<(Vec<EthTxAttempt>, u64)> {
        Ok(self.ctx.store.list_attempts(offset, limit).await?)
    }

    /// Addresses the key store can sign for.
    pub async fn sending_keys(&self) -> TxmResult<Vec<Address>> {
        Ok(self.ctx.keys.sending_keys().await?)
    }

    /// Nonce state of every known key.
    pub async fn list_keys(&self) -> TxmResult<Vec<KeyState>> {
        Ok(self.ctx.store.key_states().await?)
    }

    /// Operator override of the next nonce of `address`.
    #[instrument(skip(self))]
    pub async fn reset_nonce(&self, address: Address, nonce: u64) -> TxmResult<()> {
        let lock = self.ctx.lock_for(address);
        let _guard = lock.lock().await;
        if !self.ctx.store.reset_next_nonce(address, nonce).await? {
            return Err(TxmError::NotFound(format!("key {address:?}")));
        }
        warn!("Next nonce reset by operator");
        self.ctx
            .metrics
            .next_nonce
            .with_label_values(&[&format!("{address:?}")])
            .set(nonce as i64);
        Ok(())
    }

    /// Stops or resumes broadcasting from `address`.
    #[instrument(skip(self))]
    pub async fn set_key_disabled(&self, address: Address, disabled: bool) -> TxmResult<()> {
        if !self.ctx.store.set_key_disabled(address, disabled).await? {
            return Err(TxmError::NotFound(format!("key {address:?}")));
        }
        info!("Key state changed");
        self.ctx.trigger(address);
        Ok(())
    }

    /// Re-signs and sends, for every nonce in `nonces`, the tx of `address`
    /// holding it, or an empty self transfer when there is none. Failures
    /// are logged and reported per nonce.
    #[instrument(skip(self))]
    pub async fn force_rebroadcast(
        &self,
        nonces: RangeInclusive<u64>,
        address: Address,
        gas_price: U256,
        gas_limit: u64,
    ) -> TxmResult<Vec<(u64, TxOutcome)>> {
        if nonces.is_empty() {
            return Err(TxmError::Validation("empty nonce range".into()));
        }
        let lock = self.ctx.lock_for(address);
        let _guard = lock.lock().await;
        let mut results = Vec::new();
        for nonce in nonces {
            let outcome = self
                .rebroadcast_nonce(address, nonce, gas_price, gas_limit)
                .await
                .map_err(|err| {
                    error!(?err, nonce, "Force rebroadcast failed");
                    err.to_string()
                });
            if let Ok(hash) = &outcome {
                info!(nonce, ?hash, "Force rebroadcast sent");
            }
            results.push((nonce, outcome));
        }
        Ok(results)
    }

    async fn rebroadcast_nonce(
        &self,
        address: Address,
        nonce: u64,
        gas_price: U256,
        gas_limit: u64,
    ) -> TxmResult<H256> {
        let unsigned = match self.ctx.store.tx_by_nonce(address, nonce).await? {
            Some(tx) => UnsignedTx {
                gas_limit,
                ..TxmContext::unsigned(&tx, nonce, gas_price)
            },
            None => UnsignedTx {
                nonce,
                to: address,
                value: U256::zero(),
                data: Bytes::default(),
                gas_limit,
                gas_price,
            },
        };
        let signed = self
            .ctx
            .keys
            .sign_tx(address, &unsigned, self.ctx.config.chain_id)
            .await?;
        self.ctx.chain.send_raw_transaction(signed.raw).await?;
        Ok(signed.hash)
    }

    /// The tx created for `task_run_id`, if any.
    pub async fn tx_for_task_run(&self, task_run_id: Uuid) -> TxmResult<Option<EthTx>> {
        Ok(self.ctx.store.tx_by_task_run(task_run_id).await?)
    }

    /// Gives up on the tx of `task_run_id`. A tx not yet holding a nonce
    /// fails outright. One already broadcast keeps being confirmed and
    /// bumped so later nonces of its key are not stuck behind it, but its
    /// outcome is no longer reported.
    #[instrument(skip(self))]
    pub async fn abandon_task_run_tx(&self, task_run_id: Uuid, reason: &str) -> TxmResult<bool> {
        let Some(tx) = self.ctx.store.tx_by_task_run(task_run_id).await? else {
            return Ok(false);
        };
        // not while the broadcaster is assigning or sending
        let lock = self.ctx.lock_for(tx.from);
        let _guard = lock.lock().await;
        match self.ctx.store.abandon_tx(tx.id, reason).await? {
            Some(EthTxState::FatalError) => {
                warn!(id = tx.id, reason, "Abandoned unstarted transaction");
                self.ctx.metrics.transition(EthTxState::FatalError);
                Ok(true)
            }
            Some(state) => {
                warn!(id = tx.id, nonce = ?tx.nonce, %state, reason, "Abandoned transaction, still mining it for its nonce");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Outcome of the tx created for `task_run_id`, once it is final.
    pub async fn task_run_outcome(&self, task_run_id: Uuid) -> TxmResult<Option<TxOutcome>> {
        let Some(tx) = self.ctx.store.tx_by_task_run(task_run_id).await? else {
            return Ok(None);
        };
        match tx.state {
            EthTxState::Confirmed => {
                let attempts = self.ctx.store.attempts_for_tx(tx.id).await?;
                Ok(attempts
                    .into_iter()
                    .find(|a| a.state == AttemptState::Confirmed)
                    .map(|a| Ok(a.hash)))
            }
            EthTxState::FatalError => Ok(Some(Err(tx
                .error
                .unwrap_or_else(|| "transaction failed".into())))),
            _ => Ok(None),
        }
    }
}
