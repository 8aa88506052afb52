use std::{fmt::Debug, str::FromStr};

use async_trait::async_trait;
use auto_impl::auto_impl;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ActiveModelTrait, ActiveValue::*, ColumnTrait, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use tracing::instrument;
use uuid::Uuid;

use oracle_base::db::{
    address_to_bytes, bytes_to_address, bytes_to_h256,
    generated::{eth_receipt, eth_tx, eth_tx_attempt, key_state},
    h256_to_bytes, i64_to_u64, now, string_to_u256, to_chrono, u256_to_string, u64_to_i64,
    OracleDb,
};
use oracle_core::{Address, Bytes, H256};

use crate::{
    AttemptState, EthTx, EthTxAttempt, EthTxState, KeyState, NewAttempt, NewTx, StoredReceipt,
};

/// Persistence of the transaction manager. Multi-row updates that must
/// land together run in one database transaction.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait TxStore: Send + Sync + Debug {
    /// Key state of `address`, created with nonce 0 when missing.
    async fn ensure_key_state(&self, address: Address) -> Result<KeyState, DbErr>;

    /// Key state of `address`.
    async fn key_state(&self, address: Address) -> Result<Option<KeyState>, DbErr>;

    /// Every key state.
    async fn key_states(&self) -> Result<Vec<KeyState>, DbErr>;

    /// Raises the next nonce of `address` to `nonce` if it is lower.
    /// Returns whether it moved.
    async fn sync_next_nonce_forward(&self, address: Address, nonce: u64) -> Result<bool, DbErr>;

    /// Sets the next nonce of `address` unconditionally.
    async fn reset_next_nonce(&self, address: Address, nonce: u64) -> Result<bool, DbErr>;

    /// Enables or disables `address`.
    async fn set_key_disabled(&self, address: Address, disabled: bool) -> Result<bool, DbErr>;

    /// Inserts an unstarted tx unless `from` already holds `max_queued`
    /// unstarted txs (0 is unlimited), in which case `None` is returned.
    async fn insert_unstarted_tx(
        &self,
        tx: &NewTx,
        gas_limit: u64,
        max_queued: u64,
    ) -> Result<Option<EthTx>, DbErr>;

    /// Oldest unstarted tx of `address`.
    async fn next_unstarted_tx(&self, address: Address) -> Result<Option<EthTx>, DbErr>;

    /// The in-progress tx of `address` with its attempt.
    async fn in_progress_tx(
        &self,
        address: Address,
    ) -> Result<Option<(EthTx, EthTxAttempt)>, DbErr>;

    /// Number of txs of `address` in `state`.
    async fn count_txs(&self, address: Address, state: EthTxState) -> Result<u64, DbErr>;

    /// Stamps `nonce` on the unstarted tx and writes its first attempt.
    /// Returns `None`, writing nothing, if the next nonce of `address` is no
    /// longer `nonce`.
    async fn save_in_progress(
        &self,
        tx_id: i64,
        address: Address,
        nonce: u64,
        attempt: &NewAttempt,
    ) -> Result<Option<EthTxAttempt>, DbErr>;

    /// The node accepted the first attempt: the attempt is broadcast, the tx
    /// unconfirmed and the next nonce of `address` moves past `nonce`.
    async fn mark_broadcast(
        &self,
        tx_id: i64,
        attempt_id: i64,
        address: Address,
        nonce: u64,
    ) -> Result<(), DbErr>;

    /// Fails a tx that was never accepted: the attempt, if any, is deleted
    /// and the nonce released.
    async fn fail_tx(&self, tx_id: i64, attempt_id: Option<i64>, error: &str)
        -> Result<(), DbErr>;

    /// Every unconfirmed tx, oldest first.
    async fn unconfirmed_txs(&self) -> Result<Vec<EthTx>, DbErr>;

    /// Attempts of a tx, newest first.
    async fn attempts_for_tx(&self, tx_id: i64) -> Result<Vec<EthTxAttempt>, DbErr>;

    /// Stamps `number` on broadcast attempts that have no block yet.
    async fn set_broadcast_before_block(&self, number: u64) -> Result<u64, DbErr>;

    /// Adds an in-progress attempt to an existing tx.
    async fn insert_attempt(&self, tx_id: i64, attempt: &NewAttempt)
        -> Result<EthTxAttempt, DbErr>;

    /// Marks an attempt as accepted by the node, now.
    async fn mark_attempt_broadcast(&self, attempt_id: i64) -> Result<(), DbErr>;

    /// Removes an attempt that can never be accepted.
    async fn delete_attempt(&self, attempt_id: i64) -> Result<(), DbErr>;

    /// Stores a receipt, replacing any previous one for the same hash.
    async fn save_receipt(&self, receipt: &StoredReceipt) -> Result<(), DbErr>;

    /// Stored receipt of an attempt hash.
    async fn receipt(&self, tx_hash: H256) -> Result<Option<StoredReceipt>, DbErr>;

    /// Confirms `attempt_id` and its tx. With an `error`, the tx becomes
    /// fatal instead.
    async fn confirm_tx(
        &self,
        tx_id: i64,
        attempt_id: i64,
        error: Option<&str>,
    ) -> Result<(), DbErr>;

    /// Confirmed txs whose receipt block is at or above `block_number`, with
    /// the confirmed attempt and its receipt.
    async fn confirmed_txs_since(
        &self,
        block_number: u64,
    ) -> Result<Vec<(EthTx, EthTxAttempt, StoredReceipt)>, DbErr>;

    /// Undoes a confirmation: the tx is unconfirmed again, the attempt
    /// broadcast and its receipt deleted.
    async fn unconfirm_tx(&self, tx_id: i64, attempt: &EthTxAttempt) -> Result<(), DbErr>;

    /// Gives up on a tx for its task run. An unstarted tx fails outright;
    /// one already holding a nonce keeps its state and only records
    /// `reason`, so it is still mined. Returns the state the tx is left in,
    /// or `None` when it was final or abandoned already.
    async fn abandon_tx(&self, tx_id: i64, reason: &str) -> Result<Option<EthTxState>, DbErr>;

    /// Tx by id.
    async fn tx(&self, id: i64) -> Result<Option<EthTx>, DbErr>;

    /// Tx owning the attempt with `hash`.
    async fn tx_by_attempt_hash(&self, hash: H256) -> Result<Option<EthTx>, DbErr>;

    /// Tx of `address` holding `nonce`.
    async fn tx_by_nonce(&self, address: Address, nonce: u64) -> Result<Option<EthTx>, DbErr>;

    /// Tx created for a pipeline task run.
    async fn tx_by_task_run(&self, task_run_id: Uuid) -> Result<Option<EthTx>, DbErr>;

    /// A page of attempts, newest first, and the total count.
    async fn list_attempts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<EthTxAttempt>, u64), DbErr>;
}

fn parse_state<T: FromStr>(s: &str) -> Result<T, DbErr> {
    T::from_str(s).map_err(|_| DbErr::Custom(format!("unknown state {s:?}")))
}

fn tx_from_model(m: eth_tx::Model) -> Result<EthTx, DbErr> {
    Ok(EthTx {
        id: m.id,
        from: bytes_to_address(&m.from_address)?,
        to: bytes_to_address(&m.to_address)?,
        payload: Bytes::from(m.encoded_payload),
        value: string_to_u256(&m.value)?,
        gas_limit: i64_to_u64(m.gas_limit),
        nonce: m.nonce.map(i64_to_u64),
        state: parse_state(&m.state)?,
        error: m.error,
        task_run_id: m.pipeline_task_run_id,
        min_confirmations: m.min_confirmations.map(i64_to_u64),
        created_at: to_chrono(m.time_created),
        broadcast_at: m.time_broadcast.map(to_chrono),
    })
}

fn attempt_from_model(m: eth_tx_attempt::Model) -> Result<EthTxAttempt, DbErr> {
    Ok(EthTxAttempt {
        id: m.id,
        eth_tx_id: m.eth_tx_id,
        hash: bytes_to_h256(&m.hash)?,
        gas_price: string_to_u256(&m.gas_price)?,
        signed_raw_tx: Bytes::from(m.signed_raw_tx),
        state: parse_state(&m.state)?,
        broadcast_before_block_number: m.broadcast_before_block_number.map(i64_to_u64),
        created_at: to_chrono(m.time_created),
        broadcast_at: m.time_broadcast.map(to_chrono),
    })
}

fn receipt_from_model(m: eth_receipt::Model) -> Result<StoredReceipt, DbErr> {
    Ok(StoredReceipt {
        tx_hash: bytes_to_h256(&m.tx_hash)?,
        block_hash: bytes_to_h256(&m.block_hash)?,
        block_number: i64_to_u64(m.block_number),
        tx_index: i64_to_u64(m.transaction_index),
        status: m.status,
    })
}

fn key_from_model(m: key_state::Model) -> Result<KeyState, DbErr> {
    Ok(KeyState {
        address: bytes_to_address(&m.address)?,
        next_nonce: i64_to_u64(m.next_nonce),
        disabled: m.disabled,
        created_at: to_chrono(m.time_created),
        updated_at: to_chrono(m.time_updated),
    })
}

fn new_attempt_model(tx_id: i64, attempt: &NewAttempt) -> eth_tx_attempt::ActiveModel {
    eth_tx_attempt::ActiveModel {
        id: NotSet,
        time_created: Set(now()),
        time_broadcast: Set(None),
        eth_tx_id: Set(tx_id),
        hash: Set(h256_to_bytes(&attempt.hash)),
        gas_price: Set(u256_to_string(attempt.gas_price)),
        signed_raw_tx: Set(attempt.signed_raw_tx.to_vec()),
        state: Set(AttemptState::InProgress.to_string()),
        broadcast_before_block_number: Set(None),
    }
}

#[async_trait]
impl TxStore for OracleDb {
    #[instrument(skip(self))]
    async fn ensure_key_state(&self, address: Address) -> Result<KeyState, DbErr> {
        let model = key_state::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            time_updated: Set(now()),
            address: Set(address_to_bytes(&address)),
            next_nonce: Set(0),
            disabled: Set(false),
        };
        match key_state::Entity::insert(model)
            .on_conflict(
                OnConflict::column(key_state::Column::Address)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self.conn())
            .await
        {
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(e) => return Err(e),
        }
        self.key_state(address)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("key state of {address:?}")))
    }

    async fn key_state(&self, address: Address) -> Result<Option<KeyState>, DbErr> {
        key_state::Entity::find()
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .one(self.conn())
            .await?
            .map(key_from_model)
            .transpose()
    }

    async fn key_states(&self) -> Result<Vec<KeyState>, DbErr> {
        key_state::Entity::find()
            .order_by_asc(key_state::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(key_from_model)
            .collect()
    }

    #[instrument(skip(self))]
    async fn sync_next_nonce_forward(&self, address: Address, nonce: u64) -> Result<bool, DbErr> {
        let res = key_state::Entity::update_many()
            .col_expr(key_state::Column::NextNonce, Expr::value(u64_to_i64(nonce)))
            .col_expr(key_state::Column::TimeUpdated, Expr::value(now()))
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .filter(key_state::Column::NextNonce.lt(u64_to_i64(nonce)))
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn reset_next_nonce(&self, address: Address, nonce: u64) -> Result<bool, DbErr> {
        let res = key_state::Entity::update_many()
            .col_expr(key_state::Column::NextNonce, Expr::value(u64_to_i64(nonce)))
            .col_expr(key_state::Column::TimeUpdated, Expr::value(now()))
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected > 0)
    }

    #[instrument(skip(self))]
    async fn set_key_disabled(&self, address: Address, disabled: bool) -> Result<bool, DbErr> {
        let res = key_state::Entity::update_many()
            .col_expr(key_state::Column::Disabled, Expr::value(disabled))
            .col_expr(key_state::Column::TimeUpdated, Expr::value(now()))
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected > 0)
    }

    #[instrument(skip(self, tx), fields(from = ?tx.from))]
    async fn insert_unstarted_tx(
        &self,
        tx: &NewTx,
        gas_limit: u64,
        max_queued: u64,
    ) -> Result<Option<EthTx>, DbErr> {
        let txn = self.conn().begin().await?;
        if max_queued > 0 {
            let queued = eth_tx::Entity::find()
                .filter(eth_tx::Column::FromAddress.eq(address_to_bytes(&tx.from)))
                .filter(eth_tx::Column::State.eq(EthTxState::Unstarted.to_string()))
                .count(&txn)
                .await?;
            if queued >= max_queued {
                txn.rollback().await?;
                return Ok(None);
            }
        }
        let model = eth_tx::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            time_broadcast: Set(None),
            from_address: Set(address_to_bytes(&tx.from)),
            to_address: Set(address_to_bytes(&tx.to)),
            encoded_payload: Set(tx.payload.to_vec()),
            value: Set(u256_to_string(tx.value)),
            gas_limit: Set(u64_to_i64(gas_limit)),
            nonce: Set(None),
            state: Set(EthTxState::Unstarted.to_string()),
            error: Set(None),
            pipeline_task_run_id: Set(tx.task_run_id),
            min_confirmations: Set(tx.min_confirmations.map(u64_to_i64)),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;
        tx_from_model(model).map(Some)
    }

    async fn next_unstarted_tx(&self, address: Address) -> Result<Option<EthTx>, DbErr> {
        eth_tx::Entity::find()
            .filter(eth_tx::Column::FromAddress.eq(address_to_bytes(&address)))
            .filter(eth_tx::Column::State.eq(EthTxState::Unstarted.to_string()))
            .order_by_asc(eth_tx::Column::Id)
            .one(self.conn())
            .await?
            .map(tx_from_model)
            .transpose()
    }

    async fn in_progress_tx(
        &self,
        address: Address,
    ) -> Result<Option<(EthTx, EthTxAttempt)>, DbErr> {
        let Some(tx) = eth_tx::Entity::find()
            .filter(eth_tx::Column::FromAddress.eq(address_to_bytes(&address)))
            .filter(eth_tx::Column::State.eq(EthTxState::InProgress.to_string()))
            .order_by_asc(eth_tx::Column::Id)
            .one(self.conn())
            .await?
        else {
            return Ok(None);
        };
        let attempt = eth_tx_attempt::Entity::find()
            .filter(eth_tx_attempt::Column::EthTxId.eq(tx.id))
            .order_by_desc(eth_tx_attempt::Column::Id)
            .one(self.conn())
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound(format!("attempt of in-progress tx {}", tx.id))
            })?;
        Ok(Some((tx_from_model(tx)?, attempt_from_model(attempt)?)))
    }

    async fn count_txs(&self, address: Address, state: EthTxState) -> Result<u64, DbErr> {
        eth_tx::Entity::find()
            .filter(eth_tx::Column::FromAddress.eq(address_to_bytes(&address)))
            .filter(eth_tx::Column::State.eq(state.to_string()))
            .count(self.conn())
            .await
    }

    #[instrument(skip(self, attempt), fields(hash = ?attempt.hash))]
    async fn save_in_progress(
        &self,
        tx_id: i64,
        address: Address,
        nonce: u64,
        attempt: &NewAttempt,
    ) -> Result<Option<EthTxAttempt>, DbErr> {
        let txn = self.conn().begin().await?;
        let key = key_state::Entity::find()
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .one(&txn)
            .await?;
        if key.map(|k| i64_to_u64(k.next_nonce)) != Some(nonce) {
            txn.rollback().await?;
            return Ok(None);
        }
        let updated = eth_tx::Entity::update_many()
            .col_expr(eth_tx::Column::Nonce, Expr::value(Some(u64_to_i64(nonce))))
            .col_expr(
                eth_tx::Column::State,
                Expr::value(EthTxState::InProgress.to_string()),
            )
            .filter(eth_tx::Column::Id.eq(tx_id))
            .filter(eth_tx::Column::State.eq(EthTxState::Unstarted.to_string()))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Err(DbErr::RecordNotUpdated);
        }
        let model = new_attempt_model(tx_id, attempt).insert(&txn).await?;
        txn.commit().await?;
        attempt_from_model(model).map(Some)
    }

    #[instrument(skip(self))]
    async fn mark_broadcast(
        &self,
        tx_id: i64,
        attempt_id: i64,
        address: Address,
        nonce: u64,
    ) -> Result<(), DbErr> {
        let txn = self.conn().begin().await?;
        let at = now();
        eth_tx_attempt::Entity::update_many()
            .col_expr(
                eth_tx_attempt::Column::State,
                Expr::value(AttemptState::Broadcast.to_string()),
            )
            .col_expr(eth_tx_attempt::Column::TimeBroadcast, Expr::value(Some(at)))
            .filter(eth_tx_attempt::Column::Id.eq(attempt_id))
            .exec(&txn)
            .await?;
        eth_tx::Entity::update_many()
            .col_expr(
                eth_tx::Column::State,
                Expr::value(EthTxState::Unconfirmed.to_string()),
            )
            .col_expr(eth_tx::Column::TimeBroadcast, Expr::value(Some(at)))
            .filter(eth_tx::Column::Id.eq(tx_id))
            .filter(eth_tx::Column::State.eq(EthTxState::InProgress.to_string()))
            .exec(&txn)
            .await?;
        let next = u64_to_i64(nonce.saturating_add(1));
        key_state::Entity::update_many()
            .col_expr(key_state::Column::NextNonce, Expr::value(next))
            .col_expr(key_state::Column::TimeUpdated, Expr::value(at))
            .filter(key_state::Column::Address.eq(address_to_bytes(&address)))
            .filter(key_state::Column::NextNonce.lt(next))
            .exec(&txn)
            .await?;
        txn.commit().await
    }

    #[instrument(skip(self))]
    async fn fail_tx(
        &self,
        tx_id: i64,
        attempt_id: Option<i64>,
        error: &str,
    ) -> Result<(), DbErr> {
        let txn = self.conn().begin().await?;
        if let Some(attempt_id) = attempt_id {
            eth_tx_attempt::Entity::delete_by_id(attempt_id)
                .exec(&txn)
                .await?;
        }
        eth_tx::Entity::update_many()
            .col_expr(
                eth_tx::Column::State,
                Expr::value(EthTxState::FatalError.to_string()),
            )
            .col_expr(eth_tx::Column::Nonce, Expr::value(Option::<i64>::None))
            .col_expr(eth_tx::Column::Error, Expr::value(Some(error.to_owned())))
            .filter(eth_tx::Column::Id.eq(tx_id))
            .exec(&txn)
            .await?;
        txn.commit().await
    }

    async fn unconfirmed_txs(&self) -> Result<Vec<EthTx>, DbErr> {
        eth_tx::Entity::find()
            .filter(eth_tx::Column::State.eq(EthTxState::Unconfirmed.to_string()))
            .order_by_asc(eth_tx::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(tx_from_model)
            .collect()
    }

    async fn attempts_for_tx(&self, tx_id: i64) -> Result<Vec<EthTxAttempt>, DbErr> {
        eth_tx_attempt::Entity::find()
            .filter(eth_tx_attempt::Column::EthTxId.eq(tx_id))
            .order_by_desc(eth_tx_attempt::Column::Id)
            .all(self.conn())
            .await?
            .into_iter()
            .map(attempt_from_model)
            .collect()
    }

    async fn set_broadcast_before_block(&self, number: u64) -> Result<u64, DbErr> {
        let res = eth_tx_attempt::Entity::update_many()
            .col_expr(
                eth_tx_attempt::Column::BroadcastBeforeBlockNumber,
                Expr::value(Some(u64_to_i64(number))),
            )
            .filter(eth_tx_attempt::Column::State.eq(AttemptState::Broadcast.to_string()))
            .filter(eth_tx_attempt::Column::BroadcastBeforeBlockNumber.is_null())
            .exec(self.conn())
            .await?;
        Ok(res.rows_affected)
    }

    #[instrument(skip(self, attempt), fields(hash = ?attempt.hash))]
    async fn insert_attempt(
        &self,
        tx_id: i64,
        attempt: &NewAttempt,
    ) -> Result<EthTxAttempt, DbErr> {
        let model = new_attempt_model(tx_id, attempt).insert(self.conn()).await?;
        attempt_from_model(model)
    }

    async fn mark_attempt_broadcast(&self, attempt_id: i64) -> Result<(), DbErr> {
        eth_tx_attempt::Entity::update_many()
            .col_expr(
                eth_tx_attempt::Column::State,
                Expr::value(AttemptState::Broadcast.to_string()),
            )
            .col_expr(eth_tx_attempt::Column::TimeBroadcast, Expr::value(Some(now())))
            .filter(eth_tx_attempt::Column::Id.eq(attempt_id))
            .filter(eth_tx_attempt::Column::State.ne(AttemptState::Confirmed.to_string()))
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn delete_attempt(&self, attempt_id: i64) -> Result<(), DbErr> {
        eth_tx_attempt::Entity::delete_by_id(attempt_id)
            .exec(self.conn())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, receipt), fields(hash = ?receipt.tx_hash, block = receipt.block_number))]
    async fn save_receipt(&self, receipt: &StoredReceipt) -> Result<(), DbErr> {
        let model = eth_receipt::ActiveModel {
            id: NotSet,
            time_created: Set(now()),
            tx_hash: Set(h256_to_bytes(&receipt.tx_hash)),
            block_hash: Set(h256_to_bytes(&receipt.block_hash)),
            block_number: Set(u64_to_i64(receipt.block_number)),
            transaction_index: Set(u64_to_i64(receipt.tx_index)),
            status: Set(receipt.status),
        };
        eth_receipt::Entity::insert(model)
            .on_conflict(
                OnConflict::column(eth_receipt::Column::TxHash)
                    .update_columns([
                        eth_receipt::Column::BlockHash,
                        eth_receipt::Column::BlockNumber,
                        eth_receipt::Column::TransactionIndex,
                        eth_receipt::Column::Status,
                    ])
                    .to_owned(),
            )
            .exec(self.conn())
            .await?;
        Ok(())
    }

    async fn receipt(&self, tx_hash: H256) -> Result<Option<StoredReceipt>, DbErr> {
        eth_receipt::Entity::find()
            .filter(eth_receipt::Column::TxHash.eq(h256_to_bytes(&tx_hash)))
            .one(self.conn())
            .await?
            .map(receipt_from_model)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn confirm_tx(
        &self,
        tx_id: i64,
        attempt_id: i64,
        error: Option<&str>,
    ) -> Result<(), DbErr> {
        let txn = self.conn().begin().await?;
        eth_tx_attempt::Entity::update_many()
            .col_expr(
                eth_tx_attempt::Column::State,
                Expr::value(AttemptState::Confirmed.to_string()),
            )
            .filter(eth_tx_attempt::Column::Id.eq(attempt_id))
            .exec(&txn)
            .await?;
        let update = match error {
            Some(error) => eth_tx::Entity::update_many()
                .col_expr(
                    eth_tx::Column::State,
                    Expr::value(EthTxState::FatalError.to_string()),
                )
                .col_expr(eth_tx::Column::Error, Expr::value(Some(error.to_owned()))),
            // an abandoned tx keeps its reason
            None => eth_tx::Entity::update_many().col_expr(
                eth_tx::Column::State,
                Expr::value(EthTxState::Confirmed.to_string()),
            ),
        };
        update
            .filter(eth_tx::Column::Id.eq(tx_id))
            .exec(&txn)
            .await?;
        txn.commit().await
    }

    async fn confirmed_txs_since(
        &self,
        block_number: u64,
    ) -> Result<Vec<(EthTx, EthTxAttempt, StoredReceipt)>, DbErr> {
        let receipts = eth_receipt::Entity::find()
            .filter(eth_receipt::Column::BlockNumber.gte(u64_to_i64(block_number)))
            .all(self.conn())
            .await?;
        if receipts.is_empty() {
            return Ok(vec![]);
        }
        let attempts = eth_tx_attempt::Entity::find()
            .filter(eth_tx_attempt::Column::Hash.is_in(receipts.iter().map(|r| r.tx_hash.clone())))
            .filter(eth_tx_attempt::Column::State.eq(AttemptState::Confirmed.to_string()))
            .all(self.conn())
            .await?;
        let mut out = Vec::with_capacity(attempts.len());
        for attempt in attempts {
            let Some(tx) = eth_tx::Entity::find_by_id(attempt.eth_tx_id)
                .filter(eth_tx::Column::State.eq(EthTxState::Confirmed.to_string()))
                .one(self.conn())
                .await?
            else {
                continue;
            };
            let Some(receipt) = receipts.iter().find(|r| r.tx_hash == attempt.hash).cloned()
            else {
                continue;
            };
            out.push((
                tx_from_model(tx)?,
                attempt_from_model(attempt)?,
                receipt_from_model(receipt)?,
            ));
        }
        out.sort_by_key(|(tx, _, _)| tx.id);
        Ok(out)
    }

    #[instrument(skip(self, attempt), fields(attempt = attempt.id))]
    async fn unconfirm_tx(&self, tx_id: i64, attempt: &EthTxAttempt) -> Result<(), DbErr> {
        let txn = self.conn().begin().await?;
        eth_tx_attempt::Entity::update_many()
            .col_expr(
                eth_tx_attempt::Column::State,
                Expr::value(AttemptState::Broadcast.to_string()),
            )
            .filter(eth_tx_attempt::Column::Id.eq(attempt.id))
            .exec(&txn)
            .await?;
        // a revert that was reorged out no longer stands
        eth_tx::Entity::update_many()
            .col_expr(eth_tx::Column::Error, Expr::value(None::<String>))
            .filter(eth_tx::Column::Id.eq(tx_id))
            .filter(eth_tx::Column::State.eq(EthTxState::FatalError.to_string()))
            .exec(&txn)
            .await?;
        eth_tx::Entity::update_many()
            .col_expr(
                eth_tx::Column::State,
                Expr::value(EthTxState::Unconfirmed.to_string()),
            )
            .filter(eth_tx::Column::Id.eq(tx_id))
            .exec(&txn)
            .await?;
        eth_receipt::Entity::delete_many()
            .filter(eth_receipt::Column::TxHash.eq(h256_to_bytes(&attempt.hash)))
            .exec(&txn)
            .await?;
        txn.commit().await
    }

    #[instrument(skip(self))]
    async fn abandon_tx(&self, tx_id: i64, reason: &str) -> Result<Option<EthTxState>, DbErr> {
        let txn = self.conn().begin().await?;
        let Some(tx) = eth_tx::Entity::find_by_id(tx_id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };
        let state: EthTxState = parse_state(&tx.state)?;
        let next = match state {
            EthTxState::Unstarted => EthTxState::FatalError,
            EthTxState::InProgress | EthTxState::Unconfirmed if tx.error.is_none() => state,
            _ => {
                txn.rollback().await?;
                return Ok(None);
            }
        };
        eth_tx::Entity::update_many()
            .col_expr(eth_tx::Column::State, Expr::value(next.to_string()))
            .col_expr(eth_tx::Column::Error, Expr::value(Some(reason.to_owned())))
            .filter(eth_tx::Column::Id.eq(tx_id))
            .filter(eth_tx::Column::State.eq(state.to_string()))
            .exec(&txn)
            .await?;
        txn.commit().await?;
        Ok(Some(next))
    }

    async fn tx(&self, id: i64) -> Result<Option<EthTx>, DbErr> {
        eth_tx::Entity::find_by_id(id)
            .one(self.conn())
            .await?
            .map(tx_from_model)
            .transpose()
    }

    async fn tx_by_attempt_hash(&self, hash: H256) -> Result<Option<EthTx>, DbErr> {
        let Some(attempt) = eth_tx_attempt::Entity::find()
            .filter(eth_tx_attempt::Column::Hash.eq(h256_to_bytes(&hash)))
            .one(self.conn())
            .await?
        else {
            return Ok(None);
        };
        self.tx(attempt.eth_tx_id).await
    }

    async fn tx_by_nonce(&self, address: Address, nonce: u64) -> Result<Option<EthTx>, DbErr> {
        eth_tx::Entity::find()
            .filter(eth_tx::Column::FromAddress.eq(address_to_bytes(&address)))
            .filter(eth_tx::Column::Nonce.eq(u64_to_i64(nonce)))
            .order_by_desc(eth_tx::Column::Id)
            .one(self.conn())
            .await?
            .map(tx_from_model)
            .transpose()
    }

    async fn tx_by_task_run(&self, task_run_id: Uuid) -> Result<Option<EthTx>, DbErr> {
        eth_tx::Entity::find()
            .filter(eth_tx::Column::PipelineTaskRunId.eq(task_run_id))
            .order_by_desc(eth_tx::Column::Id)
            .one(self.conn())
            .await?
            .map(tx_from_model)
            .transpose()
    }

    async fn list_attempts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<EthTxAttempt>, u64), DbErr> {
        let total = eth_tx_attempt::Entity::find().count(self.conn()).await?;
        let attempts = eth_tx_attempt::Entity::find()
            .order_by_desc(eth_tx_attempt::Column::Id)
            .offset(offset)
            .limit(limit)
            .all(self.conn())
            .await?
            .into_iter()
            .map(attempt_from_model)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((attempts, total))
    }
}

#[cfg(test)]
mod tests {
    use oracle_core::U256;

    use super::*;

    fn new_tx(from: Address) -> NewTx {
        NewTx {
            from,
            to: Address::repeat_byte(0xbb),
            payload: Bytes::from(vec![1, 2, 3]),
            value: U256::from(7),
            gas_limit: None,
            task_run_id: Some(Uuid::new_v4()),
            min_confirmations: None,
        }
    }

    fn attempt(byte: u8, gwei: u64) -> NewAttempt {
        NewAttempt {
            hash: H256::repeat_byte(byte),
            gas_price: U256::from(gwei) * U256::exp10(9),
            signed_raw_tx: Bytes::from(vec![byte; 4]),
        }
    }

    #[tokio::test]
    async fn queue_limit_is_enforced() {
        let db = OracleDb::in_memory().await.unwrap();
        let from = Address::repeat_byte(0xaa);
        assert!(db.insert_unstarted_tx(&new_tx(from), 21_000, 2).await.unwrap().is_some());
        assert!(db.insert_unstarted_tx(&new_tx(from), 21_000, 2).await.unwrap().is_some());
        assert!(db.insert_unstarted_tx(&new_tx(from), 21_000, 2).await.unwrap().is_none());
        // other senders have their own queue
        let other = Address::repeat_byte(0xcc);
        assert!(db.insert_unstarted_tx(&new_tx(other), 21_000, 2).await.unwrap().is_some());
        // 0 is unlimited
        assert!(db.insert_unstarted_tx(&new_tx(from), 21_000, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nonce_is_assigned_and_advanced_atomically() {
        let db = OracleDb::in_memory().await.unwrap();
        let from = Address::repeat_byte(0xaa);
        db.ensure_key_state(from).await.unwrap();
        let tx = db.insert_unstarted_tx(&new_tx(from), 21_000, 0).await.unwrap().unwrap();
        assert_eq!(tx.state, EthTxState::Unstarted);
        assert_eq!(tx.value, U256::from(7));

        // a stale nonce writes nothing
        assert!(db.save_in_progress(tx.id, from, 3, &attempt(1, 20)).await.unwrap().is_none());
        assert!(db.attempts_for_tx(tx.id).await.unwrap().is_empty());

        let a = db.save_in_progress(tx.id, from, 0, &attempt(1, 20)).await.unwrap().unwrap();
        let (in_progress, a2) = db.in_progress_tx(from).await.unwrap().unwrap();
        assert_eq!(in_progress.nonce, Some(0));
        assert_eq!(a2, a);
        assert_eq!(db.key_state(from).await.unwrap().unwrap().next_nonce, 0);

        db.mark_broadcast(tx.id, a.id, from, 0).await.unwrap();
        let tx = db.tx(tx.id).await.unwrap().unwrap();
        assert_eq!(tx.state, EthTxState::Unconfirmed);
        assert!(tx.broadcast_at.is_some());
        assert_eq!(db.key_state(from).await.unwrap().unwrap().next_nonce, 1);
        assert_eq!(
            db.attempts_for_tx(tx.id).await.unwrap()[0].state,
            AttemptState::Broadcast
        );
    }

    #[tokio::test]
    async fn next_nonce_only_syncs_forward() {
        let db = OracleDb::in_memory().await.unwrap();
        let from = Address::repeat_byte(0xaa);
        db.ensure_key_state(from).await.unwrap();
        assert!(db.sync_next_nonce_forward(from, 5).await.unwrap());
        assert!(!db.sync_next_nonce_forward(from, 3).await.unwrap());
        assert_eq!(db.key_state(from).await.unwrap().unwrap().next_nonce, 5);
        assert!(db.reset_next_nonce(from, 2).await.unwrap());
        assert_eq!(db.key_state(from).await.unwrap().unwrap().next_nonce, 2);
        // ensure does not reset an existing row
        assert_eq!(db.ensure_key_state(from).await.unwrap().next_nonce, 2);
    }

    #[tokio::test]
    async fn failed_tx_releases_its_nonce() {
        let db = OracleDb::in_memory().await.unwrap();
        let from = Address::repeat_byte(0xaa);
        db.ensure_key_state(from).await.unwrap();
        let tx = db.insert_unstarted_tx(&new_tx(from), 21_000, 0).await.unwrap().unwrap();
        let a = db.save_in_progress(tx.id, from, 0, &attempt(1, 20)).await.unwrap().unwrap();
        db.fail_tx(tx.id, Some(a.id), "insufficient funds").await.unwrap();

        let tx = db.tx(tx.id).await.unwrap().unwrap();
        assert_eq!(tx.state, EthTxState::FatalError);
        assert_eq!(tx.nonce, None);
        assert_eq!(tx.error.as_deref(), Some("insufficient funds"));
        assert!(db.attempts_for_tx(tx.id).await.unwrap().is_empty());
        assert_eq!(db.key_state(from).await.unwrap().unwrap().next_nonce, 0);
    }

    #[tokio::test]
    async fn confirmation_and_reorg_round_trip() {
        let db = OracleDb::in_memory().await.unwrap();
        let from = Address::repeat_byte(0xaa);
        db.ensure_key_state(from).await.unwrap();
        let tx = db.insert_unstarted_tx(&new_tx(from), 21_000, 0).await.unwrap().unwrap();
        let a = db.save_in_progress(tx.id, from, 0, &attempt(1, 20)).await.unwrap().unwrap();
        db.mark_broadcast(tx.id, a.id, from, 0).await.unwrap();
        assert_eq!(db.set_broadcast_before_block(100).await.unwrap(), 1);
        assert_eq!(db.set_broadcast_before_block(101).await.unwrap(), 0);

        let receipt = StoredReceipt {
            tx_hash: a.hash,
            block_hash: H256::repeat_byte(9),
            block_number: 101,
            tx_index: 0,
            status: Some(true),
        };
        db.save_receipt(&receipt).await.unwrap();
        db.save_receipt(&receipt).await.unwrap();
        db.confirm_tx(tx.id, a.id, None).await.unwrap();

        let confirmed = db.confirmed_txs_since(90).await.unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].2, receipt);
        assert!(db.confirmed_txs_since(102).await.unwrap().is_empty());

        db.unconfirm_tx(tx.id, &confirmed[0].1).await.unwrap();
        assert_eq!(db.tx(tx.id).await.unwrap().unwrap().state, EthTxState::Unconfirmed);
        assert!(db.receipt(a.hash).await.unwrap().is_none());
        assert_eq!(db.unconfirmed_txs().await.unwrap().len(), 1);

        let found = db.tx_by_attempt_hash(a.hash).await.unwrap().unwrap();
        assert_eq!(found.id, tx.id);
        assert_eq!(db.tx_by_nonce(from, 0).await.unwrap().unwrap().id, tx.id);
        let (page, total) = db.list_attempts(0, 10).await.unwrap();
        assert_eq!((page.len(), total), (1, 1));
    }
}
