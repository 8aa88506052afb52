use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use headtracker::HeadTrackable;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use oracle_base::db::OracleDb;
use oracle_core::{
    Address, Bytes, ChainClient, ChainCommunicationError, ChainHealth, Head, KeyStore,
    UnsignedTx, U256,
};
use oracle_test::{test_key_store, SimulatedChain};

use crate::*;

const CHAIN_ID: u64 = 1337;

fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

#[derive(Debug, Default)]
struct Recorder(Mutex<Vec<(Uuid, TxOutcome)>>);

impl Recorder {
    fn outcomes(&self) -> Vec<(Uuid, TxOutcome)> {
        self.0.lock().clone()
    }
}

#[async_trait]
impl ResumeCallback for Recorder {
    async fn resume(&self, task_run_id: Uuid, outcome: TxOutcome) -> eyre::Result<()> {
        self.0.lock().push((task_run_id, outcome));
        Ok(())
    }
}

struct Harness {
    chain: Arc<SimulatedChain>,
    db: OracleDb,
    keys: Arc<oracle_base::LocalKeyStore>,
    mgr: TxManager,
    from: Address,
    resumed: Arc<Recorder>,
    health: watch::Sender<ChainHealth>,
}

fn test_config() -> TxmConfig {
    TxmConfig {
        chain_id: CHAIN_ID,
        finality_depth: 5,
        min_confirmations: 2,
        gas_bump_threshold: 2,
        retry_backoff: Duration::from_millis(10),
        max_retry_backoff: Duration::from_millis(20),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

impl Harness {
    async fn new(config: TxmConfig) -> Self {
        let chain = Arc::new(SimulatedChain::with_height(CHAIN_ID, 10));
        let db = OracleDb::in_memory().await.unwrap();
        let keys = Arc::new(test_key_store(1));
        let from = keys.sending_keys().await.unwrap()[0];
        let (health, health_rx) = watch::channel(ChainHealth::Healthy);
        let mgr = TxManager::new(
            Arc::new(db.clone()),
            chain.clone(),
            keys.clone(),
            config,
            TxmMetrics::dummy_instance(),
            health_rx,
        );
        let resumed = Arc::new(Recorder::default());
        mgr.set_resume_callback(resumed.clone());
        Self {
            chain,
            db,
            keys,
            mgr,
            from,
            resumed,
            health,
        }
    }

    fn new_tx(&self) -> NewTx {
        NewTx {
            from: self.from,
            to: Address::repeat_byte(0xcc),
            payload: Bytes::from(vec![0xde, 0xad]),
            value: U256::zero(),
            gas_limit: Some(100_000),
            task_run_id: Some(Uuid::new_v4()),
            min_confirmations: None,
        }
    }

    async fn broadcast(&self) -> TxmResult<()> {
        self.mgr.broadcaster(self.from).process().await
    }

    async fn on_head(&self, head: &Head) {
        self.mgr.confirmer().on_new_longest_chain(head).await;
    }

    /// Mines a block and feeds it to the confirmer.
    async fn mine(&self) -> Head {
        let head = self.chain.mine_block();
        self.on_head(&head).await;
        head
    }

    async fn tx(&self, id: i64) -> EthTx {
        self.db.tx(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn enqueued_tx_is_broadcast_confirmed_and_resumed() {
    let h = Harness::new(test_config()).await;
    let new_tx = h.new_tx();
    let task_run_id = new_tx.task_run_id.unwrap();
    let tx = h.mgr.enqueue(new_tx).await.unwrap();
    assert_eq!(tx.state, EthTxState::Unstarted);
    assert_eq!(tx.nonce, None);

    h.broadcast().await.unwrap();
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(sent[0].gas_price, gwei(20));
    let stored = h.tx(tx.id).await;
    assert_eq!(stored.state, EthTxState::Unconfirmed);
    assert_eq!(stored.nonce, Some(0));
    assert_eq!(h.db.key_state(h.from).await.unwrap().unwrap().next_nonce, 1);

    let mined = h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
    let receipt = h.db.receipt(sent[0].hash).await.unwrap().unwrap();
    assert_eq!(receipt.block_number, mined.number);
    assert!(h.resumed.outcomes().is_empty());

    h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
    h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Confirmed);
    assert_eq!(h.resumed.outcomes(), vec![(task_run_id, Ok(sent[0].hash))]);
    assert_eq!(
        h.mgr.task_run_outcome(task_run_id).await.unwrap(),
        Some(Ok(sent[0].hash))
    );

    let (found, attempts) = h.mgr.get_transaction(sent[0].hash).await.unwrap();
    assert_eq!(found.id, tx.id);
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Confirmed);
}

#[tokio::test]
async fn nonces_are_contiguous_and_unique() {
    let h = Harness::new(test_config()).await;
    for _ in 0..5 {
        h.mgr.enqueue(h.new_tx()).await.unwrap();
    }
    h.broadcast().await.unwrap();
    let nonces: Vec<u64> = h.chain.sent().iter().map(|t| t.nonce).collect();
    assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
    assert_eq!(h.db.key_state(h.from).await.unwrap().unwrap().next_nonce, 5);
}

#[tokio::test]
async fn in_flight_limit_pauses_broadcasting() {
    let h = Harness::new(TxmConfig {
        max_in_flight_transactions: 2,
        min_confirmations: 1,
        ..test_config()
    })
    .await;
    for _ in 0..3 {
        h.mgr.enqueue(h.new_tx()).await.unwrap();
    }
    h.broadcast().await.unwrap();
    assert_eq!(h.chain.sent().len(), 2);

    h.mine().await;
    h.mine().await;
    h.broadcast().await.unwrap();
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].nonce, 2);
}

#[tokio::test]
async fn full_queue_rejects_enqueue() {
    let h = Harness::new(TxmConfig {
        max_queued_transactions: 1,
        ..test_config()
    })
    .await;
    h.mgr.enqueue(h.new_tx()).await.unwrap();
    let err = h.mgr.enqueue(h.new_tx()).await.unwrap_err();
    assert!(matches!(err, TxmError::QueueFull { limit: 1, .. }), "{err}");
}

#[tokio::test]
async fn unknown_or_disabled_keys_are_rejected() {
    let h = Harness::new(test_config()).await;
    let err = h
        .mgr
        .enqueue(NewTx {
            from: Address::repeat_byte(0x01),
            ..h.new_tx()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TxmError::Validation(_)));

    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.mgr.set_key_disabled(h.from, true).await.unwrap();
    h.broadcast().await.unwrap();
    assert!(h.chain.sent().is_empty());
    assert!(matches!(
        h.mgr.enqueue(h.new_tx()).await.unwrap_err(),
        TxmError::Validation(_)
    ));

    h.mgr.set_key_disabled(h.from, false).await.unwrap();
    h.broadcast().await.unwrap();
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
}

#[tokio::test]
async fn nothing_is_broadcast_while_the_chain_is_unavailable() {
    let h = Harness::new(test_config()).await;
    h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.health.send_replace(ChainHealth::Unavailable);
    h.broadcast().await.unwrap();
    assert!(h.chain.sent().is_empty());
    h.health.send_replace(ChainHealth::Healthy);
    h.broadcast().await.unwrap();
    assert_eq!(h.chain.sent().len(), 1);
}

#[tokio::test]
async fn stalled_tx_is_bumped_after_threshold() {
    let h = Harness::new(test_config()).await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.chain.set_withhold_receipts(true);
    h.broadcast().await.unwrap();

    // stamps the attempt with the current tip
    let tip = h.chain.tip();
    h.on_head(&tip).await;
    h.mine().await;
    assert_eq!(h.db.attempts_for_tx(tx.id).await.unwrap().len(), 1);

    h.mine().await;
    let attempts = h.db.attempts_for_tx(tx.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    // max(20 * 1.2, 20 + 5) gwei, same nonce
    assert_eq!(attempts[0].gas_price, gwei(25));
    assert_eq!(attempts[0].state, AttemptState::Broadcast);
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].nonce, sent[0].nonce);

    h.chain.set_withhold_receipts(false);
    h.mine().await;
    h.mine().await;
    h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Confirmed);
    let attempts = h.db.attempts_for_tx(tx.id).await.unwrap();
    let confirmed: Vec<_> = attempts
        .iter()
        .filter(|a| a.state == AttemptState::Confirmed)
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].hash, sent[1].hash);
}

#[tokio::test]
async fn bumping_stops_at_the_gas_cap() {
    let h = Harness::new(TxmConfig {
        max_gas_price_wei: gwei(20),
        ..test_config()
    })
    .await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.chain.set_withhold_receipts(true);
    h.broadcast().await.unwrap();
    let tip = h.chain.tip();
    h.on_head(&tip).await;
    for _ in 0..4 {
        h.mine().await;
    }
    assert_eq!(h.db.attempts_for_tx(tx.id).await.unwrap().len(), 1);
    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
}

#[tokio::test]
async fn reorged_out_tx_is_rebroadcast_and_reconfirmed() {
    let h = Harness::new(TxmConfig {
        min_confirmations: 1,
        ..test_config()
    })
    .await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.broadcast().await.unwrap();
    h.mine().await;
    h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Confirmed);
    let first = h.chain.sent()[0].hash;

    let tip = h.chain.reorg(2);
    assert!(h.chain.receipt_of(first).is_none());
    h.on_head(&tip).await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
    assert!(h.db.receipt(first).await.unwrap().is_none());
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].gas_price > sent[0].gas_price);

    h.mine().await;
    h.mine().await;
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Confirmed);
    let attempts = h.db.attempts_for_tx(tx.id).await.unwrap();
    let confirmed: Vec<_> = attempts
        .iter()
        .filter(|a| a.state == AttemptState::Confirmed)
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].hash, sent[1].hash);
}

async fn sign(h: &Harness, nonce: u64, gas_price: U256) -> oracle_core::SignedTx {
    h.keys
        .sign_tx(
            h.from,
            &UnsignedTx {
                nonce,
                to: Address::repeat_byte(0xcc),
                value: U256::zero(),
                data: Bytes::default(),
                gas_limit: 21_000,
                gas_price,
            },
            CHAIN_ID,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn in_progress_tx_is_resent_with_the_same_bytes() {
    let h = Harness::new(test_config()).await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    // state left behind by a crash between saving and sending
    let signed = sign(&h, 0, gwei(20)).await;
    h.db
        .save_in_progress(
            tx.id,
            h.from,
            0,
            &NewAttempt {
                hash: signed.hash,
                gas_price: gwei(20),
                signed_raw_tx: signed.raw.clone(),
            },
        )
        .await
        .unwrap()
        .unwrap();

    h.broadcast().await.unwrap();
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].hash, signed.hash);
    assert_eq!(sent[0].raw, signed.raw);
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
}

#[tokio::test]
async fn shutdown_mid_broadcast_resumes_with_the_same_nonce_and_bytes() {
    let h = Harness::new(test_config()).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let handles = h.mgr.start(cancel.clone()).await.unwrap();
    h.chain.set_sends_stalled(true);
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();

    // nonce and attempt are saved, the send never returns
    let mut in_progress = None;
    for _ in 0..100 {
        in_progress = h.db.in_progress_tx(h.from).await.unwrap();
        if in_progress.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (saved, attempt) = in_progress.expect("tx never went in progress");
    assert_eq!(saved.id, tx.id);
    assert_eq!(saved.nonce, Some(0));

    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("broadcaster kept running after shutdown")
            .unwrap();
    }
    assert!(h.chain.sent().is_empty());
    assert_eq!(h.tx(tx.id).await.state, EthTxState::InProgress);

    // a new manager over the same store finishes the send
    h.chain.set_sends_stalled(false);
    let (_health, health_rx) = watch::channel(ChainHealth::Healthy);
    let restarted = TxManager::new(
        Arc::new(h.db.clone()),
        h.chain.clone(),
        h.keys.clone(),
        test_config(),
        TxmMetrics::dummy_instance(),
        health_rx,
    );
    let cancel = tokio_util::sync::CancellationToken::new();
    let handles = restarted.start(cancel.clone()).await.unwrap();
    let mut state = EthTxState::InProgress;
    for _ in 0..100 {
        state = h.tx(tx.id).await.state;
        if state == EthTxState::Unconfirmed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, EthTxState::Unconfirmed);

    let sent = h.chain.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].nonce, 0);
    assert_eq!(sent[0].hash, attempt.hash);
    assert_eq!(sent[0].raw, attempt.signed_raw_tx);
    assert_eq!(h.db.attempts_for_tx(tx.id).await.unwrap().len(), 1);
    assert_eq!(h.db.count_txs(h.from, EthTxState::InProgress).await.unwrap(), 0);
    assert_eq!(restarted.list_keys().await.unwrap()[0].next_nonce, 1);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn already_known_tx_counts_as_broadcast() {
    let h = Harness::new(test_config()).await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    let signed = sign(&h, 0, gwei(20)).await;
    h.db
        .save_in_progress(
            tx.id,
            h.from,
            0,
            &NewAttempt {
                hash: signed.hash,
                gas_price: gwei(20),
                signed_raw_tx: signed.raw.clone(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    // sent before the crash, never marked
    h.chain.send_raw_transaction(signed.raw).await.unwrap();

    h.broadcast().await.unwrap();
    assert_eq!(h.chain.sent().len(), 1);
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
    assert_eq!(h.db.key_state(h.from).await.unwrap().unwrap().next_nonce, 1);
}

#[tokio::test]
async fn fatal_send_error_fails_the_tx_and_frees_the_nonce() {
    let h = Harness::new(test_config()).await;
    let new_tx = h.new_tx();
    let task_run_id = new_tx.task_run_id.unwrap();
    let tx = h.mgr.enqueue(new_tx).await.unwrap();
    h.chain.push_send_error(ChainCommunicationError::rpc(
        Some(-32000),
        "insufficient funds for gas * price + value",
    ));
    h.broadcast().await.unwrap();

    let failed = h.tx(tx.id).await;
    assert_eq!(failed.state, EthTxState::FatalError);
    assert_eq!(failed.nonce, None);
    assert!(failed.error.unwrap().contains("insufficient funds"));
    assert!(h.db.attempts_for_tx(tx.id).await.unwrap().is_empty());
    let outcomes = h.resumed.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, task_run_id);
    assert!(outcomes[0].1.is_err());

    let next = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.broadcast().await.unwrap();
    assert_eq!(h.tx(next.id).await.nonce, Some(0));
}

#[tokio::test]
async fn transient_send_error_keeps_the_tx_in_progress() {
    let h = Harness::new(test_config()).await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.chain
        .push_send_error(ChainCommunicationError::Transport("connection reset".into()));
    assert!(h.broadcast().await.is_err());
    assert_eq!(h.tx(tx.id).await.state, EthTxState::InProgress);
    assert!(h.chain.sent().is_empty());

    h.broadcast().await.unwrap();
    assert_eq!(h.tx(tx.id).await.state, EthTxState::Unconfirmed);
    assert_eq!(h.chain.sent().len(), 1);
}

#[tokio::test]
async fn nonce_is_synced_forward_from_the_chain() {
    let h = Harness::new(test_config()).await;
    for nonce in 0..3 {
        let signed = sign(&h, nonce, gwei(10)).await;
        h.chain.send_raw_transaction(signed.raw).await.unwrap();
    }
    h.mgr.broadcaster(h.from).sync_nonce().await.unwrap();
    assert_eq!(h.db.key_state(h.from).await.unwrap().unwrap().next_nonce, 3);

    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.broadcast().await.unwrap();
    assert_eq!(h.tx(tx.id).await.nonce, Some(3));
}

#[tokio::test]
async fn reverted_tx_becomes_fatal() {
    let h = Harness::new(TxmConfig {
        min_confirmations: 1,
        ..test_config()
    })
    .await;
    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    h.broadcast().await.unwrap();
    let hash = h.chain.sent()[0].hash;
    h.chain.mine_block();
    h.chain.revert_tx(hash);
    h.mine().await;

    let failed = h.tx(tx.id).await;
    assert_eq!(failed.state, EthTxState::FatalError);
    assert_eq!(failed.error.as_deref(), Some("transaction reverted"));
    assert_eq!(h.resumed.outcomes()[0].1, Err("transaction reverted".to_owned()));
}

#[tokio::test]
async fn force_rebroadcast_fills_gaps_with_self_transfers() {
    let h = Harness::new(test_config()).await;
    let results = h
        .mgr
        .force_rebroadcast(0..=1, h.from, gwei(50), 21_000)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, outcome)| outcome.is_ok()));
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].nonce, 1);
    assert_eq!(sent[1].gas_price, gwei(50));

    assert!(matches!(
        h.mgr.force_rebroadcast(2..=1, h.from, gwei(50), 21_000).await,
        Err(TxmError::Validation(_))
    ));
}

#[tokio::test]
async fn reset_nonce_overrides_the_stored_value() {
    let h = Harness::new(test_config()).await;
    assert!(matches!(
        h.mgr.reset_nonce(h.from, 7).await,
        Err(TxmError::NotFound(_))
    ));
    h.db.ensure_key_state(h.from).await.unwrap();
    h.mgr.reset_nonce(h.from, 7).await.unwrap();
    let keys = h.mgr.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].next_nonce, 7);
}

#[tokio::test]
async fn started_broadcaster_sends_on_enqueue() {
    let h = Harness::new(test_config()).await;
    let cancel = tokio_util::sync::CancellationToken::new();
    let handles = h.mgr.start(cancel.clone()).await.unwrap();
    assert_eq!(handles.len(), 1);

    let tx = h.mgr.enqueue(h.new_tx()).await.unwrap();
    let mut state = EthTxState::Unstarted;
    for _ in 0..100 {
        state = h.tx(tx.id).await.state;
        if state == EthTxState::Unconfirmed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, EthTxState::Unconfirmed);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn unstarted_tx_is_abandoned_outright() {
    let h = Harness::new(test_config()).await;
    let new_tx = h.new_tx();
    let task_run_id = new_tx.task_run_id.unwrap();
    let tx = h.mgr.enqueue(new_tx).await.unwrap();

    assert!(h
        .mgr
        .abandon_task_run_tx(task_run_id, "abandoned after reorg")
        .await
        .unwrap());
    let abandoned = h.tx(tx.id).await;
    assert_eq!(abandoned.state, EthTxState::FatalError);
    assert_eq!(abandoned.nonce, None);
    assert_eq!(
        h.mgr.task_run_outcome(task_run_id).await.unwrap(),
        Some(Err("abandoned after reorg".to_owned()))
    );
    // final txs are left as they are
    assert!(!h
        .mgr
        .abandon_task_run_tx(task_run_id, "again")
        .await
        .unwrap());
    assert!(!h.mgr.abandon_task_run_tx(Uuid::new_v4(), "x").await.unwrap());

    h.broadcast().await.unwrap();
    assert!(h.chain.sent().is_empty());
}

#[tokio::test]
async fn abandoned_broadcast_tx_is_still_mined_so_later_nonces_confirm() {
    let h = Harness::new(test_config()).await;
    let first = h.new_tx();
    let abandoned_run = first.task_run_id.unwrap();
    let first = h.mgr.enqueue(first).await.unwrap();
    let second = h.new_tx();
    let waiting_run = second.task_run_id.unwrap();
    let second = h.mgr.enqueue(second).await.unwrap();
    h.broadcast().await.unwrap();
    let sent = h.chain.sent();
    assert_eq!(sent.len(), 2);

    assert!(h
        .mgr
        .abandon_task_run_tx(abandoned_run, "abandoned after reorg")
        .await
        .unwrap());
    let abandoned = h.tx(first.id).await;
    assert_eq!(abandoned.state, EthTxState::Unconfirmed);
    assert_eq!(abandoned.nonce, Some(0));
    assert!(abandoned.abandoned());
    assert!(!h
        .mgr
        .abandon_task_run_tx(abandoned_run, "again")
        .await
        .unwrap());

    // the node evicts nonce 0, so nonce 1 cannot be mined until it is resent
    h.chain.drop_from_mempool(sent[0].hash);
    for _ in 0..12 {
        h.mine().await;
        if h.tx(second.id).await.state == EthTxState::Confirmed {
            break;
        }
    }

    let abandoned = h.tx(first.id).await;
    assert_eq!(abandoned.state, EthTxState::Confirmed);
    assert_eq!(abandoned.error.as_deref(), Some("abandoned after reorg"));
    assert_eq!(h.tx(second.id).await.state, EthTxState::Confirmed);
    assert_eq!(h.chain.account_nonce(h.from), 2);

    // only the task run still waiting hears back
    let outcomes = h.resumed.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, waiting_run);
    assert!(outcomes[0].1.is_ok());
}
