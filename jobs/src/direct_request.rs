//! Jobs triggered by `OracleRequest` logs of an oracle contract.
//!
//! A request is acted on once its block has enough confirmations and is
//! still canonical. A run whose request block is reorged away before it is
//! final is errored and its pending transaction abandoned.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sha3::{Digest, Keccak256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use headtracker::{HeadBroadcaster, HeadTrackable, Unsubscriber};
use oracle_core::{Address, ChainClient, Head, Log, LogFilter, H256, U256};
use pipeline::PipelineRunner;

use crate::{
    Delegate, DirectRequestSpec, JobError, JobKind, JobMetrics, JobResult, JobSpec, JobStore,
    JobType, JobsConfig, Service,
};

/// Signature of the event an oracle contract emits for each request.
pub const ORACLE_REQUEST_SIGNATURE: &str =
    "OracleRequest(bytes32,address,bytes32,uint256,address,bytes4,uint256,uint256,bytes)";

/// Error given to runs whose request block left the canonical chain.
pub const REORGED: &str = "reorged";
/// Error given to the transactions of those runs.
pub const ABANDONED_AFTER_REORG: &str = "abandoned after reorg";

/// Topic 0 of `OracleRequest` logs.
pub fn oracle_request_topic() -> H256 {
    H256::from_slice(&Keccak256::digest(ORACLE_REQUEST_SIGNATURE.as_bytes()))
}

/// The spec id topic addressing a job: the 32 character hex form of its
/// external id.
pub fn spec_id_topic(external_job_id: Uuid) -> H256 {
    H256::from_slice(external_job_id.simple().to_string().as_bytes())
}

fn spec_id_matches(topic: H256, external_job_id: Uuid) -> bool {
    if topic == spec_id_topic(external_job_id) {
        return true;
    }
    // older contracts carry the raw id, left aligned
    let mut raw = [0u8; 32];
    raw[..16].copy_from_slice(external_job_id.as_bytes());
    topic.as_bytes() == raw
}

/// The request fields read from an `OracleRequest` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleRequest {
    /// Job addressed
    pub spec_id: H256,
    /// Contract that made the request
    pub requester: Address,
    /// Id assigned by the oracle contract
    pub request_id: H256,
    /// Payment attached
    pub payment: U256,
}

impl OracleRequest {
    /// Reads the indexed spec id and the leading data words.
    pub fn decode(log: &Log) -> Result<Self, String> {
        let spec_id = *log
            .topics
            .get(1)
            .ok_or_else(|| "missing spec id topic".to_owned())?;
        let data = log.data.as_ref();
        if data.len() < 96 {
            return Err(format!("data too short: {} bytes", data.len()));
        }
        Ok(Self {
            spec_id,
            requester: Address::from_slice(&data[12..32]),
            request_id: H256::from_slice(&data[32..64]),
            payment: U256::from_big_endian(&data[64..96]),
        })
    }
}

// pending logs ordered by block, then position
type LogKey = (u64, u64, H256);

fn key(log: &Log) -> LogKey {
    (log.block_number, log.log_index, log.block_hash)
}

/// Runs already errored for a reorged request, by the block of their log.
/// Entries leave once that block is past the finality depth, where the
/// consumed log is no longer re-checked.
#[derive(Debug, Default)]
struct AbandonedRuns(HashMap<i64, u64>);

impl AbandonedRuns {
    fn contains(&self, run_id: i64) -> bool {
        self.0.contains_key(&run_id)
    }

    fn insert(&mut self, run_id: i64, block_number: u64) {
        self.0.insert(run_id, block_number);
    }

    fn remove(&mut self, run_id: i64) {
        self.0.remove(&run_id);
    }

    /// Forgets runs whose log block is below `block_number`.
    fn prune_below(&mut self, block_number: u64) {
        self.0.retain(|_, block| *block >= block_number);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug)]
struct Listener {
    job: JobSpec,
    spec: DirectRequestSpec,
    min_confirmations: u64,
    config: JobsConfig,
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn JobStore>,
    runner: PipelineRunner,
    broadcaster: HeadBroadcaster,
    metrics: JobMetrics,
    pending: Mutex<BTreeMap<LogKey, Log>>,
    abandoned: Mutex<AbandonedRuns>,
    cancel: CancellationToken,
}

impl Listener {
    fn filter(&self) -> LogFilter {
        LogFilter::new(self.spec.contract_address, vec![oracle_request_topic()])
    }

    fn dropped(&self, log: &Log, reason: &'static str) {
        self.metrics.logs_dropped.with_label_values(&[reason]).inc();
        debug!(
            block = log.block_number,
            log_index = log.log_index,
            reason,
            "Ignoring request log"
        );
    }

    /// Queues a request log addressed to this job. Returns whether it was
    /// queued.
    fn accept(&self, log: Log) -> bool {
        if log.removed {
            if self.pending.lock().remove(&key(&log)).is_some() {
                info!(
                    block = log.block_number,
                    log_index = log.log_index,
                    "Request log removed before it was confirmed"
                );
            }
            return false;
        }
        if !self.filter().matches(&log) {
            return false;
        }
        let request = match OracleRequest::decode(&log) {
            Ok(request) => request,
            Err(error) => {
                warn!(%error, tx_hash = ?log.tx_hash, "Malformed request log");
                self.dropped(&log, "malformed");
                return false;
            }
        };
        if !spec_id_matches(request.spec_id, self.job.external_job_id) {
            return false;
        }
        if !self.spec.requesters.is_empty() && !self.spec.requesters.contains(&request.requester) {
            self.dropped(&log, "requester");
            return false;
        }
        if request.payment < self.spec.min_contract_payment {
            self.dropped(&log, "payment");
            return false;
        }
        debug!(
            block = log.block_number,
            log_index = log.log_index,
            request_id = ?request.request_id,
            "Request log pending confirmation"
        );
        self.pending.lock().insert(key(&log), log);
        true
    }

    async fn canonical_hash(&self, head: &Head, number: u64) -> Option<H256> {
        if let Some(hash) = head.hash_at_height(number) {
            return Some(hash);
        }
        match self.chain.head_by_number(Some(number)).await {
            Ok(found) => found.map(|h| h.hash),
            Err(error) => {
                warn!(%error, number, "Failed to look up canonical block");
                None
            }
        }
    }

    /// Starts runs for the pending logs confirmed by `head` and drops those
    /// reorged away.
    async fn process_pending(&self, head: &Head) {
        let candidates: Vec<Log> = self
            .pending
            .lock()
            .values()
            .filter(|l| l.block_number <= head.number)
            .cloned()
            .collect();
        for log in candidates {
            let confirmed = head.number >= log.block_number + self.min_confirmations;
            let canonical = if confirmed {
                self.canonical_hash(head, log.block_number).await
            } else {
                head.hash_at_height(log.block_number)
            };
            match canonical {
                Some(hash) if hash != log.block_hash => {
                    if self.pending.lock().remove(&key(&log)).is_some() {
                        warn!(
                            block = log.block_number,
                            log_index = log.log_index,
                            "Pending request log reorged away, dropping"
                        );
                        self.dropped(&log, "reorged");
                    }
                }
                Some(_) if confirmed => {
                    if self.pending.lock().remove(&key(&log)).is_some() {
                        self.start_run(log).await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn start_run(&self, log: Log) {
        if self.cancel.is_cancelled() {
            // job stopped or being deleted; a restarted listener replays it
            self.dropped(&log, "stopped");
            return;
        }
        match self.store.mark_log_consumed(self.job.id, &log).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(block = log.block_number, log_index = log.log_index, "Request log already consumed");
                return;
            }
            Err(error) => {
                warn!(%error, "Failed to record request log, retrying on the next head");
                self.pending.lock().insert(key(&log), log);
                return;
            }
        }
        let vars = self.job.run_vars(json!({
            "logBlockHash": format!("{:?}", log.block_hash),
            "logBlockNumber": log.block_number,
            "logTxHash": format!("{:?}", log.tx_hash),
            "logTopics": log.topics.iter().map(|t| format!("{t:?}")).collect::<Vec<_>>(),
            "logData": format!("0x{}", hex::encode(&log.data)),
            "logAddress": format!("{:?}", log.address),
            "meta": {},
        }));
        match self
            .runner
            .start_run(self.job.pipeline_spec_id, Some(self.job.id), vars)
            .await
        {
            Ok(run) => {
                self.metrics
                    .runs_triggered
                    .with_label_values(&[JobType::DirectRequest.as_ref()])
                    .inc();
                info!(
                    run_id = run.id,
                    block = log.block_number,
                    log_index = log.log_index,
                    "Started run for request log"
                );
                if let Err(error) = self.store.set_log_run(self.job.id, &log, run.id).await {
                    warn!(%error, run_id = run.id, "Failed to link request log to its run");
                }
            }
            Err(error) => {
                warn!(%error, "Failed to start run for request log");
                if let Err(error) = self.store.unmark_log(self.job.id, &log).await {
                    warn!(%error, "Failed to release request log");
                }
            }
        }
    }

    /// Errors the unfinished runs of consumed logs that left the canonical
    /// chain before becoming final.
    async fn check_consumed(&self, head: &Head) {
        let from = head.number.saturating_sub(self.config.finality_depth);
        self.abandoned.lock().prune_below(from);
        let consumed = match self.store.consumed_logs_since(self.job.id, from).await {
            Ok(consumed) => consumed,
            Err(error) => {
                warn!(%error, "Failed to load consumed request logs");
                return;
            }
        };
        for log in consumed.into_iter().filter(|l| l.block_number <= head.number) {
            let Some(run_id) = log.pipeline_run_id else {
                continue;
            };
            if self.abandoned.lock().contains(run_id) {
                continue;
            }
            match self.canonical_hash(head, log.block_number).await {
                Some(hash) if hash != log.block_hash => {}
                _ => continue,
            }
            self.abandoned.lock().insert(run_id, log.block_number);
            match self
                .runner
                .abandon_run(run_id, REORGED, ABANDONED_AFTER_REORG)
                .await
            {
                Ok(true) => {
                    self.metrics.runs_abandoned.inc();
                    warn!(run_id, block = log.block_number, "Request log reorged away, run errored");
                }
                Ok(false) => debug!(run_id, "Reorged request already finished"),
                Err(error) => {
                    self.abandoned.lock().remove(run_id);
                    warn!(%error, run_id, "Failed to abandon reorged run");
                }
            }
        }
    }

    /// Queues every request log from block `from` on and acts on those
    /// already confirmed.
    async fn replay(&self, from: u64) -> JobResult<()> {
        let logs = self
            .chain
            .filter_logs(self.filter().from_block(from))
            .await?;
        let queued = logs.into_iter().filter(|l| self.accept(l.clone())).count();
        info!(from, queued, "Replayed request logs");
        if let Some(head) = self.broadcaster.latest_chain() {
            self.process_pending(&head).await;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.chain.subscribe_logs(self.filter()).await {
                Ok(mut subscription) => {
                    // catch up on logs emitted while not subscribed
                    match self.chain.block_number().await {
                        Ok(tip) => {
                            let from = tip.saturating_sub(self.config.finality_depth);
                            if let Err(error) = self.replay(from).await {
                                warn!(%error, "Failed to backfill request logs");
                            }
                        }
                        Err(error) => warn!(%error, "Failed to read the block number for backfill"),
                    }
                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            log = subscription.recv() => match log {
                                Some(log) => {
                                    if self.accept(log) {
                                        if let Some(head) = self.broadcaster.latest_chain() {
                                            self.process_pending(&head).await;
                                        }
                                    }
                                }
                                None => {
                                    warn!("Request log subscription closed, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(error) => warn!(%error, "Failed to subscribe to request logs"),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.resubscribe_backoff) => {}
            }
        }
    }
}

#[async_trait]
impl HeadTrackable for Listener {
    async fn on_new_longest_chain(&self, head: &Head) {
        self.process_pending(head).await;
        self.check_consumed(head).await;
    }
}

/// Watches the oracle contract of one direct request job.
#[derive(Debug)]
pub struct DirectRequestService {
    listener: Arc<Listener>,
    unsubscriber: Mutex<Option<Unsubscriber>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Service for DirectRequestService {
    async fn start(&self) -> JobResult<()> {
        let listener = self.listener.clone();
        let (_, unsubscriber) = listener.broadcaster.subscribe(listener.clone());
        *self.unsubscriber.lock() = Some(unsubscriber);
        let span = info_span!("DirectRequest", job_id = listener.job.id);
        *self.handle.lock() = Some(tokio::spawn(listener.run().instrument(span)));
        info!(
            job_id = self.listener.job.id,
            contract = ?self.listener.spec.contract_address,
            min_confirmations = self.listener.min_confirmations,
            "Listening for oracle requests"
        );
        Ok(())
    }

    async fn close(&self) {
        self.listener.cancel.cancel();
        if let Some(unsubscriber) = self.unsubscriber.lock().take() {
            unsubscriber.unsubscribe();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                warn!(%error, "Request listener ended abnormally");
            }
        }
        let dropped = std::mem::take(&mut *self.listener.pending.lock()).len();
        if dropped > 0 {
            info!(dropped, "Discarded unconfirmed request logs");
        }
    }
}

/// Runs direct request jobs.
#[derive(Debug)]
pub struct DirectRequestDelegate {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn JobStore>,
    runner: PipelineRunner,
    broadcaster: HeadBroadcaster,
    config: JobsConfig,
    metrics: JobMetrics,
    listeners: Mutex<HashMap<i64, Weak<Listener>>>,
}

impl DirectRequestDelegate {
    /// A delegate listening on `chain` and confirming against the heads of
    /// `broadcaster`.
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn JobStore>,
        runner: PipelineRunner,
        broadcaster: HeadBroadcaster,
        config: JobsConfig,
        metrics: JobMetrics,
    ) -> Self {
        Self {
            chain,
            store,
            runner,
            broadcaster,
            config,
            metrics,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn live_listeners(&self) -> Vec<Arc<Listener>> {
        let mut listeners = self.listeners.lock();
        listeners.retain(|_, l| l.strong_count() > 0);
        listeners.values().filter_map(Weak::upgrade).collect()
    }
}

#[async_trait]
impl Delegate for DirectRequestDelegate {
    fn job_type(&self) -> JobType {
        JobType::DirectRequest
    }

    async fn before_job_deleted(&self, job: &JobSpec) {
        self.listeners.lock().remove(&job.id);
    }

    async fn services_for_spec(&self, job: &JobSpec) -> JobResult<Vec<Arc<dyn Service>>> {
        let JobKind::DirectRequest(spec) = &job.kind else {
            return Err(JobError::validation(format!(
                "job {} is not a direct request job",
                job.id
            )));
        };
        let listener = Arc::new(Listener {
            job: job.clone(),
            spec: spec.clone(),
            min_confirmations: spec
                .min_incoming_confirmations
                .unwrap_or(self.config.finality_depth),
            config: self.config.clone(),
            chain: self.chain.clone(),
            store: self.store.clone(),
            runner: self.runner.clone(),
            broadcaster: self.broadcaster.clone(),
            metrics: self.metrics.clone(),
            pending: Mutex::new(BTreeMap::new()),
            abandoned: Mutex::default(),
            cancel: CancellationToken::new(),
        });
        self.listeners
            .lock()
            .insert(job.id, Arc::downgrade(&listener));
        Ok(vec![Arc::new(DirectRequestService {
            listener,
            unsubscriber: Mutex::new(None),
            handle: Mutex::new(None),
        })])
    }

    #[instrument(skip(self))]
    async fn replay_from_block(&self, number: u64) -> JobResult<()> {
        for listener in self.live_listeners() {
            listener.replay(number).await?;
        }
        Ok(())
    }
}
