use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use oracle_base::settings::{ConfigParsingError, ValueParser};
use oracle_core::{utils::Mailbox, ChainClient, ChainHealth, Head, H256};

use crate::{
    link_chain, HeadBroadcaster, HeadStore, HeadTrackerError, HeadTrackerMetrics,
    HeadTrackerResult,
};

/// Settings of the head tracker.
#[derive(Debug, Clone)]
pub struct HeadTrackerConfig {
    /// Blocks after which a block is final
    pub finality_depth: u64,
    /// Heads kept below the highest seen head, at least the finality depth
    pub history_depth: u64,
    /// Capacity of the incoming head buffer
    pub max_buffer_size: usize,
    /// Failed subscription attempts before the chain is reported unavailable
    pub subscribe_retries: u32,
    /// First delay between subscription attempts
    pub retry_backoff: Duration,
    /// Cap of the delay between subscription attempts
    pub max_retry_backoff: Duration,
}

impl Default for HeadTrackerConfig {
    fn default() -> Self {
        Self {
            finality_depth: 50,
            history_depth: 100,
            max_buffer_size: 3,
            subscribe_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(30),
        }
    }
}

impl HeadTrackerConfig {
    /// Reads the `headTracker` section. The finality depth comes from the
    /// chain settings.
    pub fn from_section(
        section: &ValueParser,
        finality_depth: u64,
        err: &mut ConfigParsingError,
    ) -> Self {
        let d = Self::default();
        let config = Self {
            finality_depth,
            history_depth: section
                .u64(err, "historyDepth")
                .unwrap_or(d.history_depth),
            max_buffer_size: section
                .u64(err, "maxBufferSize")
                .map(|n| n.max(1) as usize)
                .unwrap_or(d.max_buffer_size),
            subscribe_retries: section
                .u64(err, "subscribeRetries")
                .map(|n| n.min(u32::MAX as u64) as u32)
                .unwrap_or(d.subscribe_retries),
            retry_backoff: section.duration_or(err, "retryBackoff", d.retry_backoff),
            max_retry_backoff: section.duration_or(err, "maxRetryBackoff", d.max_retry_backoff),
        };
        if config.history_depth < finality_depth {
            err.push(
                format!("{}.historyDepth", section.path()),
                eyre::eyre!("must be at least the finality depth ({finality_depth})"),
            );
        }
        config
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    // unlinked heads within the retained window, by hash
    heads: HashMap<H256, Head>,
    booted: bool,
}

/// Follows the chain tip and hands every new longest chain to the
/// [`HeadBroadcaster`].
#[derive(Debug)]
pub struct HeadTracker {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn HeadStore>,
    broadcaster: HeadBroadcaster,
    config: HeadTrackerConfig,
    metrics: HeadTrackerMetrics,
    mailbox: Mailbox<Head>,
    state: Mutex<TrackerState>,
    longest: RwLock<Option<Head>>,
    health: watch::Sender<ChainHealth>,
}

impl HeadTracker {
    /// Creates a tracker; nothing runs until [`Self::start`].
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn HeadStore>,
        broadcaster: HeadBroadcaster,
        config: HeadTrackerConfig,
        metrics: HeadTrackerMetrics,
    ) -> Self {
        let (health, _) = watch::channel(ChainHealth::Healthy);
        Self {
            chain,
            store,
            broadcaster,
            mailbox: Mailbox::new(config.max_buffer_size),
            config,
            metrics,
            state: Mutex::new(TrackerState::default()),
            longest: RwLock::new(None),
            health,
        }
    }

    /// Highest head in the store.
    pub async fn highest_seen_head(&self) -> HeadTrackerResult<Option<Head>> {
        Ok(self.store.latest_head().await?)
    }

    /// The stored head with `hash`, with up to `lookback` ancestors linked.
    pub async fn chain(&self, hash: H256, lookback: u64) -> HeadTrackerResult<Option<Head>> {
        Ok(self.store.chain(hash, lookback).await?)
    }

    /// Current longest chain.
    pub fn latest_chain(&self) -> Option<Head> {
        self.longest.read().clone()
    }

    /// Receiver of chain health changes.
    pub fn health(&self) -> watch::Receiver<ChainHealth> {
        self.health.subscribe()
    }

    fn set_health(&self, health: ChainHealth) {
        self.metrics
            .chain_health
            .set(i64::from(health == ChainHealth::Healthy));
        self.health.send_if_modified(|current| {
            let changed = *current != health;
            *current = health;
            changed
        });
    }

    /// Loads the retained heads, then runs the subscription and the head
    /// processor until `cancel` fires. The returned task resolves with an
    /// error if the chain diverged beyond the finality depth.
    pub async fn start(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> HeadTrackerResult<JoinHandle<HeadTrackerResult<()>>> {
        self.load_from_store().await?;

        let subscription = {
            let tracker = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(
                async move { tracker.run_subscription(cancel).await }
                    .instrument(info_span!("HeadSubscription")),
            )
        };

        let tracker = self.clone();
        Ok(tokio::spawn(
            async move {
                let res = tracker.run_processor(cancel).await;
                subscription.abort();
                if let Err(err) = &res {
                    error!(?err, "Head tracker stopped");
                }
                res
            }
            .instrument(info_span!("HeadTracker")),
        ))
    }

    #[instrument(skip_all)]
    async fn load_from_store(&self) -> HeadTrackerResult<()> {
        let Some(latest) = self.store.latest_head().await? else {
            info!("No persisted heads");
            return Ok(());
        };
        let keep = self.retained_depth();
        let heads: HashMap<H256, Head> = self
            .store
            .heads_since(latest.number.saturating_sub(keep))
            .await?
            .into_iter()
            .map(|h| (h.hash, h))
            .collect();
        let longest = link_chain(&heads, latest, self.config.finality_depth);
        info!(number = longest.number, loaded = heads.len(), "Loaded persisted heads");
        self.metrics.current_head.set(longest.number as i64);
        *self.longest.write() = Some(longest);
        self.state.lock().await.heads = heads;
        Ok(())
    }

    fn retained_depth(&self) -> u64 {
        self.config.finality_depth.max(self.config.history_depth)
    }

    /// Queues a head for processing, dropping the oldest queued one when
    /// the buffer is full.
    pub fn deliver(&self, head: Head) {
        if self.mailbox.deliver(head) {
            self.metrics.dropped_heads.inc();
            debug!("Head buffer full, dropped the oldest head");
        }
    }

    async fn run_subscription(&self, cancel: CancellationToken) {
        let mut failures = 0u32;
        let mut backoff = self.config.retry_backoff;
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return,
                res = self.chain.subscribe_new_heads() => res,
            };
            let mut subscription = match res {
                Ok(subscription) => subscription,
                Err(err) => {
                    failures += 1;
                    if failures >= self.config.subscribe_retries {
                        let err = HeadTrackerError::BlockchainUnavailable(err.to_string());
                        error!(%err, failures, "Unable to subscribe to new heads");
                        self.set_health(ChainHealth::Unavailable);
                    } else {
                        warn!(?err, failures, "Failed to subscribe to new heads, retrying");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.config.max_retry_backoff);
                    continue;
                }
            };
            if failures > 0 {
                info!(failures, "Head subscription re-established");
            }
            failures = 0;
            backoff = self.config.retry_backoff;
            self.set_health(ChainHealth::Healthy);

            // covers anything missed while the subscription was down
            match self.chain.head_by_number(None).await {
                Ok(Some(tip)) => self.deliver(tip),
                Ok(None) => {}
                Err(err) => warn!(?err, "Failed to fetch the latest head"),
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    head = subscription.recv() => match head {
                        Some(head) => self.deliver(head),
                        None => {
                            warn!("Head subscription closed, resubscribing");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_processor(&self, cancel: CancellationToken) -> HeadTrackerResult<()> {
        loop {
            while let Some(head) = self.mailbox.retrieve() {
                match self.handle_new_head(head).await {
                    Ok(()) => {}
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => warn!(?err, "Failed to process head"),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.mailbox.notified() => {}
            }
        }
    }

    /// Persists `head`, backfills its missing ancestors and, if it extends
    /// past the current longest chain, broadcasts the new chain.
    #[instrument(skip_all, fields(number = head.number, hash = ?head.hash))]
    pub async fn handle_new_head(&self, head: Head) -> HeadTrackerResult<()> {
        self.metrics.heads_received.inc();
        let mut state = self.state.lock().await;
        self.store.store_head(&head).await?;
        state.heads.insert(head.hash, Head { parent: None, ..head.clone() });

        let backfill_depth = if state.booted {
            self.config.finality_depth + 1
        } else {
            self.config.history_depth.max(self.config.finality_depth + 1)
        };
        state.booted = true;
        self.backfill(&mut state, &head, backfill_depth).await?;

        let previous = self.longest.read().clone();
        if let Some(previous) = &previous {
            if head.number <= previous.number {
                debug!(current = previous.number, "Head is not above the longest chain");
                return Ok(());
            }
        }

        // one extra ancestor so a rewrite one past the finality depth shows
        let candidate = link_chain(&state.heads, head, self.config.finality_depth + 1);
        if let Some(previous) = &previous {
            let replaced = replaced_blocks(previous, &candidate);
            if replaced > self.config.finality_depth {
                return Err(HeadTrackerError::HeadDivergence {
                    replaced,
                    finality_depth: self.config.finality_depth,
                });
            }
            if replaced > 0 {
                self.metrics.reorgs.inc();
                warn!(replaced, previous = ?previous.hash, "Reorg detected");
            }
        }

        let longest = candidate.truncated(self.config.finality_depth);
        self.metrics.current_head.set(longest.number as i64);
        *self.longest.write() = Some(longest.clone());
        let number = longest.number;
        self.broadcaster.on_new_longest_chain(longest);
        debug!("New longest chain");

        let cutoff = number.saturating_sub(self.retained_depth());
        if cutoff > 0 {
            state.heads.retain(|_, h| h.number >= cutoff);
            self.store.trim_heads_below(cutoff).await?;
        }
        Ok(())
    }

    async fn backfill(
        &self,
        state: &mut TrackerState,
        head: &Head,
        depth: u64,
    ) -> HeadTrackerResult<()> {
        let mut parent_hash = head.parent_hash;
        let mut number = head.number;
        let mut fetched = 0;
        while fetched < depth && number > 0 && !state.heads.contains_key(&parent_hash) {
            let parent = match self.chain.head_by_hash(parent_hash).await {
                Ok(Some(parent)) => parent,
                Ok(None) => {
                    warn!(?parent_hash, "Ancestor not found while backfilling");
                    break;
                }
                Err(err) => {
                    warn!(?err, ?parent_hash, "Failed to fetch ancestor while backfilling");
                    break;
                }
            };
            self.metrics.heads_received.inc();
            self.store.store_head(&parent).await?;
            parent_hash = parent.parent_hash;
            number = parent.number;
            state.heads.insert(parent.hash, Head { parent: None, ..parent });
            fetched += 1;
        }
        if fetched > 0 {
            debug!(fetched, "Backfilled ancestors");
        }
        Ok(())
    }
}

/// Number of blocks of `previous` that `candidate` replaces, counting down
/// from the tip of `previous` until both chains agree.
fn replaced_blocks(previous: &Head, candidate: &Head) -> u64 {
    let mut replaced = 0;
    for ancestor in candidate.chain().filter(|h| h.number <= previous.number) {
        match previous.hash_at_height(ancestor.number) {
            Some(hash) if hash == ancestor.hash => break,
            Some(_) => replaced += 1,
            None => break,
        }
    }
    replaced
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use async_trait::async_trait;
    use oracle_base::db::OracleDb;
    use oracle_test::SimulatedChain;

    use super::*;
    use crate::HeadTrackable;

    const FINALITY: u64 = 5;

    #[derive(Debug, Default)]
    struct LastSeen(AtomicU64);

    #[async_trait]
    impl HeadTrackable for LastSeen {
        async fn on_new_longest_chain(&self, head: &Head) {
            self.0.store(head.number, Ordering::SeqCst);
        }
    }

    async fn setup(chain: Arc<SimulatedChain>) -> (Arc<HeadTracker>, HeadBroadcaster, OracleDb) {
        let db = OracleDb::in_memory().await.unwrap();
        let broadcaster =
            HeadBroadcaster::new(Duration::from_secs(1), HeadTrackerMetrics::dummy_instance());
        let tracker = Arc::new(HeadTracker::new(
            chain,
            Arc::new(db.clone()),
            broadcaster.clone(),
            HeadTrackerConfig {
                finality_depth: FINALITY,
                history_depth: 8,
                retry_backoff: Duration::from_millis(10),
                max_retry_backoff: Duration::from_millis(20),
                ..Default::default()
            },
            HeadTrackerMetrics::dummy_instance(),
        ));
        (tracker, broadcaster, db)
    }

    async fn feed_tip(tracker: &HeadTracker, chain: &SimulatedChain) -> HeadTrackerResult<()> {
        tracker.handle_new_head(chain.tip()).await
    }

    #[tokio::test]
    async fn first_head_backfills_history() {
        let chain = Arc::new(SimulatedChain::with_height(1, 20));
        let (tracker, _, db) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();

        let longest = tracker.latest_chain().unwrap();
        assert_eq!(longest.number, 20);
        assert_eq!(longest.chain_length(), FINALITY + 1);
        // history depth 8 is above finality + 1
        assert_eq!(db.heads_since(0).await.unwrap().len(), 9);
        let highest = tracker.highest_seen_head().await.unwrap().unwrap();
        assert_eq!(highest.hash, chain.tip().hash);
    }

    #[tokio::test]
    async fn lower_heads_are_stored_but_not_broadcast() {
        let chain = Arc::new(SimulatedChain::with_height(1, 10));
        let (tracker, broadcaster, db) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();
        let stale = chain.canonical_head(9).unwrap();
        let mut orphan = stale.clone();
        orphan.hash = H256::repeat_byte(0xee);
        tracker.handle_new_head(orphan.clone()).await.unwrap();

        assert_eq!(broadcaster.latest_chain().unwrap().number, 10);
        assert!(db.head_by_hash(orphan.hash).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reorg_within_finality_is_accepted() {
        let chain = Arc::new(SimulatedChain::with_height(1, 20));
        let (tracker, _, _) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();

        let tip = chain.reorg(FINALITY - 1);
        feed_tip(&tracker, &chain).await.unwrap();
        let longest = tracker.latest_chain().unwrap();
        assert_eq!(longest.hash, tip.hash);
        assert_eq!(longest.chain_length(), FINALITY + 1);
        for h in longest.chain() {
            assert_eq!(chain.canonical_head(h.number).unwrap().hash, h.hash);
        }
    }

    #[tokio::test]
    async fn reorg_of_exactly_finality_is_accepted() {
        let chain = Arc::new(SimulatedChain::with_height(1, 20));
        let (tracker, _, _) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();
        chain.reorg(FINALITY);
        feed_tip(&tracker, &chain).await.unwrap();
        assert_eq!(tracker.latest_chain().unwrap().hash, chain.tip().hash);
    }

    #[tokio::test]
    async fn reorg_past_finality_diverges() {
        let chain = Arc::new(SimulatedChain::with_height(1, 20));
        let (tracker, _, _) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();
        chain.reorg(FINALITY + 1);
        let err = feed_tip(&tracker, &chain).await.unwrap_err();
        assert!(matches!(
            err,
            HeadTrackerError::HeadDivergence { replaced, finality_depth: FINALITY } if replaced == FINALITY + 1
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn old_heads_are_trimmed() {
        let chain = Arc::new(SimulatedChain::with_height(1, 5));
        let (tracker, _, db) = setup(chain.clone()).await;
        feed_tip(&tracker, &chain).await.unwrap();
        for _ in 0..20 {
            chain.mine_block();
            feed_tip(&tracker, &chain).await.unwrap();
        }
        let stored = db.heads_since(0).await.unwrap();
        assert_eq!(stored.iter().map(|h| h.number).min(), Some(25 - 8));
    }

    #[tokio::test]
    async fn running_tracker_follows_the_subscription() {
        let chain = Arc::new(SimulatedChain::with_height(1, 3));
        let (tracker, broadcaster, _) = setup(chain.clone()).await;
        let seen = Arc::new(LastSeen::default());
        let (_, _unsub) = broadcaster.subscribe(seen.clone());
        let _b = broadcaster.start();
        let cancel = CancellationToken::new();
        let handle = tracker.start(cancel.clone()).await.unwrap();

        for _ in 0..100 {
            if chain.head_subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        chain.mine_blocks(4);
        for _ in 0..200 {
            if seen.0.load(Ordering::SeqCst) == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.0.load(Ordering::SeqCst), 7);
        assert_eq!(*tracker.health().borrow(), ChainHealth::Healthy);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        broadcaster.close();
    }

    #[tokio::test]
    async fn unavailable_chain_is_reported_and_recovers() {
        let chain = Arc::new(SimulatedChain::with_height(1, 3));
        chain.set_subscriptions_failing(true);
        let (tracker, _, _) = setup(chain.clone()).await;
        let mut health = tracker.health();
        let cancel = CancellationToken::new();
        let _handle = tracker.start(cancel.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), health.wait_for(|h| *h == ChainHealth::Unavailable))
            .await
            .unwrap()
            .unwrap();

        chain.set_subscriptions_failing(false);
        tokio::time::timeout(Duration::from_secs(2), health.wait_for(|h| *h == ChainHealth::Healthy))
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();
    }
}
