use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use auto_impl::auto_impl;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use oracle_core::{utils::Mailbox, Head};

use crate::HeadTrackerMetrics;

/// Time each subscriber callback gets before the broadcaster moves on.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// A component that reacts to new longest chains.
#[async_trait]
#[auto_impl(&, Box, Arc)]
pub trait HeadTrackable: Send + Sync + Debug {
    /// Called with the new longest chain, parents linked up to the finality
    /// depth.
    async fn on_new_longest_chain(&self, head: &Head);
}

#[derive(Debug, Clone)]
struct Subscriber {
    trackable: Arc<dyn HeadTrackable>,
    slot: Arc<Mutex<Slot>>,
}

/// Delivery state of one subscriber. While `busy`, newer heads replace
/// `pending` and the running callback loop picks up the last one.
#[derive(Debug, Default)]
struct Slot {
    busy: bool,
    pending: Option<Arc<Head>>,
}

#[derive(Debug)]
struct Inner {
    mailbox: Mailbox<Head>,
    subscribers: Mutex<BTreeMap<u64, Subscriber>>,
    next_id: AtomicU64,
    latest: Mutex<Option<Head>>,
    running: Mutex<Vec<AbortHandle>>,
    callback_timeout: Duration,
    cancel: CancellationToken,
    metrics: HeadTrackerMetrics,
}

/// Fans each new longest chain out to every subscriber.
///
/// Heads go through a single slot mailbox, so a burst collapses to the
/// newest head. Each subscriber is called at most once at a time; heads
/// arriving while it is busy coalesce, and only the newest of them is
/// delivered once its callback returns.
#[derive(Debug, Clone)]
pub struct HeadBroadcaster {
    inner: Arc<Inner>,
}

/// Removes a subscription when [`Unsubscriber::unsubscribe`] is called.
#[derive(Debug)]
pub struct Unsubscriber {
    id: u64,
    inner: Weak<Inner>,
}

impl Unsubscriber {
    /// Stops further callbacks to the subscriber.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.subscribers.lock().remove(&self.id);
        }
    }
}

impl HeadBroadcaster {
    /// A broadcaster giving each callback `callback_timeout`.
    pub fn new(callback_timeout: Duration, metrics: HeadTrackerMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailbox: Mailbox::new(1),
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                latest: Mutex::new(None),
                running: Mutex::new(Vec::new()),
                callback_timeout,
                cancel: CancellationToken::new(),
                metrics,
            }),
        }
    }

    /// Registers `trackable` and returns the latest head seen so far.
    pub fn subscribe(&self, trackable: Arc<dyn HeadTrackable>) -> (Option<Head>, Unsubscriber) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(
            id,
            Subscriber {
                trackable,
                slot: Default::default(),
            },
        );
        let latest = self.inner.latest.lock().clone();
        (
            latest,
            Unsubscriber {
                id,
                inner: Arc::downgrade(&self.inner),
            },
        )
    }

    /// Hands a new longest chain to the broadcaster.
    pub fn on_new_longest_chain(&self, head: Head) {
        {
            let mut latest = self.inner.latest.lock();
            if latest.as_ref().is_some_and(|l| l.number > head.number) {
                debug!(number = head.number, "Ignoring head lower than the latest broadcast");
                return;
            }
            *latest = Some(head.clone());
        }
        self.inner.mailbox.deliver(head);
    }

    /// Latest head handed to the broadcaster.
    pub fn latest_chain(&self) -> Option<Head> {
        self.inner.latest.lock().clone()
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Runs the delivery loop until [`Self::close`] is called.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                info!("Head broadcaster started");
                loop {
                    while let Some(head) = inner.mailbox.retrieve_latest_and_clear() {
                        Self::broadcast(&inner, head).await;
                    }
                    tokio::select! {
                        _ = inner.cancel.cancelled() => break,
                        _ = inner.mailbox.notified() => {}
                    }
                }
                info!("Head broadcaster stopped");
            }
            .instrument(info_span!("HeadBroadcaster")),
        )
    }

    async fn broadcast(inner: &Arc<Inner>, head: Head) {
        let subscribers: Vec<(u64, Subscriber)> = inner
            .subscribers
            .lock()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        let head = Arc::new(head);

        let mut handles = Vec::with_capacity(subscribers.len());
        for (id, subscriber) in subscribers {
            {
                let mut slot = subscriber.slot.lock();
                if slot.busy {
                    debug!(
                        subscriber = id,
                        number = head.number,
                        "Subscriber busy, head queued for its next callback"
                    );
                    slot.pending = Some(head.clone());
                    continue;
                }
                slot.busy = true;
            }
            let handle = tokio::spawn(Self::deliver(
                Arc::downgrade(inner),
                id,
                subscriber,
                head.clone(),
            ));
            inner.running.lock().push(handle.abort_handle());
            handles.push(handle);
        }

        if tokio::time::timeout(inner.callback_timeout, join_all(handles))
            .await
            .is_err()
        {
            inner.metrics.callback_timeouts.inc();
            warn!(
                number = head.number,
                timeout = ?inner.callback_timeout,
                "Head callbacks exceeded their timeout"
            );
        }
        inner.running.lock().retain(|h| !h.is_finished());
    }

    /// Calls the subscriber with `head`, then with whatever head arrived
    /// meanwhile, until nothing is pending.
    async fn deliver(inner: Weak<Inner>, id: u64, subscriber: Subscriber, mut head: Arc<Head>) {
        loop {
            subscriber.trackable.on_new_longest_chain(&head).await;
            let mut slot = subscriber.slot.lock();
            let subscribed = inner
                .upgrade()
                .is_some_and(|i| i.subscribers.lock().contains_key(&id));
            match slot.pending.take() {
                Some(next) if subscribed => head = next,
                _ => {
                    slot.busy = false;
                    return;
                }
            }
        }
    }

    /// Cancels running callbacks and drops every subscriber.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        for handle in self.inner.running.lock().drain(..) {
            handle.abort();
        }
        self.inner.subscribers.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use chrono::Utc;
    use oracle_core::H256;

    use super::*;

    fn head(number: u64) -> Head {
        Head::new(
            H256::from_low_u64_be(number),
            number,
            H256::from_low_u64_be(number.saturating_sub(1)),
            Utc::now(),
        )
    }

    #[derive(Debug, Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        delay: Option<Duration>,
        overlapped: AtomicBool,
        in_callback: AtomicBool,
    }

    #[async_trait]
    impl HeadTrackable for Recorder {
        async fn on_new_longest_chain(&self, head: &Head) {
            if self.in_callback.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().push(head.number);
            self.in_callback.store(false, Ordering::SeqCst);
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn subscribers_see_heads_in_order() {
        let broadcaster =
            HeadBroadcaster::new(Duration::from_millis(200), HeadTrackerMetrics::dummy_instance());
        let handle = broadcaster.start();
        let recorder = Arc::new(Recorder::default());
        let (latest, _unsub) = broadcaster.subscribe(recorder.clone());
        assert!(latest.is_none());

        for n in 1..=50 {
            broadcaster.on_new_longest_chain(head(n));
            if n % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }
        wait_for(|| recorder.seen.lock().last() == Some(&50)).await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.last(), Some(&50));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert!(!recorder.overlapped.load(Ordering::SeqCst));

        let (latest, _) = broadcaster.subscribe(Arc::new(Recorder::default()));
        assert_eq!(latest.map(|h| h.number), Some(50));

        broadcaster.close();
        handle.await.unwrap();
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn slow_subscriber_does_not_delay_peers() {
        let broadcaster =
            HeadBroadcaster::new(Duration::from_millis(100), HeadTrackerMetrics::dummy_instance());
        let _handle = broadcaster.start();
        let slow = Arc::new(Recorder {
            delay: Some(Duration::from_millis(600)),
            ..Default::default()
        });
        let fast = Arc::new(Recorder::default());
        let (_, _u1) = broadcaster.subscribe(slow.clone());
        let (_, _u2) = broadcaster.subscribe(fast.clone());

        broadcaster.on_new_longest_chain(head(1));
        wait_for(|| fast.seen.lock().len() == 1).await;
        // wait past the timeout; the slow callback is still running
        tokio::time::sleep(Duration::from_millis(150)).await;
        broadcaster.on_new_longest_chain(head(2));
        wait_for(|| fast.seen.lock().len() == 2).await;
        broadcaster.on_new_longest_chain(head(3));
        wait_for(|| fast.seen.lock().len() == 3).await;

        assert_eq!(*fast.seen.lock(), vec![1, 2, 3]);
        assert!(logs_contain("Subscriber busy, head queued for its next callback"));
        assert!(slow.seen.lock().is_empty());

        // the heads that arrived while it was busy coalesce to the newest
        wait_for(|| slow.seen.lock().len() == 2).await;
        assert_eq!(*slow.seen.lock(), vec![1, 3]);
        assert!(!slow.overlapped.load(Ordering::SeqCst));
        broadcaster.close();
    }

    #[tokio::test]
    async fn unsubscribed_trackable_is_not_called() {
        let broadcaster =
            HeadBroadcaster::new(Duration::from_millis(100), HeadTrackerMetrics::dummy_instance());
        let _handle = broadcaster.start();
        let recorder = Arc::new(Recorder::default());
        let (_, unsub) = broadcaster.subscribe(recorder.clone());
        broadcaster.on_new_longest_chain(head(1));
        wait_for(|| recorder.seen.lock().len() == 1).await;
        unsub.unsubscribe();
        broadcaster.on_new_longest_chain(head(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*recorder.seen.lock(), vec![1]);
        broadcaster.close();
    }
}
