use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A bounded queue between one producer side and one consumer task.
///
/// Delivering into a full mailbox drops the oldest item, so the newest item
/// always survives. With a capacity of one this is a latest-wins slot.
#[derive(Debug)]
pub struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> Mailbox<T> {
    /// A mailbox holding at most `capacity` items (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Adds an item. Returns true if an older item was dropped to make room.
    pub fn deliver(&self, item: T) -> bool {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(item);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Removes and returns the oldest item.
    pub fn retrieve(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Removes everything and returns the newest item.
    pub fn retrieve_latest_and_clear(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Removes and returns everything, oldest first.
    pub fn retrieve_all(&self) -> Vec<T> {
        self.queue.lock().drain(..).collect()
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Completes once an item has been delivered since the last wakeup.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
