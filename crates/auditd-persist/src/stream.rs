//! Real-time event fan-out
//!
//! Every successful append is published to the hub. Each subscriber owns a
//! bounded queue drained by its own writer task, so publication is
//! non-blocking and per-subscriber order matches chain order. A subscriber
//! whose queue is full or whose receiver is gone is marked dead during the
//! dispatch pass and pruned afterwards under a short write lock.
//!
//! There is no replay: a new subscriber sees only events appended after its
//! registration. Catch-up goes through the HTTP query surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

/// Queue depth per subscriber before it is considered too slow
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

struct HubInner {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Fan-out hub for newline-delimited event JSON
#[derive(Clone)]
pub struct StreamHub {
    inner: Arc<HubInner>,
}

/// A registered subscription; dropping the receiver ends it
pub struct StreamSubscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber and get its queue
    pub fn subscribe(&self) -> StreamSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.push(Subscriber { id, tx });
        }
        debug!(subscriber = id, "stream subscriber registered");
        StreamSubscription { id, rx }
    }

    /// Drop a subscriber explicitly (writer tasks call this on disconnect)
    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.retain(|s| s.id != id);
        }
    }

    /// Publish one serialized event to every live subscriber.
    ///
    /// Called from the append path while the writer mutex is held, which is
    /// what makes delivery order equal chain order; nothing here blocks or
    /// awaits. Snapshot under the read lock, send outside any lock held for
    /// the prune.
    pub fn publish(&self, line: &str) {
        let dead: Vec<u64> = {
            let subs = match self.inner.subscribers.read() {
                Ok(subs) => subs,
                Err(_) => return,
            };
            subs.iter()
                .filter(|s| s.tx.try_send(line.to_string()).is_err())
                .map(|s| s.id)
                .collect()
        };

        if !dead.is_empty() {
            if let Ok(mut subs) = self.inner.subscribers.write() {
                subs.retain(|s| !dead.contains(&s.id));
            }
            debug!(pruned = dead.len(), "dropped dead stream subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}
