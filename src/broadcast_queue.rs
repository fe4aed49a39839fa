use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Queue of pending gossip messages, each retransmitted a bounded number
/// of times before being dropped.
///
/// Implementations are internally synchronized; the gossip loop and the
/// state machine call into the queue concurrently.
pub trait BroadcastQueue: Send + Sync {
    /// Enqueue an encoded message for gossip.
    ///
    /// `tag` deduplicates rumors: a newer broadcast with the same tag
    /// replaces the older one, firing the older one's notifier. `notify`
    /// is signalled once this broadcast leaves the queue for good.
    fn queue_broadcast(
        &self,
        tag: Option<String>,
        payload: Vec<u8>,
        notify: Option<Arc<Notify>>,
    ) -> Result<()>;

    /// Pop up to `limit - overhead·k` bytes of the highest-priority
    /// messages, where each selected message costs its length plus
    /// `overhead` bytes of framing. Increments transmit counters and
    /// drops messages that have reached their retransmit limit.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Result<Vec<Vec<u8>>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

struct QueuedBroadcast {
    tag: Option<String>,
    payload: Vec<u8>,
    transmits: u32,
    id: u64,
    notify: Option<Arc<Notify>>,
}

impl QueuedBroadcast {
    fn finished(&self) {
        if let Some(notify) = &self.notify {
            notify.notify_one();
        }
    }
}

/// The default transmit-limited queue.
///
/// Messages are served in ascending-transmit order with FIFO tie-breaks,
/// and removed once transmitted `ceil(retransmit_mult · log10(n + 1))`
/// times, where `n` comes from the injected cluster-size supplier.
pub struct DefaultBroadcastQueue {
    queue: Mutex<Vec<QueuedBroadcast>>,
    next_id: AtomicU64,
    retransmit_mult: u32,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
}

impl DefaultBroadcastQueue {
    pub fn new<F>(retransmit_mult: u32, num_nodes: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
        }
    }

    fn retransmit_limit(&self) -> u32 {
        retransmit_limit(self.retransmit_mult, (self.num_nodes)())
    }
}

/// `ceil(mult · log10(n + 1))`, with at least one transmission.
pub(crate) fn retransmit_limit(mult: u32, n: usize) -> u32 {
    let n = n.max(1);
    let limit = (mult as f64 * ((n + 1) as f64).log10()).ceil() as u32;
    limit.max(1)
}

impl BroadcastQueue for DefaultBroadcastQueue {
    fn queue_broadcast(
        &self,
        tag: Option<String>,
        payload: Vec<u8>,
        notify: Option<Arc<Notify>>,
    ) -> Result<()> {
        let mut queue = self.queue.lock();
        if let Some(tag) = &tag {
            // Newer rumor for the same subject supersedes the older one.
            queue.retain(|queued| {
                let stale = queued.tag.as_deref() == Some(tag.as_str());
                if stale {
                    queued.finished();
                }
                !stale
            });
        }
        queue.push(QueuedBroadcast {
            tag,
            payload,
            transmits: 0,
            id: self.next_id.fetch_add(1, AtomicOrdering::Relaxed),
            notify,
        });
        Ok(())
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Result<Vec<Vec<u8>>> {
        let max_transmits = self.retransmit_limit();
        let mut queue = self.queue.lock();
        queue.sort_by(|a, b| {
            a.transmits
                .cmp(&b.transmits)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut bytes_used = 0;
        let mut selected = Vec::new();
        let mut index = 0;
        while index < queue.len() {
            let cost = overhead + queue[index].payload.len();
            if bytes_used + cost > limit {
                index += 1;
                continue;
            }
            bytes_used += cost;
            selected.push(queue[index].payload.clone());
            queue[index].transmits += 1;
            if queue[index].transmits >= max_transmits {
                let spent = queue.remove(index);
                spent.finished();
            } else {
                index += 1;
            }
        }
        Ok(selected)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.queue.lock().len())
    }
}
