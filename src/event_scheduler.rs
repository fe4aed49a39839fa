use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Deadline-bound protocol events: probe acknowledgements waiting to be
/// intercepted, and suspicion timers waiting to expire.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) enum EventType {
    Ack { seq_no: u32 },
    SuspicionTimeout { node: String },
}

/// Terminal state of a scheduled event, delivered to the waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventState {
    /// The deadline fired before anything else happened.
    ReachedDeadline,
    /// The awaited condition arrived in time (an ack, a refutation).
    Intercepted,
    /// The event became irrelevant and was dropped.
    Cancelled,
}

struct Entry {
    id: u64,
    sender: mpsc::Sender<EventState>,
}

struct SchedulerInner {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    by_type: HashMap<EventType, Entry>,
    by_id: HashMap<u64, EventType>,
}

/// Table of pending deadlines keyed by event type.
///
/// Every entry leaves the table exactly once: intercepted, cancelled, or
/// reaped by the deadline loop. Nothing outlives its deadline, so a
/// probe abandoned mid-flight cannot leak its handler.
pub(crate) struct EventScheduler {
    inner: Mutex<SchedulerInner>,
    counter: AtomicU64,
    changed: Notify,
}

impl EventScheduler {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SchedulerInner {
                heap: BinaryHeap::new(),
                by_type: HashMap::new(),
                by_id: HashMap::new(),
            }),
            counter: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Register an event with a deadline. Returns the receiver the
    /// caller selects on; errors if an event of this type is pending.
    pub(crate) fn schedule(
        &self,
        event_type: EventType,
        deadline: Instant,
    ) -> Result<mpsc::Receiver<EventState>> {
        let (sender, receiver) = mpsc::channel(1);
        let id = self.counter.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut inner = self.inner.lock();
            if inner.by_type.contains_key(&event_type) {
                return Err(anyhow!("event already pending: {:?}", event_type));
            }
            inner.by_type.insert(event_type.clone(), Entry { id, sender });
            inner.by_id.insert(id, event_type);
            inner.heap.push(Reverse((deadline, id)));
        }
        self.changed.notify_one();
        Ok(receiver)
    }

    /// Resolve a pending event early. Returns false when no such event
    /// is pending (late ack, already-fired timer).
    pub(crate) fn intercept(&self, event_type: &EventType) -> bool {
        self.finish(event_type, EventState::Intercepted)
    }

    /// Drop a pending event without treating it as success.
    pub(crate) fn cancel(&self, event_type: &EventType) -> bool {
        self.finish(event_type, EventState::Cancelled)
    }

    fn finish(&self, event_type: &EventType, state: EventState) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.by_type.remove(event_type);
            if let Some(entry) = &entry {
                inner.by_id.remove(&entry.id);
            }
            entry
        };
        match entry {
            Some(entry) => {
                // The waiter may be gone; the event is resolved either way.
                let _ = entry.sender.try_send(state);
                true
            }
            None => false,
        }
    }

    /// Earliest pending deadline, skipping entries already resolved.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        while let Some(Reverse((deadline, id))) = inner.heap.peek().copied() {
            if inner.by_id.contains_key(&id) {
                return Some(deadline);
            }
            inner.heap.pop();
        }
        None
    }

    /// Remove and return every event whose deadline has passed.
    pub(crate) fn pop_due(&self, now: Instant) -> Vec<(EventType, mpsc::Sender<EventState>)> {
        let mut due = Vec::new();
        let mut inner = self.inner.lock();
        while let Some(Reverse((deadline, id))) = inner.heap.peek().copied() {
            if deadline > now {
                break;
            }
            inner.heap.pop();
            if let Some(event_type) = inner.by_id.remove(&id) {
                if let Some(entry) = inner.by_type.remove(&event_type) {
                    due.push((event_type, entry.sender));
                }
            }
        }
        due
    }

    /// Wait until the set of pending deadlines may have changed.
    pub(crate) async fn wait_for_change(&self) {
        self.changed.notified().await;
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.inner.lock().by_type.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_deadline_fires() {
        let scheduler = EventScheduler::new();
        let event = EventType::Ack { seq_no: 1 };
        let mut receiver = scheduler
            .schedule(event.clone(), Instant::now() + Duration::from_millis(10))
            .unwrap();

        let due = scheduler.pop_due(Instant::now() + Duration::from_millis(20));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, event);
        due[0].1.try_send(EventState::ReachedDeadline).unwrap();

        assert_eq!(receiver.recv().await, Some(EventState::ReachedDeadline));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_intercept_resolves_before_deadline() {
        let scheduler = EventScheduler::new();
        let event = EventType::Ack { seq_no: 7 };
        let mut receiver = scheduler
            .schedule(event.clone(), Instant::now() + Duration::from_secs(10))
            .unwrap();

        assert!(scheduler.intercept(&event));
        assert_eq!(receiver.recv().await, Some(EventState::Intercepted));

        // Intercepted events never fire from the heap.
        let due = scheduler.pop_due(Instant::now() + Duration::from_secs(20));
        assert!(due.is_empty());
        // A second intercept finds nothing.
        assert!(!scheduler.intercept(&event));
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let scheduler = EventScheduler::new();
        let event = EventType::SuspicionTimeout {
            node: "a".to_string(),
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        scheduler.schedule(event.clone(), deadline).unwrap();
        assert!(scheduler.schedule(event, deadline).is_err());
    }

    #[test]
    fn test_next_deadline_skips_resolved() {
        let scheduler = EventScheduler::new();
        let near = EventType::Ack { seq_no: 1 };
        let far = EventType::Ack { seq_no: 2 };
        let near_deadline = Instant::now() + Duration::from_millis(10);
        let far_deadline = Instant::now() + Duration::from_secs(10);
        scheduler.schedule(near.clone(), near_deadline).unwrap();
        scheduler.schedule(far, far_deadline).unwrap();

        assert_eq!(scheduler.next_deadline(), Some(near_deadline));
        scheduler.cancel(&near);
        assert_eq!(scheduler.next_deadline(), Some(far_deadline));
    }
}
