use configuration::OverflowPolicy;
use events::EventEnvelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to an envelope offered to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Queued after evicting the oldest waiting envelope.
    DisplacedOldest,
    /// Not queued; the queue was full and the policy keeps what it has.
    Rejected,
}

/// Bounded FIFO of envelopes waiting for fan-out.
pub struct OutboundQueue {
    items: Mutex<VecDeque<EventEnvelope>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, envelope: EventEnvelope) -> Admission {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(envelope);
            return Admission::Queued;
        }

        self.dropped.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            OverflowPolicy::DropOldest => {
                if let Some(evicted) = items.pop_front() {
                    tracing::warn!(
                        evicted_id = %evicted.id,
                        event_type = %evicted.kind,
                        capacity = self.capacity,
                        "Outbound queue full, dropped oldest event."
                    );
                }
                items.push_back(envelope);
                Admission::DisplacedOldest
            }
            OverflowPolicy::DropNewest => {
                tracing::warn!(
                    rejected_id = %envelope.id,
                    event_type = %envelope.kind,
                    capacity = self.capacity,
                    "Outbound queue full, rejected new event."
                );
                Admission::Rejected
            }
        }
    }

    /// Takes everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<EventEnvelope> {
        self.items.lock().drain(..).collect()
    }

    pub fn depth(&self) -> usize {
        self.items.lock().len()
    }

    /// Envelopes lost to overflow since start-up.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
