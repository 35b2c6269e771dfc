//! Local observer registry: handlers keyed by event kind.

use events::EventKind;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Returned by `on`, needed to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Runs every handler registered for `kind`, in registration order.
    ///
    /// A handler that errors or panics is logged and skipped; the rest still run.
    /// Handlers run without the registry lock held, so they may call `on`/`off`.
    pub fn emit(&self, kind: EventKind, data: &Value) -> usize {
        let handlers: Vec<(HandlerId, Handler)> = match self.handlers.lock().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(data))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(event_type = %kind, handler = id.0, error = %e, "Event handler failed.");
                }
                Err(_) => {
                    tracing::error!(event_type = %kind, handler = id.0, "Event handler panicked.");
                }
            }
        }
        handlers.len()
    }
}

/// Remembers the most recent envelope ids so an envelope seen on both
/// transports is only dispatched once.
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl RecentIds {
    /// A zero capacity disables de-duplication.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Records `id`. Returns `false` if it was already in the window.
    pub fn insert(&mut self, id: Uuid) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
