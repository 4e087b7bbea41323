//! Tracer events and their delivery.
//!
//! Channel subscribers are fed first, so a channel sees events in emission
//! order even when a listener emits more events while handling one. Listeners
//! are then called synchronously, in registration order, on the thread that
//! caused the event. This is what lets a listener react to `Traced` by
//! tracing more nodes before the next completion check runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::diff::Diff;
use crate::error::DiscoveryError;

/// Something the tracer reports.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// The tracer went from idle to tracing.
    Started,

    /// Dependencies of `node` were discovered and applied.
    Traced { node: String, diff: Diff },

    /// Dependency discovery for `node` failed.
    NodeError { node: String, error: DiscoveryError },

    /// No valid pending job remains. `diff` spans every change since the
    /// previous `Complete`; `errors` lists the discovery failures of the run.
    Complete {
        diff: Diff,
        errors: Vec<DiscoveryError>,
    },

    /// Nodes were pruned. `nodes_impacted` are surviving nodes whose edges
    /// changed as a result.
    Pruned {
        pruned: Vec<String>,
        nodes_impacted: Vec<String>,
        diff: Diff,
    },
}

/// Identifies a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Callback = Arc<dyn Fn(&TraceEvent) + Send + Sync>;

/// Fan-out of tracer events to listeners and channels.
#[derive(Default)]
pub(crate) struct Emitter {
    listeners: Mutex<Vec<(ListenerId, Callback)>>,
    channels: Mutex<Vec<mpsc::UnboundedSender<TraceEvent>>>,
}

impl Emitter {
    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&TraceEvent) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TraceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: TraceEvent) {
        self.channels
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());

        // Listeners may register, unregister or emit while being called.
        let listeners: Vec<Callback> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for listener in listeners {
            listener(&event);
        }
    }
}
