//! Registry event bus. Subscribers (scheduler waiters, dashboard feeds)
//! observe per-worker events in emission order; cross-worker ordering is
//! unspecified.

use castor_contracts::JobState;
use tokio::sync::broadcast;

use super::WorkerState;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    WorkerConnected {
        worker_id: String,
    },
    WorkerStateChanged {
        worker_id: String,
        state: WorkerState,
    },
    WorkerCapabilitiesReceived {
        worker_id: String,
    },
    WorkerStatsUpdated {
        worker_id: String,
    },
    WorkerGone {
        worker_id: String,
    },
    JobBound {
        job_id: String,
        worker_id: String,
    },
    JobUnbound {
        job_id: String,
        worker_id: String,
        terminal: JobState,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RegistryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; an event with no subscribers is fine.
    pub fn emit(&self, event: RegistryEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
