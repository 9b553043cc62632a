//! Health supervision: a single 1-second loop watching heartbeat recency.
//!
//! Two missed-interval thresholds: after three missed beats a connected
//! worker turns `unhealthy` (the scheduler stops binding to it); after the
//! unhealthy grace it is declared `disconnected`, its transport is closed,
//! and the worker-loss policy fails every job still bound to it. A single
//! on-time heartbeat walks an unhealthy worker straight back to
//! `connected` — heartbeats are the only liveness authority.

use std::time::Duration;

use castor_config::CoordinatorConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::{Registry, WorkerState};

const MISSED_BEATS_UNHEALTHY: u32 = 3;

#[derive(Debug, Clone)]
pub struct HealthSupervisor {
    registry: Registry,
    heartbeat_interval: Duration,
    unhealthy_grace: Duration,
}

impl HealthSupervisor {
    pub fn new(registry: Registry, config: &CoordinatorConfig) -> Self {
        Self {
            registry,
            heartbeat_interval: config.heartbeat_interval,
            unhealthy_grace: config.unhealthy_grace,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => self.sweep().await,
                }
            }
        })
    }

    /// One pass over every worker.
    pub async fn sweep(&self) {
        for entry in self.registry.iter_entries() {
            let (state, silence, missed) = {
                let mut record = entry.record.write().await;
                if matches!(
                    record.state,
                    WorkerState::Disconnected | WorkerState::Connecting
                ) {
                    continue;
                }
                let silence = record.last_heartbeat.elapsed();
                if silence >= self.heartbeat_interval * 2 {
                    record.missed_heartbeats += 1;
                }
                (record.state, silence, record.missed_heartbeats)
            };

            if silence >= self.unhealthy_grace {
                warn!(
                    worker_id = %entry.id,
                    silence_ms = silence.as_millis() as u64,
                    "worker exceeded the unhealthy grace, declaring it lost"
                );
                // Closing the link fails every active job bound to the
                // worker: each session observes its stream ending and
                // finishes failed/recoverable, releasing reservations.
                self.registry.connection_lost(&entry.id).await;
                continue;
            }

            if missed >= MISSED_BEATS_UNHEALTHY && state == WorkerState::Connected {
                info!(
                    worker_id = %entry.id,
                    missed,
                    "worker missed heartbeats, marking unhealthy"
                );
                self.registry.transition(&entry, WorkerState::Unhealthy).await;
            }
        }
    }
}
