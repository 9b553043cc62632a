//! In-memory worker registry.
//!
//! The map itself is a sharded [`DashMap`]; each worker record sits behind
//! its own async `RwLock`, so heartbeat handling, scheduling reservations,
//! and health transitions serialize per worker without a global write lock.
//! Disconnected workers linger for an eviction grace so dashboards can show
//! the last known state.

pub mod events;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use castor_contracts::{
    Capabilities, Command, CoordinatorFrame, GpuInfo, HeartbeatRequest, JobState, SystemStats,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use events::{EventBus, RegistryEvent};

/// Coordinator-side view of a worker's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Connecting,
    Connected,
    Draining,
    Unhealthy,
    Disconnected,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
            Self::Unhealthy => "unhealthy",
            Self::Disconnected => "disconnected",
        }
    }
}

/// Channels into a worker's live connection actor.
#[derive(Debug, Clone)]
pub struct WorkerLink {
    /// Frames pushed straight onto the websocket.
    pub frames: mpsc::Sender<CoordinatorFrame>,
    /// Commands queued for the next heartbeat reply.
    pub commands: mpsc::Sender<Command>,
    /// Cancelling this tears the connection down.
    pub closed: CancellationToken,
}

/// Per-GPU session accounting: the worker's reported occupancy plus the
/// scheduler's speculative overlay.
#[derive(Debug, Clone)]
pub struct GpuSessionState {
    pub info: GpuInfo,
    pub reported_encode: u32,
    pub reserved_encode: u32,
    pub reported_decode: u32,
}

impl GpuSessionState {
    /// Sessions the scheduler must assume are in use.
    pub fn effective_encode(&self) -> u32 {
        self.reported_encode + self.reserved_encode
    }

    /// Whether one more encode session fits, with the zero sentinel
    /// resolved against `unlimited`.
    pub fn has_headroom(&self, unlimited: u32) -> bool {
        self.effective_encode() < self.info.encode_session_cap(unlimited)
    }
}

#[derive(Debug)]
pub struct WorkerRecord {
    pub name: String,
    pub version: String,
    pub remote_addr: String,
    pub capabilities: Capabilities,
    pub state: WorkerState,
    pub active_jobs: u32,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub system: Option<SystemStats>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub last_heartbeat_at: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub heartbeat_seq: u64,
    pub disconnected_at: Option<Instant>,
    pub gpus: Vec<GpuSessionState>,
    pub link: Option<WorkerLink>,
}

#[derive(Debug)]
pub struct WorkerEntry {
    pub id: String,
    pub record: RwLock<WorkerRecord>,
}

/// Dashboard/API projection of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub remote_addr: String,
    pub state: WorkerState,
    pub active_jobs: u32,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub max_concurrent_jobs: u32,
    pub system: Option<SystemStats>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub missed_heartbeats: u32,
    pub gpus: Vec<GpuSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuSnapshot {
    pub index: u32,
    pub name: String,
    pub max_encode_sessions: u32,
    pub reported_encode_sessions: u32,
    pub reserved_encode_sessions: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("unknown worker {0}")]
    UnknownWorker(String),
    #[error("stale heartbeat sequence {got} (latest {latest})")]
    Stale { got: u64, latest: u64 },
}

#[derive(Debug, Clone)]
pub struct Registry {
    workers: Arc<DashMap<String, Arc<WorkerEntry>>>,
    events: EventBus,
    metrics: Arc<Metrics>,
}

impl Registry {
    pub fn new(events: EventBus, metrics: Arc<Metrics>) -> Self {
        Self {
            workers: Arc::new(DashMap::new()),
            events,
            metrics,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<WorkerEntry>> {
        self.workers.get(worker_id).map(|e| e.value().clone())
    }

    pub fn iter_entries(&self) -> Vec<Arc<WorkerEntry>> {
        self.workers.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn link(&self, worker_id: &str) -> Option<WorkerLink> {
        let entry = self.get(worker_id)?;
        let record = entry.record.read().await;
        record.link.clone()
    }

    /// Register (or re-register) a worker. An existing record is replaced
    /// wholesale: the old link is closed, which fails any stale sessions
    /// still pointing at it.
    pub async fn register(
        &self,
        worker_id: String,
        name: String,
        version: String,
        remote_addr: String,
        capabilities: Capabilities,
        link: WorkerLink,
    ) {
        let now = Utc::now();
        let gpus = capabilities
            .gpus
            .iter()
            .map(|info| GpuSessionState {
                info: info.clone(),
                reported_encode: 0,
                reserved_encode: 0,
                reported_decode: 0,
            })
            .collect();
        let record = WorkerRecord {
            name,
            version,
            remote_addr,
            capabilities,
            state: WorkerState::Connecting,
            active_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            system: None,
            connected_at: now,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: now,
            missed_heartbeats: 0,
            heartbeat_seq: 0,
            disconnected_at: None,
            gpus,
            link: Some(link),
        };

        if let Some(existing) = self.get(&worker_id) {
            {
                let mut old = existing.record.write().await;
                if let Some(old_link) = old.link.take() {
                    old_link.closed.cancel();
                }
            }
            info!(%worker_id, "worker re-registered, discarding stale state");
            self.metrics.re_registrations.fetch_add(1, Ordering::Relaxed);
            // Walk back to `connecting` first so the state gauges stay
            // consistent, then install the fresh record.
            self.transition(&existing, WorkerState::Connecting).await;
            *existing.record.write().await = record;
            self.events.emit(RegistryEvent::WorkerCapabilitiesReceived {
                worker_id: worker_id.clone(),
            });
            self.transition(&existing, WorkerState::Connected).await;
            return;
        }

        let entry = Arc::new(WorkerEntry {
            id: worker_id.clone(),
            record: RwLock::new(record),
        });
        self.workers.insert(worker_id.clone(), entry.clone());
        info!(%worker_id, "worker registered");
        self.events.emit(RegistryEvent::WorkerConnected {
            worker_id: worker_id.clone(),
        });
        self.events
            .emit(RegistryEvent::WorkerCapabilitiesReceived { worker_id });
        self.transition(&entry, WorkerState::Connected).await;
    }

    /// Apply one heartbeat. Heartbeats are the single source of truth for
    /// liveness; out-of-order arrivals are rejected.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        request: &HeartbeatRequest,
    ) -> Result<(), HeartbeatError> {
        let entry = self
            .get(worker_id)
            .ok_or_else(|| HeartbeatError::UnknownWorker(worker_id.to_string()))?;
        let mut record = entry.record.write().await;

        if request.seq <= record.heartbeat_seq && request.seq != 0 {
            self.metrics.heartbeats_stale.fetch_add(1, Ordering::Relaxed);
            return Err(HeartbeatError::Stale {
                got: request.seq,
                latest: record.heartbeat_seq,
            });
        }
        record.heartbeat_seq = request.seq;
        record.last_heartbeat = Instant::now();
        record.last_heartbeat_at = Utc::now();
        record.missed_heartbeats = 0;
        record.system = request.system.clone();
        for report in &request.gpus {
            if let Some(gpu) = record
                .gpus
                .iter_mut()
                .find(|g| g.info.index == report.index)
            {
                gpu.reported_encode = report.active_encode_sessions;
                gpu.reported_decode = report.active_decode_sessions;
            }
        }
        self.metrics
            .heartbeats_received
            .fetch_add(1, Ordering::Relaxed);

        let target = match (record.state, request.draining) {
            (WorkerState::Unhealthy, _) => Some(WorkerState::Connected),
            (WorkerState::Connected, true) => Some(WorkerState::Draining),
            (WorkerState::Draining, false) => Some(WorkerState::Connected),
            _ => None,
        };
        drop(record);

        if let Some(state) = target {
            self.transition(&entry, state).await;
        }
        self.events.emit(RegistryEvent::WorkerStatsUpdated {
            worker_id: worker_id.to_string(),
        });
        Ok(())
    }

    /// Queue a command for a worker's next heartbeat reply.
    pub async fn send_command(&self, worker_id: &str, command: Command) -> bool {
        match self.link(worker_id).await {
            Some(link) => link.commands.send(command).await.is_ok(),
            None => false,
        }
    }

    /// State transition with event + gauge bookkeeping. No-op when already
    /// in the target state.
    pub async fn transition(&self, entry: &Arc<WorkerEntry>, state: WorkerState) {
        let mut record = entry.record.write().await;
        if record.state == state {
            return;
        }
        let old = record.state;
        record.state = state;
        if state == WorkerState::Disconnected {
            record.disconnected_at = Some(Instant::now());
        }
        drop(record);

        let gauge = |s: WorkerState| match s {
            WorkerState::Unhealthy => Some(&self.metrics.workers_unhealthy),
            WorkerState::Draining => Some(&self.metrics.workers_draining),
            WorkerState::Disconnected => Some(&self.metrics.workers_disconnected),
            WorkerState::Connected => Some(&self.metrics.workers_connected),
            WorkerState::Connecting => None,
        };
        if let Some(g) = gauge(old) {
            g.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(g) = gauge(state) {
            g.fetch_add(1, Ordering::Relaxed);
        }

        debug!(worker_id = %entry.id, from = old.as_str(), to = state.as_str(), "worker state change");
        self.events.emit(RegistryEvent::WorkerStateChanged {
            worker_id: entry.id.clone(),
            state,
        });
    }

    /// The transport to a worker went away (socket closed, unregister, or
    /// health timeout). Closes the link and marks the record disconnected.
    pub async fn connection_lost(&self, worker_id: &str) {
        let Some(entry) = self.get(worker_id) else {
            return;
        };
        {
            let mut record = entry.record.write().await;
            if let Some(link) = record.link.take() {
                link.closed.cancel();
            }
        }
        warn!(%worker_id, "worker connection lost");
        self.transition(&entry, WorkerState::Disconnected).await;
    }

    /// Reservation bookkeeping, called only from the scheduler task.
    pub async fn bind_job(&self, worker_id: &str, job_id: &str, gpu_index: Option<u32>) -> bool {
        let Some(entry) = self.get(worker_id) else {
            return false;
        };
        let mut record = entry.record.write().await;
        record.active_jobs += 1;
        if let Some(index) = gpu_index
            && let Some(gpu) = record.gpus.iter_mut().find(|g| g.info.index == index)
        {
            gpu.reserved_encode += 1;
            self.metrics
                .gpu_sessions_reserved
                .fetch_add(1, Ordering::Relaxed);
        }
        drop(record);
        self.events.emit(RegistryEvent::JobBound {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
        });
        true
    }

    /// Release a reservation on terminal state (or rollback after a failed
    /// `Ack`).
    pub async fn unbind_job(
        &self,
        worker_id: &str,
        job_id: &str,
        gpu_index: Option<u32>,
        terminal: JobState,
    ) {
        if let Some(entry) = self.get(worker_id) {
            let mut record = entry.record.write().await;
            record.active_jobs = record.active_jobs.saturating_sub(1);
            match terminal {
                JobState::Completed => record.completed_jobs += 1,
                JobState::Failed => record.failed_jobs += 1,
                _ => {}
            }
            if let Some(index) = gpu_index
                && let Some(gpu) = record.gpus.iter_mut().find(|g| g.info.index == index)
            {
                gpu.reserved_encode = gpu.reserved_encode.saturating_sub(1);
                self.metrics
                    .gpu_sessions_reserved
                    .fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.events.emit(RegistryEvent::JobUnbound {
            job_id: job_id.to_string(),
            worker_id: worker_id.to_string(),
            terminal,
        });
    }

    pub async fn snapshot(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        let entry = self.get(worker_id)?;
        Some(Self::snapshot_entry(&entry).await)
    }

    pub async fn snapshots(&self) -> Vec<WorkerSnapshot> {
        let mut out = Vec::new();
        for entry in self.iter_entries() {
            out.push(Self::snapshot_entry(&entry).await);
        }
        out
    }

    async fn snapshot_entry(entry: &Arc<WorkerEntry>) -> WorkerSnapshot {
        let record = entry.record.read().await;
        WorkerSnapshot {
            id: entry.id.clone(),
            name: record.name.clone(),
            version: record.version.clone(),
            remote_addr: record.remote_addr.clone(),
            state: record.state,
            active_jobs: record.active_jobs,
            completed_jobs: record.completed_jobs,
            failed_jobs: record.failed_jobs,
            max_concurrent_jobs: record.capabilities.max_concurrent_jobs,
            system: record.system.clone(),
            connected_at: record.connected_at,
            last_heartbeat_at: record.last_heartbeat_at,
            missed_heartbeats: record.missed_heartbeats,
            gpus: record
                .gpus
                .iter()
                .map(|g| GpuSnapshot {
                    index: g.info.index,
                    name: g.info.name.clone(),
                    max_encode_sessions: g.info.max_encode_sessions,
                    reported_encode_sessions: g.reported_encode,
                    reserved_encode_sessions: g.reserved_encode,
                })
                .collect(),
        }
    }

    /// Background task removing workers that stayed disconnected past the
    /// eviction grace.
    pub fn spawn_eviction_loop(
        &self,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let mut evict = Vec::new();
                for entry in registry.iter_entries() {
                    let record = entry.record.read().await;
                    if record.state == WorkerState::Disconnected
                        && let Some(at) = record.disconnected_at
                        && at.elapsed() >= grace
                    {
                        evict.push(entry.id.clone());
                    }
                }
                for worker_id in evict {
                    registry.workers.remove(&worker_id);
                    registry
                        .metrics
                        .workers_disconnected
                        .fetch_sub(1, Ordering::Relaxed);
                    info!(%worker_id, "evicted disconnected worker");
                    registry.events.emit(RegistryEvent::WorkerGone { worker_id });
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A registered worker whose link leads to inspectable channels instead
    /// of a live socket.
    pub struct FakeWorker {
        pub worker_id: String,
        pub frames_rx: mpsc::Receiver<CoordinatorFrame>,
        pub commands_rx: mpsc::Receiver<Command>,
        pub closed: CancellationToken,
    }

    pub async fn register_fake(
        registry: &Registry,
        worker_id: &str,
        capabilities: Capabilities,
    ) -> FakeWorker {
        let (frames_tx, frames_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let closed = CancellationToken::new();
        registry
            .register(
                worker_id.to_string(),
                format!("fake-{worker_id}"),
                "0.0.0-test".into(),
                "127.0.0.1:0".into(),
                capabilities,
                WorkerLink {
                    frames: frames_tx,
                    commands: commands_tx,
                    closed: closed.clone(),
                },
            )
            .await;
        FakeWorker {
            worker_id: worker_id.to_string(),
            frames_rx,
            commands_rx,
            closed,
        }
    }
}
