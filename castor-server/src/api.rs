//! Coordinator assembly and north-bound API.
//!
//! [`Coordinator`] wires the registry, scheduler, health supervisor, and
//! eviction loop together, exposes the in-process API the relay calls
//! (`submit_job`, `cancel_job`, the list endpoints), and builds the axum
//! router serving the daemon websocket plus the read-only dashboard routes.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use castor_config::CoordinatorConfig;
use castor_contracts::{JobSpec, TranscodeMessage};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::health::HealthSupervisor;
use crate::jobs::{JobSnapshot, JobTable};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::events::EventBus;
use crate::registry::{Registry, WorkerSnapshot};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::session::{JobHandle, SessionContext};
use crate::{session, ws};

pub struct CoordinatorInner {
    pub(crate) config: Arc<CoordinatorConfig>,
    pub(crate) registry: Registry,
    pub(crate) jobs: JobTable,
    pub(crate) scheduler: SchedulerHandle,
    pub(crate) metrics: Arc<Metrics>,
    /// Per-job stream demux: the connection actors push worker frames here.
    pub(crate) streams: Arc<DashMap<String, mpsc::Sender<TranscodeMessage>>>,
    pub(crate) shutdown: CancellationToken,
}

impl std::fmt::Debug for CoordinatorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorInner")
            .field("workers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    /// Build the coordinator and start its background tasks.
    pub fn new(config: CoordinatorConfig) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::default());
        let registry = Registry::new(EventBus::default(), metrics.clone());
        let shutdown = CancellationToken::new();

        let scheduler =
            Scheduler::spawn(registry.clone(), metrics.clone(), &config, shutdown.clone());
        HealthSupervisor::new(registry.clone(), &config).spawn(shutdown.clone());
        registry.spawn_eviction_loop(config.worker_eviction_grace, shutdown.clone());

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                registry,
                jobs: JobTable::default(),
                scheduler,
                metrics,
                streams: Arc::new(DashMap::new()),
                shutdown,
            }),
        }
    }

    /// Router serving the daemon websocket and the dashboard endpoints.
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(&self) -> axum::Router {
        axum::Router::new()
            .route("/v1/daemon", get(ws::daemon_ws))
            .route("/api/v1/workers", get(list_workers))
            .route("/api/v1/workers/{id}", get(get_worker))
            .route("/api/v1/jobs", get(list_jobs))
            .route("/api/v1/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(self.inner.clone())
    }

    /// Submit a transcode job. Returns immediately; scheduling progress,
    /// stats, and the terminal outcome arrive on the status channel.
    pub fn submit_job(&self, spec: JobSpec) -> JobHandle {
        let job_id = Uuid::new_v4().to_string();
        let cancel = self.inner.jobs.insert(job_id.clone(), spec.clone());

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inner.config.session.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.inner.config.session.outbound_capacity);
        let (status_tx, status_rx) = mpsc::channel(64);

        let ctx = SessionContext {
            job_id: job_id.clone(),
            spec,
            config: self.inner.config.clone(),
            registry: self.inner.registry.clone(),
            scheduler: self.inner.scheduler.clone(),
            jobs: self.inner.jobs.clone(),
            streams: self.inner.streams.clone(),
            metrics: self.inner.metrics.clone(),
            cancel,
            inbound_rx,
            outbound_tx,
            status_tx,
        };
        tokio::spawn(session::run(ctx));

        JobHandle {
            job_id,
            inbound: inbound_tx,
            outbound: outbound_rx,
            status: status_rx,
        }
    }

    /// Cancel a job. Returns false for unknown job ids.
    pub fn cancel_job(&self, job_id: &str, reason: &str) -> bool {
        self.inner.jobs.cancel(job_id, reason)
    }

    pub async fn list_workers(&self) -> Vec<WorkerSnapshot> {
        self.inner.registry.snapshots().await
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerSnapshot> {
        self.inner.registry.snapshot(worker_id).await
    }

    pub fn list_active_jobs(&self) -> Vec<JobSnapshot> {
        self.inner.jobs.active_snapshots()
    }

    pub fn job_snapshot(&self, job_id: &str) -> Option<JobSnapshot> {
        self.inner.jobs.snapshot(job_id)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Graceful shutdown: cancel every active session, wait out the grace,
    /// then stop the background tasks.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down, draining sessions");
        for snapshot in self.inner.jobs.active_snapshots() {
            self.inner
                .jobs
                .cancel(&snapshot.job_id, "coordinator shutting down");
        }
        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_grace;
        while self.inner.jobs.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        self.inner.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<CoordinatorInner> {
        &self.inner
    }
}

async fn list_workers(State(inner): State<Arc<CoordinatorInner>>) -> Json<Vec<WorkerSnapshot>> {
    Json(inner.registry.snapshots().await)
}

async fn get_worker(
    State(inner): State<Arc<CoordinatorInner>>,
    Path(worker_id): Path<String>,
) -> Result<Json<WorkerSnapshot>, StatusCode> {
    inner
        .registry
        .snapshot(&worker_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_jobs(State(inner): State<Arc<CoordinatorInner>>) -> Json<Vec<JobSnapshot>> {
    Json(inner.jobs.active_snapshots())
}

async fn metrics(State(inner): State<Arc<CoordinatorInner>>) -> Json<MetricsSnapshot> {
    Json(inner.metrics.snapshot())
}
