//! The scheduler: capability-aware worker selection with speculative
//! reservation accounting.
//!
//! All reservation state mutates inside one actor task, so the bookkeeping
//! is race-free without a global lock; heartbeats and health transitions
//! keep mutating worker records in parallel behind their per-worker locks.
//! Queue-policy waiters park FIFO inside the actor and are retried when a
//! reservation releases or a worker connects.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use castor_config::CoordinatorConfig;
use castor_contracts::codec::{decoder_handles, encoder_produces, is_hardware};
use castor_contracts::{Capabilities, GpuExhaustedPolicy, HwAccelKind, JobSpec, JobState};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::registry::events::RegistryEvent;
use crate::registry::{Registry, WorkerState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no connected worker is capable of this job")]
    NoCapableWorker,
    #[error("cluster capacity exhausted")]
    CapacityExhausted,
    #[error("all GPU encode sessions exhausted")]
    GpuSessionsExhausted,
    #[error("rejected: {0}")]
    Rejected(String),
}

/// A speculative claim on one worker (and optionally one GPU session),
/// held from bind until the job's terminal state.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub worker_id: String,
    pub gpu_index: Option<u32>,
    pub hardware: bool,
}

enum SchedulerCmd {
    Reserve {
        job_id: String,
        spec: Box<JobSpec>,
        exclude: Vec<String>,
        reply: oneshot::Sender<Result<Reservation, ScheduleError>>,
    },
    /// Park until capacity frees (GPU policy `queue`); the reply fires when
    /// a reservation succeeds or the waiter is cancelled.
    ReserveQueued {
        job_id: String,
        spec: Box<JobSpec>,
        exclude: Vec<String>,
        reply: oneshot::Sender<Result<Reservation, ScheduleError>>,
    },
    CancelWait {
        job_id: String,
    },
    Release {
        job_id: String,
        terminal: JobState,
    },
}

struct Waiter {
    job_id: String,
    spec: Box<JobSpec>,
    exclude: Vec<String>,
    reply: oneshot::Sender<Result<Reservation, ScheduleError>>,
}

#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCmd>,
    queue_wait: std::time::Duration,
}

impl std::fmt::Debug for SchedulerCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reserve { .. } => "Reserve",
            Self::ReserveQueued { .. } => "ReserveQueued",
            Self::CancelWait { .. } => "CancelWait",
            Self::Release { .. } => "Release",
        };
        f.write_str(name)
    }
}

impl SchedulerHandle {
    /// Bind a job to a worker: reserve capacity, applying the job's
    /// GPU-exhausted policy. `exclude` carries workers that already failed
    /// this job's `Ack` during the retry loop.
    pub async fn reserve(
        &self,
        job_id: &str,
        spec: &JobSpec,
        exclude: Vec<String>,
    ) -> Result<Reservation, ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCmd::Reserve {
                job_id: job_id.to_string(),
                spec: Box::new(spec.clone()),
                exclude: exclude.clone(),
                reply,
            })
            .await
            .map_err(|_| ScheduleError::Rejected("scheduler is gone".into()))?;
        let first = rx
            .await
            .map_err(|_| ScheduleError::Rejected("scheduler dropped the request".into()))?;

        match first {
            Err(ScheduleError::GpuSessionsExhausted)
                if spec.gpu_exhausted_policy == GpuExhaustedPolicy::Queue =>
            {
                self.reserve_queued(job_id, spec, exclude).await
            }
            other => other,
        }
    }

    async fn reserve_queued(
        &self,
        job_id: &str,
        spec: &JobSpec,
        exclude: Vec<String>,
    ) -> Result<Reservation, ScheduleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCmd::ReserveQueued {
                job_id: job_id.to_string(),
                spec: Box::new(spec.clone()),
                exclude,
                reply,
            })
            .await
            .map_err(|_| ScheduleError::Rejected("scheduler is gone".into()))?;

        match tokio::time::timeout(self.queue_wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScheduleError::Rejected("scheduler dropped the waiter".into())),
            Err(_) => {
                let _ = self
                    .tx
                    .send(SchedulerCmd::CancelWait {
                        job_id: job_id.to_string(),
                    })
                    .await;
                Err(ScheduleError::CapacityExhausted)
            }
        }
    }

    /// Release a job's reservation. Idempotent; safe for rollback and for
    /// terminal cleanup alike.
    pub async fn release(&self, job_id: &str, terminal: JobState) {
        let _ = self
            .tx
            .send(SchedulerCmd::Release {
                job_id: job_id.to_string(),
                terminal,
            })
            .await;
    }
}

pub struct Scheduler {
    registry: Registry,
    metrics: Arc<Metrics>,
    reservations: HashMap<String, Reservation>,
    waiters: VecDeque<Waiter>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("reservations", &self.reservations.len())
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

impl Scheduler {
    pub fn spawn(
        registry: Registry,
        metrics: Arc<Metrics>,
        config: &CoordinatorConfig,
        shutdown: CancellationToken,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(128);
        let scheduler = Self {
            registry,
            metrics,
            reservations: HashMap::new(),
            waiters: VecDeque::new(),
        };
        tokio::spawn(scheduler.run(rx, shutdown));
        SchedulerHandle {
            tx,
            queue_wait: config.queue_wait_timeout,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SchedulerCmd>, shutdown: CancellationToken) {
        let mut events = self.registry.events().subscribe();
        info!("scheduler task started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,

                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => return,
                },

                event = events.recv() => match event {
                    Ok(RegistryEvent::WorkerConnected { .. })
                    | Ok(RegistryEvent::JobUnbound { .. }) => self.retry_waiters().await,
                    Ok(_) => {}
                    // Lagging only means missed wake-ups; retry to be safe.
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        self.retry_waiters().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                },
            }
        }
    }

    async fn handle(&mut self, cmd: SchedulerCmd) {
        match cmd {
            SchedulerCmd::Reserve {
                job_id,
                spec,
                exclude,
                reply,
            } => {
                let result = self.reserve(&job_id, &spec, &exclude).await;
                self.send_or_rollback(&job_id, reply, result).await;
            }
            SchedulerCmd::ReserveQueued {
                job_id,
                spec,
                exclude,
                reply,
            } => {
                // One more attempt before parking: capacity may have freed
                // between the caller's first try and this command.
                match self.reserve(&job_id, &spec, &exclude).await {
                    Err(ScheduleError::GpuSessionsExhausted) => {
                        debug!(%job_id, "parking queue-policy waiter");
                        self.waiters.push_back(Waiter {
                            job_id,
                            spec,
                            exclude,
                            reply,
                        });
                    }
                    other => {
                        let _ = reply.send(other);
                    }
                }
            }
            SchedulerCmd::CancelWait { job_id } => {
                self.waiters.retain(|w| w.job_id != job_id);
            }
            SchedulerCmd::Release { job_id, terminal } => {
                if let Some(reservation) = self.reservations.remove(&job_id) {
                    self.registry
                        .unbind_job(
                            &reservation.worker_id,
                            &job_id,
                            reservation.gpu_index,
                            terminal,
                        )
                        .await;
                    self.metrics.jobs_active.fetch_sub(1, Ordering::Relaxed);
                }
                // JobUnbound re-enters through the event stream and wakes
                // waiters there.
            }
        }
    }

    /// FIFO retry: only the head waiter is tried; if it still cannot be
    /// placed it stays at the head, preserving queue order.
    async fn retry_waiters(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.reply.is_closed() {
                continue;
            }
            match self.reserve(&waiter.job_id, &waiter.spec, &waiter.exclude).await {
                Err(ScheduleError::GpuSessionsExhausted) => {
                    self.waiters.push_front(waiter);
                    return;
                }
                result => {
                    self.send_or_rollback(&waiter.job_id, waiter.reply, result).await;
                }
            }
        }
    }

    /// Deliver a reservation result; if the requester already gave up
    /// (queue timeout, cancelled session) the reservation rolls straight
    /// back so nothing leaks.
    async fn send_or_rollback(
        &mut self,
        job_id: &str,
        reply: oneshot::Sender<Result<Reservation, ScheduleError>>,
        result: Result<Reservation, ScheduleError>,
    ) {
        if let Err(returned) = reply.send(result)
            && returned.is_ok()
            && let Some(reservation) = self.reservations.remove(job_id)
        {
            debug!(%job_id, "requester vanished, rolling back its reservation");
            self.registry
                .unbind_job(
                    &reservation.worker_id,
                    job_id,
                    reservation.gpu_index,
                    JobState::Pending,
                )
                .await;
            self.metrics.jobs_active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// One reservation attempt, including the `fallback` policy rewrite.
    async fn reserve(
        &mut self,
        job_id: &str,
        spec: &JobSpec,
        exclude: &[String],
    ) -> Result<Reservation, ScheduleError> {
        let started = tokio::time::Instant::now();
        self.metrics.schedule_attempts.fetch_add(1, Ordering::Relaxed);

        let mut result = self.try_reserve(job_id, spec, exclude, true).await;
        if matches!(result, Err(ScheduleError::GpuSessionsExhausted))
            && spec.gpu_exhausted_policy == GpuExhaustedPolicy::Fallback
        {
            debug!(%job_id, "GPU sessions exhausted, falling back to software");
            result = self.try_reserve(job_id, spec, exclude, false).await;
        }

        match &result {
            Ok(reservation) => {
                self.metrics.last_schedule_latency_us.store(
                    started.elapsed().as_micros() as u64,
                    Ordering::Relaxed,
                );
                self.metrics.jobs_active.fetch_add(1, Ordering::Relaxed);
                info!(
                    %job_id,
                    worker_id = %reservation.worker_id,
                    gpu = ?reservation.gpu_index,
                    hardware = reservation.hardware,
                    "job bound"
                );
            }
            Err(err) => {
                self.metrics.schedule_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%job_id, %err, "reservation failed");
            }
        }
        result
    }

    async fn try_reserve(
        &mut self,
        job_id: &str,
        spec: &JobSpec,
        exclude: &[String],
        allow_hardware: bool,
    ) -> Result<Reservation, ScheduleError> {
        struct Choice {
            worker_id: String,
            gpu_index: Option<u32>,
            hardware: bool,
            score: (u32, u32, u64),
        }

        let mut best: Option<Choice> = None;
        let mut any_capable = false;
        let mut sessions_exhausted = false;

        for entry in self.registry.iter_entries() {
            if exclude.contains(&entry.id) {
                continue;
            }
            let record = entry.record.read().await;
            if record.state != WorkerState::Connected {
                continue;
            }
            if !worker_capable(&record.capabilities, spec, allow_hardware) {
                continue;
            }
            any_capable = true;

            // Hard disqualifier: total cap. A zero cap never schedules.
            if record.active_jobs >= record.capabilities.max_concurrent_jobs {
                continue;
            }

            let hardware =
                allow_hardware && spec.wants_hardware() && has_hw_video_path(&record.capabilities, spec);
            let gpu_index = if hardware && needs_cuda_session(spec) {
                let unlimited = record.capabilities.max_concurrent_jobs;
                match record
                    .gpus
                    .iter()
                    .filter(|g| g.has_headroom(unlimited))
                    .min_by_key(|g| g.effective_encode())
                {
                    Some(gpu) => Some(gpu.info.index),
                    None => {
                        sessions_exhausted = true;
                        continue;
                    }
                }
            } else {
                None
            };

            let pressure = record
                .system
                .as_ref()
                .map(|s| s.cpu_percent as u32)
                .unwrap_or(0);
            let score = (record.active_jobs, pressure, stable_hash(&entry.id));
            if best.as_ref().is_none_or(|b| score < b.score) {
                best = Some(Choice {
                    worker_id: entry.id.clone(),
                    gpu_index,
                    hardware,
                    score,
                });
            }
        }

        let Some(choice) = best else {
            if sessions_exhausted {
                return Err(ScheduleError::GpuSessionsExhausted);
            }
            if any_capable {
                return Err(ScheduleError::CapacityExhausted);
            }
            return Err(ScheduleError::NoCapableWorker);
        };

        if !self
            .registry
            .bind_job(&choice.worker_id, job_id, choice.gpu_index)
            .await
        {
            warn!(%job_id, worker_id = %choice.worker_id, "chosen worker vanished during bind");
            return Err(ScheduleError::CapacityExhausted);
        }
        let reservation = Reservation {
            worker_id: choice.worker_id,
            gpu_index: choice.gpu_index,
            hardware: choice.hardware,
        };
        self.reservations
            .insert(job_id.to_string(), reservation.clone());
        Ok(reservation)
    }
}

/// Capability filter: decoders for the source pair always, encoders for
/// each non-copy target, and (outside fallback rewrites) the preferred
/// accelerator when one is named.
fn worker_capable(caps: &Capabilities, spec: &JobSpec, allow_hardware: bool) -> bool {
    if caps.max_concurrent_jobs == 0 {
        return false;
    }
    if !caps
        .video_decoders
        .iter()
        .any(|d| decoder_handles(d, &spec.source_video_codec))
    {
        return false;
    }
    if !caps
        .audio_decoders
        .iter()
        .any(|d| decoder_handles(d, &spec.source_audio_codec))
    {
        return false;
    }
    if !spec.video_passthrough()
        && !caps
            .video_encoders
            .iter()
            .any(|e| encoder_produces(e, &spec.target_video_codec))
    {
        return false;
    }
    if !spec.audio_passthrough()
        && !caps
            .audio_encoders
            .iter()
            .any(|e| encoder_produces(e, &spec.target_audio_codec))
    {
        return false;
    }
    if allow_hardware
        && spec.gpu_exhausted_policy != GpuExhaustedPolicy::Fallback
        && let Some(kind) = spec.preferred_hw_accel.filter(|k| k.is_hardware())
        && !caps.accel(kind).is_some_and(|a| a.available)
    {
        return false;
    }
    true
}

/// The worker offers a hardware encoder for the target video codec.
fn has_hw_video_path(caps: &Capabilities, spec: &JobSpec) -> bool {
    if spec.video_passthrough() {
        return false;
    }
    caps.available_accels().any(|accel| {
        accel
            .encoders
            .iter()
            .any(|e| is_hardware(e) && encoder_produces(e, &spec.target_video_codec))
    })
}

/// Only CUDA paths are governed by per-GPU session counters.
fn needs_cuda_session(spec: &JobSpec) -> bool {
    matches!(spec.preferred_hw_accel, Some(HwAccelKind::Cuda))
}

/// Stable tie-breaker so equal-scored candidates do not thrash.
fn stable_hash(id: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}
