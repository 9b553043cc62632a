//! Per-job transcode session: owns the logical stream to the bound worker
//! and the bounded queues facing the caller.
//!
//! One task per job drives the whole lifecycle: bind (with the Ack retry
//! loop), sample pumping in both directions, stats relay, and exactly one
//! terminal status event whatever path ends the job.

pub mod buffer;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use castor_config::CoordinatorConfig;
use castor_contracts::{
    Command, CoordinatorFrame, EsSampleBatch, JobSpec, JobState, TranscodeError,
    TranscodeErrorCode, TranscodeMessage, TranscodeStats,
};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::JobTable;
use crate::metrics::Metrics;
use crate::registry::{Registry, WorkerLink};
use crate::scheduler::{ScheduleError, SchedulerHandle};
use buffer::{OutboundBuffer, PushOutcome};

/// How long a cancelled session waits for the worker's confirming `Stop`.
const CANCEL_CONFIRM_GRACE: Duration = Duration::from_secs(5);

/// Status updates surfaced to the caller.
#[derive(Debug, Clone)]
pub enum JobEvent {
    State {
        state: JobState,
        error: Option<TranscodeError>,
    },
    Stats(TranscodeStats),
}

/// Caller-facing handle returned by `submit_job`.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: String,
    /// Source batches toward the worker; blocks when the session is full.
    pub inbound: mpsc::Sender<EsSampleBatch>,
    /// Transcoded batches back from the worker.
    pub outbound: mpsc::Receiver<EsSampleBatch>,
    /// State transitions, stats, and the terminal error if any.
    pub status: mpsc::Receiver<JobEvent>,
}

pub(crate) struct SessionContext {
    pub job_id: String,
    pub spec: JobSpec,
    pub config: Arc<CoordinatorConfig>,
    pub registry: Registry,
    pub scheduler: SchedulerHandle,
    pub jobs: JobTable,
    pub streams: Arc<DashMap<String, mpsc::Sender<TranscodeMessage>>>,
    pub metrics: Arc<Metrics>,
    pub cancel: CancellationToken,
    pub inbound_rx: mpsc::Receiver<EsSampleBatch>,
    pub outbound_tx: mpsc::Sender<EsSampleBatch>,
    pub status_tx: mpsc::Sender<JobEvent>,
}

enum PumpOutcome {
    Completed,
    Cancelled,
    Failed(TranscodeError),
}

pub(crate) async fn run(mut ctx: SessionContext) {
    let bound = bind(&mut ctx).await;
    let (reservation_terminal, outcome) = match bound {
        Ok((link, stream_rx)) => {
            let outcome = pump(&mut ctx, &link, stream_rx).await;
            (true, outcome)
        }
        Err(BindEnd::Cancelled) => (false, PumpOutcome::Cancelled),
        Err(BindEnd::Failed(error)) => (false, PumpOutcome::Failed(error)),
    };

    ctx.streams.remove(&ctx.job_id);
    let (state, error) = match outcome {
        PumpOutcome::Completed => {
            ctx.metrics.jobs_completed.fetch_add(1, Ordering::Relaxed);
            (JobState::Completed, None)
        }
        PumpOutcome::Cancelled => {
            ctx.metrics.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
            (JobState::Cancelled, None)
        }
        PumpOutcome::Failed(error) => {
            ctx.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
            (JobState::Failed, Some(error))
        }
    };
    if reservation_terminal {
        ctx.scheduler.release(&ctx.job_id, state).await;
    }
    set_state(&ctx, state, error).await;
    info!(job_id = %ctx.job_id, state = state.as_str(), "session finished");
}

/// Exactly-once terminal emission is guaranteed by this being the only
/// place that writes states: the session task is single-threaded and
/// `run` emits the terminal state last.
async fn set_state(ctx: &SessionContext, state: JobState, error: Option<TranscodeError>) {
    ctx.jobs.update(&ctx.job_id, |record| {
        record.state = state;
        if record.error.is_none() {
            record.error = error.clone();
        }
    });
    let _ = ctx.status_tx.send(JobEvent::State { state, error }).await;
}

enum BindEnd {
    Cancelled,
    /// Failed; any reservation was already rolled back.
    Failed(TranscodeError),
}

fn map_schedule_error(err: ScheduleError) -> TranscodeError {
    match err {
        ScheduleError::NoCapableWorker => {
            TranscodeError::fatal(TranscodeErrorCode::CodecUnsupported, err.to_string())
        }
        ScheduleError::GpuSessionsExhausted => {
            TranscodeError::recoverable(TranscodeErrorCode::SessionLimitReached, err.to_string())
        }
        ScheduleError::CapacityExhausted | ScheduleError::Rejected(_) => {
            TranscodeError::recoverable(TranscodeErrorCode::Internal, err.to_string())
        }
    }
}

async fn bind(
    ctx: &mut SessionContext,
) -> Result<(WorkerLink, mpsc::Receiver<TranscodeMessage>), BindEnd> {
    let mut exclude: Vec<String> = Vec::new();
    let mut attempts_left = ctx.config.retry_budget + 1;

    loop {
        if ctx.cancel.is_cancelled() {
            return Err(BindEnd::Cancelled);
        }

        let reservation = match ctx
            .scheduler
            .reserve(&ctx.job_id, &ctx.spec, exclude.clone())
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => return Err(BindEnd::Failed(map_schedule_error(err))),
        };
        let worker_id = reservation.worker_id.clone();
        ctx.jobs.update(&ctx.job_id, |record| {
            record.state = JobState::Assigned;
            record.worker_id = Some(worker_id.clone());
        });
        let _ = ctx
            .status_tx
            .send(JobEvent::State {
                state: JobState::Assigned,
                error: None,
            })
            .await;

        let (stream_tx, mut stream_rx) = mpsc::channel(128);
        ctx.streams.insert(ctx.job_id.clone(), stream_tx);

        let mut attempt_failed = |ctx: &SessionContext| {
            ctx.streams.remove(&ctx.job_id);
            exclude.push(reservation.worker_id.clone());
        };

        let Some(link) = ctx.registry.link(&reservation.worker_id).await else {
            attempt_failed(ctx);
            ctx.scheduler.release(&ctx.job_id, JobState::Pending).await;
            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(BindEnd::Failed(TranscodeError::recoverable(
                    TranscodeErrorCode::Internal,
                    "bound worker had no live connection",
                )));
            }
            continue;
        };

        let start = CoordinatorFrame::Transcode {
            job_id: ctx.job_id.clone(),
            message: TranscodeMessage::Start {
                spec: ctx.spec.clone(),
            },
        };
        if link.frames.send(start).await.is_err() {
            attempt_failed(ctx);
            ctx.scheduler.release(&ctx.job_id, JobState::Pending).await;
            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(BindEnd::Failed(TranscodeError::recoverable(
                    TranscodeErrorCode::Internal,
                    "worker connection closed before start",
                )));
            }
            continue;
        }

        let ack = tokio::time::timeout(ctx.config.session.ack_timeout, async {
            tokio::select! {
                ack = async {
                    while let Some(message) = stream_rx.recv().await {
                        if matches!(message, TranscodeMessage::Ack { .. }) {
                            return Some(message);
                        }
                    }
                    None
                } => ack,
                _ = link.closed.cancelled() => None,
            }
        })
        .await;

        match ack {
            Ok(Some(TranscodeMessage::Ack {
                success: true,
                actual_encoder,
                actual_hw_accel,
                ..
            })) => {
                ctx.jobs.update(&ctx.job_id, |record| {
                    record.state = JobState::Starting;
                    record.actual_encoder = actual_encoder.clone();
                    record.actual_hw_accel = actual_hw_accel;
                });
                let _ = ctx
                    .status_tx
                    .send(JobEvent::State {
                        state: JobState::Starting,
                        error: None,
                    })
                    .await;
                return Ok((link, stream_rx));
            }
            Ok(Some(TranscodeMessage::Ack { error, .. })) => {
                let error = error.unwrap_or_else(|| {
                    TranscodeError::recoverable(
                        TranscodeErrorCode::Internal,
                        "worker refused the job without a reason",
                    )
                });
                warn!(
                    job_id = %ctx.job_id,
                    worker_id = %reservation.worker_id,
                    code = ?error.code,
                    "worker rejected start: {}",
                    error.message
                );
                attempt_failed(ctx);
                ctx.scheduler.release(&ctx.job_id, JobState::Pending).await;
                if !error.recoverable {
                    return Err(BindEnd::Failed(error));
                }
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(BindEnd::Failed(error));
                }
            }
            Ok(None) | Ok(Some(_)) | Err(_) => {
                debug!(
                    job_id = %ctx.job_id,
                    worker_id = %reservation.worker_id,
                    "no ack before the deadline"
                );
                attempt_failed(ctx);
                ctx.scheduler.release(&ctx.job_id, JobState::Pending).await;
                attempts_left -= 1;
                if attempts_left == 0 {
                    return Err(BindEnd::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::Internal,
                        "worker did not acknowledge the job in time",
                    )));
                }
            }
        }
    }
}

async fn pump(
    ctx: &mut SessionContext,
    link: &WorkerLink,
    mut stream_rx: mpsc::Receiver<TranscodeMessage>,
) -> PumpOutcome {
    let mut buffer = OutboundBuffer::new(ctx.config.session.outbound_capacity);
    let mut inbound_open = true;
    let mut outbound_open = true;
    let mut cancel_sent = false;
    let mut cancel_deadline: Option<Instant> = None;
    let mut running = false;

    loop {
        tokio::select! {
            _ = link.closed.cancelled() => {
                return if cancel_sent {
                    PumpOutcome::Cancelled
                } else {
                    PumpOutcome::Failed(worker_lost())
                };
            }

            _ = ctx.cancel.cancelled(), if !cancel_sent => {
                let reason = ctx
                    .jobs
                    .cancel_reason(&ctx.job_id)
                    .unwrap_or_else(|| "cancelled".into());
                let _ = link
                    .commands
                    .send(Command::CancelJob { job_id: ctx.job_id.clone() })
                    .await;
                let _ = link
                    .frames
                    .send(CoordinatorFrame::Transcode {
                        job_id: ctx.job_id.clone(),
                        message: TranscodeMessage::Stop { reason },
                    })
                    .await;
                cancel_sent = true;
                cancel_deadline = Some(Instant::now() + CANCEL_CONFIRM_GRACE);
            }

            _ = async { tokio::time::sleep_until(cancel_deadline.unwrap_or_else(Instant::now)).await },
                if cancel_deadline.is_some() =>
            {
                return PumpOutcome::Cancelled;
            }

            batch = ctx.inbound_rx.recv(), if inbound_open && !cancel_sent => match batch {
                Some(batch) => {
                    let frame = CoordinatorFrame::Transcode {
                        job_id: ctx.job_id.clone(),
                        message: TranscodeMessage::Samples { batch },
                    };
                    match tokio::time::timeout(
                        ctx.config.session.sample_write_timeout,
                        link.frames.send(frame),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            return PumpOutcome::Failed(worker_lost());
                        }
                        Err(_) => {
                            return PumpOutcome::Failed(TranscodeError::recoverable(
                                TranscodeErrorCode::InputStalled,
                                "timed out forwarding samples to the worker",
                            ));
                        }
                    }
                }
                None => {
                    // Caller closed the source; ask the worker to flush.
                    inbound_open = false;
                    let _ = link
                        .frames
                        .send(CoordinatorFrame::Transcode {
                            job_id: ctx.job_id.clone(),
                            message: TranscodeMessage::Stop {
                                reason: "end of input".into(),
                            },
                        })
                        .await;
                }
            },

            message = stream_rx.recv() => match message {
                Some(TranscodeMessage::Samples { batch }) => {
                    if batch.is_source {
                        continue;
                    }
                    match buffer.push(batch) {
                        PushOutcome::Overflow => {
                            let _ = link
                                .commands
                                .send(Command::CancelJob { job_id: ctx.job_id.clone() })
                                .await;
                            return PumpOutcome::Failed(TranscodeError::recoverable(
                                TranscodeErrorCode::OutputStalled,
                                "caller consumed no output before the first keyframe",
                            ));
                        }
                        PushOutcome::StoredWithDrops(drops) if drops.any() => {
                            ctx.metrics
                                .sample_batches_dropped
                                .fetch_add(drops.batches, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
                Some(TranscodeMessage::Stats { mut stats }) => {
                    stats.batches_dropped = buffer.total_drops.batches;
                    ctx.jobs.update(&ctx.job_id, |record| {
                        record.stats = stats.clone();
                    });
                    let _ = ctx.status_tx.send(JobEvent::Stats(stats)).await;
                }
                Some(TranscodeMessage::Error { error }) => {
                    return PumpOutcome::Failed(error);
                }
                Some(TranscodeMessage::Stop { reason }) => {
                    debug!(job_id = %ctx.job_id, %reason, "worker closed the stream");
                    return if cancel_sent {
                        PumpOutcome::Cancelled
                    } else {
                        PumpOutcome::Completed
                    };
                }
                Some(_) => {}
                None => {
                    return if cancel_sent {
                        PumpOutcome::Cancelled
                    } else {
                        PumpOutcome::Failed(worker_lost())
                    };
                }
            },

            permit = ctx.outbound_tx.reserve(), if outbound_open && !buffer.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(batch) = buffer.pop() {
                            if !running {
                                running = true;
                                ctx.jobs.update(&ctx.job_id, |record| {
                                    record.state = JobState::Running;
                                });
                                let _ = ctx
                                    .status_tx
                                    .send(JobEvent::State {
                                        state: JobState::Running,
                                        error: None,
                                    })
                                    .await;
                            }
                            permit.send(batch);
                        }
                    }
                    Err(_) => {
                        // Caller dropped the outbound side; stop forwarding
                        // and let the drop ladder absorb the rest.
                        outbound_open = false;
                        ctx.jobs.cancel(&ctx.job_id, "output receiver dropped");
                    }
                }
            },
        }
    }
}

fn worker_lost() -> TranscodeError {
    TranscodeError::recoverable(
        TranscodeErrorCode::Internal,
        "worker connection lost mid-job",
    )
}
