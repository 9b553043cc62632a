//! The daemon's single connection to the coordinator.
//!
//! One websocket carries everything: the registration exchange, the
//! heartbeat loop with piggybacked commands, and every per-job transcode
//! stream, demultiplexed by job id. On transport loss all live jobs fail
//! locally as recoverable, their slots release, and the runtime reconnects
//! with jittered exponential backoff, re-registering under the same daemon
//! id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use castor_config::DaemonConfig;
use castor_contracts::wire::{self, WireError};
use castor_contracts::{
    Capabilities, Command, ConcurrencyUpdate, CoordinatorFrame, DaemonFrame, EsSampleBatch,
    HeartbeatRequest, JobSpec, JobStatus, PROTOCOL_VERSION, RegisterFailure, RegisterRequest,
    RegisterResponse, TranscodeErrorCode, TranscodeMessage, TranscodeError, UnregisterRequest,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::AdmissionController;
use crate::stats::SystemSampler;
use crate::supervisor::{Shutdown, Supervisor, SupervisorHandle};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
/// Daemon build version reported at registration.
const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("registration rejected: {0:?}")]
    Rejected(RegisterFailure),
    #[error("registration timed out")]
    RegistrationTimeout,
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
    #[error("connection closed by coordinator")]
    Closed,
}

impl RuntimeError {
    /// Fatal errors stop the daemon instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug)]
enum SessionEnd {
    /// Local shutdown requested.
    Shutdown,
    /// Drain finished and the coordinator confirmed the unregister.
    Drained,
    /// Transport lost; reconnect.
    Lost { registered: bool },
}

/// Per-job bookkeeping in the session loop. Jobs start `Pending` while
/// admission runs (possibly queued); sample batches buffer in the channel
/// meanwhile.
enum JobEntry {
    Pending {
        samples_tx: mpsc::Sender<EsSampleBatch>,
        deferred_shutdown: Option<Shutdown>,
    },
    Live(SupervisorHandle),
}

enum RuntimeEvent {
    JobStarted {
        job_id: String,
        handle: SupervisorHandle,
    },
    JobRejected {
        job_id: String,
    },
}

enum Flow {
    Continue,
    Drained,
}

pub struct WorkerRuntime {
    config: Arc<DaemonConfig>,
    daemon_id: String,
    capabilities: Capabilities,
    admission: Arc<AdmissionController>,
    sampler: SystemSampler,
    jobs: HashMap<String, JobEntry>,
    hb_seq: u64,
    draining: bool,
}

impl std::fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("daemon_id", &self.daemon_id)
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(config: Arc<DaemonConfig>, capabilities: Capabilities) -> Self {
        let daemon_id = config
            .daemon_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let admission = Arc::new(AdmissionController::new(
            capabilities.clone(),
            config.queue_wait_timeout,
        ));
        Self {
            config,
            daemon_id,
            capabilities,
            admission,
            sampler: SystemSampler::new(),
            jobs: HashMap::new(),
            hb_seq: 0,
            draining: false,
        }
    }

    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    /// Connection loop: serve a session, then reconnect with backoff until
    /// shutdown or a fatal registration failure.
    pub async fn run(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            match self.session(&shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Drained) => {
                    info!("drain complete, daemon exiting");
                    return Ok(());
                }
                Ok(SessionEnd::Lost { registered }) => {
                    if registered {
                        attempt = 0;
                    }
                }
                Err(err) if err.is_fatal() => {
                    return Err(anyhow::anyhow!("coordinator refused this daemon: {err}"));
                }
                Err(err) => warn!(%err, "coordinator session failed"),
            }
            attempt += 1;
            let delay = reconnect_delay(
                self.config.reconnect_base,
                self.config.reconnect_max,
                attempt,
            );
            info!(attempt, ?delay, "reconnecting to coordinator");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    async fn session(&mut self, shutdown: &CancellationToken) -> Result<SessionEnd, RuntimeError> {
        let (ws, _) = connect_async(self.config.coordinator_url.as_str()).await?;
        let (sink, mut stream) = ws.split();

        // Dedicated writer task; everything sends through this channel.
        let (frame_tx, frame_rx) = mpsc::channel::<DaemonFrame>(256);
        let writer = tokio::spawn(write_frames(sink, frame_rx));

        let register = DaemonFrame::Register(RegisterRequest {
            daemon_id: self.daemon_id.clone(),
            daemon_name: self.config.daemon_name.clone(),
            version: DAEMON_VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
            auth_token: self.config.auth_token.clone(),
            capabilities: self.capabilities.clone(),
        });
        if frame_tx.send(register).await.is_err() {
            writer.abort();
            return Err(RuntimeError::Closed);
        }

        let response = match tokio::time::timeout(
            REGISTRATION_TIMEOUT,
            wait_registered(&mut stream),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                writer.abort();
                return Err(RuntimeError::RegistrationTimeout);
            }
        };
        if let Some(failure) = registration_failure(&response) {
            writer.abort();
            return Err(RuntimeError::Rejected(failure));
        }

        let hb_interval = Duration::from_millis(response.heartbeat_interval_ms.max(250));
        info!(
            daemon_id = %self.daemon_id,
            coordinator_version = %response.coordinator_version,
            ?hb_interval,
            "registered with coordinator"
        );
        self.hb_seq = 0;

        let (events_tx, mut events_rx) = mpsc::channel::<RuntimeEvent>(64);
        let mut heartbeat = tokio::time::interval(hb_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown_jobs(Shutdown::Cancel {
                        reason: "daemon shutting down".into(),
                    });
                    let _ = frame_tx
                        .send(DaemonFrame::Unregister(UnregisterRequest {
                            daemon_id: self.daemon_id.clone(),
                            reason: "daemon shutting down".into(),
                        }))
                        .await;
                    break SessionEnd::Shutdown;
                }

                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        match self.handle_message(message, &frame_tx, &events_tx).await {
                            Ok(Flow::Continue) => {}
                            Ok(Flow::Drained) => break SessionEnd::Drained,
                            Err(err) => {
                                warn!(%err, "dropping undecodable frame");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "websocket read failed");
                        self.on_transport_lost();
                        break SessionEnd::Lost { registered: true };
                    }
                    None => {
                        self.on_transport_lost();
                        break SessionEnd::Lost { registered: true };
                    }
                },

                Some(event) = events_rx.recv() => self.handle_event(event),

                _ = heartbeat.tick() => {
                    if !self.send_heartbeat(&frame_tx).await {
                        self.on_transport_lost();
                        break SessionEnd::Lost { registered: true };
                    }
                    if self.draining && self.config.drain_exit && self.jobs.is_empty() {
                        let _ = frame_tx
                            .send(DaemonFrame::Unregister(UnregisterRequest {
                                daemon_id: self.daemon_id.clone(),
                                reason: "drain complete".into(),
                            }))
                            .await;
                    }
                }
            }
        };

        // Give the writer a moment to flush any farewell frames.
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.abort();
        Ok(end)
    }

    async fn handle_message(
        &mut self,
        message: Message,
        frame_tx: &mpsc::Sender<DaemonFrame>,
        events_tx: &mpsc::Sender<RuntimeEvent>,
    ) -> Result<Flow, WireError> {
        let frame: CoordinatorFrame = match message {
            Message::Text(text) => wire::decode_frame(text.as_str())?,
            Message::Binary(bytes) => wire::decode_frame_bytes(&bytes)?,
            Message::Close(_) => return Ok(Flow::Continue),
            _ => return Ok(Flow::Continue),
        };

        match frame {
            CoordinatorFrame::Registered(_) => {}
            CoordinatorFrame::Unregistered(_) => {
                if self.draining {
                    return Ok(Flow::Drained);
                }
            }
            CoordinatorFrame::HeartbeatAck(ack) => {
                for command in ack.commands {
                    self.handle_command(command).await;
                }
            }
            CoordinatorFrame::Transcode { job_id, message } => {
                self.handle_transcode(job_id, message, frame_tx, events_tx)
                    .await;
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Drain => {
                info!("drain requested by coordinator");
                self.draining = true;
                self.admission.set_draining(true);
            }
            Command::CancelJob { job_id } => match self.jobs.get_mut(&job_id) {
                Some(JobEntry::Live(handle)) => handle.shutdown(Shutdown::Cancel {
                    reason: "cancelled by coordinator".into(),
                }),
                Some(JobEntry::Pending {
                    deferred_shutdown, ..
                }) => {
                    *deferred_shutdown = Some(Shutdown::Cancel {
                        reason: "cancelled by coordinator".into(),
                    });
                }
                None => debug!(%job_id, "cancel for unknown job"),
            },
            Command::UpdateConfig { payload } => {
                match serde_json::from_slice::<ConcurrencyUpdate>(&payload) {
                    Ok(update) => self.admission.update_caps(&update).await,
                    Err(err) => warn!(%err, "undecodable UPDATE_CONFIG payload"),
                }
            }
        }
    }

    async fn handle_transcode(
        &mut self,
        job_id: String,
        message: TranscodeMessage,
        frame_tx: &mpsc::Sender<DaemonFrame>,
        events_tx: &mpsc::Sender<RuntimeEvent>,
    ) {
        match message {
            TranscodeMessage::Start { spec } => {
                self.start_job(job_id, spec, frame_tx, events_tx);
            }
            TranscodeMessage::Samples { batch } => {
                let Some(entry) = self.jobs.get(&job_id) else {
                    debug!(%job_id, "samples for unknown job");
                    return;
                };
                let samples_tx = match entry {
                    JobEntry::Pending { samples_tx, .. } => samples_tx,
                    JobEntry::Live(handle) => &handle.samples,
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = samples_tx.try_send(batch) {
                    // The pump is hopelessly behind; treat as a stall.
                    if let JobEntry::Live(handle) = entry {
                        handle.shutdown(Shutdown::Fail {
                            error: TranscodeError::recoverable(
                                TranscodeErrorCode::InputStalled,
                                "sample backlog overflowed on the worker",
                            ),
                        });
                    }
                }
            }
            TranscodeMessage::Stop { reason } => match self.jobs.get_mut(&job_id) {
                Some(JobEntry::Live(handle)) => {
                    debug!(%job_id, %reason, "stream stop from coordinator");
                    handle.shutdown(Shutdown::Drain);
                }
                Some(JobEntry::Pending {
                    deferred_shutdown, ..
                }) => {
                    *deferred_shutdown = Some(Shutdown::Cancel { reason });
                }
                None => {}
            },
            // Worker-originated message kinds arriving here are protocol
            // misuse; ignore them.
            TranscodeMessage::Ack { .. }
            | TranscodeMessage::Stats { .. }
            | TranscodeMessage::Error { .. } => {
                debug!(%job_id, "ignoring coordinator-sent worker message");
            }
        }
    }

    fn start_job(
        &mut self,
        job_id: String,
        spec: JobSpec,
        frame_tx: &mpsc::Sender<DaemonFrame>,
        events_tx: &mpsc::Sender<RuntimeEvent>,
    ) {
        if self.jobs.contains_key(&job_id) {
            warn!(%job_id, "duplicate start ignored");
            return;
        }
        let (samples_tx, samples_rx) = mpsc::channel(256);
        self.jobs.insert(
            job_id.clone(),
            JobEntry::Pending {
                samples_tx: samples_tx.clone(),
                deferred_shutdown: None,
            },
        );

        // Admission may park on the queue policy; never block the read loop.
        let admission = self.admission.clone();
        let config = self.config.clone();
        let frame_tx = frame_tx.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            match admission.admit(&spec).await {
                Ok(granted) => {
                    let handle = Supervisor::spawn_with_samples(
                        job_id.clone(),
                        spec,
                        granted,
                        config,
                        frame_tx,
                        samples_tx,
                        samples_rx,
                    );
                    let _ = events_tx
                        .send(RuntimeEvent::JobStarted { job_id, handle })
                        .await;
                }
                Err(err) => {
                    info!(%job_id, %err, "admission rejected job");
                    let _ = frame_tx
                        .send(DaemonFrame::Transcode {
                            job_id: job_id.clone(),
                            message: TranscodeMessage::Ack {
                                success: false,
                                actual_encoder: None,
                                actual_hw_accel: None,
                                error: Some(err.to_transcode_error()),
                            },
                        })
                        .await;
                    let _ = events_tx.send(RuntimeEvent::JobRejected { job_id }).await;
                }
            }
        });
    }

    fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::JobStarted { job_id, handle } => {
                let deferred = match self.jobs.remove(&job_id) {
                    Some(JobEntry::Pending {
                        deferred_shutdown, ..
                    }) => deferred_shutdown,
                    _ => None,
                };
                if let Some(signal) = deferred {
                    handle.shutdown(signal);
                }
                self.jobs.insert(job_id, JobEntry::Live(handle));
            }
            RuntimeEvent::JobRejected { job_id } => {
                self.jobs.remove(&job_id);
            }
        }
    }

    /// Build and send one heartbeat; prune jobs that reported terminal.
    async fn send_heartbeat(&mut self, frame_tx: &mpsc::Sender<DaemonFrame>) -> bool {
        self.hb_seq += 1;
        let mut statuses = Vec::new();
        for (job_id, entry) in &self.jobs {
            if let JobEntry::Live(handle) = entry {
                statuses.push(JobStatus {
                    job_id: job_id.clone(),
                    session_id: handle.session_id.clone(),
                    channel_name: handle.channel_name.clone(),
                    state: *handle.state.borrow(),
                    running_time_ms: handle.started.elapsed().as_millis() as u64,
                    stats: Some(handle.stats.borrow().clone()),
                });
            }
        }
        self.jobs.retain(|_, entry| match entry {
            JobEntry::Live(handle) => !handle.is_terminal(),
            JobEntry::Pending { .. } => true,
        });

        let request = HeartbeatRequest {
            daemon_id: self.daemon_id.clone(),
            seq: self.hb_seq,
            system: Some(self.sampler.sample()),
            jobs: statuses,
            gpus: self.admission.gpu_utilization(),
            draining: self.draining,
        };
        frame_tx
            .send(DaemonFrame::Heartbeat(request))
            .await
            .is_ok()
    }

    fn shutdown_jobs(&mut self, signal: Shutdown) {
        for entry in self.jobs.values() {
            if let JobEntry::Live(handle) = entry {
                handle.shutdown(signal.clone());
            }
        }
        self.jobs.clear();
    }

    /// Transport loss: every live job fails locally as recoverable and its
    /// slots release; the coordinator fails its side independently.
    fn on_transport_lost(&mut self) {
        warn!(jobs = self.jobs.len(), "connection to coordinator lost");
        self.shutdown_jobs(Shutdown::Fail {
            error: TranscodeError::recoverable(
                TranscodeErrorCode::Internal,
                "coordinator connection lost",
            ),
        });
    }
}

async fn write_frames(mut sink: WsSink, mut frame_rx: mpsc::Receiver<DaemonFrame>) {
    while let Some(frame) = frame_rx.recv().await {
        let text = match wire::encode_frame(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(%err, "failed to encode frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn wait_registered(stream: &mut WsStream) -> Result<RegisterResponse, RuntimeError> {
    while let Some(message) = stream.next().await {
        let frame: CoordinatorFrame = match message? {
            Message::Text(text) => wire::decode_frame(text.as_str())?,
            Message::Binary(bytes) => wire::decode_frame_bytes(&bytes)?,
            Message::Close(_) => return Err(RuntimeError::Closed),
            _ => continue,
        };
        if let CoordinatorFrame::Registered(response) = frame {
            return Ok(response);
        }
    }
    Err(RuntimeError::Closed)
}

fn registration_failure(response: &RegisterResponse) -> Option<RegisterFailure> {
    if response.success {
        return None;
    }
    Some(response.error.clone().unwrap_or_else(|| {
        RegisterFailure::Unauthorized("registration refused without a reason".into())
    }))
}

/// Exponential backoff from `base` doubling to `max`, with ±20 % jitter.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    use rand::Rng as _;
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(max);
    let jitter = rand::rng().random_range(0.8..=1.2);
    capped.mul_f64(jitter).min(max.mul_f64(1.2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_with_jitter_bounds() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        for attempt in 1..10 {
            let delay = reconnect_delay(base, max, attempt);
            let nominal = base
                .saturating_mul(1u32 << (attempt - 1).min(16))
                .min(max)
                .as_secs_f64();
            assert!(delay.as_secs_f64() >= nominal * 0.8 - 1e-9, "attempt {attempt}");
            assert!(delay.as_secs_f64() <= nominal * 1.2 + 1e-9, "attempt {attempt}");
        }
    }

    #[test]
    fn registration_failure_defaults_to_unauthorized() {
        let response = RegisterResponse {
            success: false,
            coordinator_version: "x".into(),
            heartbeat_interval_ms: 5000,
            error: None,
        };
        assert!(matches!(
            registration_failure(&response),
            Some(RegisterFailure::Unauthorized(_))
        ));
        let ok = RegisterResponse {
            success: true,
            ..response
        };
        assert!(registration_failure(&ok).is_none());
    }
}
