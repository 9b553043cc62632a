//! Per-job encoder process supervision.
//!
//! One supervisor task per admitted job. It owns the encoder child process
//! and its three pipes: source samples are framed onto stdin in DTS order,
//! transcoded samples are parsed off stdout into batches, and stderr feeds
//! progress stats plus the fatal-pattern classifier. Full passthrough jobs
//! (`copy`/`copy`) never spawn a process; samples transit untouched.
//!
//! The slot tuple acquired at admission is held by the supervisor and
//! returned when the task finishes, whatever the outcome.

pub mod batch;
pub mod command;
pub mod diagnose;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use castor_config::DaemonConfig;
use castor_contracts::espipe::{EsPipeCodec, EsPipeFrame, MediaKind};
use castor_contracts::{
    DaemonFrame, EsSampleBatch, JobSpec, JobState, TranscodeError, TranscodeErrorCode,
    TranscodeMessage, TranscodeStats,
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::admission::Admission;
use crate::stats::ProcessMeter;
use batch::BatchAssembler;
use diagnose::Progress;

/// External requests to wind a job down.
#[derive(Debug, Clone)]
pub enum Shutdown {
    /// End of input: close stdin, let the encoder flush, finish `completed`.
    Drain,
    /// Hard cancel: SIGTERM, grace, SIGKILL; finish `cancelled`.
    Cancel { reason: String },
    /// Terminate and record the given failure (e.g. transport loss).
    Fail { error: TranscodeError },
}

/// Handle held by the runtime for one supervised job.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    pub job_id: String,
    pub channel_name: Option<String>,
    pub session_id: Option<String>,
    pub samples: mpsc::Sender<EsSampleBatch>,
    pub state: watch::Receiver<JobState>,
    pub stats: watch::Receiver<TranscodeStats>,
    pub started: Instant,
    shutdown_tx: mpsc::Sender<Shutdown>,
}

impl SupervisorHandle {
    /// Request a shutdown. Idempotent: the first request wins, later ones
    /// are ignored once the task is gone.
    pub fn shutdown(&self, signal: Shutdown) {
        let _ = self.shutdown_tx.try_send(signal);
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }
}

struct Ctx {
    job_id: String,
    spec: JobSpec,
    admission: Admission,
    config: Arc<DaemonConfig>,
    out: mpsc::Sender<DaemonFrame>,
    samples_rx: mpsc::Receiver<EsSampleBatch>,
    shutdown_rx: mpsc::Receiver<Shutdown>,
    state_tx: watch::Sender<JobState>,
    stats_tx: watch::Sender<TranscodeStats>,
    started: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    samples_in: u64,
    samples_out: u64,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Debug)]
enum Outcome {
    Completed,
    Cancelled { reason: String },
    Failed(TranscodeError),
}

/// Shared view of the stderr pump.
#[derive(Debug, Default)]
struct StderrState {
    tail: VecDeque<String>,
    progress: Progress,
    fatal: Option<TranscodeError>,
}

const STDERR_TAIL_LINES: usize = 24;

#[derive(Debug)]
pub struct Supervisor;

impl Supervisor {
    pub fn spawn(
        job_id: String,
        spec: JobSpec,
        admission: Admission,
        config: Arc<DaemonConfig>,
        out: mpsc::Sender<DaemonFrame>,
    ) -> SupervisorHandle {
        let (samples_tx, samples_rx) = mpsc::channel(256);
        Self::spawn_inner(job_id, spec, admission, config, out, samples_tx, samples_rx, None)
    }

    /// Variant taking an existing samples channel, so the runtime can buffer
    /// batches that arrive while admission is still pending.
    pub fn spawn_with_samples(
        job_id: String,
        spec: JobSpec,
        admission: Admission,
        config: Arc<DaemonConfig>,
        out: mpsc::Sender<DaemonFrame>,
        samples_tx: mpsc::Sender<EsSampleBatch>,
        samples_rx: mpsc::Receiver<EsSampleBatch>,
    ) -> SupervisorHandle {
        Self::spawn_inner(job_id, spec, admission, config, out, samples_tx, samples_rx, None)
    }

    /// Test hook: run the encoder path against an arbitrary command.
    #[cfg(test)]
    pub(crate) fn spawn_with_command(
        job_id: String,
        spec: JobSpec,
        admission: Admission,
        config: Arc<DaemonConfig>,
        out: mpsc::Sender<DaemonFrame>,
        cmd: Command,
    ) -> SupervisorHandle {
        let (samples_tx, samples_rx) = mpsc::channel(256);
        Self::spawn_inner(job_id, spec, admission, config, out, samples_tx, samples_rx, Some(cmd))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_inner(
        job_id: String,
        spec: JobSpec,
        admission: Admission,
        config: Arc<DaemonConfig>,
        out: mpsc::Sender<DaemonFrame>,
        samples_tx: mpsc::Sender<EsSampleBatch>,
        samples_rx: mpsc::Receiver<EsSampleBatch>,
        cmd_override: Option<Command>,
    ) -> SupervisorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(JobState::Starting);
        let (stats_tx, stats_rx) = watch::channel(TranscodeStats::default());
        let started = Instant::now();

        let handle = SupervisorHandle {
            job_id: job_id.clone(),
            channel_name: spec.channel_name.clone(),
            session_id: spec.session_id.clone(),
            samples: samples_tx,
            state: state_rx,
            stats: stats_rx,
            started,
            shutdown_tx,
        };

        let ctx = Ctx {
            job_id,
            spec,
            admission,
            config,
            out,
            samples_rx,
            shutdown_rx,
            state_tx,
            stats_tx,
            started,
        };
        tokio::spawn(run(ctx, cmd_override));

        handle
    }
}

async fn run(mut ctx: Ctx, cmd_override: Option<Command>) {
    let outcome = if ctx.spec.is_passthrough() {
        run_passthrough(&mut ctx).await
    } else {
        let cmd = cmd_override.unwrap_or_else(|| {
            command::build(&ctx.config.encoder_path, &ctx.spec, &ctx.admission)
        });
        run_encoder(&mut ctx, cmd).await
    };

    let final_stats = ctx.stats_tx.borrow().clone();
    match &outcome {
        Outcome::Completed => {
            send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Stats { stats: final_stats }).await;
            send_msg(
                &ctx.out,
                &ctx.job_id,
                TranscodeMessage::Stop {
                    reason: "completed".into(),
                },
            )
            .await;
            let _ = ctx.state_tx.send(JobState::Completed);
            info!(job_id = %ctx.job_id, "job completed");
        }
        Outcome::Cancelled { reason } => {
            send_msg(
                &ctx.out,
                &ctx.job_id,
                TranscodeMessage::Stop {
                    reason: format!("cancelled: {reason}"),
                },
            )
            .await;
            let _ = ctx.state_tx.send(JobState::Cancelled);
            info!(job_id = %ctx.job_id, %reason, "job cancelled");
        }
        Outcome::Failed(error) => {
            send_msg(
                &ctx.out,
                &ctx.job_id,
                TranscodeMessage::Error {
                    error: error.clone(),
                },
            )
            .await;
            let _ = ctx.state_tx.send(JobState::Failed);
            warn!(
                job_id = %ctx.job_id,
                code = ?error.code,
                recoverable = error.recoverable,
                "job failed: {}",
                error.message
            );
        }
    }
    // Admission ticket drops with ctx, returning the slot tuple.
}

async fn send_msg(out: &mpsc::Sender<DaemonFrame>, job_id: &str, message: TranscodeMessage) -> bool {
    out.send(DaemonFrame::Transcode {
        job_id: job_id.to_string(),
        message,
    })
    .await
    .is_ok()
}

fn connection_lost() -> TranscodeError {
    TranscodeError::recoverable(
        TranscodeErrorCode::Internal,
        "coordinator connection lost mid-job",
    )
}

async fn send_ack_success(ctx: &Ctx) -> bool {
    send_msg(
        &ctx.out,
        &ctx.job_id,
        TranscodeMessage::Ack {
            success: true,
            actual_encoder: ctx.admission.video_encoder.clone(),
            actual_hw_accel: ctx.admission.hw_accel,
            error: None,
        },
    )
    .await
}

/// Interleave a batch's video and audio samples by DTS, video first on
/// ties, as the encoder expects its input multiplexed.
fn merge_by_dts(batch: &EsSampleBatch) -> Vec<EsPipeFrame> {
    let mut frames = Vec::with_capacity(batch.sample_count());
    let (mut vi, mut ai) = (0, 0);
    while vi < batch.video.len() || ai < batch.audio.len() {
        let take_video = match (batch.video.get(vi), batch.audio.get(ai)) {
            (Some(v), Some(a)) => v.dts <= a.dts,
            (Some(_), None) => true,
            _ => false,
        };
        if take_video {
            frames.push(EsPipeFrame::from_sample(MediaKind::Video, &batch.video[vi]));
            vi += 1;
        } else {
            frames.push(EsPipeFrame::from_sample(MediaKind::Audio, &batch.audio[ai]));
            ai += 1;
        }
    }
    frames
}

fn build_stats(
    ctx: &Ctx,
    counters: Counters,
    meter: &mut Option<ProcessMeter>,
    progress: Progress,
    pid: Option<u32>,
) -> TranscodeStats {
    let (cpu_percent, resident_mb) = meter.as_mut().map_or((0.0, 0), ProcessMeter::sample);
    TranscodeStats {
        samples_in: counters.samples_in,
        samples_out: counters.samples_out,
        bytes_in: counters.bytes_in,
        bytes_out: counters.bytes_out,
        speed: progress.speed.unwrap_or(0.0),
        cpu_percent,
        resident_mb,
        encoder_pid: pid,
        running_time_ms: ctx.started.elapsed().as_millis() as u64,
        actual_hw_accel: ctx.admission.hw_accel,
        actual_device: ctx
            .admission
            .hw_device
            .clone()
            .or_else(|| ctx.admission.gpu_index.map(|i| format!("cuda:{i}"))),
        batches_dropped: 0,
    }
}

/// Mutable passthrough pump state shared between the live arm and the
/// drain flush.
struct PassthroughState {
    counters: Counters,
    out_seq: u64,
    running: bool,
}

/// Retag one source batch and forward it. Returns false on a lost
/// connection.
async fn forward_passthrough(ctx: &Ctx, state: &mut PassthroughState, batch: EsSampleBatch) -> bool {
    if batch.is_empty() {
        return true;
    }
    state.counters.samples_in += batch.sample_count() as u64;
    state.counters.samples_out = state.counters.samples_in;
    state.counters.bytes_in += batch.byte_len() as u64;
    state.counters.bytes_out = state.counters.bytes_in;

    let mut forwarded = batch;
    forwarded.is_source = false;
    forwarded.batch_sequence = state.out_seq;
    state.out_seq += 1;

    if !state.running {
        state.running = true;
        let _ = ctx.state_tx.send(JobState::Running);
    }
    send_msg(
        &ctx.out,
        &ctx.job_id,
        TranscodeMessage::Samples { batch: forwarded },
    )
    .await
}

async fn run_passthrough(ctx: &mut Ctx) -> Outcome {
    if !send_ack_success(ctx).await {
        return Outcome::Failed(connection_lost());
    }

    let mut state = PassthroughState {
        counters: Counters::default(),
        out_seq: 0,
        running: false,
    };
    let mut last_input = Instant::now();
    let mut tick = tokio::time::interval(ctx.config.stats_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            Some(signal) = ctx.shutdown_rx.recv() => match signal {
                Shutdown::Drain => {
                    // Flush anything still queued before finishing.
                    while let Ok(batch) = ctx.samples_rx.try_recv() {
                        if batch.is_source && !forward_passthrough(ctx, &mut state, batch).await {
                            return Outcome::Failed(connection_lost());
                        }
                    }
                    return Outcome::Completed;
                }
                Shutdown::Cancel { reason } => return Outcome::Cancelled { reason },
                Shutdown::Fail { error } => return Outcome::Failed(error),
            },
            batch = ctx.samples_rx.recv() => match batch {
                Some(batch) if batch.is_source => {
                    last_input = Instant::now();
                    if !forward_passthrough(ctx, &mut state, batch).await {
                        return Outcome::Failed(connection_lost());
                    }
                }
                Some(_) => {}
                None => return Outcome::Completed,
            },
            _ = tick.tick() => {
                if last_input.elapsed() >= ctx.config.input_stall_timeout {
                    return Outcome::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::InputStalled,
                        "no source samples within the stall window",
                    ));
                }
                // Passthrough keeps up with its input by construction.
                let progress = Progress {
                    speed: Some(1.0),
                    ..Default::default()
                };
                let stats = build_stats(ctx, state.counters, &mut None, progress, None);
                let _ = ctx.stats_tx.send(stats.clone());
                if !send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Stats { stats }).await {
                    return Outcome::Failed(connection_lost());
                }
            },
        }
    }
}

async fn run_encoder(ctx: &mut Ctx, mut cmd: Command) -> Outcome {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            let error = TranscodeError::recoverable(
                TranscodeErrorCode::Internal,
                format!("failed to spawn encoder: {err}"),
            );
            send_msg(
                &ctx.out,
                &ctx.job_id,
                TranscodeMessage::Ack {
                    success: false,
                    actual_encoder: None,
                    actual_hw_accel: None,
                    error: Some(error.clone()),
                },
            )
            .await;
            return Outcome::Failed(error);
        }
    };
    let pid = child.id();
    debug!(job_id = %ctx.job_id, ?pid, encoder = ?ctx.admission.video_encoder, "encoder spawned");

    if !send_ack_success(ctx).await {
        terminate_child(&mut child, ctx.config.term_grace).await;
        return Outcome::Failed(connection_lost());
    }

    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        terminate_child(&mut child, ctx.config.term_grace).await;
        return Outcome::Failed(TranscodeError::fatal(
            TranscodeErrorCode::Internal,
            "encoder pipes were not attached",
        ));
    };

    let mut writer = Some(FramedWrite::new(stdin, EsPipeCodec));

    // Parameter sets / audio config precede the first sample.
    for (kind, init) in [
        (MediaKind::Video, &ctx.spec.video_init_data),
        (MediaKind::Audio, &ctx.spec.audio_init_data),
    ] {
        if init.is_empty() {
            continue;
        }
        let frame = EsPipeFrame::config(kind, init.clone());
        if let Some(w) = writer.as_mut()
            && w.send(frame).await.is_err()
        {
            terminate_child(&mut child, ctx.config.term_grace).await;
            return Outcome::Failed(TranscodeError::recoverable(
                TranscodeErrorCode::FfmpegCrashed,
                "encoder rejected init data",
            ));
        }
    }

    // Stdout pump: decode frames off the pipe into a bounded channel.
    let (frame_tx, mut frame_rx) = mpsc::channel(256);
    let stdout_task = tokio::spawn(async move {
        let mut reader = FramedRead::new(stdout, EsPipeCodec);
        while let Some(item) = reader.next().await {
            let failed = item.is_err();
            if frame_tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    // Stderr pump: progress, diagnostics tail, fatal classification.
    let stderr_state = Arc::new(StdMutex::new(StderrState::default()));
    let stderr_task = {
        let state = stderr_state.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut st = state.lock().expect("stderr state poisoned");
                if st.tail.len() == STDERR_TAIL_LINES {
                    st.tail.pop_front();
                }
                st.tail.push_back(line.clone());
                if let Some(progress) = diagnose::parse_progress(&line) {
                    st.progress = progress;
                }
                if st.fatal.is_none()
                    && let Some(fatal) = diagnose::classify_fatal(&line)
                {
                    st.fatal = Some(fatal);
                }
            }
        })
    };

    let outcome =
        encoder_loop(ctx, &mut child, &mut writer, &mut frame_rx, &stderr_state, pid).await;
    stdout_task.abort();
    stderr_task.abort();
    outcome
}

async fn encoder_loop(
    ctx: &mut Ctx,
    child: &mut Child,
    writer: &mut Option<FramedWrite<ChildStdin, EsPipeCodec>>,
    frame_rx: &mut mpsc::Receiver<Result<EsPipeFrame, castor_contracts::espipe::EsPipeError>>,
    stderr_state: &Arc<StdMutex<StderrState>>,
    pid: Option<u32>,
) -> Outcome {
    let mut assembler = BatchAssembler::new(
        Duration::from_millis(ctx.config.sample_batch_window_ms),
        ctx.config.sample_batch_bytes,
    );
    let mut meter = pid.map(ProcessMeter::new);
    let mut counters = Counters::default();
    let mut last_input = Instant::now();
    let mut last_output = Instant::now();
    let mut input_seen = false;
    let mut input_closed = false;
    let mut stdout_done = false;
    let mut running = false;

    let mut tick = tokio::time::interval(ctx.config.stats_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let window = assembler.deadline();
        tokio::select! {
            Some(signal) = ctx.shutdown_rx.recv() => match signal {
                Shutdown::Drain => {
                    // Write out anything still queued, then half-close so
                    // the encoder flushes and exits on its own.
                    'flush: while let Ok(batch) = ctx.samples_rx.try_recv() {
                        if !batch.is_source {
                            continue;
                        }
                        for frame in merge_by_dts(&batch) {
                            counters.samples_in += 1;
                            counters.bytes_in += frame.payload.len() as u64;
                            let Some(w) = writer.as_mut() else { break 'flush };
                            match tokio::time::timeout(
                                ctx.config.input_stall_timeout,
                                w.send(frame),
                            )
                            .await
                            {
                                Ok(Ok(())) => {}
                                _ => break 'flush,
                            }
                        }
                    }
                    input_closed = true;
                    drop(writer.take());
                }
                Shutdown::Cancel { reason } => {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Cancelled { reason };
                }
                Shutdown::Fail { error } => {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(error);
                }
            },

            batch = ctx.samples_rx.recv(), if !input_closed => match batch {
                Some(batch) if batch.is_source => {
                    for frame in merge_by_dts(&batch) {
                        counters.samples_in += 1;
                        counters.bytes_in += frame.payload.len() as u64;
                        let Some(w) = writer.as_mut() else { break };
                        match tokio::time::timeout(ctx.config.input_stall_timeout, w.send(frame)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                terminate_child(child, ctx.config.term_grace).await;
                                return Outcome::Failed(TranscodeError::recoverable(
                                    TranscodeErrorCode::FfmpegCrashed,
                                    format!("encoder stopped accepting input: {err}"),
                                ));
                            }
                            Err(_) => {
                                terminate_child(child, ctx.config.term_grace).await;
                                return Outcome::Failed(TranscodeError::recoverable(
                                    TranscodeErrorCode::InputStalled,
                                    "timed out writing samples to the encoder",
                                ));
                            }
                        }
                    }
                    last_input = Instant::now();
                    input_seen = true;
                }
                Some(_) => {}
                None => {
                    // Runtime dropped the job entry; finish like a drain.
                    input_closed = true;
                    drop(writer.take());
                }
            },

            frame = frame_rx.recv(), if !stdout_done => match frame {
                Some(Ok(frame)) => {
                    if !frame.is_config {
                        last_output = Instant::now();
                        counters.samples_out += 1;
                        counters.bytes_out += frame.payload.len() as u64;
                        if !running {
                            running = true;
                            let _ = ctx.state_tx.send(JobState::Running);
                        }
                        if let Some(batch) = assembler.push(frame)
                            && !send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Samples { batch }).await
                        {
                            terminate_child(child, ctx.config.term_grace).await;
                            return Outcome::Failed(connection_lost());
                        }
                    }
                }
                Some(Err(err)) => {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::Internal,
                        format!("corrupt es-pipe stream from encoder: {err}"),
                    ));
                }
                None => {
                    stdout_done = true;
                    if let Some(batch) = assembler.flush()
                        && !send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Samples { batch }).await
                    {
                        return Outcome::Failed(connection_lost());
                    }
                }
            },

            status = child.wait() => {
                // Drain whatever the stdout pump still holds.
                let drain = async {
                    while let Some(item) = frame_rx.recv().await {
                        if let Ok(frame) = item
                            && !frame.is_config
                        {
                            counters.samples_out += 1;
                            counters.bytes_out += frame.payload.len() as u64;
                            if let Some(batch) = assembler.push(frame) {
                                send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Samples { batch }).await;
                            }
                        }
                    }
                };
                let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
                if let Some(batch) = assembler.flush() {
                    send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Samples { batch }).await;
                }

                let status = match status {
                    Ok(status) => status,
                    Err(err) => {
                        return Outcome::Failed(TranscodeError::recoverable(
                            TranscodeErrorCode::Internal,
                            format!("failed to reap encoder: {err}"),
                        ));
                    }
                };
                let st = stderr_state.lock().expect("stderr state poisoned");
                if status.success() {
                    if input_closed {
                        return Outcome::Completed;
                    }
                    return Outcome::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::FfmpegCrashed,
                        "encoder exited before end of input",
                    ));
                }
                if let Some(fatal) = st.fatal.clone() {
                    return Outcome::Failed(fatal);
                }
                let tail: Vec<&str> = st.tail.iter().map(String::as_str).collect();
                return Outcome::Failed(diagnose::classify_exit(status.code(), &tail.join("\n")));
            },

            _ = tick.tick() => {
                let fatal = stderr_state.lock().expect("stderr state poisoned").fatal.clone();
                if let Some(fatal) = fatal {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(fatal);
                }
                if !input_closed && last_input.elapsed() >= ctx.config.input_stall_timeout {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::InputStalled,
                        "no source samples within the stall window",
                    ));
                }
                if input_seen && !stdout_done && last_output.elapsed() >= ctx.config.output_stall_timeout {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(TranscodeError::recoverable(
                        TranscodeErrorCode::OutputStalled,
                        "encoder produced no output within the stall window",
                    ));
                }
                let progress = stderr_state.lock().expect("stderr state poisoned").progress;
                let stats = build_stats(ctx, counters, &mut meter, progress, pid);
                let _ = ctx.stats_tx.send(stats.clone());
                if !send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Stats { stats }).await {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(connection_lost());
                }
            },

            _ = async { tokio::time::sleep_until(window.unwrap_or_else(Instant::now)).await }, if window.is_some() => {
                if let Some(batch) = assembler.flush()
                    && !send_msg(&ctx.out, &ctx.job_id, TranscodeMessage::Samples { batch }).await
                {
                    terminate_child(child, ctx.config.term_grace).await;
                    return Outcome::Failed(connection_lost());
                }
            },
        }
    }
}

/// SIGTERM, bounded grace, then SIGKILL. Never leaks the child.
async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a child we own by pid.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_contracts::{Capabilities, EsSample};
    use std::process::Stdio;

    use crate::admission::AdmissionController;

    fn passthrough_spec() -> JobSpec {
        JobSpec {
            source_video_codec: "h264".into(),
            source_audio_codec: "aac".into(),
            target_video_codec: "copy".into(),
            target_audio_codec: "copy".into(),
            ..Default::default()
        }
    }

    fn encode_spec() -> JobSpec {
        JobSpec {
            source_video_codec: "h264".into(),
            source_audio_codec: "aac".into(),
            target_video_codec: "h264".into(),
            target_audio_codec: "aac".into(),
            ..Default::default()
        }
    }

    fn software_caps() -> Capabilities {
        Capabilities {
            video_encoders: vec!["libx264".into()],
            video_decoders: vec!["h264".into()],
            audio_encoders: vec!["aac".into()],
            audio_decoders: vec!["aac".into()],
            max_concurrent_jobs: 4,
            max_cpu_jobs: 4,
            max_gpu_jobs: 0,
            max_probe_jobs: 4,
            ..Default::default()
        }
    }

    fn test_config() -> Arc<DaemonConfig> {
        Arc::new(DaemonConfig {
            input_stall_timeout: Duration::from_secs(10),
            output_stall_timeout: Duration::from_secs(10),
            stats_interval: Duration::from_millis(100),
            term_grace: Duration::from_millis(500),
            sample_batch_window_ms: 50,
            ..Default::default()
        })
    }

    fn sample(seq: u64, key: bool) -> EsSample {
        EsSample {
            pts: seq as i64 * 3000,
            dts: seq as i64 * 3000,
            payload: vec![seq as u8; 32],
            is_keyframe: key,
            sequence: seq,
        }
    }

    async fn admit(spec: &JobSpec) -> Admission {
        AdmissionController::new(software_caps(), Duration::from_secs(1))
            .admit(spec)
            .await
            .unwrap()
    }

    async fn next_transcode(rx: &mut mpsc::Receiver<DaemonFrame>) -> TranscodeMessage {
        match rx.recv().await.expect("frame") {
            DaemonFrame::Transcode { message, .. } => message,
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn passthrough_round_trips_samples_byte_identically() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let spec = passthrough_spec();
        let admission = admit(&spec).await;
        let handle = Supervisor::spawn(
            "job-pt".into(),
            spec,
            admission,
            test_config(),
            out_tx,
        );

        match next_transcode(&mut out_rx).await {
            TranscodeMessage::Ack { success: true, actual_encoder: None, .. } => {}
            other => panic!("expected success ack, got {other:?}"),
        }

        let mut batch = EsSampleBatch::source(0);
        batch.video.push(sample(0, true));
        batch.audio.push(sample(0, false));
        handle.samples.send(batch.clone()).await.unwrap();

        let forwarded = loop {
            match next_transcode(&mut out_rx).await {
                TranscodeMessage::Samples { batch } => break batch,
                TranscodeMessage::Stats { .. } => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        };
        assert!(!forwarded.is_source);
        assert_eq!(forwarded.video, batch.video);
        assert_eq!(forwarded.audio, batch.audio);

        handle.shutdown(Shutdown::Drain);
        loop {
            match next_transcode(&mut out_rx).await {
                TranscodeMessage::Stop { reason } => {
                    assert_eq!(reason, "completed");
                    break;
                }
                TranscodeMessage::Stats { .. } | TranscodeMessage::Samples { .. } => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }

        let mut state = handle.state.clone();
        state
            .wait_for(|s| *s == JobState::Completed)
            .await
            .unwrap();
    }

    // `cat` echoes es-pipe frames verbatim, standing in for an encoder
    // whose output equals its input.
    fn cat_command() -> Command {
        let mut cmd = Command::new("cat");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    #[tokio::test]
    async fn encoder_path_pumps_samples_and_completes_on_drain() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let spec = encode_spec();
        let admission = admit(&spec).await;
        let handle = Supervisor::spawn_with_command(
            "job-cat".into(),
            spec,
            admission,
            test_config(),
            out_tx,
            cat_command(),
        );

        match next_transcode(&mut out_rx).await {
            TranscodeMessage::Ack { success: true, actual_encoder: Some(enc), .. } => {
                assert_eq!(enc, "libx264");
            }
            other => panic!("expected success ack, got {other:?}"),
        }

        let mut batch = EsSampleBatch::source(0);
        batch.video.push(sample(0, true));
        batch.video.push(sample(1, false));
        handle.samples.send(batch.clone()).await.unwrap();

        let echoed = loop {
            match next_transcode(&mut out_rx).await {
                TranscodeMessage::Samples { batch } => break batch,
                TranscodeMessage::Stats { .. } => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        };
        assert_eq!(echoed.video[0].payload, batch.video[0].payload);
        assert!(echoed.video[0].is_keyframe);

        let mut state = handle.state.clone();
        state.wait_for(|s| *s == JobState::Running).await.unwrap();

        handle.shutdown(Shutdown::Drain);
        loop {
            match next_transcode(&mut out_rx).await {
                TranscodeMessage::Stop { reason } => {
                    assert_eq!(reason, "completed");
                    break;
                }
                _ => continue,
            }
        }
        let mut state = handle.state.clone();
        state
            .wait_for(|s| *s == JobState::Completed)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancel_terminates_the_encoder() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let spec = encode_spec();
        let admission = admit(&spec).await;
        let handle = Supervisor::spawn_with_command(
            "job-cancel".into(),
            spec,
            admission,
            test_config(),
            out_tx,
            cat_command(),
        );

        match next_transcode(&mut out_rx).await {
            TranscodeMessage::Ack { success: true, .. } => {}
            other => panic!("expected ack, got {other:?}"),
        }

        handle.shutdown(Shutdown::Cancel {
            reason: "caller cancelled".into(),
        });
        loop {
            match next_transcode(&mut out_rx).await {
                TranscodeMessage::Stop { reason } => {
                    assert!(reason.starts_with("cancelled"));
                    break;
                }
                _ => continue,
            }
        }
        let mut state = handle.state.clone();
        state
            .wait_for(|s| *s == JobState::Cancelled)
            .await
            .unwrap();
    }

    #[test]
    fn dts_merge_interleaves_media_kinds() {
        let mut batch = EsSampleBatch::source(0);
        batch.video.push(EsSample {
            pts: 0,
            dts: 0,
            payload: vec![1],
            is_keyframe: true,
            sequence: 0,
        });
        batch.video.push(EsSample {
            pts: 6000,
            dts: 6000,
            payload: vec![2],
            is_keyframe: false,
            sequence: 1,
        });
        batch.audio.push(EsSample {
            pts: 3000,
            dts: 3000,
            payload: vec![3],
            is_keyframe: false,
            sequence: 0,
        });

        let merged = merge_by_dts(&batch);
        let dts: Vec<i64> = merged.iter().map(|f| f.dts).collect();
        assert_eq!(dts, vec![0, 3000, 6000]);
        assert_eq!(merged[0].kind, MediaKind::Video);
        assert_eq!(merged[1].kind, MediaKind::Audio);
    }
}
