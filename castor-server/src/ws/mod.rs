//! Daemon-facing websocket endpoint.
//!
//! One connection actor per daemon. The first frame must be `Register`
//! (auth token and protocol gate, bounded by the registration timeout);
//! after that the actor applies heartbeats in arrival order, answers them
//! with any queued commands, and demultiplexes per-job transcode frames to
//! their session channels.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use castor_contracts::wire;
use castor_contracts::{
    Command, CoordinatorFrame, DaemonFrame, HeartbeatResponse, PROTOCOL_VERSION, RegisterFailure,
    RegisterRequest, RegisterResponse, TranscodeMessage, UnregisterResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::CoordinatorInner;
use crate::registry::WorkerLink;

const COORDINATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn daemon_ws(
    State(inner): State<Arc<CoordinatorInner>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_daemon_socket(socket, inner, addr))
}

fn encode(frame: &CoordinatorFrame) -> Option<Message> {
    match wire::encode_frame(frame) {
        Ok(json) => Some(Message::Text(Utf8Bytes::from(json))),
        Err(err) => {
            warn!(%err, "failed to encode coordinator frame");
            None
        }
    }
}

fn decode(message: &Message) -> Option<DaemonFrame> {
    let result = match message {
        Message::Text(text) => wire::decode_frame(text.as_str()),
        Message::Binary(bytes) => wire::decode_frame_bytes(bytes),
        _ => return None,
    };
    match result {
        Ok(frame) => Some(frame),
        Err(err) => {
            debug!(%err, "dropping undecodable daemon frame");
            None
        }
    }
}

async fn handle_daemon_socket(socket: WebSocket, inner: Arc<CoordinatorInner>, addr: SocketAddr) {
    let (mut sink, mut stream) = socket.split();

    // Registration gate: first frame, bounded.
    let request = match tokio::time::timeout(inner.config.registration_timeout, stream.next()).await
    {
        Ok(Some(Ok(message))) => match decode(&message) {
            Some(DaemonFrame::Register(request)) => request,
            _ => {
                debug!(%addr, "first frame was not a registration, closing");
                return;
            }
        },
        _ => {
            debug!(%addr, "socket closed before registration");
            return;
        }
    };

    if let Some(failure) = vet_registration(&inner, &request) {
        warn!(%addr, daemon_id = %request.daemon_id, ?failure, "registration refused");
        let refusal = CoordinatorFrame::Registered(RegisterResponse {
            success: false,
            coordinator_version: COORDINATOR_VERSION.into(),
            heartbeat_interval_ms: inner.config.heartbeat_interval.as_millis() as u64,
            error: Some(failure),
        });
        if let Some(message) = encode(&refusal) {
            let _ = sink.send(message).await;
        }
        let _ = sink.close().await;
        return;
    }

    let worker_id = request.daemon_id.clone();
    let (frames_tx, frames_rx) = mpsc::channel::<CoordinatorFrame>(256);
    let (commands_tx, mut commands_rx) = mpsc::channel::<Command>(32);
    let closed = CancellationToken::new();

    inner
        .registry
        .register(
            worker_id.clone(),
            request.daemon_name.clone(),
            request.version.clone(),
            addr.to_string(),
            request.capabilities.clone(),
            WorkerLink {
                frames: frames_tx.clone(),
                commands: commands_tx,
                closed: closed.clone(),
            },
        )
        .await;

    let accepted = CoordinatorFrame::Registered(RegisterResponse {
        success: true,
        coordinator_version: COORDINATOR_VERSION.into(),
        heartbeat_interval_ms: inner.config.heartbeat_interval.as_millis() as u64,
        error: None,
    });
    if frames_tx.send(accepted).await.is_err() {
        inner.registry.connection_lost(&worker_id).await;
        return;
    }

    let writer = tokio::spawn(write_frames(sink, frames_rx));

    let mut unregistered = false;
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,

            message = stream.next() => {
                let Some(Ok(message)) = message else { break };
                let Some(frame) = decode(&message) else { continue };
                match frame {
                    DaemonFrame::Register(_) => {
                        debug!(%worker_id, "duplicate register on live connection ignored");
                    }
                    DaemonFrame::Heartbeat(request) => {
                        match inner.registry.heartbeat(&worker_id, &request).await {
                            Ok(()) => {
                                let mut commands = Vec::new();
                                while let Ok(command) = commands_rx.try_recv() {
                                    commands.push(command);
                                }
                                let reply = CoordinatorFrame::HeartbeatAck(HeartbeatResponse {
                                    success: true,
                                    commands,
                                });
                                if frames_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(%worker_id, %err, "heartbeat rejected");
                                let reply = CoordinatorFrame::HeartbeatAck(HeartbeatResponse {
                                    success: false,
                                    commands: Vec::new(),
                                });
                                if frames_tx.send(reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    DaemonFrame::Transcode { job_id, message } => {
                        route_transcode(&inner, &worker_id, job_id, message).await;
                    }
                    DaemonFrame::Unregister(request) => {
                        info!(%worker_id, reason = %request.reason, "worker unregistered");
                        let _ = frames_tx
                            .send(CoordinatorFrame::Unregistered(UnregisterResponse {
                                success: true,
                            }))
                            .await;
                        unregistered = true;
                        break;
                    }
                }
            }
        }
    }

    if !unregistered {
        debug!(%worker_id, "daemon socket closed");
    }
    inner.registry.connection_lost(&worker_id).await;
    // Give the writer a moment to flush, then stop it.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    writer.abort();
}

/// Forward a per-job frame to its session, or clean up strays: a success
/// `Ack` for a job the coordinator no longer tracks means the worker is
/// running something nobody wants.
async fn route_transcode(
    inner: &Arc<CoordinatorInner>,
    worker_id: &str,
    job_id: String,
    message: TranscodeMessage,
) {
    let needs_cancel = matches!(message_kind(&message), StrayKind::NeedsCancel);
    if let Some(stream_tx) = inner.streams.get(&job_id).map(|e| e.value().clone())
        && stream_tx.send(message).await.is_ok()
    {
        return;
    }
    if needs_cancel {
        debug!(%worker_id, %job_id, "stray frame for unknown job, cancelling it on the worker");
        let _ = inner
            .registry
            .send_command(worker_id, Command::CancelJob { job_id })
            .await;
    }
}

enum StrayKind {
    NeedsCancel,
    Ignorable,
}

fn message_kind(message: &TranscodeMessage) -> StrayKind {
    match message {
        TranscodeMessage::Ack { success: true, .. }
        | TranscodeMessage::Samples { .. }
        | TranscodeMessage::Stats { .. } => StrayKind::NeedsCancel,
        _ => StrayKind::Ignorable,
    }
}

fn vet_registration(
    inner: &Arc<CoordinatorInner>,
    request: &RegisterRequest,
) -> Option<RegisterFailure> {
    if let Some(expected) = &inner.config.auth_token
        && request.auth_token.as_deref() != Some(expected.as_str())
    {
        return Some(RegisterFailure::Unauthorized(
            "invalid or missing auth token".into(),
        ));
    }
    if request.protocol != PROTOCOL_VERSION {
        return Some(RegisterFailure::VersionIncompatible(format!(
            "daemon speaks protocol {} but the coordinator requires {}",
            request.protocol, PROTOCOL_VERSION
        )));
    }
    if request.daemon_id.trim().is_empty() {
        return Some(RegisterFailure::Unauthorized("empty daemon id".into()));
    }
    None
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames_rx: mpsc::Receiver<CoordinatorFrame>,
) {
    while let Some(frame) = frames_rx.recv().await {
        let Some(message) = encode(&frame) else { continue };
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
