use serde::{Deserialize, Serialize};

use crate::capabilities::{Capabilities, HwAccelKind};
use crate::job::{JobSpec, JobState, TranscodeError, TranscodeStats};
use crate::sample::EsSampleBatch;
use crate::wire::base64_bytes;

/// First frame a daemon sends after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub daemon_id: String,
    pub daemon_name: String,
    /// Daemon build version, informational.
    pub version: String,
    /// Protocol revision; mismatch is `VersionIncompatible`.
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub capabilities: Capabilities,
}

/// Why a registration was refused. Both kinds are terminal for the
/// connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RegisterFailure {
    Unauthorized(String),
    VersionIncompatible(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub coordinator_version: String,
    /// Interval the daemon must heartbeat at, declared by the coordinator.
    pub heartbeat_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RegisterFailure>,
}

/// Host-level stats sampled on the daemon each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub load_avg: f32,
}

/// Per-GPU session occupancy as the daemon sees it. This is the
/// authoritative value; the scheduler overlays its own reservations on top.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuUtilization {
    pub index: u32,
    pub active_encode_sessions: u32,
    pub active_decode_sessions: u32,
}

/// Summary of one live job carried in a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    pub state: JobState,
    pub running_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TranscodeStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub daemon_id: String,
    /// Monotonic per-connection counter; the registry rejects out-of-order
    /// arrivals.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemStats>,
    #[serde(default)]
    pub jobs: Vec<JobStatus>,
    #[serde(default)]
    pub gpus: Vec<GpuUtilization>,
    /// Set once the daemon is draining: finishing jobs, refusing new ones.
    #[serde(default)]
    pub draining: bool,
}

/// Coordinator instructions piggybacked on heartbeat replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Drain,
    CancelJob {
        job_id: String,
    },
    UpdateConfig {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
}

/// Decoded `UPDATE_CONFIG` payload: runtime adjustments to a daemon's
/// concurrency caps. Absent fields are left untouched. Lowering a cap never
/// revokes slots already in use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_jobs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_jobs: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_probe_jobs: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub daemon_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterResponse {
    pub success: bool,
}

/// Messages on the per-job transcode stream. `Start` is coordinator->worker
/// first, `Ack` is worker->coordinator first; after a successful ack either
/// side sends `Samples`/`Stats`; `Stop` is always the final message from
/// either side, and the worker may instead end with `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscodeMessage {
    Start {
        spec: JobSpec,
    },
    Ack {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual_encoder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actual_hw_accel: Option<HwAccelKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<TranscodeError>,
    },
    Samples {
        batch: EsSampleBatch,
    },
    Stats {
        stats: TranscodeStats,
    },
    Error {
        error: TranscodeError,
    },
    Stop {
        reason: String,
    },
}

/// Everything a daemon sends over its websocket. Control traffic and all
/// per-job streams are multiplexed on the one connection; transcode frames
/// carry the job id they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum DaemonFrame {
    Register(RegisterRequest),
    Heartbeat(HeartbeatRequest),
    Unregister(UnregisterRequest),
    Transcode {
        job_id: String,
        message: TranscodeMessage,
    },
}

/// Everything the coordinator sends back on the same socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    Registered(RegisterResponse),
    HeartbeatAck(HeartbeatResponse),
    Unregistered(UnregisterResponse),
    Transcode {
        job_id: String,
        message: TranscodeMessage,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::EsSample;

    #[test]
    fn frames_round_trip_through_json() {
        let frame = DaemonFrame::Transcode {
            job_id: "j-1".into(),
            message: TranscodeMessage::Samples {
                batch: EsSampleBatch {
                    video: vec![EsSample {
                        pts: 90_000,
                        dts: 87_000,
                        payload: vec![0, 0, 0, 1, 0x65],
                        is_keyframe: true,
                        sequence: 12,
                    }],
                    audio: vec![],
                    is_source: false,
                    batch_sequence: 4,
                },
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let back: DaemonFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn register_failure_is_tagged() {
        let frame = CoordinatorFrame::Registered(RegisterResponse {
            success: false,
            coordinator_version: "0.1.0".into(),
            heartbeat_interval_ms: 5000,
            error: Some(RegisterFailure::Unauthorized("bad token".into())),
        });
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"kind\":\"unauthorized\""));
        let back: CoordinatorFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn commands_tag_by_name() {
        let cmd = Command::CancelJob {
            job_id: "j-9".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"command\":\"cancel_job\""));
        let drain: Command = serde_json::from_str("{\"command\":\"drain\"}").unwrap();
        assert_eq!(drain, Command::Drain);
    }
}
