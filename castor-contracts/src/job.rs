use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::capabilities::HwAccelKind;
use crate::wire::base64_bytes;

/// What to do when every eligible GPU has exhausted its encode sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuExhaustedPolicy {
    /// Strip hardware candidates and retry with software encoders.
    #[default]
    Fallback,
    /// Hold the job until a session frees up, bounded by the queue timeout.
    Queue,
    /// Fail immediately with `GpuSessionsExhausted`.
    Reject,
}

/// Immutable description of one transcode job.
///
/// `target_video_codec == "copy"` (resp. audio) selects passthrough for that
/// media kind; when both are `copy` no encoder process is involved at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source_video_codec: String,
    pub source_audio_codec: String,
    /// Sequence/picture parameter sets for the source video stream.
    #[serde(default, with = "base64_bytes")]
    pub video_init_data: Vec<u8>,
    /// AudioSpecificConfig (or equivalent) for the source audio stream.
    #[serde(default, with = "base64_bytes")]
    pub audio_init_data: Vec<u8>,
    pub target_video_codec: String,
    pub target_audio_codec: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Output dimensions when downscaling, `(width, height)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_hw_accel: Option<HwAccelKind>,
    /// Device hint, e.g. `/dev/dri/renderD128` or a CUDA index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_device: Option<String>,
    /// Extra key/value options passed through to the encoder verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_options: BTreeMap<String, String>,
    #[serde(default)]
    pub gpu_exhausted_policy: GpuExhaustedPolicy,
    /// IPTV channel this job serves, surfaced in heartbeats and dashboards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    /// Upstream relay session the job belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl JobSpec {
    pub fn video_passthrough(&self) -> bool {
        self.target_video_codec == "copy"
    }

    pub fn audio_passthrough(&self) -> bool {
        self.target_audio_codec == "copy"
    }

    /// Both media kinds pass through untouched.
    pub fn is_passthrough(&self) -> bool {
        self.video_passthrough() && self.audio_passthrough()
    }

    /// The job asks for a hardware video path.
    pub fn wants_hardware(&self) -> bool {
        matches!(self.preferred_hw_accel, Some(kind) if kind.is_hardware())
    }
}

/// Lifecycle of a job as tracked on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Starting | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Valid walk check for the state machine: forward-only, except that
    /// observers may see `running` again after a missed update.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Pending, Assigned) | (Assigned, Starting) | (Starting, Running) => true,
            (_, Failed) | (_, Cancelled) => true,
            (Running, Completed) | (Starting, Completed) => true,
            _ => false,
        }
    }
}

/// Rolling runtime statistics for one job, reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscodeStats {
    pub samples_in: u64,
    pub samples_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Encoding speed as a realtime multiplier (1.0 = realtime).
    pub speed: f32,
    pub cpu_percent: f32,
    pub resident_mb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_pid: Option<u32>,
    pub running_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hw_accel: Option<HwAccelKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_device: Option<String>,
    /// Outbound batches dropped under backpressure since the last report.
    #[serde(default)]
    pub batches_dropped: u64,
}

/// Classification of a failed transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscodeErrorCode {
    FfmpegCrashed,
    CodecUnsupported,
    SessionLimitReached,
    InputStalled,
    OutputStalled,
    Internal,
}

/// Terminal error recorded on a job. `recoverable` tells the caller whether
/// resubmitting on another worker is worthwhile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct TranscodeError {
    pub code: TranscodeErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl TranscodeError {
    pub fn recoverable(code: TranscodeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn fatal(code: TranscodeErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_active_partitions() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Assigned.is_active());
        assert!(JobState::Starting.is_active());
        assert!(JobState::Running.is_active());
        assert!(!JobState::Pending.is_active());
        assert!(!JobState::Pending.is_terminal());
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            assert!(!terminal.can_transition_to(JobState::Running));
            assert!(!terminal.can_transition_to(JobState::Failed));
        }
    }

    #[test]
    fn error_code_wire_names() {
        let json = serde_json::to_string(&TranscodeErrorCode::FfmpegCrashed).unwrap();
        assert_eq!(json, "\"FFMPEG_CRASHED\"");
        let json = serde_json::to_string(&TranscodeErrorCode::OutputStalled).unwrap();
        assert_eq!(json, "\"OUTPUT_STALLED\"");
    }

    #[test]
    fn passthrough_detection() {
        let spec = JobSpec {
            target_video_codec: "copy".into(),
            target_audio_codec: "copy".into(),
            ..Default::default()
        };
        assert!(spec.is_passthrough());

        let spec = JobSpec {
            target_video_codec: "h264".into(),
            target_audio_codec: "copy".into(),
            ..Default::default()
        };
        assert!(!spec.is_passthrough());
        assert!(spec.audio_passthrough());
    }
}
