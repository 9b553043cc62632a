use std::path::Path;
use std::time::Duration;

use castor_contracts::Capabilities;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, duration, load_toml};

/// Worker daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Coordinator websocket endpoint, e.g. `ws://coordinator:7400/v1/daemon`.
    pub coordinator_url: String,
    /// Stable daemon identity; generated once and persisted by the operator.
    /// A fresh UUID is used when unset.
    pub daemon_id: Option<String>,
    pub daemon_name: String,
    pub auth_token: Option<String>,
    /// Encoder binary driven by the process supervisor.
    pub encoder_path: String,
    /// Bound on the whole capability probe.
    #[serde(with = "duration")]
    pub probe_timeout: Duration,
    /// Skip hardware smoke tests during the probe (slow CI machines).
    pub probe_smoke: bool,
    /// Reconnect backoff bounds.
    #[serde(with = "duration")]
    pub reconnect_base: Duration,
    #[serde(with = "duration")]
    pub reconnect_max: Duration,
    /// Idle bound on the stdin pump before a job fails `INPUT_STALLED`.
    #[serde(with = "duration")]
    pub input_stall_timeout: Duration,
    /// Idle bound on the stdout pump before a job fails `OUTPUT_STALLED`.
    #[serde(with = "duration")]
    pub output_stall_timeout: Duration,
    /// Outbound batching: close a batch on this window...
    pub sample_batch_window_ms: u64,
    /// ...or when it reaches this many payload bytes, whichever first.
    pub sample_batch_bytes: usize,
    /// Cadence of `TranscodeStats` emissions per job.
    #[serde(with = "duration")]
    pub stats_interval: Duration,
    /// SIGTERM-to-SIGKILL grace when cancelling an encoder.
    #[serde(with = "duration")]
    pub term_grace: Duration,
    /// Local wait bound when a job's GPU policy is `queue`.
    #[serde(with = "duration")]
    pub queue_wait_timeout: Duration,
    /// Concurrency cap overrides; zero keeps the probed default.
    pub max_concurrent_jobs: u32,
    pub max_cpu_jobs: u32,
    pub max_gpu_jobs: u32,
    pub max_probe_jobs: u32,
    /// Exit the process once a drain completes instead of idling.
    pub drain_exit: bool,
    /// Pre-declared capabilities; skips binary/hardware detection entirely.
    pub capabilities_override: Option<Capabilities>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:7400/v1/daemon".into(),
            daemon_id: None,
            daemon_name: hostname_or_default(),
            auth_token: None,
            encoder_path: "ffmpeg".into(),
            probe_timeout: Duration::from_secs(30),
            probe_smoke: true,
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            input_stall_timeout: Duration::from_secs(30),
            output_stall_timeout: Duration::from_secs(10),
            sample_batch_window_ms: 200,
            sample_batch_bytes: 256 * 1024,
            stats_interval: Duration::from_secs(1),
            term_grace: Duration::from_secs(5),
            queue_wait_timeout: Duration::from_secs(60),
            max_concurrent_jobs: 0,
            max_cpu_jobs: 0,
            max_gpu_jobs: 0,
            max_probe_jobs: 0,
            drain_exit: false,
            capabilities_override: None,
        }
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "castor-daemon".into())
}

impl DaemonConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator_url.is_empty() {
            return Err(ConfigError::Invalid("coordinator_url is required".into()));
        }
        if self.reconnect_base.is_zero() || self.reconnect_max < self.reconnect_base {
            return Err(ConfigError::Invalid(
                "reconnect bounds must satisfy 0 < base <= max".into(),
            ));
        }
        if self.sample_batch_bytes == 0 || self.sample_batch_window_ms == 0 {
            return Err(ConfigError::Invalid(
                "sample batching window and byte bound must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.reconnect_base, Duration::from_secs(5));
        assert_eq!(config.reconnect_max, Duration::from_secs(60));
        assert_eq!(config.input_stall_timeout, Duration::from_secs(30));
        assert_eq!(config.output_stall_timeout, Duration::from_secs(10));
        assert_eq!(config.sample_batch_window_ms, 200);
        assert_eq!(config.sample_batch_bytes, 256 * 1024);
        assert_eq!(config.term_grace, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn capability_override_parses_inline() {
        let config: DaemonConfig = toml::from_str(
            r#"
            coordinator_url = "ws://cc:7400/v1/daemon"

            [capabilities_override]
            video_encoders = ["libx264"]
            video_decoders = ["h264"]
            audio_encoders = ["aac"]
            audio_decoders = ["aac"]
            max_concurrent_jobs = 4
            "#,
        )
        .unwrap();
        let caps = config.capabilities_override.unwrap();
        assert_eq!(caps.max_concurrent_jobs, 4);
        assert!(caps.has_video_encoder("libx264"));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config: DaemonConfig = toml::from_str(
            r#"
            reconnect_base = "2m"
            reconnect_max = "1m"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
