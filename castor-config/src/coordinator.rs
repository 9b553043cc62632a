use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, duration, load_toml};

/// Per-job session queue sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Source batches buffered toward the worker before the caller blocks.
    pub inbound_capacity: usize,
    /// Transcoded batches buffered toward the caller before the drop
    /// ladder engages.
    pub outbound_capacity: usize,
    /// Max time a send to the worker link may take before the job fails
    /// with `INPUT_STALLED`.
    #[serde(with = "duration")]
    pub sample_write_timeout: Duration,
    /// How long the coordinator waits for a worker's `Ack` after `Start`.
    #[serde(with = "duration")]
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 64,
            outbound_capacity: 64,
            sample_write_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Coordinator process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,
    /// Shared secret daemons must present at registration; `None` disables
    /// the check.
    pub auth_token: Option<String>,
    /// Heartbeat period declared to daemons at registration.
    #[serde(with = "duration")]
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is declared disconnected.
    #[serde(with = "duration")]
    pub unhealthy_grace: Duration,
    /// Max wait for a queued job when the GPU policy is `queue`.
    #[serde(with = "duration")]
    pub queue_wait_timeout: Duration,
    /// Scheduler retries across workers after an `Ack` failure.
    pub retry_budget: u32,
    /// Retention of disconnected workers in the registry.
    #[serde(with = "duration")]
    pub worker_eviction_grace: Duration,
    /// Drain window on coordinator shutdown before sessions are forced.
    #[serde(with = "duration")]
    pub shutdown_grace: Duration,
    /// How long a freshly accepted socket may take to register.
    #[serde(with = "duration")]
    pub registration_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7400".parse().unwrap(),
            auth_token: None,
            heartbeat_interval: Duration::from_secs(5),
            unhealthy_grace: Duration::from_secs(30),
            queue_wait_timeout: Duration::from_secs(60),
            retry_budget: 2,
            worker_eviction_grace: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(10),
            session: SessionConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        if self.unhealthy_grace < self.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "unhealthy_grace must be at least one heartbeat interval".into(),
            ));
        }
        if self.session.inbound_capacity == 0 || self.session.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session queue capacities must be non-zero".into(),
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
        let config = CoordinatorConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.unhealthy_grace, Duration::from_secs(30));
        assert_eq!(config.queue_wait_timeout, Duration::from_secs(60));
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.worker_eviction_grace, Duration::from_secs(300));
        assert_eq!(config.session.inbound_capacity, 64);
        assert_eq!(config.session.outbound_capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn humantime_durations_parse() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            listen_addr = "127.0.0.1:9000"
            heartbeat_interval = "2s"
            unhealthy_grace = "1m"
            queue_wait_timeout = "90s"
            "#,
        )
        .unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.unhealthy_grace, Duration::from_secs(60));
        assert_eq!(config.queue_wait_timeout, Duration::from_secs(90));
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[test]
    fn load_reads_a_file_and_missing_path_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinator.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:7500\"\nretry_budget = 5\n").unwrap();

        let config = CoordinatorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen_addr.port(), 7500);
        assert_eq!(config.retry_budget, 5);

        let defaults = CoordinatorConfig::load(None).unwrap();
        assert_eq!(defaults.retry_budget, 2);
    }

    #[test]
    fn grace_shorter_than_heartbeat_is_rejected() {
        let config: CoordinatorConfig = toml::from_str(
            r#"
            heartbeat_interval = "30s"
            unhealthy_grace = "5s"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
