//! Startup capability probe.
//!
//! Runs once before registration: enumerates the encoder binary's codec
//! tables, detects hardware accelerators, smoke-tests the hardware encoders
//! it intends to advertise, and derives concurrency defaults. The resulting
//! [`Capabilities`] record is immutable for the lifetime of the connection.

mod gpu;
mod parse;

use std::process::Stdio;
use std::time::Duration;

use castor_config::DaemonConfig;
use castor_contracts::{Capabilities, FilteredEncoder, GpuInfo, HwAccel, HwAccelKind};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub use gpu::{classify_gpu, detect_render_node, parse_nvidia_smi};
pub use parse::{CodecKind, names_of, parse_codec_table};

/// Sessions an "unlimited" GPU contributes to derived concurrency defaults.
const UNLIMITED_GPU_WEIGHT: u32 = 8;
/// Bound on each individual smoke-test invocation.
const SMOKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("encoder binary unavailable: {0}")]
    EncoderMissing(String),
    #[error("capability probe exceeded {0:?}")]
    Timeout(Duration),
    #[error("encoder query failed: {0}")]
    Query(String),
}

#[derive(Debug)]
pub struct CapabilityProbe {
    encoder_path: String,
    probe_timeout: Duration,
    run_smoke: bool,
    cpu_count: u32,
    caps_override: Option<Capabilities>,
    concurrency_overrides: [u32; 4],
}

impl CapabilityProbe {
    pub fn new(config: &DaemonConfig, cpu_count: usize) -> Self {
        Self {
            encoder_path: config.encoder_path.clone(),
            probe_timeout: config.probe_timeout,
            run_smoke: config.probe_smoke,
            cpu_count: cpu_count.max(1) as u32,
            caps_override: config.capabilities_override.clone(),
            concurrency_overrides: [
                config.max_concurrent_jobs,
                config.max_cpu_jobs,
                config.max_gpu_jobs,
                config.max_probe_jobs,
            ],
        }
    }

    /// Run the probe, bounded by the configured timeout.
    pub async fn run(&self) -> Result<Capabilities, ProbeError> {
        if let Some(mut caps) = self.caps_override.clone() {
            info!("using pre-declared capabilities, skipping detection");
            self.apply_concurrency_defaults(&mut caps);
            return Ok(caps);
        }
        tokio::time::timeout(self.probe_timeout, self.detect())
            .await
            .map_err(|_| ProbeError::Timeout(self.probe_timeout))?
    }

    async fn detect(&self) -> Result<Capabilities, ProbeError> {
        self.check_binary().await?;

        let encoders = self.query_table("-encoders").await?;
        let decoders = self.query_table("-decoders").await?;

        let mut caps = Capabilities {
            video_encoders: names_of(&encoders, CodecKind::Video),
            video_decoders: names_of(&decoders, CodecKind::Video),
            audio_encoders: names_of(&encoders, CodecKind::Audio),
            audio_decoders: names_of(&decoders, CodecKind::Audio),
            ..Default::default()
        };

        caps.gpus = gpu::detect_cuda_gpus().await;
        caps.hw_accels = self.assemble_accels(&caps);

        if self.run_smoke {
            self.smoke_filter(&mut caps).await;
        }

        self.apply_concurrency_defaults(&mut caps);

        info!(
            video_encoders = caps.video_encoders.len(),
            audio_encoders = caps.audio_encoders.len(),
            gpus = caps.gpus.len(),
            accels = caps.hw_accels.iter().filter(|a| a.available).count(),
            max_concurrent_jobs = caps.max_concurrent_jobs,
            "capability probe complete"
        );
        Ok(caps)
    }

    async fn check_binary(&self) -> Result<(), ProbeError> {
        let output = Command::new(&self.encoder_path)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ProbeError::EncoderMissing(format!("{}: {err}", self.encoder_path)))?;
        if !output.status.success() {
            return Err(ProbeError::EncoderMissing(format!(
                "{} -version exited with {:?}",
                self.encoder_path,
                output.status.code()
            )));
        }
        Ok(())
    }

    async fn query_table(&self, flag: &str) -> Result<Vec<(CodecKind, String)>, ProbeError> {
        let output = Command::new(&self.encoder_path)
            .arg("-hide_banner")
            .arg(flag)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ProbeError::Query(format!("{flag}: {err}")))?;
        if !output.status.success() {
            return Err(ProbeError::Query(format!(
                "{flag} exited with {:?}",
                output.status.code()
            )));
        }
        Ok(parse_codec_table(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Map detected hardware onto acceleration entries, restricted to what
    /// the encoder binary actually ships.
    fn assemble_accels(&self, caps: &Capabilities) -> Vec<HwAccel> {
        let mut accels = Vec::new();

        let by_suffix = |suffix: &str, list: &[String]| -> Vec<String> {
            list.iter()
                .filter(|name| name.ends_with(suffix))
                .cloned()
                .collect()
        };

        if !caps.gpus.is_empty() {
            let encoders = by_suffix("_nvenc", &caps.video_encoders);
            let decoders = by_suffix("_cuvid", &caps.video_decoders);
            accels.push(HwAccel {
                kind: HwAccelKind::Cuda,
                device: None,
                available: !encoders.is_empty(),
                encoders,
                decoders,
                filtered_encoders: Vec::new(),
            });
        }

        if let Some(node) = gpu::detect_render_node() {
            let encoders = by_suffix("_vaapi", &caps.video_encoders);
            accels.push(HwAccel {
                kind: HwAccelKind::Vaapi,
                device: Some(node.clone()),
                available: !encoders.is_empty(),
                encoders,
                decoders: by_suffix("_vaapi", &caps.video_decoders),
                filtered_encoders: Vec::new(),
            });

            let qsv_encoders = by_suffix("_qsv", &caps.video_encoders);
            if !qsv_encoders.is_empty() {
                accels.push(HwAccel {
                    kind: HwAccelKind::Qsv,
                    device: Some(node),
                    available: true,
                    encoders: qsv_encoders,
                    decoders: by_suffix("_qsv", &caps.video_decoders),
                    filtered_encoders: Vec::new(),
                });
            }
        }

        #[cfg(target_os = "macos")]
        {
            let encoders = by_suffix("_videotoolbox", &caps.video_encoders);
            accels.push(HwAccel {
                kind: HwAccelKind::VideoToolbox,
                device: None,
                available: !encoders.is_empty(),
                encoders,
                decoders: Vec::new(),
                filtered_encoders: Vec::new(),
            });
        }

        accels
    }

    /// Smoke-test every hardware encoder we are about to advertise; failures
    /// move to the filtered list with the stderr tail as reason.
    async fn smoke_filter(&self, caps: &mut Capabilities) {
        for accel in &mut caps.hw_accels {
            if !accel.available {
                continue;
            }
            let mut kept = Vec::new();
            for encoder in std::mem::take(&mut accel.encoders) {
                match self.smoke_one(&encoder).await {
                    Ok(()) => kept.push(encoder),
                    Err(reason) => {
                        warn!(encoder, %reason, "smoke test failed, filtering encoder");
                        caps.video_encoders.retain(|e| *e != encoder);
                        accel.filtered_encoders.push(FilteredEncoder {
                            name: encoder,
                            reason,
                        });
                    }
                }
            }
            accel.encoders = kept;
            accel.available = !accel.encoders.is_empty();
        }
    }

    async fn smoke_one(&self, encoder: &str) -> Result<(), String> {
        let result = tokio::time::timeout(
            SMOKE_TIMEOUT,
            Command::new(&self.encoder_path)
                .args([
                    "-hide_banner",
                    "-v",
                    "error",
                    "-f",
                    "lavfi",
                    "-i",
                    "testsrc2=duration=0.2:size=320x240:rate=30",
                    "-frames:v",
                    "2",
                    "-c:v",
                    encoder,
                    "-f",
                    "null",
                    "-",
                ])
                .stdin(Stdio::null())
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail = stderr.lines().last().unwrap_or("unknown failure");
                Err(tail.to_string())
            }
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("smoke test exceeded {SMOKE_TIMEOUT:?}")),
        }
    }

    /// Fill zeroed concurrency caps with detected defaults: CPU jobs from
    /// core count, GPU jobs from session totals, probe jobs from the total.
    fn apply_concurrency_defaults(&self, caps: &mut Capabilities) {
        let [total_override, cpu_override, gpu_override, probe_override] =
            self.concurrency_overrides;

        if total_override != 0 {
            caps.max_concurrent_jobs = total_override;
        }
        if cpu_override != 0 {
            caps.max_cpu_jobs = cpu_override;
        }
        if gpu_override != 0 {
            caps.max_gpu_jobs = gpu_override;
        }
        if probe_override != 0 {
            caps.max_probe_jobs = probe_override;
        }

        if caps.max_cpu_jobs == 0 {
            caps.max_cpu_jobs = self.cpu_count;
        }
        if caps.max_concurrent_jobs == 0 {
            caps.max_concurrent_jobs = caps.max_cpu_jobs + weighted_gpu_sessions(&caps.gpus);
        }
        if caps.max_gpu_jobs == 0 {
            caps.max_gpu_jobs = caps
                .gpus
                .iter()
                .map(|g| g.encode_session_cap(caps.max_concurrent_jobs))
                .sum();
        }
        if caps.max_probe_jobs == 0 {
            caps.max_probe_jobs = caps.max_concurrent_jobs;
        }

        debug!(
            total = caps.max_concurrent_jobs,
            cpu = caps.max_cpu_jobs,
            gpu = caps.max_gpu_jobs,
            probe = caps.max_probe_jobs,
            "concurrency caps resolved"
        );
    }
}

fn weighted_gpu_sessions(gpus: &[GpuInfo]) -> u32 {
    gpus.iter()
        .map(|g| {
            if g.max_encode_sessions == 0 {
                UNLIMITED_GPU_WEIGHT
            } else {
                g.max_encode_sessions
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_contracts::GpuClass;

    fn probe_with(cpu: usize, overrides: [u32; 4]) -> CapabilityProbe {
        CapabilityProbe {
            encoder_path: "ffmpeg".into(),
            probe_timeout: Duration::from_secs(30),
            run_smoke: false,
            cpu_count: cpu as u32,
            caps_override: None,
            concurrency_overrides: overrides,
        }
    }

    fn gpu(index: u32, sessions: u32) -> GpuInfo {
        GpuInfo {
            index,
            name: "test".into(),
            class: GpuClass::Consumer,
            driver_version: String::new(),
            max_encode_sessions: sessions,
            max_decode_sessions: 0,
        }
    }

    #[test]
    fn defaults_derive_from_cores_and_sessions() {
        let probe = probe_with(8, [0, 0, 0, 0]);
        let mut caps = Capabilities {
            gpus: vec![gpu(0, 3), gpu(1, 0)],
            ..Default::default()
        };
        probe.apply_concurrency_defaults(&mut caps);
        assert_eq!(caps.max_cpu_jobs, 8);
        // cores + 3 finite sessions + unlimited weight
        assert_eq!(caps.max_concurrent_jobs, 8 + 3 + UNLIMITED_GPU_WEIGHT);
        // finite cap + unlimited resolved to the total
        assert_eq!(caps.max_gpu_jobs, 3 + caps.max_concurrent_jobs);
        assert_eq!(caps.max_probe_jobs, caps.max_concurrent_jobs);
    }

    #[test]
    fn explicit_overrides_win() {
        let probe = probe_with(8, [4, 2, 1, 3]);
        let mut caps = Capabilities::default();
        probe.apply_concurrency_defaults(&mut caps);
        assert_eq!(caps.max_concurrent_jobs, 4);
        assert_eq!(caps.max_cpu_jobs, 2);
        assert_eq!(caps.max_gpu_jobs, 1);
        assert_eq!(caps.max_probe_jobs, 3);
    }
}
