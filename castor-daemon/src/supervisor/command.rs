//! Encoder command construction. The encoder is driven in es-pipe mode:
//! framed samples on stdin, framed samples on stdout, diagnostics and
//! progress on stderr. Hardware input options must precede `-i`.

use std::process::Stdio;

use castor_contracts::{HwAccelKind, JobSpec};
use tokio::process::Command;

use crate::admission::Admission;

pub fn build(encoder_path: &str, spec: &JobSpec, admission: &Admission) -> Command {
    let mut cmd = Command::new(encoder_path);
    cmd.arg("-hide_banner");
    cmd.arg("-loglevel").arg("info");

    if let Some(accel) = admission.hw_accel {
        match accel {
            HwAccelKind::Cuda => {
                cmd.arg("-hwaccel").arg("cuda");
                cmd.arg("-hwaccel_output_format").arg("cuda");
                if let Some(index) = admission.gpu_index {
                    cmd.arg("-hwaccel_device").arg(index.to_string());
                }
            }
            HwAccelKind::Vaapi => {
                cmd.arg("-hwaccel").arg("vaapi");
                if let Some(device) = &admission.hw_device {
                    cmd.arg("-hwaccel_device").arg(device);
                }
                cmd.arg("-hwaccel_output_format").arg("vaapi");
            }
            HwAccelKind::Qsv => {
                cmd.arg("-hwaccel").arg("qsv");
                if let Some(device) = &admission.hw_device {
                    cmd.arg("-qsv_device").arg(device);
                }
            }
            HwAccelKind::VideoToolbox => {
                cmd.arg("-hwaccel").arg("videotoolbox");
            }
            HwAccelKind::Amf => {
                cmd.arg("-hwaccel").arg("d3d11va");
            }
            HwAccelKind::None => {}
        }
    }

    // Source decoders, declared ahead of the input.
    cmd.arg("-vcodec").arg(&spec.source_video_codec);
    cmd.arg("-acodec").arg(&spec.source_audio_codec);
    cmd.arg("-f").arg("espipe");
    cmd.arg("-i").arg("pipe:0");

    match &admission.video_encoder {
        Some(encoder) => {
            cmd.arg("-c:v").arg(encoder);
            if spec.video_bitrate_kbps > 0 {
                cmd.arg("-b:v").arg(format!("{}k", spec.video_bitrate_kbps));
            }
            if let Some(crf) = spec.crf {
                cmd.arg("-crf").arg(crf.to_string());
            }
            if let Some(preset) = &spec.preset {
                cmd.arg("-preset").arg(preset);
            }
            if let Some(profile) = &spec.profile {
                cmd.arg("-profile:v").arg(profile);
            }
            if let Some(level) = &spec.level {
                cmd.arg("-level:v").arg(level);
            }
            if let Some((width, height)) = spec.scale {
                let filter = match admission.hw_accel {
                    Some(HwAccelKind::Cuda) => format!("scale_cuda={width}:{height}"),
                    Some(HwAccelKind::Vaapi) => format!("scale_vaapi={width}:{height}"),
                    Some(HwAccelKind::Qsv) => format!("scale_qsv={width}:{height}"),
                    _ => format!("scale={width}:{height}"),
                };
                cmd.arg("-vf").arg(filter);
            }
        }
        None => {
            cmd.arg("-c:v").arg("copy");
        }
    }

    match &admission.audio_encoder {
        Some(encoder) => {
            cmd.arg("-c:a").arg(encoder);
            if spec.audio_bitrate_kbps > 0 {
                cmd.arg("-b:a").arg(format!("{}k", spec.audio_bitrate_kbps));
            }
        }
        None => {
            cmd.arg("-c:a").arg("copy");
        }
    }

    for (key, value) in &spec.extra_options {
        cmd.arg(format!("-{key}")).arg(value);
    }

    cmd.arg("-f").arg("espipe");
    cmd.arg("pipe:1");

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_contracts::GpuExhaustedPolicy;

    use crate::admission::AdmissionController;
    use castor_contracts::{Capabilities, GpuClass, GpuInfo, HwAccel};
    use std::time::Duration;

    fn caps() -> Capabilities {
        Capabilities {
            video_encoders: vec!["h264_nvenc".into(), "libx264".into()],
            video_decoders: vec!["h264".into()],
            audio_encoders: vec!["aac".into()],
            audio_decoders: vec!["aac".into()],
            hw_accels: vec![HwAccel {
                kind: HwAccelKind::Cuda,
                device: None,
                available: true,
                encoders: vec!["h264_nvenc".into()],
                decoders: vec![],
                filtered_encoders: vec![],
            }],
            gpus: vec![GpuInfo {
                index: 0,
                name: "RTX".into(),
                class: GpuClass::Consumer,
                driver_version: String::new(),
                max_encode_sessions: 3,
                max_decode_sessions: 0,
            }],
            max_concurrent_jobs: 4,
            max_cpu_jobs: 4,
            max_gpu_jobs: 4,
            max_probe_jobs: 4,
        }
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn hardware_input_options_precede_the_input() {
        let controller = AdmissionController::new(caps(), Duration::from_secs(1));
        let spec = JobSpec {
            source_video_codec: "h264".into(),
            source_audio_codec: "aac".into(),
            target_video_codec: "h264".into(),
            target_audio_codec: "aac".into(),
            video_bitrate_kbps: 5000,
            audio_bitrate_kbps: 128,
            preferred_hw_accel: Some(HwAccelKind::Cuda),
            gpu_exhausted_policy: GpuExhaustedPolicy::Reject,
            ..Default::default()
        };
        let admission = controller.admit(&spec).await.unwrap();
        let cmd = build("ffmpeg", &spec, &admission);
        let args = args_of(&cmd);

        let hwaccel = args.iter().position(|a| a == "-hwaccel").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(hwaccel < input);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "h264_nvenc"));
        assert!(args.windows(2).any(|w| w[0] == "-b:v" && w[1] == "5000k"));
        assert!(args.windows(2).any(|w| w[0] == "-b:a" && w[1] == "128k"));
    }

    #[tokio::test]
    async fn video_passthrough_maps_to_copy() {
        let controller = AdmissionController::new(caps(), Duration::from_secs(1));
        let spec = JobSpec {
            source_video_codec: "h264".into(),
            source_audio_codec: "aac".into(),
            target_video_codec: "copy".into(),
            target_audio_codec: "aac".into(),
            ..Default::default()
        };
        let admission = controller.admit(&spec).await.unwrap();
        let cmd = build("ffmpeg", &spec, &admission);
        let args = args_of(&cmd);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "aac"));
    }
}
