//! GPU discovery. CUDA devices are enumerated through `nvidia-smi`; VAAPI
//! presence is inferred from the DRM render nodes.

use castor_contracts::{GpuClass, GpuInfo};
use tokio::process::Command;
use tracing::debug;

/// Query `nvidia-smi` for installed NVIDIA GPUs. Returns an empty list when
/// the tool is missing or fails, which simply means "no CUDA here".
pub async fn detect_cuda_gpus() -> Vec<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=index,name,driver_version")
        .arg("--format=csv,noheader")
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout))
        }
        Ok(out) => {
            debug!(code = ?out.status.code(), "nvidia-smi exited non-zero");
            Vec::new()
        }
        Err(err) => {
            debug!(%err, "nvidia-smi not available");
            Vec::new()
        }
    }
}

/// Parse `nvidia-smi --query-gpu=index,name,driver_version --format=csv,noheader`.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse::<u32>().ok()?;
            let name = fields.next()?.to_string();
            let driver_version = fields.next().unwrap_or_default().to_string();
            let class = classify_gpu(&name);
            Some(GpuInfo {
                index,
                name,
                class,
                driver_version,
                // The driver does not expose session caps; class defaults
                // stand in until a heartbeat reports real occupancy.
                max_encode_sessions: class.default_encode_sessions(),
                max_decode_sessions: 0,
            })
        })
        .collect()
}

/// Class inference from the marketing name. Wrong guesses only shift the
/// session-limit default, which the scheduler treats as advisory anyway.
pub fn classify_gpu(name: &str) -> GpuClass {
    let lower = name.to_lowercase();
    if ["a100", "h100", "h200", "l4", "l40", "tesla"]
        .iter()
        .any(|m| lower.contains(m))
    {
        GpuClass::Datacenter
    } else if ["quadro", "rtx a", "rtx 2000 ada", "rtx 4000 ada", "rtx 6000 ada"]
        .iter()
        .any(|m| lower.contains(m))
    {
        GpuClass::Professional
    } else if lower.contains("geforce") || lower.contains("rtx") || lower.contains("gtx") {
        GpuClass::Consumer
    } else if lower.contains("graphics") && lower.contains("intel") {
        GpuClass::Integrated
    } else {
        GpuClass::Unknown
    }
}

/// First DRM render node, the device VAAPI and QSV attach to.
pub fn detect_render_node() -> Option<String> {
    for candidate in ["/dev/dri/renderD128", "/dev/dri/renderD129"] {
        if std::path::Path::new(candidate).exists() {
            return Some(candidate.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_csv() {
        let gpus = parse_nvidia_smi(
            "0, NVIDIA GeForce RTX 4070, 550.54.14\n1, NVIDIA L40S, 550.54.14\n",
        );
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].index, 0);
        assert_eq!(gpus[0].class, GpuClass::Consumer);
        assert_eq!(gpus[0].max_encode_sessions, 5);
        assert_eq!(gpus[1].class, GpuClass::Datacenter);
        assert_eq!(gpus[1].max_encode_sessions, 0);
        assert_eq!(gpus[1].driver_version, "550.54.14");
    }

    #[test]
    fn classification_covers_the_common_lines() {
        assert_eq!(classify_gpu("NVIDIA GeForce GTX 1660"), GpuClass::Consumer);
        assert_eq!(classify_gpu("Quadro P4000"), GpuClass::Professional);
        assert_eq!(classify_gpu("NVIDIA RTX A5000"), GpuClass::Professional);
        assert_eq!(classify_gpu("Tesla T4"), GpuClass::Datacenter);
        assert_eq!(classify_gpu("Intel UHD Graphics 770"), GpuClass::Integrated);
        assert_eq!(classify_gpu("Mystery Accelerator"), GpuClass::Unknown);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        assert!(parse_nvidia_smi("not,a,gpu line\n").is_empty());
        assert!(parse_nvidia_smi("").is_empty());
    }
}
