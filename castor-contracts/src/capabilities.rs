use serde::{Deserialize, Serialize};

/// Hardware acceleration families a daemon can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccelKind {
    Cuda,
    Vaapi,
    Qsv,
    VideoToolbox,
    Amf,
    None,
}

impl HwAccelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::VideoToolbox => "videotoolbox",
            Self::Amf => "amf",
            Self::None => "none",
        }
    }

    /// True for variants that consume a GPU encode session.
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Marketing class of a GPU, used to pick session-limit defaults when the
/// driver does not report one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuClass {
    Consumer,
    Professional,
    Datacenter,
    Integrated,
    Unknown,
}

impl GpuClass {
    /// Default concurrent encode sessions when the driver is silent.
    /// Zero means unlimited.
    pub fn default_encode_sessions(&self) -> u32 {
        match self {
            Self::Consumer => 5,
            Self::Professional => 32,
            Self::Datacenter => 0,
            Self::Integrated => 2,
            Self::Unknown => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Professional => "professional",
            Self::Datacenter => "datacenter",
            Self::Integrated => "integrated",
            Self::Unknown => "unknown",
        }
    }
}

/// A single GPU visible to a daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub class: GpuClass,
    #[serde(default)]
    pub driver_version: String,
    /// Concurrent encode sessions the driver allows. Zero means unlimited.
    pub max_encode_sessions: u32,
    /// Concurrent decode sessions the driver allows. Zero means unlimited.
    pub max_decode_sessions: u32,
}

impl GpuInfo {
    /// Effective encode-session cap with the unlimited sentinel resolved to
    /// `unlimited`. Callers pass the relevant outer bound (typically the
    /// worker's total job cap) so the zero sentinel never reaches division
    /// or comparison logic.
    pub fn encode_session_cap(&self, unlimited: u32) -> u32 {
        if self.max_encode_sessions == 0 {
            unlimited
        } else {
            self.max_encode_sessions
        }
    }
}

/// An encoder the probe saw but excluded, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilteredEncoder {
    pub name: String,
    pub reason: String,
}

/// One hardware acceleration entry in a capability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwAccel {
    pub kind: HwAccelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub available: bool,
    /// Encoder names this accelerator can drive, e.g. `h264_nvenc`.
    #[serde(default)]
    pub encoders: Vec<String>,
    /// Decoder names this accelerator can drive, e.g. `h264_cuvid`.
    #[serde(default)]
    pub decoders: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filtered_encoders: Vec<FilteredEncoder>,
}

/// Everything a daemon declares about itself at registration. Immutable for
/// the lifetime of the connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub video_encoders: Vec<String>,
    pub video_decoders: Vec<String>,
    pub audio_encoders: Vec<String>,
    pub audio_decoders: Vec<String>,
    #[serde(default)]
    pub hw_accels: Vec<HwAccel>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    /// Overall cap on concurrent jobs. A worker declaring zero is never
    /// scheduled to.
    pub max_concurrent_jobs: u32,
    /// Per-class caps; zero means "derive a sensible default".
    #[serde(default)]
    pub max_cpu_jobs: u32,
    #[serde(default)]
    pub max_gpu_jobs: u32,
    #[serde(default)]
    pub max_probe_jobs: u32,
}

impl Capabilities {
    pub fn has_video_encoder(&self, name: &str) -> bool {
        self.video_encoders.iter().any(|e| e == name)
    }

    pub fn has_video_decoder(&self, name: &str) -> bool {
        self.video_decoders.iter().any(|d| d == name)
    }

    pub fn has_audio_encoder(&self, name: &str) -> bool {
        self.audio_encoders.iter().any(|e| e == name)
    }

    pub fn has_audio_decoder(&self, name: &str) -> bool {
        self.audio_decoders.iter().any(|d| d == name)
    }

    /// The accelerator entry for `kind`, if the daemon reported one.
    pub fn accel(&self, kind: HwAccelKind) -> Option<&HwAccel> {
        self.hw_accels.iter().find(|a| a.kind == kind)
    }

    /// Accelerators that are actually usable.
    pub fn available_accels(&self) -> impl Iterator<Item = &HwAccel> {
        self.hw_accels.iter().filter(|a| a.available)
    }

    pub fn gpu(&self, index: u32) -> Option<&GpuInfo> {
        self.gpus.iter().find(|g| g.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_sentinel_resolves_to_outer_bound() {
        let gpu = GpuInfo {
            index: 0,
            name: "L40S".into(),
            class: GpuClass::Datacenter,
            driver_version: "550.54".into(),
            max_encode_sessions: 0,
            max_decode_sessions: 0,
        };
        assert_eq!(gpu.encode_session_cap(16), 16);

        let capped = GpuInfo {
            max_encode_sessions: 3,
            ..gpu
        };
        assert_eq!(capped.encode_session_cap(16), 3);
    }

    #[test]
    fn class_defaults_match_driver_policy() {
        assert_eq!(GpuClass::Consumer.default_encode_sessions(), 5);
        assert_eq!(GpuClass::Professional.default_encode_sessions(), 32);
        assert_eq!(GpuClass::Datacenter.default_encode_sessions(), 0);
        assert_eq!(GpuClass::Integrated.default_encode_sessions(), 2);
        assert_eq!(GpuClass::Unknown.default_encode_sessions(), 3);
    }
}
