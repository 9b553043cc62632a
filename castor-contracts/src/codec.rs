//! Mapping between codec names (`h264`, `hevc`, `aac`, ...) and encoder
//! names (`libx264`, `h264_nvenc`, `aac`, ...). The scheduler and the local
//! admission controller both rank encoders by the codec they produce, so the
//! table lives here rather than in either binary.

use crate::capabilities::HwAccelKind;

/// Suffixes hardware encoders carry, paired with their acceleration family.
const HW_SUFFIXES: &[(&str, HwAccelKind)] = &[
    ("_nvenc", HwAccelKind::Cuda),
    ("_cuvid", HwAccelKind::Cuda),
    ("_vaapi", HwAccelKind::Vaapi),
    ("_qsv", HwAccelKind::Qsv),
    ("_videotoolbox", HwAccelKind::VideoToolbox),
    ("_amf", HwAccelKind::Amf),
];

/// Software encoder/decoder names and the codec each produces.
const SOFTWARE_TABLE: &[(&str, &str)] = &[
    ("libx264", "h264"),
    ("x264", "h264"),
    ("libx265", "hevc"),
    ("x265", "hevc"),
    ("libvpx", "vp8"),
    ("libvpx-vp9", "vp9"),
    ("libaom-av1", "av1"),
    ("libsvtav1", "av1"),
    ("aac", "aac"),
    ("libfdk_aac", "aac"),
    ("ac3", "ac3"),
    ("eac3", "eac3"),
    ("libopus", "opus"),
    ("opus", "opus"),
    ("libmp3lame", "mp3"),
    ("mp2", "mp2"),
];

/// Normalize codec aliases so comparisons are stable (`h265` -> `hevc`).
pub fn normalize_codec(codec: &str) -> &str {
    match codec {
        "h265" | "x265" => "hevc",
        "avc" => "h264",
        other => other,
    }
}

/// The acceleration family an encoder name belongs to, if any.
pub fn hw_kind_of(name: &str) -> Option<HwAccelKind> {
    HW_SUFFIXES
        .iter()
        .find(|(suffix, _)| name.ends_with(suffix))
        .map(|(_, kind)| *kind)
}

/// True when the encoder name denotes a hardware path.
pub fn is_hardware(name: &str) -> bool {
    hw_kind_of(name).is_some()
}

/// The codec a given encoder or decoder name produces/consumes.
///
/// Hardware names are classified by stripping the acceleration suffix
/// (`hevc_nvenc` -> `hevc`); software names go through a fixed table.
pub fn codec_of(name: &str) -> Option<&str> {
    for (suffix, _) in HW_SUFFIXES {
        if let Some(stem) = name.strip_suffix(suffix) {
            return Some(normalize_codec(stem));
        }
    }
    SOFTWARE_TABLE
        .iter()
        .find(|(enc, _)| *enc == name)
        .map(|(_, codec)| *codec)
}

/// True when `name` can produce `codec` (aliases normalized).
pub fn encoder_produces(name: &str, codec: &str) -> bool {
    codec_of(name) == Some(normalize_codec(codec))
}

/// True when decoder `name` handles `codec`. Decoders are usually listed
/// under the bare codec name (`h264`, `aac`), with hardware variants
/// suffixed like encoders.
pub fn decoder_handles(name: &str, codec: &str) -> bool {
    let codec = normalize_codec(codec);
    normalize_codec(name) == codec || codec_of(name) == Some(codec)
}
