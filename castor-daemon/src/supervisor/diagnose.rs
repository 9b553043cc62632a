//! Encoder stderr interpretation: fatal-substring classification and
//! progress-line parsing.
//!
//! The pattern table needs a review pass per encoder release; a wrong entry
//! degrades observability, not correctness, since the exit code still drives
//! the terminal state.

use castor_contracts::{TranscodeError, TranscodeErrorCode};

struct FatalPattern {
    needle: &'static str,
    code: TranscodeErrorCode,
    recoverable: bool,
}

const FATAL_PATTERNS: &[FatalPattern] = &[
    FatalPattern {
        needle: "Unknown encoder",
        code: TranscodeErrorCode::CodecUnsupported,
        recoverable: false,
    },
    FatalPattern {
        needle: "Encoder not found",
        code: TranscodeErrorCode::CodecUnsupported,
        recoverable: false,
    },
    FatalPattern {
        needle: "OpenEncodeSessionEx failed",
        code: TranscodeErrorCode::SessionLimitReached,
        recoverable: true,
    },
    FatalPattern {
        needle: "No capable devices found",
        code: TranscodeErrorCode::SessionLimitReached,
        recoverable: true,
    },
    FatalPattern {
        needle: "Device creation failed",
        code: TranscodeErrorCode::Internal,
        recoverable: true,
    },
    FatalPattern {
        needle: "Generic error in an external library",
        code: TranscodeErrorCode::Internal,
        recoverable: true,
    },
    FatalPattern {
        needle: "Invalid data found when processing input",
        code: TranscodeErrorCode::FfmpegCrashed,
        recoverable: true,
    },
    FatalPattern {
        needle: "Conversion failed",
        code: TranscodeErrorCode::FfmpegCrashed,
        recoverable: true,
    },
];

/// Match a stderr line against the fatal table. First match wins.
pub fn classify_fatal(line: &str) -> Option<TranscodeError> {
    FATAL_PATTERNS
        .iter()
        .find(|p| line.contains(p.needle))
        .map(|p| TranscodeError {
            code: p.code,
            message: line.trim().to_string(),
            recoverable: p.recoverable,
        })
}

/// Classify an encoder exit without a better diagnosis, using the stderr
/// tail as the message.
pub fn classify_exit(code: Option<i32>, stderr_tail: &str) -> TranscodeError {
    TranscodeError::recoverable(
        TranscodeErrorCode::FfmpegCrashed,
        format!(
            "encoder exited with {}: {}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr_tail.trim()
        ),
    )
}

/// Fields pulled out of an encoder progress line.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Progress {
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub speed: Option<f32>,
    pub bitrate_kbps: Option<f32>,
}

/// Parse a `frame= 1234 fps= 30 ... speed=1.23x` progress line. Values may
/// be separated from their key by spaces, so tokens are re-stitched first.
pub fn parse_progress(line: &str) -> Option<Progress> {
    if !line.contains("frame=") && !line.contains("speed=") {
        return None;
    }

    let mut progress = Progress::default();
    let mut pending_key: Option<&str> = None;

    for token in line.split_whitespace() {
        let (key, value) = if let Some(key) = pending_key.take() {
            (key, token)
        } else if let Some((key, value)) = token.split_once('=') {
            if value.is_empty() {
                pending_key = Some(key);
                continue;
            }
            (key, value)
        } else {
            continue;
        };

        match key {
            "frame" => progress.frame = value.parse().ok(),
            "fps" => progress.fps = value.parse().ok(),
            "speed" => {
                progress.speed = value.trim_end_matches(['x', 'X']).parse().ok();
            }
            "bitrate" => {
                if let Some(kbits) = value.strip_suffix("kbits/s") {
                    progress.bitrate_kbps = kbits.parse().ok();
                }
            }
            _ => {}
        }
    }

    Some(progress)
}
