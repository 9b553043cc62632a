//! Parsers for the encoder binary's query output.

/// Media kind column in `-encoders`/`-decoders` listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Video,
    Audio,
}

/// Parse the table printed by `<encoder> -encoders` or `-decoders`.
///
/// Lines look like:
///
/// ```text
///  V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
///  A....D aac                  AAC (Advanced Audio Coding)
/// ```
///
/// Everything before the `------` separator is a legend and is skipped.
pub fn parse_codec_table(output: &str) -> Vec<(CodecKind, String)> {
    let mut entries = Vec::new();
    let mut in_table = false;

    for line in output.lines() {
        if !in_table {
            if line.trim_start().starts_with("---") {
                in_table = true;
            }
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(flags), Some(name)) = (fields.next(), fields.next()) else {
            continue;
        };
        let kind = match flags.chars().next() {
            Some('V') => CodecKind::Video,
            Some('A') => CodecKind::Audio,
            _ => continue,
        };
        entries.push((kind, name.to_string()));
    }

    entries
}

pub fn names_of(entries: &[(CodecKind, String)], kind: CodecKind) -> Vec<String> {
    entries
        .iter()
        .filter(|(k, _)| *k == kind)
        .map(|(_, name)| name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODERS_FIXTURE: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 .F.... = Frame-level multithreading
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
 A....D aac                  AAC (Advanced Audio Coding)
 A....D libopus              libopus Opus (codec opus)
 S..... srt                  SubRip subtitle";

    #[test]
    fn parses_video_and_audio_rows() {
        let entries = parse_codec_table(ENCODERS_FIXTURE);
        let video = names_of(&entries, CodecKind::Video);
        let audio = names_of(&entries, CodecKind::Audio);
        assert_eq!(video, vec!["libx264", "h264_nvenc", "hevc_nvenc"]);
        assert_eq!(audio, vec!["aac", "libopus"]);
    }

    #[test]
    fn skips_the_legend_and_subtitle_rows() {
        let entries = parse_codec_table(ENCODERS_FIXTURE);
        assert!(entries.iter().all(|(_, name)| name != "srt"));
        assert!(entries.iter().all(|(_, name)| name != "="));
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert!(parse_codec_table("").is_empty());
        assert!(parse_codec_table("Encoders:\n V..... = Video").is_empty());
    }
}
