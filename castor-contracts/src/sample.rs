use serde::{Deserialize, Serialize};

use crate::wire::base64_bytes;

/// One elementary-stream unit: a NAL unit for video, a codec frame for
/// audio. Timestamps are in the 90 kHz transport timescale and must be
/// non-decreasing within a stream; `sequence` is strictly increasing per
/// stream direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsSample {
    pub pts: i64,
    pub dts: i64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub is_keyframe: bool,
    pub sequence: u64,
}

impl EsSample {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// An ordered batch of samples. Batches exist only to amortize per-message
/// overhead; sample order within and across batches is the stream order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EsSampleBatch {
    #[serde(default)]
    pub video: Vec<EsSample>,
    #[serde(default)]
    pub audio: Vec<EsSample>,
    /// True for coordinator -> worker source batches, false for the
    /// transcoded return direction.
    pub is_source: bool,
    pub batch_sequence: u64,
}

impl EsSampleBatch {
    pub fn source(batch_sequence: u64) -> Self {
        Self {
            is_source: true,
            batch_sequence,
            ..Default::default()
        }
    }

    pub fn transcoded(batch_sequence: u64) -> Self {
        Self {
            is_source: false,
            batch_sequence,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.video.len() + self.audio.len()
    }

    /// Total payload bytes carried.
    pub fn byte_len(&self) -> usize {
        self.video.iter().map(EsSample::len).sum::<usize>()
            + self.audio.iter().map(EsSample::len).sum::<usize>()
    }

    pub fn has_keyframe(&self) -> bool {
        self.video.iter().any(|s| s.is_keyframe)
    }

    /// Fold `other` into `self`, preserving order. The merged batch takes
    /// the later batch sequence, so merging empty batches is a semantic
    /// no-op.
    pub fn merge(&mut self, other: EsSampleBatch) {
        self.video.extend(other.video);
        self.audio.extend(other.audio);
        self.batch_sequence = self.batch_sequence.max(other.batch_sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64, dts: i64, key: bool) -> EsSample {
        EsSample {
            pts: dts,
            dts,
            payload: vec![0u8; 8],
            is_keyframe: key,
            sequence: seq,
        }
    }

    #[test]
    fn empty_batches_merge_without_semantic_change() {
        let mut a = EsSampleBatch::source(3);
        let b = EsSampleBatch::source(7);
        a.merge(b);
        assert!(a.is_empty());
        assert_eq!(a.batch_sequence, 7);
    }

    #[test]
    fn merge_preserves_sample_order() {
        let mut a = EsSampleBatch::transcoded(0);
        a.video.push(sample(0, 0, true));
        a.video.push(sample(1, 3000, false));

        let mut b = EsSampleBatch::transcoded(1);
        b.video.push(sample(2, 6000, false));
        b.audio.push(sample(0, 1000, false));

        a.merge(b);
        let seqs: Vec<u64> = a.video.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(a.audio.len(), 1);
    }

    #[test]
    fn keyframe_and_size_accounting() {
        let mut batch = EsSampleBatch::transcoded(0);
        assert!(!batch.has_keyframe());
        batch.video.push(sample(0, 0, true));
        batch.audio.push(sample(0, 0, false));
        assert!(batch.has_keyframe());
        assert_eq!(batch.sample_count(), 2);
        assert_eq!(batch.byte_len(), 16);
    }
}
