//! Outbound batching policy: a batch closes on a time window or a byte
//! bound, whichever comes first, and keyframes flush immediately.

use std::time::Duration;

use castor_contracts::espipe::{EsPipeFrame, MediaKind};
use castor_contracts::sample::EsSampleBatch;
use tokio::time::Instant;

#[derive(Debug)]
pub struct BatchAssembler {
    window: Duration,
    max_bytes: usize,
    next_sequence: u64,
    current: EsSampleBatch,
    bytes: usize,
    opened_at: Option<Instant>,
}

impl BatchAssembler {
    pub fn new(window: Duration, max_bytes: usize) -> Self {
        Self {
            window,
            max_bytes,
            next_sequence: 0,
            current: EsSampleBatch::transcoded(0),
            bytes: 0,
            opened_at: None,
        }
    }

    /// Add a transcoded frame. Returns a finished batch when this frame
    /// closed one (keyframe or byte bound).
    pub fn push(&mut self, frame: EsPipeFrame) -> Option<EsSampleBatch> {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.bytes += frame.payload.len();
        let keyframe = frame.is_keyframe;
        let kind = frame.kind;
        let sample = frame.into_sample();
        match kind {
            MediaKind::Video => self.current.video.push(sample),
            MediaKind::Audio => self.current.audio.push(sample),
        }

        if keyframe || self.bytes >= self.max_bytes {
            self.flush()
        } else {
            None
        }
    }

    /// When the currently open batch must close, regardless of new input.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.window)
    }

    /// Close the open batch, if it holds anything.
    pub fn flush(&mut self) -> Option<EsSampleBatch> {
        if self.current.is_empty() {
            self.opened_at = None;
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let mut done = std::mem::replace(&mut self.current, EsSampleBatch::transcoded(0));
        done.batch_sequence = sequence;
        self.bytes = 0;
        self.opened_at = None;
        Some(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: MediaKind, bytes: usize, keyframe: bool) -> EsPipeFrame {
        EsPipeFrame {
            kind,
            is_keyframe: keyframe,
            is_config: false,
            sequence: 0,
            pts: 0,
            dts: 0,
            payload: vec![0u8; bytes],
        }
    }

    #[test]
    fn keyframes_flush_immediately() {
        let mut assembler = BatchAssembler::new(Duration::from_millis(200), 1024);
        assert!(assembler.push(frame(MediaKind::Video, 10, false)).is_none());
        let batch = assembler.push(frame(MediaKind::Video, 10, true)).unwrap();
        assert_eq!(batch.video.len(), 2);
        assert!(batch.has_keyframe());
        assert_eq!(batch.batch_sequence, 0);
    }

    #[test]
    fn byte_bound_closes_a_batch() {
        let mut assembler = BatchAssembler::new(Duration::from_millis(200), 64);
        assert!(assembler.push(frame(MediaKind::Audio, 32, false)).is_none());
        let batch = assembler.push(frame(MediaKind::Audio, 40, false)).unwrap();
        assert_eq!(batch.audio.len(), 2);
    }

    #[test]
    fn batch_sequences_increase_strictly() {
        let mut assembler = BatchAssembler::new(Duration::from_millis(200), 16);
        let a = assembler.push(frame(MediaKind::Video, 20, false)).unwrap();
        let b = assembler.push(frame(MediaKind::Video, 20, false)).unwrap();
        assembler.push(frame(MediaKind::Video, 1, false));
        let c = assembler.flush().unwrap();
        assert!(a.batch_sequence < b.batch_sequence);
        assert!(b.batch_sequence < c.batch_sequence);
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let mut assembler = BatchAssembler::new(Duration::from_millis(200), 64);
        assert!(assembler.flush().is_none());
        assert!(assembler.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_tracks_the_open_batch() {
        let mut assembler = BatchAssembler::new(Duration::from_millis(200), 1 << 20);
        assert!(assembler.deadline().is_none());
        assembler.push(frame(MediaKind::Video, 8, false));
        let deadline = assembler.deadline().unwrap();
        assert!(deadline > Instant::now());
        let batch = assembler.flush().unwrap();
        assert_eq!(batch.video.len(), 1);
        assert!(assembler.deadline().is_none());
    }
}
