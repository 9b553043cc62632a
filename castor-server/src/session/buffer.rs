//! Bounded outbound buffer with the explicit drop ladder: when the caller
//! falls behind, oldest non-keyframe batches go first, then non-keyframe
//! video inside keyframe batches, then audio. Before the first keyframe has
//! been delivered nothing is dropped; the buffer may grow to twice its soft
//! cap and then the job is failed instead.

use std::collections::VecDeque;

use castor_contracts::EsSampleBatch;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropStats {
    pub batches: u64,
    pub video_samples: u64,
    pub audio_samples: u64,
}

impl DropStats {
    pub fn any(&self) -> bool {
        self.batches != 0 || self.video_samples != 0 || self.audio_samples != 0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Stored,
    StoredWithDrops(DropStats),
    /// Pre-first-keyframe hard limit exceeded; the session must fail the
    /// job with `OUTPUT_STALLED`.
    Overflow,
}

#[derive(Debug)]
pub struct OutboundBuffer {
    soft_cap: usize,
    queue: VecDeque<EsSampleBatch>,
    first_keyframe_delivered: bool,
    pub total_drops: DropStats,
}

impl OutboundBuffer {
    pub fn new(soft_cap: usize) -> Self {
        Self {
            soft_cap: soft_cap.max(2),
            queue: VecDeque::new(),
            first_keyframe_delivered: false,
            total_drops: DropStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn push(&mut self, batch: EsSampleBatch) -> PushOutcome {
        if self.queue.len() < self.soft_cap {
            self.queue.push_back(batch);
            return PushOutcome::Stored;
        }

        if !self.first_keyframe_delivered {
            // Keyframes are sacred until the caller has seen one; buffer
            // beyond the soft cap, up to the hard limit.
            if self.queue.len() < self.soft_cap * 2 {
                self.queue.push_back(batch);
                return PushOutcome::Stored;
            }
            return PushOutcome::Overflow;
        }

        let drops = self.make_room();
        self.queue.push_back(batch);
        self.total_drops.batches += drops.batches;
        self.total_drops.video_samples += drops.video_samples;
        self.total_drops.audio_samples += drops.audio_samples;
        PushOutcome::StoredWithDrops(drops)
    }

    pub fn pop(&mut self) -> Option<EsSampleBatch> {
        let batch = self.queue.pop_front()?;
        if batch.has_keyframe() {
            self.first_keyframe_delivered = true;
        }
        Some(batch)
    }

    /// Free one slot. Ladder: whole non-keyframe batch, then non-keyframe
    /// video (merging the two oldest to actually shrink), then audio.
    fn make_room(&mut self) -> DropStats {
        let mut drops = DropStats::default();

        if let Some(pos) = self.queue.iter().position(|b| !b.has_keyframe()) {
            if let Some(dropped) = self.queue.remove(pos) {
                drops.batches += 1;
                drops.video_samples += dropped.video.len() as u64;
                drops.audio_samples += dropped.audio.len() as u64;
            }
            return drops;
        }

        // Every queued batch carries a keyframe: strip the non-keyframe
        // video from the oldest to preserve audio sync.
        if let Some(head) = self.queue.front_mut() {
            let before = head.video.len();
            head.video.retain(|s| s.is_keyframe);
            drops.video_samples += (before - head.video.len()) as u64;
        }

        if self.queue.len() >= 2 {
            // Fold the two oldest together so the batch count shrinks.
            if let (Some(mut a), Some(b)) = (self.queue.pop_front(), self.queue.pop_front()) {
                a.merge(b);
                self.queue.push_front(a);
                drops.batches += 1;
            }
        } else if let Some(head) = self.queue.front_mut() {
            // Degenerate single oversized batch: audio goes last.
            drops.audio_samples += head.audio.len() as u64;
            head.audio.clear();
        }
        drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use castor_contracts::EsSample;

    fn batch(seq: u64, keyframe: bool) -> EsSampleBatch {
        let mut b = EsSampleBatch::transcoded(seq);
        b.video.push(EsSample {
            pts: seq as i64 * 3000,
            dts: seq as i64 * 3000,
            payload: vec![0u8; 16],
            is_keyframe: keyframe,
            sequence: seq,
        });
        b.audio.push(EsSample {
            pts: seq as i64 * 3000,
            dts: seq as i64 * 3000,
            payload: vec![0u8; 4],
            is_keyframe: false,
            sequence: seq,
        });
        b
    }

    #[test]
    fn drops_oldest_non_keyframe_batches_first() {
        let mut buffer = OutboundBuffer::new(4);
        assert!(matches!(buffer.push(batch(0, true)), PushOutcome::Stored));
        // Deliver the keyframe so the ladder becomes legal.
        let popped = buffer.pop().unwrap();
        assert!(popped.has_keyframe());

        for seq in 1..5 {
            assert!(matches!(
                buffer.push(batch(seq, seq == 1)),
                PushOutcome::Stored
            ));
        }
        // Buffer holds [1(k), 2, 3, 4]; pushing drops batch 2, not 1.
        match buffer.push(batch(5, false)) {
            PushOutcome::StoredWithDrops(drops) => {
                assert_eq!(drops.batches, 1);
                assert_eq!(drops.video_samples, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let sequences: Vec<u64> = std::iter::from_fn(|| buffer.pop())
            .map(|b| b.batch_sequence)
            .collect();
        assert_eq!(sequences, vec![1, 3, 4, 5]);
    }

    #[test]
    fn keyframes_survive_even_when_everything_queued_has_one() {
        let mut buffer = OutboundBuffer::new(2);
        buffer.push(batch(0, true));
        buffer.pop();

        buffer.push(batch(1, true));
        buffer.push(batch(2, true));
        let outcome = buffer.push(batch(3, true));
        assert!(matches!(outcome, PushOutcome::StoredWithDrops(_)));

        let mut keyframes = 0;
        while let Some(b) = buffer.pop() {
            keyframes += b.video.iter().filter(|s| s.is_keyframe).count();
        }
        // All three queued keyframes are still there.
        assert_eq!(keyframes, 3);
    }

    #[test]
    fn batch_sequences_stay_strictly_increasing_across_drops() {
        let mut buffer = OutboundBuffer::new(3);
        buffer.push(batch(0, true));
        buffer.pop();
        for seq in 1..12 {
            buffer.push(batch(seq, seq % 4 == 0));
        }
        let mut last = None;
        while let Some(b) = buffer.pop() {
            if let Some(prev) = last {
                assert!(b.batch_sequence > prev, "{} !> {prev}", b.batch_sequence);
            }
            last = Some(b.batch_sequence);
        }
        assert!(buffer.total_drops.any());
    }

    #[test]
    fn random_workloads_respect_bounds_and_ordering() {
        use proptest::prelude::*;

        proptest!(|(ops in proptest::collection::vec((any::<bool>(), any::<bool>()), 1..200))| {
            let cap = 4;
            let mut buffer = OutboundBuffer::new(cap);
            let mut seq = 0u64;
            let mut last_popped = None;
            for (push, keyframe) in ops {
                if push {
                    let outcome = buffer.push(batch(seq, keyframe));
                    seq += 1;
                    prop_assert!(buffer.len() <= cap * 2);
                    if buffer.first_keyframe_delivered {
                        // Once a keyframe reached the caller the ladder
                        // absorbs overflow instead of failing the job.
                        prop_assert!(!matches!(outcome, PushOutcome::Overflow));
                    }
                } else if let Some(b) = buffer.pop() {
                    if let Some(prev) = last_popped {
                        prop_assert!(b.batch_sequence > prev);
                    }
                    last_popped = Some(b.batch_sequence);
                }
            }
        });
    }

    #[test]
    fn pre_keyframe_overflow_is_reported_not_dropped() {
        let mut buffer = OutboundBuffer::new(2);
        for seq in 0..4 {
            assert!(matches!(
                buffer.push(batch(seq, false)),
                PushOutcome::Stored
            ));
        }
        assert_eq!(buffer.push(batch(4, false)), PushOutcome::Overflow);
        assert_eq!(buffer.len(), 4);
        assert!(!buffer.total_drops.any());
    }
}
