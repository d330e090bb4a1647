//! Maps original publisher sequence numbers to the rewritten numbers a
//! subscriber saw, so NACKed sequences can be resolved back to buffered
//! packets and replayed with the right headers.

use parking_lot::Mutex;

use crate::util::monotonic_ms;

/// A served retransmission is not repeated inside this window.
const IGNORE_RETRANSMISSION_MS: u32 = 100;
/// RFC 4585 sizing: one feedback message covers at most 17 sequences.
const MAX_RETRANSMIT_BATCH: usize = 17;

/// Bookkeeping for one forwarded packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Sequence number the publisher sent
    pub source_seq: u16,
    /// Sequence number the subscriber saw
    pub target_seq: u16,
    /// Rewritten timestamp
    pub timestamp: u32,
    /// Spatial layer the packet was forwarded from
    pub layer: u8,
    /// Rebased VP8 fields, when the payload was rewritten
    pub picture_id: u16,
    pub tl0_pic_idx: u8,
    pub has_vp8: bool,
    /// Milliseconds (since sequencer start) of the last retransmit
    last_nack: u32,
}

struct SequencerInner {
    meta: Vec<PacketMeta>,
    size: usize,
    init: bool,
    step: usize,
    head_seq: u16,
}

/// Fixed-size ring of [`PacketMeta`], addressable for the last `size`
/// forwarded packets.
pub struct Sequencer {
    inner: Mutex<SequencerInner>,
    start_ms: u64,
}

impl Sequencer {
    pub fn new(max_track: usize) -> Self {
        let size = max_track.max(1);
        Self {
            inner: Mutex::new(SequencerInner {
                meta: vec![PacketMeta::default(); size],
                size,
                init: false,
                step: 0,
                head_seq: 0,
            }),
            start_ms: monotonic_ms(),
        }
    }

    /// Record a forwarded packet. Returns `None` when a late packet falls
    /// outside the ring.
    pub fn push(
        &self,
        source_seq: u16,
        target_seq: u16,
        timestamp: u32,
        layer: u8,
        is_head: bool,
        vp8: Option<(u16, u8)>,
    ) -> Option<PacketMeta> {
        let mut inner = self.inner.lock();
        if !inner.init {
            inner.head_seq = target_seq.wrapping_sub(1);
            inner.init = true;
        }

        let slot = if is_head {
            let inc = target_seq.wrapping_sub(inner.head_seq);
            // skip slots for any gap so late fills keep their position
            for _ in 1..inc {
                inner.step = (inner.step + 1) % inner.size;
            }
            inner.head_seq = target_seq;
            inner.step
        } else {
            // step points one past the head slot
            let back = inner.head_seq.wrapping_sub(target_seq) as usize;
            if back + 1 >= inner.size {
                return None;
            }
            (inner.step + inner.size - back - 1) % inner.size
        };

        let mut meta = PacketMeta {
            source_seq,
            target_seq,
            timestamp,
            layer,
            last_nack: 0,
            ..Default::default()
        };
        if let Some((picture_id, tl0_pic_idx)) = vp8 {
            meta.picture_id = picture_id;
            meta.tl0_pic_idx = tl0_pic_idx;
            meta.has_vp8 = true;
        }
        inner.meta[slot] = meta;
        if is_head {
            inner.step = (inner.step + 1) % inner.size;
        }
        Some(meta)
    }

    /// Resolve NACKed target sequences to their stored metadata, applying the
    /// retransmission-suppression window and the batch cap.
    pub fn get_seq_pairs(&self, seqs: &[u16]) -> Vec<PacketMeta> {
        self.get_seq_pairs_at(seqs, monotonic_ms().saturating_sub(self.start_ms))
    }

    /// `elapsed_ms` is time since sequencer start.
    fn get_seq_pairs_at(&self, seqs: &[u16], elapsed_ms: u64) -> Vec<PacketMeta> {
        let mut inner = self.inner.lock();
        if !inner.init {
            return Vec::new();
        }
        let ref_time = elapsed_ms as u32;
        let mut out = Vec::with_capacity(MAX_RETRANSMIT_BATCH);

        for &sn in seqs {
            let back = inner.head_seq.wrapping_sub(sn) as usize;
            if back >= inner.size {
                continue;
            }
            // step points one past the head slot
            let slot = (inner.step + inner.size - back - 1) % inner.size;
            let meta = inner.meta[slot];
            if meta.target_seq != sn {
                continue;
            }
            if meta.last_nack == 0 || ref_time.wrapping_sub(meta.last_nack) > IGNORE_RETRANSMISSION_MS
            {
                inner.meta[slot].last_nack = ref_time.max(1);
                out.push(inner.meta[slot]);
            }
            if out.len() == MAX_RETRANSMIT_BATCH {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_recent_sequences() {
        let s = Sequencer::new(500);
        for i in 0u16..10 {
            s.push(1000 + i, 100 + i, i as u32 * 3000, 0, true, None);
        }
        let metas = s.get_seq_pairs_at(&[102, 107], 1);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].source_seq, 1002);
        assert_eq!(metas[0].target_seq, 102);
        assert_eq!(metas[1].source_seq, 1007);
    }

    #[test]
    fn empty_request_yields_empty_batch() {
        let s = Sequencer::new(16);
        s.push(1, 1, 0, 0, true, None);
        assert!(s.get_seq_pairs_at(&[], 1).is_empty());
    }

    #[test]
    fn out_of_window_sequences_are_skipped() {
        let s = Sequencer::new(8);
        for i in 0u16..20 {
            s.push(i, i, 0, 0, true, None);
        }
        // head is 19; anything at or below 11 left the ring
        assert!(s.get_seq_pairs_at(&[5], 1).is_empty());
        assert!(s.get_seq_pairs_at(&[11], 1).is_empty());
        assert_eq!(s.get_seq_pairs_at(&[12], 1).len(), 1);
    }

    #[test]
    fn suppresses_retransmits_inside_window() {
        let s = Sequencer::new(64);
        s.push(10, 10, 0, 0, true, None);
        assert_eq!(s.get_seq_pairs_at(&[10], 10).len(), 1);
        assert!(s.get_seq_pairs_at(&[10], 60).is_empty());
        assert_eq!(s.get_seq_pairs_at(&[10], 160).len(), 1);
    }

    #[test]
    fn batch_capped_at_seventeen() {
        let s = Sequencer::new(100);
        for i in 0u16..40 {
            s.push(i, i, 0, 0, true, None);
        }
        let all: Vec<u16> = (0u16..40).collect();
        assert_eq!(s.get_seq_pairs_at(&all, 1).len(), 17);
    }

    #[test]
    fn late_packets_fill_their_slot() {
        let s = Sequencer::new(32);
        s.push(100, 200, 0, 0, true, None);
        s.push(101, 201, 0, 0, true, None);
        // 203 arrives before 202
        s.push(103, 203, 0, 0, true, None);
        s.push(102, 202, 0, 0, false, None);
        let metas = s.get_seq_pairs_at(&[202], 1);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].source_seq, 102);
    }

    #[test]
    fn wrap_around_lookup() {
        let s = Sequencer::new(16);
        s.push(1, 65534, 0, 0, true, None);
        s.push(2, 65535, 0, 0, true, None);
        s.push(3, 0, 0, 0, true, None);
        s.push(4, 1, 0, 0, true, None);
        let metas = s.get_seq_pairs_at(&[65535, 0], 1);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].source_seq, 2);
        assert_eq!(metas[1].source_seq, 3);
    }

    #[test]
    fn single_slot_ring_keeps_only_head() {
        let s = Sequencer::new(1);
        s.push(1, 10, 0, 0, true, None);
        s.push(2, 11, 0, 0, true, None);
        assert!(s.get_seq_pairs_at(&[10], 1).is_empty());
        assert_eq!(s.get_seq_pairs_at(&[11], 1).len(), 1);
    }

    #[test]
    fn vp8_meta_round_trips() {
        let s = Sequencer::new(8);
        s.push(7, 7, 0, 1, true, Some((0x1234, 9)));
        let metas = s.get_seq_pairs_at(&[7], 1);
        assert!(metas[0].has_vp8);
        assert_eq!(metas[0].picture_id, 0x1234);
        assert_eq!(metas[0].tl0_pic_idx, 9);
    }
}
