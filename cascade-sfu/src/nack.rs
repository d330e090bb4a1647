//! Missing-sequence bookkeeping for NACK origination.

use webrtc::rtcp::transport_feedbacks::transport_layer_nack::NackPair;

/// A missing sequence is re-reported at most this often.
const RENACK_INTERVAL_MS: u64 = 100;
/// After this many reports the sequence is given up on and a keyframe is
/// requested instead.
const MAX_NACK_TRIES: u8 = 3;
/// Head must be this far past a gap before the first report, to tolerate
/// natural reordering (roughly 5 ms at typical video pacing).
const HOLD_OFF_PACKETS: u32 = 2;

#[derive(Debug, Clone, Copy)]
struct NackEntry {
    ext_seq: u32,
    last_nack_ms: u64,
    tries: u8,
}

/// Tracks gaps observed by a [`PacketBuffer`](crate::buffer::PacketBuffer)
/// and turns them into RFC 4585 NACK pairs with time-bounded suppression.
#[derive(Debug, Default)]
pub struct NackQueue {
    entries: Vec<NackEntry>,
}

impl NackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly observed gap.
    pub fn push(&mut self, ext_seq: u32) {
        match self.entries.binary_search_by_key(&ext_seq, |e| e.ext_seq) {
            Ok(_) => {}
            Err(pos) => self.entries.insert(
                pos,
                NackEntry {
                    ext_seq,
                    last_nack_ms: 0,
                    tries: 0,
                },
            ),
        }
    }

    /// Drop a sequence that arrived after all (late or retransmitted).
    pub fn remove(&mut self, ext_seq: u32) {
        if let Ok(pos) = self.entries.binary_search_by_key(&ext_seq, |e| e.ext_seq) {
            self.entries.remove(pos);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collect the sequences due for a (re-)report.
    ///
    /// Returns the NACK pairs plus a flag set when at least one sequence
    /// exhausted its tries, meaning retransmission is hopeless and only a
    /// keyframe can resynchronize the stream.
    pub fn pairs(&mut self, head_ext: u32, now_ms: u64) -> (Vec<NackPair>, bool) {
        let mut seqs: Vec<u16> = Vec::new();
        let mut keyframe_needed = false;

        self.entries.retain_mut(|e| {
            if head_ext < e.ext_seq + HOLD_OFF_PACKETS {
                return true;
            }
            if e.tries >= MAX_NACK_TRIES {
                keyframe_needed = true;
                return false;
            }
            if e.tries == 0 || now_ms.saturating_sub(e.last_nack_ms) >= RENACK_INTERVAL_MS {
                e.tries += 1;
                e.last_nack_ms = now_ms;
                seqs.push(e.ext_seq as u16);
            }
            true
        });

        (build_pairs(&seqs), keyframe_needed)
    }
}

fn build_pairs(seqs: &[u16]) -> Vec<NackPair> {
    let mut pairs: Vec<NackPair> = Vec::new();
    for &seq in seqs {
        if let Some(last) = pairs.last_mut() {
            let offset = seq.wrapping_sub(last.packet_id);
            if offset >= 1 && offset <= 16 {
                last.lost_packets |= 1 << (offset - 1);
                continue;
            }
        }
        pairs.push(NackPair {
            packet_id: seq,
            lost_packets: 0,
        });
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_yields_nothing() {
        let mut q = NackQueue::new();
        let (pairs, kf) = q.pairs(100, 0);
        assert!(pairs.is_empty());
        assert!(!kf);
    }

    #[test]
    fn hold_off_delays_first_report() {
        let mut q = NackQueue::new();
        q.push(50);
        let (pairs, _) = q.pairs(50, 0);
        assert!(pairs.is_empty());
        let (pairs, _) = q.pairs(52, 0);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 50);
    }

    #[test]
    fn renack_suppressed_inside_window() {
        let mut q = NackQueue::new();
        q.push(50);
        let (pairs, _) = q.pairs(60, 1_000);
        assert_eq!(pairs.len(), 1);
        // 50 ms later: still suppressed
        let (pairs, _) = q.pairs(61, 1_050);
        assert!(pairs.is_empty());
        // 100 ms later: re-reported
        let (pairs, _) = q.pairs(62, 1_100);
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn exhausted_entry_requests_keyframe() {
        let mut q = NackQueue::new();
        q.push(50);
        let mut now = 0u64;
        for _ in 0..3 {
            q.pairs(60, now);
            now += 200;
        }
        let (pairs, kf) = q.pairs(60, now);
        assert!(pairs.is_empty());
        assert!(kf);
        assert!(q.is_empty());
    }

    #[test]
    fn arrival_removes_entry() {
        let mut q = NackQueue::new();
        q.push(50);
        q.remove(50);
        let (pairs, _) = q.pairs(60, 0);
        assert!(pairs.is_empty());
    }

    #[test]
    fn adjacent_losses_share_a_bitmask() {
        let pairs = build_pairs(&[100, 101, 103, 120]);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].packet_id, 100);
        assert_eq!(pairs[0].lost_packets, 0b101);
        assert_eq!(pairs[1].packet_id, 120);
    }
}
