//! Per-SSRC RTP ingest buffer.
//!
//! One `PacketBuffer` exists per publisher encoding (per SSRC). It reorders
//! packets inside a bounded window, originates NACKs for gaps, estimates the
//! incoming bitrate, keeps sender-report correlation data, and answers raw
//! packet lookups for NACK-driven retransmission.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::NackPair;
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::Unmarshal;

use crate::codec::is_keyframe;
use crate::error::{Error, Result};
use crate::nack::NackQueue;
use crate::util::{monotonic_ms, monotonic_ns, seq_newer};
use crate::vp8::Vp8Descriptor;

/// Slot stride of the packet arena; no SRTP-decrypted packet exceeds the MTU.
const SLOT_STRIDE: usize = 1500;
/// How far the head may run past a gap before delivery skips it.
const REORDER_LIMIT: u32 = 50;
/// Bitrate is averaged over this window.
const BITRATE_WINDOW_NS: u64 = 2_000_000_000;
/// Capacity of the deliverable-packet channel; slow consumers drop.
const DELIVERY_CAPACITY: usize = 256;

/// An RTP packet annotated with everything the forwarding path needs.
#[derive(Debug, Clone)]
pub struct ExtendedPacket {
    pub packet: Packet,
    /// Monotonic arrival time in nanoseconds
    pub arrival_ns: u64,
    /// Parsed from the payload; false for audio
    pub keyframe: bool,
    /// Highest sequence seen for this SSRC at delivery time
    pub head: bool,
    /// Present for VP8 payloads
    pub vp8: Option<Vp8Descriptor>,
}

/// NACK batches plus a keyframe-needed escalation flag.
pub type NackSink = Box<dyn Fn(Vec<NackPair>, bool) + Send + Sync>;
/// Transport-wide sequence, arrival ns, marker bit.
pub type TwccSink = Box<dyn Fn(u16, u64, bool) + Send + Sync>;
/// dBov level from the audio-level header extension.
pub type AudioLevelSink = Box<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    seq: u16,
    len: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BufferStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub lost_count: u64,
}

struct BufferInner {
    size: usize,
    data: Vec<u8>,
    slots: Vec<Slot>,
    started: bool,
    /// Extended sequence of the newest packet
    head_ext: u32,
    /// Next extended sequence to deliver in order
    next_ext: u32,
    nack: NackQueue,
    stats: BufferStats,
    bitrate_window: VecDeque<(u64, u64)>,
    max_temporal: i32,
    sr_rtp_ts: u32,
    sr_ntp_time: u64,
    sr_arrival_ns: u64,
}

pub struct PacketBuffer {
    ssrc: u32,
    mime_type: String,
    clock_rate: u32,
    video: bool,
    inner: Mutex<BufferInner>,
    tx: Mutex<Option<mpsc::Sender<ExtendedPacket>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ExtendedPacket>>,
    closed: AtomicBool,
    audio_level_ext: AtomicU8,
    twcc_ext: AtomicU8,
    on_nack: Mutex<Option<NackSink>>,
    on_twcc: Mutex<Option<TwccSink>>,
    on_audio_level: Mutex<Option<AudioLevelSink>>,
}

impl PacketBuffer {
    pub fn new(ssrc: u32, mime_type: &str, clock_rate: u32, max_track: usize) -> Self {
        let size = max_track.max(1);
        let (tx, rx) = mpsc::channel(DELIVERY_CAPACITY);
        Self {
            ssrc,
            mime_type: mime_type.to_owned(),
            clock_rate,
            video: mime_type.to_lowercase().starts_with("video/"),
            inner: Mutex::new(BufferInner {
                size,
                data: vec![0u8; size * SLOT_STRIDE],
                slots: vec![Slot::default(); size],
                started: false,
                head_ext: 0,
                next_ext: 0,
                nack: NackQueue::new(),
                stats: BufferStats::default(),
                bitrate_window: VecDeque::new(),
                max_temporal: 0,
                sr_rtp_ts: 0,
                sr_ntp_time: 0,
                sr_arrival_ns: 0,
            }),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
            audio_level_ext: AtomicU8::new(0),
            twcc_ext: AtomicU8::new(0),
            on_nack: Mutex::new(None),
            on_twcc: Mutex::new(None),
            on_audio_level: Mutex::new(None),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Negotiated header-extension ids; 0 disables the respective hook.
    pub fn set_extension_ids(&self, audio_level: u8, twcc: u8) {
        self.audio_level_ext.store(audio_level, Ordering::Relaxed);
        self.twcc_ext.store(twcc, Ordering::Relaxed);
    }

    pub fn on_nack(&self, f: NackSink) {
        *self.on_nack.lock() = Some(f);
    }

    pub fn on_transport_wide_cc(&self, f: TwccSink) {
        *self.on_twcc.lock() = Some(f);
    }

    pub fn on_audio_level(&self, f: AudioLevelSink) {
        *self.on_audio_level.lock() = Some(f);
    }

    /// Ingest one raw RTP packet.
    ///
    /// Contiguous packets become deliverable through [`read_extended`];
    /// gaps schedule NACKs; far-newer jumps reset the window.
    pub fn push(&self, raw: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if raw.is_empty() {
            return Err(Error::NilPacket);
        }
        if raw.len() < 12 {
            return Err(Error::ShortPacket);
        }
        let arrival_ns = monotonic_ns();
        let pkt = Packet::unmarshal(&mut &raw[..])?;

        let mut deliverable: Vec<ExtendedPacket> = Vec::new();
        let mut nack_out: Option<(Vec<NackPair>, bool)> = None;

        {
            let mut inner = self.inner.lock();
            let seq = pkt.header.sequence_number;

            let (ext, is_head) = if !inner.started {
                inner.started = true;
                // start with headroom so pre-wrap stragglers do not underflow
                let ext = (1u32 << 16) | u32::from(seq);
                inner.head_ext = ext;
                inner.next_ext = ext;
                (ext, true)
            } else {
                let head_u16 = inner.head_ext as u16;
                if seq_newer(seq, head_u16) {
                    let ext = inner.head_ext + u32::from(seq.wrapping_sub(head_u16));
                    (ext, true)
                } else {
                    let back = u32::from(head_u16.wrapping_sub(seq));
                    (inner.head_ext - back, false)
                }
            };

            if is_head && ext != inner.head_ext {
                let prev_head = inner.head_ext;
                if ext - prev_head >= inner.size as u32 {
                    // publisher jumped far ahead; everything buffered is stale
                    debug!(
                        ssrc = self.ssrc,
                        jump = ext - prev_head,
                        "sequence jump, resetting buffer window"
                    );
                    inner.stats.lost_count += u64::from((ext - inner.next_ext).saturating_sub(1));
                    for slot in inner.slots.iter_mut() {
                        slot.len = 0;
                    }
                    inner.nack = NackQueue::new();
                    inner.next_ext = ext;
                } else {
                    for missing in (prev_head + 1)..ext {
                        if self.video {
                            inner.nack.push(missing);
                        }
                        let idx = missing as usize % inner.size;
                        inner.slots[idx].len = 0;
                    }
                }
                inner.head_ext = ext;
            } else if !is_head {
                if inner.head_ext - ext >= inner.size as u32 {
                    trace!(ssrc = self.ssrc, seq, "packet older than buffer window");
                    return Ok(());
                }
                inner.nack.remove(ext);
            }

            if raw.len() > SLOT_STRIDE {
                debug!(ssrc = self.ssrc, len = raw.len(), "oversized packet dropped");
                return Ok(());
            }
            let size = inner.size;
            let idx = ext as usize % size;
            let base = idx * SLOT_STRIDE;
            inner.data[base..base + raw.len()].copy_from_slice(raw);
            inner.slots[idx] = Slot {
                seq: ext as u16,
                len: raw.len() as u16,
            };

            inner.stats.packet_count += 1;
            inner.stats.byte_count += raw.len() as u64;
            inner.bitrate_window.push_back((arrival_ns, raw.len() as u64));
            prune_window(&mut inner.bitrate_window, arrival_ns);

            if self.video && self.mime_type.eq_ignore_ascii_case("video/vp8") {
                if let Ok(desc) = Vp8Descriptor::parse(&pkt.payload) {
                    if desc.temporal_supported {
                        inner.max_temporal = inner.max_temporal.max(i32::from(desc.tid));
                    }
                }
            }

            // drain the contiguous prefix, skipping gaps the head outran
            loop {
                if inner.next_ext > inner.head_ext {
                    break;
                }
                let idx = inner.next_ext as usize % inner.size;
                let slot = inner.slots[idx];
                if slot.len > 0 && slot.seq == inner.next_ext as u16 {
                    let base = idx * SLOT_STRIDE;
                    let stored = &inner.data[base..base + slot.len as usize];
                    if let Ok(p) = Packet::unmarshal(&mut &stored[..]) {
                        let vp8 = if self.mime_type.eq_ignore_ascii_case("video/vp8") {
                            Vp8Descriptor::parse(&p.payload).ok()
                        } else {
                            None
                        };
                        let keyframe =
                            self.video && is_keyframe(&self.mime_type, &p.payload);
                        deliverable.push(ExtendedPacket {
                            packet: p,
                            arrival_ns,
                            keyframe,
                            head: inner.next_ext == inner.head_ext,
                            vp8,
                        });
                    }
                    inner.next_ext += 1;
                } else if inner.head_ext - inner.next_ext >= REORDER_LIMIT {
                    inner.stats.lost_count += 1;
                    let stale = inner.next_ext;
                    inner.nack.remove(stale);
                    inner.next_ext += 1;
                } else {
                    break;
                }
            }

            if self.video && !inner.nack.is_empty() {
                let head_ext = inner.head_ext;
                let (pairs, kf) = inner.nack.pairs(head_ext, monotonic_ms());
                if !pairs.is_empty() || kf {
                    nack_out = Some((pairs, kf));
                }
            }
        }

        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            for ep in deliverable {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(ep) {
                    debug!(ssrc = self.ssrc, "delivery channel full, dropping packet");
                }
            }
        }

        if let Some((pairs, kf)) = nack_out {
            if let Some(cb) = self.on_nack.lock().as_ref() {
                cb(pairs, kf);
            }
        }

        let al_ext = self.audio_level_ext.load(Ordering::Relaxed);
        if al_ext != 0 && !self.video {
            if let Some(buf) = pkt.header.get_extension(al_ext) {
                if !buf.is_empty() {
                    if let Some(cb) = self.on_audio_level.lock().as_ref() {
                        cb(buf[0] & 0x7F);
                    }
                }
            }
        }

        let tw_ext = self.twcc_ext.load(Ordering::Relaxed);
        if tw_ext != 0 {
            if let Some(buf) = pkt.header.get_extension(tw_ext) {
                if buf.len() >= 2 {
                    let sn = u16::from_be_bytes([buf[0], buf[1]]);
                    if let Some(cb) = self.on_twcc.lock().as_ref() {
                        cb(sn, arrival_ns, pkt.header.marker);
                    }
                }
            }
        }

        Ok(())
    }

    /// Await the next in-order packet. Returns `Closed` once the buffer is
    /// shut down and drained.
    pub async fn read_extended(&self) -> Result<ExtendedPacket> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(Error::Closed)
    }

    /// Raw wire bytes for a sequence still inside the window, for retransmit.
    pub fn get_packet(&self, seq: u16) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        if !inner.started {
            return Err(Error::PacketNotFound);
        }
        let head_u16 = inner.head_ext as u16;
        if seq_newer(seq, head_u16) {
            return Err(Error::PacketNotFound);
        }
        let back = u32::from(head_u16.wrapping_sub(seq));
        if back >= inner.size as u32 {
            return Err(Error::PacketNotFound);
        }
        let ext = inner.head_ext - back;
        let idx = ext as usize % inner.size;
        let slot = inner.slots[idx];
        if slot.len == 0 || slot.seq != seq {
            return Err(Error::PacketNotFound);
        }
        let base = idx * SLOT_STRIDE;
        Ok(inner.data[base..base + slot.len as usize].to_vec())
    }

    /// Smoothed receive bitrate in bits per second.
    pub fn bitrate(&self) -> u64 {
        let mut inner = self.inner.lock();
        let now = monotonic_ns();
        prune_window(&mut inner.bitrate_window, now);
        let bytes: u64 = inner.bitrate_window.iter().map(|(_, b)| b).sum();
        bytes * 8 * 1_000_000_000 / BITRATE_WINDOW_NS
    }

    /// Highest temporal layer observed in the payload descriptors.
    pub fn max_temporal_layer(&self) -> i32 {
        self.inner.lock().max_temporal
    }

    /// Record the publisher's sender report for clock correlation.
    pub fn set_sender_report_data(&self, rtp_ts: u32, ntp_time: u64) {
        let mut inner = self.inner.lock();
        inner.sr_rtp_ts = rtp_ts;
        inner.sr_ntp_time = ntp_time;
        inner.sr_arrival_ns = monotonic_ns();
    }

    /// (rtp timestamp, ntp time, local arrival ns) of the last sender report.
    pub fn get_sender_report_data(&self) -> (u32, u64, u64) {
        let inner = self.inner.lock();
        (inner.sr_rtp_ts, inner.sr_ntp_time, inner.sr_arrival_ns)
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats
    }

    /// Idempotent; wakes `read_extended` with `Closed` once drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.tx.lock().take();
        }
    }
}

fn prune_window(window: &mut VecDeque<(u64, u64)>, now_ns: u64) {
    let cutoff = now_ns.saturating_sub(BITRATE_WINDOW_NS);
    while let Some(&(t, _)) = window.front() {
        if t < cutoff {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use webrtc::rtp::header::Header;
    use webrtc::util::marshal::Marshal;

    fn raw_packet(seq: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
        let pkt = Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 1234,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        };
        pkt.marshal().unwrap().to_vec()
    }

    fn video_buffer() -> PacketBuffer {
        PacketBuffer::new(1234, "video/VP8", 90000, 500)
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let b = video_buffer();
        for seq in [10u16, 11, 12] {
            b.push(&raw_packet(seq, 1000, &[0x10, 0x01, 0x02])).unwrap();
        }
        for expected in [10u16, 11, 12] {
            let ep = b.read_extended().await.unwrap();
            assert_eq!(ep.packet.header.sequence_number, expected);
        }
    }

    #[tokio::test]
    async fn reorders_within_window() {
        let b = video_buffer();
        b.push(&raw_packet(10, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(12, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(11, 0, &[0x10, 0x01])).unwrap();
        let seqs: Vec<u16> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(b.read_extended().await.unwrap().packet.header.sequence_number);
            }
            v
        };
        assert_eq!(seqs, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn wrap_preserves_ordering() {
        let b = video_buffer();
        b.push(&raw_packet(65534, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(65535, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(0, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(1, 0, &[0x10, 0x01])).unwrap();
        let mut seqs = Vec::new();
        for _ in 0..4 {
            seqs.push(b.read_extended().await.unwrap().packet.header.sequence_number);
        }
        assert_eq!(seqs, vec![65534, 65535, 0, 1]);
    }

    #[test]
    fn gap_schedules_nack() {
        let b = video_buffer();
        let captured: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        b.on_nack(Box::new(move |pairs, _| {
            let mut list = sink.lock();
            for p in pairs {
                list.extend(p.into_iter());
            }
        }));
        b.push(&raw_packet(100, 0, &[0x10, 0x01])).unwrap();
        b.push(&raw_packet(105, 0, &[0x10, 0x01])).unwrap();
        let seqs = captured.lock().clone();
        // 104 is still inside the reorder hold-off (head must be seq+2)
        assert_eq!(seqs, vec![101, 102, 103]);
    }

    #[test]
    fn get_packet_round_trip() {
        let b = video_buffer();
        let raw = raw_packet(42, 7, &[0x10, 0x01, 0xAA]);
        b.push(&raw).unwrap();
        assert_eq!(b.get_packet(42).unwrap(), raw);
        assert!(matches!(b.get_packet(43), Err(Error::PacketNotFound)));
    }

    #[test]
    fn short_and_nil_packets_rejected() {
        let b = video_buffer();
        assert!(matches!(b.push(&[]), Err(Error::NilPacket)));
        assert!(matches!(b.push(&[0x80, 0x60]), Err(Error::ShortPacket)));
    }

    #[test]
    fn tracks_max_temporal_layer() {
        let b = video_buffer();
        // X+T extension, tid 2
        b.push(&raw_packet(1, 0, &[0x80, 0x20, 0x80, 0x01]))
            .unwrap();
        assert_eq!(b.max_temporal_layer(), 2);
    }

    #[test]
    fn sender_report_data_round_trip() {
        let b = video_buffer();
        b.set_sender_report_data(90_000, 0xABCD_EF01_2345_6789);
        let (rtp, ntp, arrival) = b.get_sender_report_data();
        assert_eq!(rtp, 90_000);
        assert_eq!(ntp, 0xABCD_EF01_2345_6789);
        assert!(arrival > 0);
    }

    #[tokio::test]
    async fn close_wakes_reader() {
        let b = Arc::new(video_buffer());
        b.push(&raw_packet(5, 0, &[0x10, 0x01])).unwrap();
        b.close();
        assert!(b.read_extended().await.is_ok());
        assert!(matches!(b.read_extended().await, Err(Error::Closed)));
        assert!(matches!(
            b.push(&raw_packet(6, 0, &[0x10, 0x01])),
            Err(Error::Closed)
        ));
    }
}
