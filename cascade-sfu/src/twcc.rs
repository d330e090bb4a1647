//! Transport-wide congestion control feedback.
//!
//! Arrival times for packets carrying the transport-cc header extension are
//! accumulated per publisher and periodically folded into a
//! `TransportLayerCc` feedback packet (reference time in 64 ms units, receive
//! deltas in 250 µs units) addressed back to the publisher.

use webrtc::rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, StatusVectorChunk,
    SymbolSizeTypeTcc, SymbolTypeTcc, TransportLayerCc,
};

/// Delta resolution of the feedback format.
const DELTA_SCALE_US: i64 = 250;
/// One-byte deltas cover [0, 255] * 250 µs.
const MAX_SMALL_DELTA_US: i64 = 255 * DELTA_SCALE_US;
/// Feedback is built once at least this many samples are pending.
const MIN_PENDING_SAMPLES: usize = 20;
/// Runs of identical symbols at least this long use a run-length chunk.
const MIN_RUN_LENGTH: usize = 7;

#[derive(Debug, Clone, Copy)]
struct RecvInfo {
    ext_tsn: u32,
    arrival_us: i64,
}

/// Per-publisher TWCC responder. Not internally synchronized; the owner
/// serializes access.
pub struct Responder {
    sender_ssrc: u32,
    media_ssrc: u32,
    ext_info: Vec<RecvInfo>,
    cycles: u32,
    last_ext_sn: u32,
    started: bool,
    last_report_us: i64,
    feedback_interval_us: i64,
    fb_pkt_count: u8,
}

impl Responder {
    pub fn new(sender_ssrc: u32, feedback_interval_ms: u64) -> Self {
        Self {
            sender_ssrc,
            media_ssrc: 0,
            ext_info: Vec::new(),
            cycles: 0,
            last_ext_sn: 0,
            started: false,
            last_report_us: 0,
            feedback_interval_us: feedback_interval_ms as i64 * 1000,
            fb_pkt_count: 0,
        }
    }

    /// Transport-wide feedback nominally targets one media SSRC; the first
    /// stream of the publisher wins.
    pub fn set_media_ssrc(&mut self, ssrc: u32) {
        if self.media_ssrc == 0 {
            self.media_ssrc = ssrc;
        }
    }

    /// Record one arrival. Returns a feedback packet when enough samples are
    /// pending and either the interval elapsed or a frame boundary (marker)
    /// was crossed.
    pub fn record(&mut self, sn: u16, arrival_ns: u64, marker: bool) -> Option<TransportLayerCc> {
        let arrival_us = (arrival_ns / 1000) as i64;

        if !self.started {
            self.started = true;
            self.last_ext_sn = u32::from(sn);
            self.last_report_us = arrival_us;
        } else {
            // detect u16 wrap on the transport-wide counter
            if sn < 0x0FFF && (self.last_ext_sn & 0xFFFF) > 0xF000 {
                self.cycles += 1 << 16;
            }
        }
        let ext_tsn = self.cycles | u32::from(sn);
        if ext_tsn > self.last_ext_sn {
            self.last_ext_sn = ext_tsn;
        }
        self.ext_info.push(RecvInfo { ext_tsn, arrival_us });

        if self.media_ssrc != 0
            && self.ext_info.len() > MIN_PENDING_SAMPLES
            && (marker || arrival_us - self.last_report_us >= self.feedback_interval_us)
        {
            self.last_report_us = arrival_us;
            return self.build();
        }
        None
    }

    fn build(&mut self) -> Option<TransportLayerCc> {
        if self.ext_info.is_empty() {
            return None;
        }
        let mut info = std::mem::take(&mut self.ext_info);
        info.sort_by_key(|i| i.ext_tsn);
        info.dedup_by_key(|i| i.ext_tsn);

        let first = info[0];
        let last_tsn = info[info.len() - 1].ext_tsn;
        if last_tsn - first.ext_tsn >= 0x8000 {
            // the span cannot be expressed in one feedback; drop the window
            return None;
        }
        let reference_time = (first.arrival_us / 64_000) as u32;
        let mut last_arrival_us = reference_time as i64 * 64_000;

        let mut symbols: Vec<SymbolTypeTcc> = Vec::new();
        let mut recv_deltas: Vec<RecvDelta> = Vec::new();
        let mut next = info.iter().peekable();

        for tsn in first.ext_tsn..=last_tsn {
            let received = match next.peek() {
                Some(i) if i.ext_tsn == tsn => {
                    let i = **i;
                    next.next();
                    Some(i)
                }
                _ => None,
            };
            match received {
                Some(i) => {
                    let delta_us = i.arrival_us - last_arrival_us;
                    let scaled = (delta_us / DELTA_SCALE_US) * DELTA_SCALE_US;
                    let symbol = if (0..=MAX_SMALL_DELTA_US).contains(&scaled) {
                        SymbolTypeTcc::PacketReceivedSmallDelta
                    } else {
                        SymbolTypeTcc::PacketReceivedLargeDelta
                    };
                    symbols.push(symbol);
                    recv_deltas.push(RecvDelta {
                        type_tcc_packet: symbol,
                        delta: scaled,
                    });
                    last_arrival_us += scaled;
                }
                None => symbols.push(SymbolTypeTcc::PacketNotReceived),
            }
        }

        let packet_chunks = chunk_symbols(&symbols);
        let fb_pkt_count = self.fb_pkt_count;
        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);

        Some(TransportLayerCc {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            base_sequence_number: first.ext_tsn as u16,
            packet_status_count: (last_tsn - first.ext_tsn + 1) as u16,
            reference_time,
            fb_pkt_count,
            packet_chunks,
            recv_deltas,
        })
    }
}

fn chunk_symbols(symbols: &[SymbolTypeTcc]) -> Vec<PacketStatusChunk> {
    let mut chunks = Vec::new();
    let mut idx = 0usize;
    while idx < symbols.len() {
        let run = symbols[idx..]
            .iter()
            .take_while(|&&s| s == symbols[idx])
            .count();
        if run >= MIN_RUN_LENGTH {
            let run = run.min(8191);
            chunks.push(PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                packet_status_symbol: symbols[idx],
                run_length: run as u16,
            }));
            idx += run;
        } else {
            let take = symbols.len().saturating_sub(idx).min(7);
            chunks.push(PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
                symbol_size: SymbolSizeTypeTcc::TwoBit,
                symbol_list: symbols[idx..idx + take].to_vec(),
            }));
            idx += take;
        }
    }
    chunks
}
