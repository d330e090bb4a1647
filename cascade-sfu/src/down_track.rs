//! Per-subscriber outbound track.
//!
//! A `DownTrack` owns the subscriber-facing copy of one published track. It
//! rewrites sequence numbers, timestamps and SSRC into a continuous outbound
//! stream, gates simulcast packets by the subscriber's current layer, rebases
//! VP8 scalability fields across layer switches, and answers subscriber RTCP.

use std::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use webrtc::rtcp::payload_feedbacks::full_intra_request::{FirEntry, FullIntraRequest};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtcp::receiver_report::ReceiverReport;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::source_description::{
    SdesType, SourceDescriptionChunk, SourceDescriptionItem,
};
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocalWriter;

use crate::buffer::ExtendedPacket;
use crate::codec::fuzzy_match_codec;
use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::sequencer::{PacketMeta, Sequencer};
use crate::simulcast::{
    decide_layer_change, rebase_picture_id, rebase_tl0_idx, LayerAction, LayerChangeContext,
    SimulcastTrackHelpers,
};
use crate::types::RtcpBatch;
use crate::util::{monotonic_ms, monotonic_ns, to_ntp_time};
use crate::vp8::Vp8Descriptor;

/// Behavioral shape of a downtrack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTrackType {
    /// Audio or single-encoding video: one upstream SSRC, pass-through layers
    Simple,
    /// Simulcast video: three candidate encodings, one forwarded at a time
    Simulcast,
}

/// Everything the transport hands over when a downtrack is attached.
pub struct DownTrackContext {
    /// Codecs negotiated with the subscriber
    pub codecs: Vec<RTCRtpCodecParameters>,
    /// SSRC assigned to this outbound stream
    pub ssrc: u32,
    /// Transceiver identifier, reported in SDES
    pub mid: String,
    /// Outbound RTP sink
    pub write_stream: Arc<dyn TrackLocalWriter + Send + Sync>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DownTrackStats {
    pub packets_sent: u32,
    pub octets_sent: u32,
    /// Worst fraction lost the subscriber reported (out of 255)
    pub fraction_lost: u8,
}

type Callback = Box<dyn Fn() + Send + Sync>;
type LayerCallback = Box<dyn Fn(i32) + Send + Sync>;

pub struct DownTrack {
    id: String,
    peer_id: String,
    stream_id: String,
    codec: RTCRtpCodecCapability,
    kind: RTPCodecType,
    max_track: usize,
    enable_temporal: bool,

    track_type: AtomicU8,
    payload_type: AtomicU8,
    ssrc: AtomicU32,
    mid: RwLock<String>,

    bound: AtomicBool,
    enabled: AtomicBool,
    re_sync: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,

    sn_offset: AtomicU16,
    ts_offset: AtomicU32,
    last_sn: AtomicU16,
    last_ts: AtomicU32,
    last_ssrc: AtomicU32,

    octet_count: AtomicU32,
    packet_count: AtomicU32,
    max_loss: AtomicU8,
    min_remb: AtomicU64,

    current_spatial: AtomicI32,
    target_spatial: AtomicI32,
    /// current | target << 16
    temporal: AtomicI32,
    max_spatial: AtomicI32,
    max_temporal: AtomicI32,

    sequencer: Mutex<Option<Sequencer>>,
    simulcast: Mutex<SimulcastTrackHelpers>,

    receiver: Weak<Receiver>,
    write_stream: RwLock<Option<Arc<dyn TrackLocalWriter + Send + Sync>>>,

    on_close: Mutex<Option<Callback>>,
    on_bind: Mutex<Option<Callback>>,
    on_spatial_change: Mutex<Option<LayerCallback>>,
}

impl DownTrack {
    pub fn new(
        id: String,
        peer_id: String,
        stream_id: String,
        codec: RTCRtpCodecCapability,
        kind: RTPCodecType,
        receiver: Weak<Receiver>,
        max_track: usize,
        enable_temporal: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            peer_id,
            stream_id,
            codec,
            kind,
            max_track,
            enable_temporal,
            track_type: AtomicU8::new(0),
            payload_type: AtomicU8::new(0),
            ssrc: AtomicU32::new(0),
            mid: RwLock::new(String::new()),
            bound: AtomicBool::new(false),
            enabled: AtomicBool::new(true),
            re_sync: AtomicBool::new(kind == RTPCodecType::Video),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sn_offset: AtomicU16::new(0),
            ts_offset: AtomicU32::new(0),
            last_sn: AtomicU16::new(0),
            last_ts: AtomicU32::new(0),
            last_ssrc: AtomicU32::new(0),
            octet_count: AtomicU32::new(0),
            packet_count: AtomicU32::new(0),
            max_loss: AtomicU8::new(0),
            min_remb: AtomicU64::new(0),
            current_spatial: AtomicI32::new(0),
            target_spatial: AtomicI32::new(0),
            temporal: AtomicI32::new(0),
            max_spatial: AtomicI32::new(0),
            max_temporal: AtomicI32::new(0),
            sequencer: Mutex::new(None),
            simulcast: Mutex::new(SimulcastTrackHelpers::default()),
            receiver,
            write_stream: RwLock::new(None),
            on_close: Mutex::new(None),
            on_bind: Mutex::new(None),
            on_spatial_change: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type.load(Ordering::Relaxed)
    }

    pub fn mime_type(&self) -> &str {
        &self.codec.mime_type
    }

    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn track_type(&self) -> DownTrackType {
        if self.track_type.load(Ordering::Relaxed) == 1 {
            DownTrackType::Simulcast
        } else {
            DownTrackType::Simple
        }
    }

    pub(crate) fn set_track_type(&self, t: DownTrackType) {
        let v = match t {
            DownTrackType::Simple => 0,
            DownTrackType::Simulcast => 1,
        };
        self.track_type.store(v, Ordering::Relaxed);
    }

    pub fn on_close(&self, f: Callback) {
        *self.on_close.lock() = Some(f);
    }

    pub fn on_bind(&self, f: Callback) {
        *self.on_bind.lock() = Some(f);
    }

    /// Invoked with the new layer whenever a spatial switch completes.
    pub fn on_spatial_layer_change(&self, f: LayerCallback) {
        *self.on_spatial_change.lock() = Some(f);
    }

    /// Attach the subscriber transport. Resolves the codec against what the
    /// transport negotiated and arms the sequencer for video tracks.
    pub fn bind(&self, ctx: DownTrackContext) -> Result<RTCRtpCodecParameters> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let needle = RTCRtpCodecParameters {
            capability: self.codec.clone(),
            ..Default::default()
        };
        let matched = fuzzy_match_codec(&needle, &ctx.codecs)?;

        self.ssrc.store(ctx.ssrc, Ordering::Relaxed);
        self.payload_type
            .store(matched.payload_type, Ordering::Relaxed);
        *self.mid.write() = ctx.mid;
        *self.write_stream.write() = Some(ctx.write_stream);
        if self.kind == RTPCodecType::Video {
            *self.sequencer.lock() = Some(Sequencer::new(self.max_track));
        }
        self.bound.store(true, Ordering::Release);

        if let Some(f) = self.on_bind.lock().as_ref() {
            f();
        }
        debug!(
            track_id = %self.id,
            peer_id = %self.peer_id,
            ssrc = ctx.ssrc,
            payload_type = matched.payload_type,
            "downtrack bound"
        );
        Ok(matched)
    }

    pub fn unbind(&self) {
        self.bound.store(false, Ordering::Release);
    }

    /// Muting stops forwarding; unmuting waits for the next keyframe.
    pub fn mute(&self, muted: bool) {
        if self.enabled.swap(!muted, Ordering::AcqRel) == !muted {
            return;
        }
        if self.kind == RTPCodecType::Video {
            self.re_sync.store(true, Ordering::Release);
        }
    }

    /// Idempotent close; detaches from the receiver via the close handler.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.bound.store(false, Ordering::Release);
        if let Some(f) = self.on_close.lock().take() {
            f();
        }
        debug!(track_id = %self.id, peer_id = %self.peer_id, "downtrack closed");
    }

    pub fn stats(&self) -> DownTrackStats {
        DownTrackStats {
            packets_sent: self.packet_count.load(Ordering::Relaxed),
            octets_sent: self.octet_count.load(Ordering::Relaxed),
            fraction_lost: self.max_loss.load(Ordering::Relaxed),
        }
    }

    pub fn current_spatial_layer(&self) -> i32 {
        self.current_spatial.load(Ordering::Relaxed)
    }

    pub fn target_spatial_layer(&self) -> i32 {
        self.target_spatial.load(Ordering::Relaxed)
    }

    pub fn max_spatial_layer(&self) -> i32 {
        self.max_spatial.load(Ordering::Relaxed)
    }

    pub fn fraction_lost(&self) -> u8 {
        self.max_loss.load(Ordering::Relaxed)
    }

    /// Smallest REMB estimate the subscriber reported, 0 when none arrived.
    pub fn remb_bitrate(&self) -> u64 {
        self.min_remb.load(Ordering::Relaxed)
    }

    /// Live per-layer receive bitrates of the owning receiver.
    pub fn receiver_bitrates(&self) -> [u64; 3] {
        self.receiver
            .upgrade()
            .map(|rx| rx.get_bitrate())
            .unwrap_or([0; 3])
    }

    /// (current, target) temporal layers.
    pub fn temporal_layers(&self) -> (i32, i32) {
        let t = self.temporal.load(Ordering::Relaxed);
        (t & 0xFFFF, t >> 16)
    }

    pub fn set_target_temporal_layer(&self, target: i32) {
        let (current, _) = self.temporal_layers();
        self.temporal
            .store(current | (target << 16), Ordering::Relaxed);
    }

    fn latch_temporal(&self, target: i32) {
        self.temporal
            .store(target | (target << 16), Ordering::Relaxed);
    }

    pub fn set_max_spatial_layer(&self, layer: i32) {
        self.max_spatial.store(layer, Ordering::Relaxed);
    }

    pub fn set_max_temporal_layer(&self, layer: i32) {
        self.max_temporal.store(layer, Ordering::Relaxed);
    }

    pub(crate) fn set_initial_layers(&self, spatial: i32, temporal: i32) {
        self.current_spatial.store(spatial, Ordering::Relaxed);
        self.target_spatial.store(spatial, Ordering::Relaxed);
        self.temporal
            .store(temporal | (temporal << 16), Ordering::Relaxed);
    }

    /// Queue a switch to another simulcast encoding. The switch completes on
    /// the next keyframe the receiver observes on the target layer.
    pub fn switch_spatial_layer(
        self: &Arc<Self>,
        target_layer: i32,
        set_as_max: bool,
    ) -> Result<()> {
        if self.track_type() != DownTrackType::Simulcast {
            return Err(Error::SpatialNotSupported);
        }
        let rx = self.receiver.upgrade().ok_or(Error::Closed)?;
        let current = self.current_spatial_layer();
        if target_layer == current || self.target_spatial_layer() != current {
            return Err(Error::SpatialLayerBusy);
        }
        rx.switch_down_track(self, target_layer as usize)?;
        self.target_spatial.store(target_layer, Ordering::Relaxed);
        if set_as_max {
            self.max_spatial.store(target_layer, Ordering::Relaxed);
        }
        // the encoder only produces a switch point on request
        if let Some(ssrc) = rx.ssrc(target_layer as usize) {
            rx.send_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: self.ssrc(),
                media_ssrc: ssrc,
            })]);
        }
        Ok(())
    }

    /// Receiver-side completion of a queued switch; offsets re-base on the
    /// first packet written from the new encoding.
    pub(crate) fn switch_spatial_layer_done(&self, layer: i32) {
        self.current_spatial.store(layer, Ordering::Relaxed);
        self.target_spatial.store(layer, Ordering::Relaxed);
        if let Some(f) = self.on_spatial_change.lock().as_ref() {
            f(layer);
        }
    }

    /// Forward one packet delivered on `layer`.
    pub async fn write_rtp(self: &Arc<Self>, pkt: &ExtendedPacket, layer: usize) -> Result<()> {
        if !self.enabled() || !self.is_bound() {
            return Ok(());
        }
        match self.track_type() {
            DownTrackType::Simple => self.write_simple(pkt).await,
            DownTrackType::Simulcast => self.write_simulcast(pkt, layer).await,
        }
    }

    async fn write_simple(self: &Arc<Self>, pkt: &ExtendedPacket) -> Result<()> {
        let seq = pkt.packet.header.sequence_number;
        let ts = pkt.packet.header.timestamp;

        if self.re_sync.load(Ordering::Acquire) {
            if self.kind == RTPCodecType::Video && !pkt.keyframe {
                self.request_keyframe(pkt.packet.header.ssrc);
                return Ok(());
            }
            if self.started.load(Ordering::Acquire) {
                let last_sn = self.last_sn.load(Ordering::Relaxed);
                self.sn_offset
                    .store(seq.wrapping_sub(last_sn).wrapping_sub(1), Ordering::Relaxed);
            }
            self.re_sync.store(false, Ordering::Release);
        }

        let new_sn = seq.wrapping_sub(self.sn_offset.load(Ordering::Relaxed));
        if let Some(seqr) = self.sequencer.lock().as_ref() {
            seqr.push(seq, new_sn, ts, 0, pkt.head, None);
        }

        let mut header = pkt.packet.header.clone();
        header.payload_type = self.payload_type();
        header.ssrc = self.ssrc();
        header.sequence_number = new_sn;

        self.finish_write(new_sn, ts, pkt.packet.header.ssrc, pkt.arrival_ns);
        self.send(Packet {
            header,
            payload: pkt.packet.payload.clone(),
        })
        .await
    }

    async fn write_simulcast(self: &Arc<Self>, pkt: &ExtendedPacket, layer: usize) -> Result<()> {
        if self.current_spatial_layer() != layer as i32 {
            // another encoding's copy is authoritative right now
            return Ok(());
        }
        let seq = pkt.packet.header.sequence_number;
        let ts = pkt.packet.header.timestamp;
        let in_ssrc = pkt.packet.header.ssrc;
        let started = self.started.load(Ordering::Acquire);
        let re_sync = self.re_sync.load(Ordering::Acquire);
        let last_ssrc = self.last_ssrc.load(Ordering::Relaxed);

        let mut payload = pkt.packet.payload.clone();
        let mut vp8_meta: Option<(u16, u8)> = None;

        {
            let mut sim = self.simulcast.lock();
            if let Some(d) = pkt.vp8 {
                if d.temporal_supported {
                    sim.temporal_supported = true;
                }
            }

            if re_sync || last_ssrc != in_ssrc || !started {
                if re_sync && !pkt.keyframe {
                    drop(sim);
                    self.request_keyframe(in_ssrc);
                    return Ok(());
                }
                if started && last_ssrc != in_ssrc && sim.last_ts_calc_ns != 0 {
                    if sim.temporal_supported {
                        if let Some(d) = pkt.vp8 {
                            sim.p_ref_pic_id = sim.l_pic_id;
                            sim.ref_pic_id = d.picture_id;
                            sim.p_ref_tlz_idx = sim.l_tlz_idx;
                            sim.ref_tlz_idx = d.tl0_pic_idx;
                        }
                    }
                    let elapsed_ns = pkt.arrival_ns.saturating_sub(sim.last_ts_calc_ns);
                    let td = ((u128::from(elapsed_ns) * u128::from(self.codec.clock_rate))
                        / 1_000_000_000) as u32;
                    let td = td.max(1);
                    let last_ts = self.last_ts.load(Ordering::Relaxed);
                    self.ts_offset
                        .store(ts.wrapping_sub(last_ts.wrapping_add(td)), Ordering::Relaxed);
                    let last_sn = self.last_sn.load(Ordering::Relaxed);
                    self.sn_offset
                        .store(seq.wrapping_sub(last_sn).wrapping_sub(1), Ordering::Relaxed);
                } else if !started {
                    // first packet passes through unadjusted
                    if let Some(d) = pkt.vp8 {
                        sim.ref_pic_id = d.picture_id;
                        sim.p_ref_pic_id = d.picture_id.wrapping_sub(1);
                        sim.ref_tlz_idx = d.tl0_pic_idx;
                        sim.p_ref_tlz_idx = d.tl0_pic_idx.wrapping_sub(1);
                    }
                    self.sn_offset.store(0, Ordering::Relaxed);
                    self.ts_offset.store(0, Ordering::Relaxed);
                }
                self.re_sync.store(false, Ordering::Release);
            }

            if self.enable_temporal && sim.temporal_supported {
                if let Some(d) = pkt.vp8 {
                    let (mut current, target) = self.temporal_layers();
                    if current != target && i32::from(d.tid) <= target {
                        self.latch_temporal(target);
                        current = target;
                    }
                    if i32::from(d.tid) > current {
                        // filtered packets must not leave gaps downstream
                        let off = self.sn_offset.load(Ordering::Relaxed);
                        self.sn_offset.store(off.wrapping_add(1), Ordering::Relaxed);
                        return Ok(());
                    }
                    let pic = rebase_picture_id(d.picture_id, sim.ref_pic_id, sim.p_ref_pic_id);
                    let tlz = rebase_tl0_idx(d.tl0_pic_idx, sim.ref_tlz_idx, sim.p_ref_tlz_idx);
                    sim.l_pic_id = pic;
                    sim.l_tlz_idx = tlz;
                    let mut buf = BytesMut::from(&payload[..]);
                    d.rewrite(&mut buf, pic, tlz);
                    payload = buf.freeze();
                    vp8_meta = Some((pic, tlz));
                }
            }
        }

        let new_sn = seq.wrapping_sub(self.sn_offset.load(Ordering::Relaxed));
        let new_ts = ts.wrapping_sub(self.ts_offset.load(Ordering::Relaxed));
        if let Some(seqr) = self.sequencer.lock().as_ref() {
            seqr.push(seq, new_sn, new_ts, layer as u8, pkt.head, vp8_meta);
        }

        let mut header = pkt.packet.header.clone();
        header.payload_type = self.payload_type();
        header.ssrc = self.ssrc();
        header.sequence_number = new_sn;
        header.timestamp = new_ts;

        self.finish_write(new_sn, new_ts, in_ssrc, pkt.arrival_ns);
        self.send(Packet { header, payload }).await
    }

    fn finish_write(&self, sn: u16, ts: u32, in_ssrc: u32, arrival_ns: u64) {
        self.last_sn.store(sn, Ordering::Relaxed);
        self.last_ts.store(ts, Ordering::Relaxed);
        self.last_ssrc.store(in_ssrc, Ordering::Relaxed);
        self.started.store(true, Ordering::Release);
        self.simulcast.lock().last_ts_calc_ns = arrival_ns;
    }

    async fn send(&self, packet: Packet) -> Result<()> {
        let stream = self.write_stream.read().clone();
        let Some(stream) = stream else {
            return Err(Error::Closed);
        };
        self.octet_count
            .fetch_add(packet.payload.len() as u32, Ordering::Relaxed);
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        stream.write_rtp(&packet).await.map_err(Error::WebRTC)?;
        Ok(())
    }

    /// Replay a buffered packet with this track's identity.
    pub(crate) async fn write_retransmit(&self, meta: &PacketMeta, raw: &[u8]) -> Result<()> {
        use webrtc::util::marshal::Unmarshal;
        if !self.enabled() || !self.is_bound() {
            return Ok(());
        }
        let mut packet = Packet::unmarshal(&mut &raw[..])?;
        packet.header.ssrc = self.ssrc();
        packet.header.payload_type = self.payload_type();
        packet.header.sequence_number = meta.target_seq;
        packet.header.timestamp = meta.timestamp;
        if meta.has_vp8 {
            if let Ok(desc) = Vp8Descriptor::parse(&packet.payload) {
                let mut buf = BytesMut::from(&packet.payload[..]);
                desc.rewrite(&mut buf, meta.picture_id, meta.tl0_pic_idx);
                packet.payload = buf.freeze();
            }
        }
        self.send(packet).await
    }

    fn request_keyframe(&self, media_ssrc: u32) {
        if let Some(rx) = self.receiver.upgrade() {
            rx.send_rtcp(vec![Box::new(PictureLossIndication {
                sender_ssrc: self.ssrc(),
                media_ssrc,
            })]);
        }
    }

    /// Process an RTCP batch the subscriber sent for this track.
    pub fn handle_rtcp(self: &Arc<Self>, packets: &RtcpBatch) {
        if !self.is_bound() {
            return;
        }
        let Some(rx) = self.receiver.upgrade() else {
            return;
        };

        let mut forward: RtcpBatch = Vec::new();
        let mut pli_seen = false;
        let mut fir_seen = false;
        let mut max_loss: u8 = 0;
        let mut has_rr = false;
        let mut min_bitrate: u64 = 0;
        let mut nack_seqs: Vec<u16> = Vec::new();
        let last_ssrc = self.last_ssrc.load(Ordering::Relaxed);

        for p in packets {
            let any = p.as_any();
            if any.downcast_ref::<PictureLossIndication>().is_some() {
                if !pli_seen && self.enabled() {
                    pli_seen = true;
                    forward.push(Box::new(PictureLossIndication {
                        sender_ssrc: self.ssrc(),
                        media_ssrc: last_ssrc,
                    }));
                }
            } else if let Some(fir) = any.downcast_ref::<FullIntraRequest>() {
                if !fir_seen && self.enabled() {
                    fir_seen = true;
                    forward.push(Box::new(FullIntraRequest {
                        sender_ssrc: self.ssrc(),
                        media_ssrc: last_ssrc,
                        fir: vec![FirEntry {
                            ssrc: last_ssrc,
                            sequence_number: fir
                                .fir
                                .first()
                                .map(|e| e.sequence_number)
                                .unwrap_or_default(),
                        }],
                    }));
                }
            } else if let Some(rr) = any.downcast_ref::<ReceiverReport>() {
                for report in &rr.reports {
                    if report.fraction_lost > max_loss {
                        max_loss = report.fraction_lost;
                    }
                }
                has_rr = true;
            } else if let Some(remb) = any.downcast_ref::<ReceiverEstimatedMaximumBitrate>() {
                let bitrate = remb.bitrate as u64;
                if min_bitrate == 0 || bitrate < min_bitrate {
                    min_bitrate = bitrate;
                }
            } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
                for pair in &nack.nacks {
                    nack_seqs.extend((*pair).into_iter());
                }
            }
        }

        if has_rr {
            self.max_loss.store(max_loss, Ordering::Relaxed);
        }
        if min_bitrate > 0 {
            self.min_remb.store(min_bitrate, Ordering::Relaxed);
        }

        if !nack_seqs.is_empty() {
            let metas = self
                .sequencer
                .lock()
                .as_ref()
                .map(|s| s.get_seq_pairs(&nack_seqs))
                .unwrap_or_default();
            if !metas.is_empty() {
                if let Err(err) = rx.retransmit_packets(self.clone(), metas) {
                    debug!(track_id = %self.id, error = %err, "retransmit request dropped");
                }
            }
        }

        if !forward.is_empty() {
            rx.send_rtcp(forward);
        }

        if self.track_type() == DownTrackType::Simulcast && (has_rr || min_bitrate > 0) {
            self.handle_layer_feedback(&rx, max_loss, min_bitrate);
        }
    }

    fn handle_layer_feedback(self: &Arc<Self>, rx: &Arc<Receiver>, loss: u8, estimate: u64) {
        let now = monotonic_ms();
        if now < self.simulcast.lock().switch_delay_until_ms {
            return;
        }
        let current_spatial = self.current_spatial_layer();
        let (current_temporal, target_temporal) = self.temporal_layers();
        if current_spatial != self.target_spatial_layer() || current_temporal != target_temporal {
            return;
        }

        let ctx = LayerChangeContext {
            current_spatial,
            target_spatial: self.target_spatial_layer(),
            current_temporal,
            target_temporal,
            max_spatial: self.max_spatial.load(Ordering::Relaxed),
            max_temporal: self.max_temporal.load(Ordering::Relaxed),
            bitrates: rx.get_bitrate(),
            max_temporal_per_layer: rx.get_max_temporal_layer(),
            estimate,
            loss,
        };
        let Some((action, cooldown_ms)) = decide_layer_change(&ctx) else {
            return;
        };

        let applied = match action {
            LayerAction::RaiseTemporal(t) | LayerAction::LowerTemporal(t) => {
                trace!(track_id = %self.id, target = t, "temporal layer change");
                self.set_target_temporal_layer(t);
                true
            }
            LayerAction::RaiseSpatial(l) | LayerAction::LowerSpatial(l) => {
                match self.switch_spatial_layer(l, false) {
                    Ok(()) => {
                        if matches!(action, LayerAction::RaiseSpatial(_)) {
                            self.set_target_temporal_layer(0);
                        }
                        true
                    }
                    Err(err) => {
                        debug!(track_id = %self.id, target = l, error = %err, "spatial change rejected");
                        false
                    }
                }
            }
        };
        if applied {
            self.simulcast.lock().switch_delay_until_ms = now + cooldown_ms;
        }
    }

    /// Build the periodic sender report, extrapolating the publisher clock
    /// from its last SR on the layer this track currently forwards.
    pub fn create_sender_report(&self) -> Option<SenderReport> {
        if !self.is_bound() {
            return None;
        }
        let rx = self.receiver.upgrade()?;
        let layer = self.current_spatial_layer().max(0) as usize;
        let (sr_rtp, sr_ntp, sr_arrival_ns) = rx.get_sender_report_data(layer)?;
        if sr_ntp == 0 {
            return None;
        }
        let elapsed_ns = monotonic_ns().saturating_sub(sr_arrival_ns);
        let advance =
            ((u128::from(elapsed_ns) * u128::from(self.codec.clock_rate)) / 1_000_000_000) as u32;
        let rtp_time = sr_rtp
            .wrapping_add(advance)
            .wrapping_sub(self.ts_offset.load(Ordering::Relaxed));
        Some(SenderReport {
            ssrc: self.ssrc(),
            ntp_time: to_ntp_time(Utc::now()),
            rtp_time,
            packet_count: self.packet_count.load(Ordering::Relaxed),
            octet_count: self.octet_count.load(Ordering::Relaxed),
            ..Default::default()
        })
    }

    /// CNAME plus transceiver-mid description chunks for compound reports.
    pub fn create_sdes_chunks(&self) -> Option<Vec<SourceDescriptionChunk>> {
        if !self.is_bound() {
            return None;
        }
        let mid = self.mid.read().clone();
        if mid.is_empty() {
            warn!(track_id = %self.id, "bound downtrack without a mid");
        }
        Some(vec![
            SourceDescriptionChunk {
                source: self.ssrc(),
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesCname,
                    text: self.stream_id.clone().into(),
                }],
            },
            SourceDescriptionChunk {
                source: self.ssrc(),
                items: vec![SourceDescriptionItem {
                    sdes_type: SdesType::SdesPrivate,
                    text: mid.into(),
                }],
            },
        ])
    }
}

impl std::fmt::Debug for DownTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownTrack")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("ssrc", &self.ssrc())
            .field("bound", &self.is_bound())
            .finish()
    }
}
