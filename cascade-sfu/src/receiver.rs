//! Layer-aware receiver for one published track.
//!
//! A `Receiver` owns up to three spatial encodings of a publisher track
//! (simulcast) or a single encoding (audio, plain video). Each encoding gets
//! an ingest task (transport → buffer) and a dispatch task (buffer →
//! downtracks). Layer switches requested by downtracks are parked in a
//! pending list and committed on the next keyframe of the target encoding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::MarshalSize;

use crate::buffer::{ExtendedPacket, PacketBuffer};
use crate::down_track::{DownTrack, DownTrackType};
use crate::error::{Error, Result};
use crate::sequencer::PacketMeta;
use crate::simulcast::layer_from_rid;
use crate::types::{RtcpBatch, StampedRtcp};
use crate::util::monotonic_ns;

/// Upstream PLIs are rate limited to one per window.
const PLI_WINDOW_NS: u64 = 500_000_000;
/// Queued-but-unserved retransmit batches beyond this are dropped.
const RETRANSMIT_QUEUE: usize = 64;
/// An up track producing nothing for this long is probed again rather than
/// torn down.
const RTP_READ_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

struct RetransmitJob {
    down_track: Arc<DownTrack>,
    metas: Vec<PacketMeta>,
}

pub struct Receiver {
    peer_id: String,
    track_id: String,
    stream_id: String,
    kind: RTPCodecType,
    codec: RTCRtpCodecParameters,
    is_simulcast: AtomicBool,

    buffers: [RwLock<Option<Arc<PacketBuffer>>>; 3],
    up_tracks: [RwLock<Option<Arc<TrackRemote>>>; 3],
    available: [AtomicBool; 3],
    down_tracks: [ArcSwap<Vec<Arc<DownTrack>>>; 3],
    pending: [AtomicBool; 3],
    pending_tracks: [Mutex<Vec<Arc<DownTrack>>>; 3],
    /// Writers to the copy-on-write downtrack slices serialize here
    store_lock: Mutex<()>,

    rtcp_tx: mpsc::Sender<StampedRtcp>,
    last_pli_ns: AtomicU64,
    retransmit_tx: mpsc::Sender<RetransmitJob>,

    closed: AtomicBool,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_close: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Receiver {
    pub fn new(
        peer_id: String,
        track_id: String,
        stream_id: String,
        kind: RTPCodecType,
        codec: RTCRtpCodecParameters,
        rtcp_tx: mpsc::Sender<StampedRtcp>,
    ) -> Arc<Self> {
        let (retransmit_tx, retransmit_rx) = mpsc::channel(RETRANSMIT_QUEUE);
        let receiver = Arc::new(Self {
            peer_id,
            track_id,
            stream_id,
            kind,
            codec,
            is_simulcast: AtomicBool::new(false),
            buffers: std::array::from_fn(|_| RwLock::new(None)),
            up_tracks: std::array::from_fn(|_| RwLock::new(None)),
            available: std::array::from_fn(|_| AtomicBool::new(false)),
            down_tracks: std::array::from_fn(|_| ArcSwap::from_pointee(Vec::new())),
            pending: std::array::from_fn(|_| AtomicBool::new(false)),
            pending_tracks: std::array::from_fn(|_| Mutex::new(Vec::new())),
            store_lock: Mutex::new(()),
            rtcp_tx,
            last_pli_ns: AtomicU64::new(0),
            retransmit_tx,
            closed: AtomicBool::new(false),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            on_close: Mutex::new(None),
        });
        receiver.spawn_retransmit_worker(retransmit_rx);
        receiver
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.kind
    }

    pub fn codec(&self) -> RTCRtpCodecParameters {
        self.codec.clone()
    }

    pub fn is_simulcast(&self) -> bool {
        self.is_simulcast.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn on_close(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.on_close.lock() = Some(f);
    }

    /// SSRC of one spatial encoding.
    pub fn ssrc(&self, layer: usize) -> Option<u32> {
        self.buffers.get(layer)?.read().as_ref().map(|b| b.ssrc())
    }

    pub fn has_spatial_layer(&self, layer: i32) -> bool {
        (0..3).contains(&layer) && self.available[layer as usize].load(Ordering::Acquire)
    }

    /// Live receive bitrate per spatial layer.
    pub fn get_bitrate(&self) -> [u64; 3] {
        std::array::from_fn(|i| {
            self.buffers[i]
                .read()
                .as_ref()
                .map(|b| b.bitrate())
                .unwrap_or(0)
        })
    }

    /// Highest temporal layer seen per spatial layer.
    pub fn get_max_temporal_layer(&self) -> [i32; 3] {
        std::array::from_fn(|i| {
            self.buffers[i]
                .read()
                .as_ref()
                .map(|b| b.max_temporal_layer())
                .unwrap_or(0)
        })
    }

    /// Publisher SR correlation data for one layer.
    pub fn get_sender_report_data(&self, layer: usize) -> Option<(u32, u64, u64)> {
        self.buffers
            .get(layer)?
            .read()
            .as_ref()
            .map(|b| b.get_sender_report_data())
    }

    /// Route a publisher sender report to the layer owning its SSRC.
    pub fn handle_sender_report(&self, ssrc: u32, rtp_ts: u32, ntp_time: u64) -> bool {
        for slot in &self.buffers {
            let guard = slot.read();
            if let Some(b) = guard.as_ref() {
                if b.ssrc() == ssrc {
                    b.set_sender_report_data(rtp_ts, ntp_time);
                    return true;
                }
            }
        }
        false
    }

    /// Attach one publisher encoding and start its ingest + dispatch tasks.
    /// Returns the spatial layer the encoding was assigned to.
    pub fn add_up_track(
        self: &Arc<Self>,
        track: Arc<TrackRemote>,
        buffer: Arc<PacketBuffer>,
        best_quality_first: bool,
    ) -> Option<usize> {
        let rid = track.rid().to_owned();
        let layer = self.install_up_track(&rid, buffer.clone(), best_quality_first)?;
        *self.up_tracks[layer].write() = Some(track.clone());

        info!(
            track_id = %self.track_id,
            stream_id = %self.stream_id,
            rid = %rid,
            layer,
            ssrc = buffer.ssrc(),
            "up track attached"
        );

        self.spawn_ingest(layer, track, buffer.clone());
        self.spawn_dispatch(layer, buffer);
        Some(layer)
    }

    /// Slot bookkeeping for a new encoding; separated from the IO tasks.
    pub(crate) fn install_up_track(
        self: &Arc<Self>,
        rid: &str,
        buffer: Arc<PacketBuffer>,
        best_quality_first: bool,
    ) -> Option<usize> {
        if self.is_closed() {
            return None;
        }
        if !rid.is_empty() {
            self.is_simulcast.store(true, Ordering::Relaxed);
        }
        let layer = if rid.is_empty() {
            (0..3).find(|&i| self.buffers[i].read().is_none())?
        } else {
            layer_from_rid(rid)?
        };
        *self.buffers[layer].write() = Some(buffer);
        self.available[layer].store(true, Ordering::Release);

        if self.is_simulcast() {
            self.apply_quality_policy(layer, best_quality_first);
        }
        Some(layer)
    }

    /// When a new encoding appears, steer existing subscribers toward it
    /// according to the quality policy.
    fn apply_quality_policy(self: &Arc<Self>, new_layer: usize, best_quality_first: bool) {
        for l in 0..3usize {
            if l == new_layer {
                continue;
            }
            let wants_switch = if best_quality_first {
                new_layer > l
            } else {
                new_layer < l
            };
            if !wants_switch {
                continue;
            }
            for dt in self.down_tracks[l].load_full().iter() {
                if let Err(err) = dt.switch_spatial_layer(new_layer as i32, false) {
                    trace!(error = %err, "quality policy switch skipped");
                }
            }
        }
    }

    fn spawn_ingest(self: &Arc<Self>, layer: usize, track: Arc<TrackRemote>, buffer: Arc<PacketBuffer>) {
        let token = self.token.clone();
        let weak = Arc::downgrade(self);
        let track_id = self.track_id.clone();
        let handle = tokio::spawn(async move {
            let mut raw = vec![0u8; 1500];
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    res = tokio::time::timeout(RTP_READ_DEADLINE, track.read(&mut raw)) => match res {
                        // an idle link is not an ended one
                        Err(_) => continue,
                        Ok(Ok((pkt, _))) => {
                            let len = pkt.header.marshal_size() + pkt.payload.len();
                            if len > raw.len() {
                                continue;
                            }
                            match buffer.push(&raw[..len]) {
                                Ok(()) | Err(Error::ShortPacket) | Err(Error::NilPacket) => {}
                                Err(Error::Closed) => break,
                                Err(err) => {
                                    debug!(track_id = %track_id, layer, error = %err, "ingest push failed");
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            debug!(track_id = %track_id, layer, error = %err, "up track read ended");
                            break;
                        }
                    }
                }
            }
            buffer.close();
            if let Some(receiver) = weak.upgrade() {
                receiver.up_track_ended(layer);
            }
        });
        self.tasks.lock().push(handle);
    }

    pub(crate) fn spawn_dispatch(self: &Arc<Self>, layer: usize, buffer: Arc<PacketBuffer>) {
        let token = self.token.clone();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    res = buffer.read_extended() => match res {
                        Ok(pkt) => {
                            let Some(receiver) = weak.upgrade() else { break };
                            receiver.dispatch(layer, &pkt).await;
                        }
                        Err(_) => break,
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// One delivery step: complete pending switches on keyframes, then fan
    /// the packet out to the downtracks currently on this layer.
    pub(crate) async fn dispatch(&self, layer: usize, pkt: &ExtendedPacket) {
        if self.is_simulcast() && pkt.keyframe && self.pending[layer].load(Ordering::Acquire) {
            let moved = std::mem::take(&mut *self.pending_tracks[layer].lock());
            for dt in moved {
                let from = dt.current_spatial_layer().max(0) as usize;
                self.delete_down_track(from, dt.peer_id());
                self.store_down_track(layer, dt.clone());
                dt.switch_spatial_layer_done(layer as i32);
                debug!(
                    track_id = %self.track_id,
                    peer_id = %dt.peer_id(),
                    from, to = layer,
                    "spatial switch completed on keyframe"
                );
            }
            self.pending[layer].store(false, Ordering::Release);
        }

        let snapshot = self.down_tracks[layer].load_full();
        for dt in snapshot.iter() {
            match dt.write_rtp(pkt, layer).await {
                Ok(()) => {}
                Err(Error::WebRTC(err)) => {
                    debug!(
                        track_id = %self.track_id,
                        peer_id = %dt.peer_id(),
                        error = %err,
                        "transport write failed, dropping downtrack"
                    );
                    self.delete_down_track(layer, dt.peer_id());
                    dt.close();
                }
                Err(err) => {
                    debug!(track_id = %self.track_id, error = %err, "downtrack write failed");
                }
            }
        }
    }

    /// Register a subscriber's downtrack, choosing its starting layer.
    pub fn add_down_track(&self, down_track: Arc<DownTrack>, best_quality_first: bool) {
        if self.is_closed() {
            return;
        }
        let layer = if self.is_simulcast() {
            let available: Vec<usize> = (0..3)
                .filter(|&i| self.available[i].load(Ordering::Acquire))
                .collect();
            let chosen = if best_quality_first {
                available.last().copied()
            } else {
                available.first().copied()
            };
            let layer = chosen.unwrap_or(0);
            down_track.set_track_type(DownTrackType::Simulcast);
            down_track.set_initial_layers(layer as i32, 2);
            down_track.set_max_spatial_layer(2);
            down_track.set_max_temporal_layer(2);
            layer
        } else {
            down_track.set_track_type(DownTrackType::Simple);
            down_track.set_initial_layers(0, 0);
            0
        };
        self.store_down_track(layer, down_track);
    }

    /// Queue a downtrack for another encoding; committed on its next keyframe.
    pub fn switch_down_track(&self, down_track: &Arc<DownTrack>, layer: usize) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if layer >= 3 || !self.available[layer].load(Ordering::Acquire) {
            return Err(Error::NoReceiverFound);
        }
        let mut pending = self.pending_tracks[layer].lock();
        if pending.iter().any(|dt| dt.peer_id() == down_track.peer_id()) {
            return Err(Error::SpatialLayerBusy);
        }
        pending.push(down_track.clone());
        self.pending[layer].store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn store_down_track(&self, layer: usize, down_track: Arc<DownTrack>) {
        let _guard = self.store_lock.lock();
        let current = self.down_tracks[layer].load_full();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(down_track);
        self.down_tracks[layer].store(Arc::new(next));
    }

    /// Remove a subscriber's downtrack from one layer slot.
    pub fn delete_down_track(&self, layer: usize, peer_id: &str) {
        if layer >= 3 {
            return;
        }
        let _guard = self.store_lock.lock();
        let current = self.down_tracks[layer].load_full();
        let next: Vec<Arc<DownTrack>> = current
            .iter()
            .filter(|dt| dt.peer_id() != peer_id)
            .cloned()
            .collect();
        self.down_tracks[layer].store(Arc::new(next));
    }

    pub(crate) fn down_track_count(&self, layer: usize) -> usize {
        self.down_tracks[layer].load().len()
    }

    /// Forward RTCP toward the publisher, de-duplicating PLIs in a 500 ms
    /// window regardless of who asked for the keyframe.
    pub fn send_rtcp(&self, packets: RtcpBatch) {
        use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;

        let has_pli = packets
            .iter()
            .any(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some());
        let packets = if has_pli {
            let now = monotonic_ns();
            let last = self.last_pli_ns.load(Ordering::Acquire);
            if last != 0 && now.saturating_sub(last) < PLI_WINDOW_NS {
                let filtered: RtcpBatch = packets
                    .into_iter()
                    .filter(|p| {
                        p.as_any()
                            .downcast_ref::<PictureLossIndication>()
                            .is_none()
                    })
                    .collect();
                if filtered.is_empty() {
                    return;
                }
                filtered
            } else {
                self.last_pli_ns.store(now.max(1), Ordering::Release);
                packets
            }
        } else {
            packets
        };

        let stamped = StampedRtcp {
            packets,
            enqueued_ns: monotonic_ns(),
        };
        if self.rtcp_tx.try_send(stamped).is_err() {
            trace!(track_id = %self.track_id, "rtcp channel full, batch dropped");
        }
    }

    /// Queue a retransmission batch on the single per-receiver worker.
    pub fn retransmit_packets(
        &self,
        down_track: Arc<DownTrack>,
        metas: Vec<PacketMeta>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let job = RetransmitJob { down_track, metas };
        if self.retransmit_tx.try_send(job).is_err() {
            debug!(track_id = %self.track_id, "retransmit queue full, batch dropped");
        }
        Ok(())
    }

    fn spawn_retransmit_worker(self: &Arc<Self>, mut rx: mpsc::Receiver<RetransmitJob>) {
        let weak = Arc::downgrade(self);
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        let Some(receiver) = weak.upgrade() else { break };
                        receiver.process_retransmit(job).await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    async fn process_retransmit(&self, job: RetransmitJob) {
        for meta in &job.metas {
            let buffer = match self.buffers.get(meta.layer as usize) {
                Some(slot) => slot.read().clone(),
                None => continue,
            };
            let Some(buffer) = buffer else { continue };
            let raw = match buffer.get_packet(meta.source_seq) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match job.down_track.write_retransmit(meta, &raw).await {
                Ok(()) => {}
                Err(Error::Closed) => break,
                Err(err) => {
                    debug!(
                        track_id = %self.track_id,
                        seq = meta.target_seq,
                        error = %err,
                        "retransmit write failed"
                    );
                }
            }
        }
    }

    fn up_track_ended(self: &Arc<Self>, layer: usize) {
        self.available[layer].store(false, Ordering::Release);
        debug!(track_id = %self.track_id, layer, "up track ended");
        if !(0..3).any(|i| self.available[i].load(Ordering::Acquire)) {
            self.close();
        }
    }

    /// Idempotent shutdown: stops tasks, closes buffers and downtracks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        for slot in &self.buffers {
            if let Some(b) = slot.read().as_ref() {
                b.close();
            }
        }
        for layer in 0..3usize {
            for dt in self.down_tracks[layer].load_full().iter() {
                dt.close();
            }
            self.down_tracks[layer].store(Arc::new(Vec::new()));
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(f) = self.on_close.lock().take() {
            f();
        }
        info!(track_id = %self.track_id, stream_id = %self.stream_id, "receiver closed");
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.token.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::sleep;
    use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
    use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
    use webrtc::util::marshal::Marshal;

    use crate::test_utils::*;

    const MS: u64 = 1_000_000;

    fn make_receiver(
        kind: RTPCodecType,
        codec: RTCRtpCodecParameters,
    ) -> (Arc<Receiver>, mpsc::Receiver<StampedRtcp>) {
        let (tx, rx) = mpsc::channel(10);
        let receiver = Receiver::new(
            "publisher".to_owned(),
            "track0".to_owned(),
            "stream0".to_owned(),
            kind,
            codec,
            tx,
        );
        (receiver, rx)
    }

    fn make_down_track(receiver: &Arc<Receiver>, codec: RTCRtpCodecParameters) -> Arc<DownTrack> {
        DownTrack::new(
            "track0".to_owned(),
            "viewer".to_owned(),
            "stream0".to_owned(),
            codec.capability,
            receiver.kind(),
            Arc::downgrade(receiver),
            500,
            true,
        )
    }

    fn video_buffer(ssrc: u32) -> Arc<PacketBuffer> {
        Arc::new(PacketBuffer::new(ssrc, "video/VP8", 90_000, 500))
    }

    #[tokio::test]
    async fn simple_audio_relay_preserves_spacing() {
        let (receiver, mut rtcp) = make_receiver(RTPCodecType::Audio, opus_codec());
        let dt = make_down_track(&receiver, opus_codec());
        let writer = bind_down_track(&dt, opus_codec(), 9111);
        receiver.add_down_track(dt.clone(), false);

        for i in 0..500u16 {
            let pkt = audio_packet(77, 1000 + i, u32::from(i) * 960);
            receiver.dispatch(0, &pkt).await;
        }

        assert_eq!(writer.count(), 500);
        let packets = writer.packets.lock();
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.sequence_number, 1000 + i as u16);
            assert_eq!(p.header.timestamp, i as u32 * 960);
            assert_eq!(p.header.ssrc, 9111);
            assert_eq!(p.header.payload_type, 111);
        }
        drop(packets);
        assert_eq!(dt.stats().packets_sent, 500);
        // audio never asks for keyframes
        assert!(rtcp.try_recv().is_err());
    }

    #[tokio::test]
    async fn rid_mapping_assigns_layers() {
        let (receiver, _rtcp) = make_receiver(RTPCodecType::Video, vp8_codec());
        assert_eq!(
            receiver.install_up_track("h", video_buffer(2), false),
            Some(1)
        );
        assert!(receiver.is_simulcast());
        assert_eq!(
            receiver.install_up_track("f", video_buffer(3), false),
            Some(2)
        );
        assert_eq!(
            receiver.install_up_track("q", video_buffer(1), false),
            Some(0)
        );
        assert!(receiver.has_spatial_layer(0));
        assert!(receiver.has_spatial_layer(1));
        assert!(receiver.has_spatial_layer(2));
        assert_eq!(receiver.ssrc(2), Some(3));
    }

    #[tokio::test]
    async fn pli_suppressed_inside_window() {
        let (receiver, mut rtcp) = make_receiver(RTPCodecType::Video, vp8_codec());
        let pli = || -> RtcpBatch {
            vec![Box::new(PictureLossIndication {
                sender_ssrc: 1,
                media_ssrc: 2,
            })]
        };

        receiver.send_rtcp(pli());
        receiver.send_rtcp(pli());
        assert!(rtcp.try_recv().is_ok());
        assert!(rtcp.try_recv().is_err());

        sleep(Duration::from_millis(600)).await;
        receiver.send_rtcp(pli());
        assert!(rtcp.try_recv().is_ok());
    }

    #[tokio::test]
    async fn simulcast_switch_completes_on_keyframe() {
        let (receiver, mut rtcp) = make_receiver(RTPCodecType::Video, vp8_codec());
        receiver.install_up_track("q", video_buffer(1), false);
        receiver.install_up_track("f", video_buffer(3), false);

        let dt = make_down_track(&receiver, vp8_codec());
        let writer = bind_down_track(&dt, vp8_codec(), 9001);
        receiver.add_down_track(dt.clone(), false);
        assert_eq!(dt.current_spatial_layer(), 0);

        let t0 = 1_000_000_000u64;
        receiver
            .dispatch(0, &extended(RTPCodecType::Video, 1, 1000, 10_000, t0, vp8_payload(true, 100, 10, 0)))
            .await;
        receiver
            .dispatch(0, &extended(RTPCodecType::Video, 1, 1001, 13_000, t0 + 33 * MS, vp8_payload(false, 101, 10, 0)))
            .await;
        assert_eq!(writer.count(), 2);

        dt.switch_spatial_layer(2, false).unwrap();
        let batch = rtcp.try_recv().expect("keyframe request for target layer");
        let pli = batch.packets[0]
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .expect("pli");
        assert_eq!(pli.media_ssrc, 3);

        // high-layer delta frames do not complete the switch
        receiver
            .dispatch(2, &extended(RTPCodecType::Video, 3, 5000, 900_000, t0 + 50 * MS, vp8_payload(false, 699, 60, 0)))
            .await;
        assert_eq!(dt.current_spatial_layer(), 0);
        assert_eq!(writer.count(), 2);

        // the low layer keeps flowing meanwhile
        receiver
            .dispatch(0, &extended(RTPCodecType::Video, 1, 1002, 16_000, t0 + 66 * MS, vp8_payload(false, 102, 10, 0)))
            .await;
        assert_eq!(writer.count(), 3);

        // the keyframe moves the track, then forwards with rebased fields
        receiver
            .dispatch(2, &extended(RTPCodecType::Video, 3, 5001, 903_000, t0 + 99 * MS, vp8_payload(true, 700, 61, 0)))
            .await;
        assert_eq!(dt.current_spatial_layer(), 2);
        assert_eq!(receiver.down_track_count(0), 0);
        assert_eq!(receiver.down_track_count(2), 1);
        assert_eq!(writer.count(), 4);

        let last = writer.last().unwrap();
        assert_eq!(last.header.sequence_number, 1003);
        assert_eq!(last.header.timestamp, 16_000 + 2_970);
        let desc = crate::vp8::Vp8Descriptor::parse(&last.payload).unwrap();
        assert_eq!(desc.picture_id, 103);

        // the old layer's packets are no longer authoritative
        receiver
            .dispatch(0, &extended(RTPCodecType::Video, 1, 1003, 19_000, t0 + 132 * MS, vp8_payload(false, 103, 10, 0)))
            .await;
        assert_eq!(writer.count(), 4);
    }

    #[tokio::test]
    async fn nack_retransmits_with_suppression() {
        let (receiver, _rtcp) = make_receiver(RTPCodecType::Video, vp8_codec());
        let buffer = video_buffer(1);
        receiver.install_up_track("", buffer.clone(), false);

        let dt = make_down_track(&receiver, vp8_codec());
        let writer = bind_down_track(&dt, vp8_codec(), 9001);
        receiver.add_down_track(dt.clone(), false);

        let t0 = 1_000_000_000u64;
        for i in 0..100u16 {
            let pkt = extended(
                RTPCodecType::Video,
                1,
                100 + i,
                u32::from(i) * 3_000,
                t0 + u64::from(i) * MS,
                vp8_payload(i == 0, 10 + i, 1, 0),
            );
            buffer.push(&pkt.packet.marshal().unwrap()).unwrap();
            receiver.dispatch(0, &pkt).await;
        }
        assert_eq!(writer.count(), 100);

        let nack = || -> RtcpBatch {
            vec![Box::new(TransportLayerNack {
                sender_ssrc: 0,
                media_ssrc: 9001,
                nacks: vec![NackPair {
                    packet_id: 150,
                    lost_packets: 0,
                }],
            })]
        };
        let sent_150 = || {
            writer
                .sequence_numbers()
                .iter()
                .filter(|&&s| s == 150)
                .count()
        };

        dt.handle_rtcp(&nack());
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sent_150(), 2);

        // a repeat inside the 100 ms window is suppressed
        dt.handle_rtcp(&nack());
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sent_150(), 2);

        // past the window it is served again
        sleep(Duration::from_millis(80)).await;
        dt.handle_rtcp(&nack());
        sleep(Duration::from_millis(30)).await;
        assert_eq!(sent_150(), 3);
    }

    #[tokio::test]
    async fn transport_error_drops_down_track() {
        let (receiver, _rtcp) = make_receiver(RTPCodecType::Audio, opus_codec());
        let dt = make_down_track(&receiver, opus_codec());
        let writer = bind_down_track(&dt, opus_codec(), 9111);
        receiver.add_down_track(dt.clone(), false);
        assert_eq!(receiver.down_track_count(0), 1);

        *writer.fail.lock() = true;
        receiver.dispatch(0, &audio_packet(77, 1, 0)).await;
        assert_eq!(receiver.down_track_count(0), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_down_tracks() {
        let (receiver, _rtcp) = make_receiver(RTPCodecType::Audio, opus_codec());
        let dt = make_down_track(&receiver, opus_codec());
        let _writer = bind_down_track(&dt, opus_codec(), 9111);
        receiver.add_down_track(dt.clone(), false);

        receiver.close();
        receiver.close();
        assert!(receiver.is_closed());
        assert_eq!(receiver.down_track_count(0), 0);
        assert!(matches!(
            receiver.switch_down_track(&dt, 0),
            Err(Error::Closed)
        ));
    }
}
