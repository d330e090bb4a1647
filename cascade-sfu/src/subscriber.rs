//! Per-subscriber state: the downtracks a client receives, its bandwidth
//! controller, and the periodic SR/SDES reporting loop toward its transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;
use webrtc::rtcp::source_description::SourceDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use crate::bandwidth::BandwidthController;
use crate::config::SfuConfig;
use crate::down_track::{DownTrack, DownTrackType};
use crate::types::{RtcpBatch, SharedRtcpWriter};

/// Cadence of outbound sender reports.
const SR_INTERVAL: Duration = Duration::from_secs(5);

type DownTrackCallback = Box<dyn Fn(Arc<DownTrack>) + Send + Sync>;

pub struct Subscriber {
    id: String,
    peer_id: String,
    /// stream id → downtracks the subscriber receives from that stream
    down_tracks: RwLock<HashMap<String, Vec<Arc<DownTrack>>>>,
    bandwidth: Arc<BandwidthController>,
    rtcp_writer: Mutex<Option<SharedRtcpWriter>>,
    on_down_track: Mutex<Option<DownTrackCallback>>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn new(peer_id: String, config: &SfuConfig) -> Arc<Self> {
        let subscriber = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            peer_id,
            down_tracks: RwLock::new(HashMap::new()),
            bandwidth: BandwidthController::new(config),
            rtcp_writer: Mutex::new(None),
            on_down_track: Mutex::new(None),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        subscriber.bandwidth.start();
        subscriber.spawn_reports();
        info!(subscriber_id = %subscriber.id, peer_id = %subscriber.peer_id, "subscriber created");
        subscriber
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthController> {
        &self.bandwidth
    }

    /// Sink for the periodic SR/SDES batches (the subscriber transport).
    pub fn set_rtcp_writer(&self, writer: SharedRtcpWriter) {
        *self.rtcp_writer.lock() = Some(writer);
    }

    /// Invoked with every new downtrack so the embedder can attach it to its
    /// peer connection and renegotiate.
    pub fn on_down_track(&self, f: DownTrackCallback) {
        *self.on_down_track.lock() = Some(f);
    }

    /// Register a downtrack created for this subscriber. Simulcast video
    /// joins the bandwidth controller.
    pub fn add_down_track(&self, stream_id: &str, down_track: Arc<DownTrack>) {
        self.down_tracks
            .write()
            .entry(stream_id.to_owned())
            .or_default()
            .push(down_track.clone());
        if down_track.kind() == RTPCodecType::Video
            && down_track.track_type() == DownTrackType::Simulcast
        {
            self.bandwidth.add_track(down_track.clone());
        }
        if let Some(f) = self.on_down_track.lock().as_ref() {
            f(down_track);
        }
    }

    pub fn remove_down_track(&self, stream_id: &str, track_id: &str) {
        let mut map = self.down_tracks.write();
        if let Some(list) = map.get_mut(stream_id) {
            list.retain(|dt| dt.id() != track_id);
            if list.is_empty() {
                map.remove(stream_id);
            }
        }
        self.bandwidth.remove_track(track_id);
    }

    pub fn get_down_tracks(&self, stream_id: &str) -> Vec<Arc<DownTrack>> {
        self.down_tracks
            .read()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn down_track_by_ssrc(&self, ssrc: u32) -> Option<Arc<DownTrack>> {
        self.down_tracks
            .read()
            .values()
            .flatten()
            .find(|dt| dt.ssrc() == ssrc)
            .cloned()
    }

    /// Route an RTCP batch from the subscriber transport to the downtracks
    /// it addresses.
    pub fn route_rtcp(&self, packets: RtcpBatch) {
        let mut per_track: HashMap<u32, RtcpBatch> = HashMap::new();
        for packet in packets {
            for ssrc in packet.destination_ssrc() {
                per_track.entry(ssrc).or_default().push(packet.cloned());
            }
        }
        for (ssrc, batch) in per_track {
            if let Some(dt) = self.down_track_by_ssrc(ssrc) {
                dt.handle_rtcp(&batch);
            }
        }
    }

    fn spawn_reports(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SR_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(subscriber) = weak.upgrade() else { break };
                        subscriber.send_reports().await;
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// One compound batch: an SR per bound downtrack plus all SDES chunks.
    async fn send_reports(&self) {
        let writer = self.rtcp_writer.lock().clone();
        let Some(writer) = writer else { return };

        let tracks: Vec<Arc<DownTrack>> = self
            .down_tracks
            .read()
            .values()
            .flatten()
            .cloned()
            .collect();

        let mut batch: RtcpBatch = Vec::new();
        let mut chunks = Vec::new();
        for dt in tracks {
            if let Some(sr) = dt.create_sender_report() {
                batch.push(Box::new(sr));
            }
            if let Some(mut c) = dt.create_sdes_chunks() {
                chunks.append(&mut c);
            }
        }
        if !chunks.is_empty() {
            batch.push(Box::new(SourceDescription { chunks }));
        }
        if batch.is_empty() {
            return;
        }
        if let Err(err) = writer.write_rtcp(&batch).await {
            debug!(subscriber_id = %self.id, error = %err, "sender report write failed");
        }
    }

    /// Idempotent teardown: stops tasks and closes every downtrack.
    pub fn close(&self) {
        self.token.cancel();
        self.bandwidth.stop();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let tracks: Vec<Arc<DownTrack>> = self
            .down_tracks
            .write()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for dt in tracks {
            dt.close();
        }
        info!(subscriber_id = %self.id, "subscriber closed");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.token.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
