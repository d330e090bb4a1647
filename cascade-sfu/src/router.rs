//! Per-publisher routing: the receiver registry, subscriber fan-out, the
//! outbound RTCP writer task, and transport-wide CC feedback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::audio_observer::AudioObserver;
use crate::buffer::PacketBuffer;
use crate::config::SfuConfig;
use crate::down_track::DownTrack;
use crate::receiver::Receiver;
use crate::subscriber::Subscriber;
use crate::twcc;
use crate::types::{ExtensionIds, RtcpBatch, SharedRtcpWriter, StampedRtcp, TrackNotification};
use crate::util::monotonic_ns;

/// Outbound RTCP queue depth; excess batches are dropped by the senders.
const RTCP_CHANNEL_CAPACITY: usize = 10;
/// Keyframe requests older than this are pointless by the time they drain.
const STALE_PLI_NS: u64 = 500_000_000;

type TrackCallback = Box<dyn Fn(TrackNotification) + Send + Sync>;

/// Fan-out registry for one publisher: all of its receivers, all subscribers
/// attached to them, and the RTCP path back to the publisher transport.
pub struct Router {
    id: String,
    config: SfuConfig,
    receivers: DashMap<String, Arc<Receiver>>,
    subscribers: DashMap<String, Arc<Subscriber>>,

    rtcp_tx: mpsc::Sender<StampedRtcp>,
    rtcp_rx: Mutex<Option<mpsc::Receiver<StampedRtcp>>>,
    twcc: Arc<Mutex<twcc::Responder>>,
    audio_observer: Mutex<Option<Arc<AudioObserver>>>,

    on_track_added: Mutex<Option<TrackCallback>>,
    on_track_removed: Mutex<Option<TrackCallback>>,

    stopped: AtomicBool,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// `id` is the publishing peer's id.
    pub fn new(id: String, config: SfuConfig) -> Arc<Self> {
        let (rtcp_tx, rtcp_rx) = mpsc::channel(RTCP_CHANNEL_CAPACITY);
        let sender_ssrc: u32 = rand::random();
        let feedback_interval = config.twcc.feedback_interval_ms;
        Arc::new(Self {
            id,
            config,
            receivers: DashMap::new(),
            subscribers: DashMap::new(),
            rtcp_tx,
            rtcp_rx: Mutex::new(Some(rtcp_rx)),
            twcc: Arc::new(Mutex::new(twcc::Responder::new(
                sender_ssrc,
                feedback_interval,
            ))),
            audio_observer: Mutex::new(None),
            on_track_added: Mutex::new(None),
            on_track_removed: Mutex::new(None),
            stopped: AtomicBool::new(false),
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    pub fn on_track_added(&self, f: TrackCallback) {
        *self.on_track_added.lock() = Some(f);
    }

    pub fn on_track_removed(&self, f: TrackCallback) {
        *self.on_track_removed.lock() = Some(f);
    }

    /// Session-level active-speaker observer; audio receivers feed it.
    pub fn set_audio_observer(&self, observer: Arc<AudioObserver>) {
        *self.audio_observer.lock() = Some(observer);
    }

    pub fn receiver(&self, track_id: &str) -> Option<Arc<Receiver>> {
        self.receivers.get(track_id).map(|r| r.clone())
    }

    /// Accept one published encoding. Layers of a simulcast track arrive as
    /// separate `TrackRemote`s sharing a track id and land on one receiver.
    pub fn add_track(
        self: &Arc<Self>,
        track: Arc<TrackRemote>,
        track_id: String,
        stream_id: String,
        extensions: ExtensionIds,
    ) -> Option<Arc<Receiver>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let codec = track.codec();
        let kind = track.kind();
        let ssrc = track.ssrc();

        let mut created = false;
        let receiver = self
            .receivers
            .entry(track_id.clone())
            .or_insert_with(|| {
                created = true;
                Receiver::new(
                    self.id.clone(),
                    track_id.clone(),
                    stream_id.clone(),
                    kind,
                    codec.clone(),
                    self.rtcp_tx.clone(),
                )
            })
            .clone();

        let buffer = Arc::new(PacketBuffer::new(
            ssrc,
            &codec.capability.mime_type,
            codec.capability.clock_rate,
            self.config.max_packet_track,
        ));
        buffer.set_extension_ids(extensions.audio_level, extensions.transport_cc);
        self.wire_buffer(&receiver, &buffer, kind, &stream_id);

        receiver.add_up_track(
            track,
            buffer,
            self.config.simulcast.best_quality_first,
        )?;

        if created {
            self.finish_receiver_setup(&receiver);
        }
        Some(receiver)
    }

    fn wire_buffer(
        self: &Arc<Self>,
        receiver: &Arc<Receiver>,
        buffer: &Arc<PacketBuffer>,
        kind: RTPCodecType,
        stream_id: &str,
    ) {
        let ssrc = buffer.ssrc();

        // loss → NACK / escalated keyframe request toward the publisher
        let rx_weak = Arc::downgrade(receiver);
        buffer.on_nack(Box::new(move |pairs, keyframe_needed| {
            let Some(receiver) = rx_weak.upgrade() else {
                return;
            };
            let mut batch: RtcpBatch = Vec::new();
            if !pairs.is_empty() {
                batch.push(Box::new(TransportLayerNack {
                    sender_ssrc: 0,
                    media_ssrc: ssrc,
                    nacks: pairs,
                }));
            }
            if keyframe_needed {
                batch.push(Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: ssrc,
                }));
            }
            if !batch.is_empty() {
                receiver.send_rtcp(batch);
            }
        }));

        // transport-wide arrival times → periodic TWCC feedback
        {
            let responder = self.twcc.clone();
            responder.lock().set_media_ssrc(ssrc);
            let rtcp_tx = self.rtcp_tx.clone();
            buffer.on_transport_wide_cc(Box::new(move |sn, arrival_ns, marker| {
                let feedback = responder.lock().record(sn, arrival_ns, marker);
                if let Some(fb) = feedback {
                    let stamped = StampedRtcp {
                        packets: vec![Box::new(fb)],
                        enqueued_ns: monotonic_ns(),
                    };
                    if rtcp_tx.try_send(stamped).is_err() {
                        trace!("rtcp channel full, twcc feedback dropped");
                    }
                }
            }));
        }

        if kind == RTPCodecType::Audio {
            let router = Arc::downgrade(self);
            let stream = stream_id.to_owned();
            if let Some(observer) = self.audio_observer.lock().as_ref() {
                observer.add_stream(stream_id);
            }
            buffer.on_audio_level(Box::new(move |level| {
                let Some(router) = router.upgrade() else {
                    return;
                };
                let guard = router.audio_observer.lock();
                if let Some(observer) = guard.as_ref() {
                    observer.observe(&stream, level);
                }
            }));
        }
    }

    fn finish_receiver_setup(self: &Arc<Self>, receiver: &Arc<Receiver>) {
        // attach every current subscriber to the new track
        for entry in self.subscribers.iter() {
            self.add_down_tracks(entry.value(), receiver);
        }

        let notification = TrackNotification {
            peer_id: self.id.clone(),
            track_id: receiver.track_id().to_owned(),
            stream_id: receiver.stream_id().to_owned(),
            kind: if receiver.kind() == RTPCodecType::Audio {
                "audio".to_owned()
            } else {
                "video".to_owned()
            },
        };

        let router = Arc::downgrade(self);
        let track_id = receiver.track_id().to_owned();
        let removed = notification.clone();
        receiver.on_close(Box::new(move || {
            let Some(router) = router.upgrade() else {
                return;
            };
            router.receivers.remove(&track_id);
            if let Some(observer) = router.audio_observer.lock().as_ref() {
                observer.remove_stream(&removed.stream_id);
            }
            if let Some(f) = router.on_track_removed.lock().as_ref() {
                f(removed.clone());
            };
        }));

        if let Some(f) = self.on_track_added.lock().as_ref() {
            f(notification);
        }
        info!(
            router_id = %self.id,
            track_id = %receiver.track_id(),
            stream_id = %receiver.stream_id(),
            "receiver registered"
        );
    }

    /// Attach a subscriber to every current receiver and keep it attached to
    /// future ones.
    pub fn subscribe(self: &Arc<Self>, subscriber: Arc<Subscriber>) {
        if !self.config.allow_self_subscribe && subscriber.peer_id() == self.id {
            debug!(router_id = %self.id, "self subscribe rejected");
            return;
        }
        for entry in self.receivers.iter() {
            self.add_down_tracks(&subscriber, entry.value());
        }
        self.subscribers
            .insert(subscriber.id().to_owned(), subscriber);
    }

    /// Detach a subscriber from future tracks. Existing downtracks stay up
    /// until the caller closes them (or the subscriber itself).
    pub fn unsubscribe(&self, subscriber_id: &str) {
        self.subscribers.remove(subscriber_id);
    }

    fn add_down_tracks(self: &Arc<Self>, subscriber: &Arc<Subscriber>, receiver: &Arc<Receiver>) {
        let codec = receiver.codec();
        let down_track = DownTrack::new(
            receiver.track_id().to_owned(),
            subscriber.peer_id().to_owned(),
            receiver.stream_id().to_owned(),
            codec.capability,
            receiver.kind(),
            Arc::downgrade(receiver),
            self.config.max_packet_track,
            self.config.simulcast.enable_temporal_layer,
        );

        let dt_weak = Arc::downgrade(&down_track);
        let rx_weak = Arc::downgrade(receiver);
        let sub_weak = Arc::downgrade(subscriber);
        down_track.on_close(Box::new(move || {
            if let (Some(dt), Some(rx)) = (dt_weak.upgrade(), rx_weak.upgrade()) {
                rx.delete_down_track(dt.current_spatial_layer().max(0) as usize, dt.peer_id());
                if let Some(sub) = sub_weak.upgrade() {
                    sub.remove_down_track(dt.stream_id(), dt.id());
                }
            }
        }));

        receiver.add_down_track(down_track.clone(), self.config.simulcast.best_quality_first);
        subscriber.add_down_track(receiver.stream_id(), down_track);
    }

    /// Bind the publisher-side RTCP sink and start draining the queue.
    pub fn set_rtcp_writer(&self, writer: SharedRtcpWriter) {
        let Some(mut rx) = self.rtcp_rx.lock().take() else {
            warn!(router_id = %self.id, "rtcp writer already set");
            return;
        };
        let token = self.token.clone();
        let router_id = self.id.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    batch = rx.recv() => {
                        let Some(batch) = batch else { break };
                        let age_ns = monotonic_ns().saturating_sub(batch.enqueued_ns);
                        let packets = if age_ns > STALE_PLI_NS {
                            let filtered: RtcpBatch = batch
                                .packets
                                .into_iter()
                                .filter(|p| {
                                    p.as_any()
                                        .downcast_ref::<PictureLossIndication>()
                                        .is_none()
                                })
                                .collect();
                            if filtered.is_empty() {
                                continue;
                            }
                            filtered
                        } else {
                            batch.packets
                        };
                        if let Err(err) = writer.write_rtcp(&packets).await {
                            debug!(router_id = %router_id, error = %err, "rtcp write failed");
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// RTCP arriving from the publisher transport; sender reports update the
    /// per-layer clock correlation used for downstream SRs.
    pub fn process_publisher_rtcp(&self, packets: &RtcpBatch) {
        for packet in packets {
            if let Some(sr) = packet.as_any().downcast_ref::<SenderReport>() {
                for entry in self.receivers.iter() {
                    if entry
                        .value()
                        .handle_sender_report(sr.ssrc, sr.rtp_time, sr.ntp_time)
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Idempotent shutdown: closes receivers and the RTCP channel.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        for entry in self.receivers.iter() {
            entry.value().close();
        }
        self.receivers.clear();
        self.subscribers.clear();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(router_id = %self.id, "router stopped");
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        self.token.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
