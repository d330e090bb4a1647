//! Common types shared across the routing core.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One batch of RTCP packets moving through the feedback plane.
pub type RtcpBatch = Vec<Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>>;

/// An RTCP batch with its enqueue time, so the writer task can drop
/// keyframe requests that went stale in the queue.
pub struct StampedRtcp {
    pub packets: RtcpBatch,
    /// Monotonic ns at enqueue
    pub enqueued_ns: u64,
}

/// Sink for RTCP batches toward a transport (publisher or subscriber side).
#[async_trait]
pub trait RtcpWriter: Send + Sync {
    async fn write_rtcp(&self, packets: &RtcpBatch) -> Result<()>;
}

/// Shared handle to an RTCP sink.
pub type SharedRtcpWriter = Arc<dyn RtcpWriter>;

/// Negotiated RTP header-extension ids a publisher transport uses.
/// An id of 0 means the extension was not negotiated.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionIds {
    /// urn:ietf:params:rtp-hdrext:ssrc-audio-level
    pub audio_level: u8,
    /// transport-wide congestion control sequence numbers
    pub transport_cc: u8,
}

/// Notification payload for the signaling collaborator when a published
/// track appears or disappears.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackNotification {
    pub peer_id: String,
    pub track_id: String,
    pub stream_id: String,
    /// "audio" or "video"
    pub kind: String,
}
