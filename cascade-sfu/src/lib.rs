//! Cascade SFU — media routing core of a selective forwarding unit.
//!
//! Cascade accepts RTP from publishing peers, chooses per subscriber which
//! simulcast encoding to forward, and relays packets without transcoding.
//! The transport layer (ICE/DTLS/SRTP, signaling, peer lifecycle) lives in
//! the embedding process; this crate starts where decoded RTP comes out of a
//! [`webrtc`] `TrackRemote` and ends where rewritten RTP enters a
//! `TrackLocalWriter`.
//!
//! ## Architecture
//!
//! - **`Router`**: per-publisher registry fanning tracks out to subscribers
//!   and routing RTCP back to the publisher
//! - **`Receiver`**: per-track owner of up to three simulcast encodings,
//!   each with its own ingest and dispatch task
//! - **`PacketBuffer`**: per-SSRC reorder window, NACK origination, bitrate
//!   estimation and retransmit lookups
//! - **`DownTrack`**: per-subscriber outbound track rewriting sequence
//!   numbers, timestamps and VP8 scalability fields
//! - **`BandwidthController`** / **`LayerSelector`**: per-subscriber
//!   bandwidth-driven layer allocation
//! - **`AudioObserver`**: dBov-based active-speaker detection
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cascade_sfu::{Router, SfuConfig, Subscriber};
//!
//! let mut config = SfuConfig::default();
//! config.validate()?;
//!
//! let router = Router::new(publisher_id, config.clone());
//! router.set_rtcp_writer(publisher_rtcp_sink);
//!
//! // from the transport's on_track callback:
//! router.add_track(track_remote, track_id, stream_id, extension_ids);
//!
//! let subscriber = Subscriber::new(viewer_id, &config);
//! router.subscribe(subscriber.clone());
//! ```

mod audio_observer;
mod bandwidth;
mod buffer;
mod codec;
mod config;
mod down_track;
mod error;
mod nack;
mod receiver;
mod router;
mod sequencer;
mod simulcast;
mod subscriber;
mod twcc;
mod types;
mod util;
mod vp8;

#[cfg(test)]
mod test_utils;

pub use audio_observer::AudioObserver;
pub use bandwidth::{BandwidthController, BandwidthEstimator, LayerSelector};
pub use buffer::{BufferStats, ExtendedPacket, PacketBuffer};
pub use codec::{fuzzy_match_codec, is_keyframe};
pub use config::{SfuConfig, SimulcastConfig, TwccConfig};
pub use down_track::{DownTrack, DownTrackContext, DownTrackStats, DownTrackType};
pub use error::{Error, Result};
pub use receiver::Receiver;
pub use router::Router;
pub use sequencer::{PacketMeta, Sequencer};
pub use simulcast::{layer_from_rid, SimulcastTrackHelpers};
pub use subscriber::Subscriber;
pub use twcc::Responder as TwccResponder;
pub use types::{
    ExtensionIds, RtcpBatch, RtcpWriter, SharedRtcpWriter, StampedRtcp, TrackNotification,
};
pub use util::{from_ntp_time, to_ntp_time};
pub use vp8::Vp8Descriptor;
