//! Shared fixtures for the unit tests: a capturing RTP sink and packet
//! builders for the forwarding paths.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::TrackLocalWriter;

use crate::buffer::ExtendedPacket;
use crate::down_track::{DownTrack, DownTrackContext};
use crate::util::monotonic_ns;
use crate::vp8::Vp8Descriptor;

/// Outbound sink that records every packet it is handed.
#[derive(Debug, Default)]
pub struct MockWriter {
    pub packets: Mutex<Vec<Packet>>,
    pub fail: Mutex<bool>,
}

impl MockWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sequence_numbers(&self) -> Vec<u16> {
        self.packets
            .lock()
            .iter()
            .map(|p| p.header.sequence_number)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn last(&self) -> Option<Packet> {
        self.packets.lock().last().cloned()
    }
}

#[async_trait]
impl TrackLocalWriter for MockWriter {
    async fn write_rtp(&self, p: &Packet) -> webrtc::error::Result<usize> {
        if *self.fail.lock() {
            return Err(webrtc::Error::ErrClosedPipe);
        }
        self.packets.lock().push(p.clone());
        Ok(p.payload.len())
    }

    async fn write(&self, b: &[u8]) -> webrtc::error::Result<usize> {
        Ok(b.len())
    }
}

pub fn opus_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "audio/opus".to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        payload_type: 111,
        ..Default::default()
    }
}

pub fn vp8_codec() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "video/VP8".to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        payload_type: 96,
        ..Default::default()
    }
}

/// Bind a downtrack to a fresh mock sink with the matching codec.
pub fn bind_down_track(dt: &Arc<DownTrack>, codec: RTCRtpCodecParameters, ssrc: u32) -> Arc<MockWriter> {
    let writer = MockWriter::new();
    dt.bind(DownTrackContext {
        codecs: vec![codec],
        ssrc,
        mid: "1".to_owned(),
        write_stream: writer.clone(),
    })
    .expect("bind");
    writer
}

/// VP8 payload with PictureID (15-bit), TL0PICIDX and TID fields.
pub fn vp8_payload(keyframe: bool, picture_id: u16, tl0: u8, tid: u8) -> Vec<u8> {
    vec![
        if keyframe { 0x90 } else { 0x80 }, // X set, S set on keyframes
        0xE0,                               // I + L + T
        0x80 | ((picture_id >> 8) & 0x7F) as u8,
        (picture_id & 0xFF) as u8,
        tl0,
        tid << 6,
        if keyframe { 0x00 } else { 0x01 }, // frame header byte
        0xAA,
        0xBB,
    ]
}

/// Build the annotated packet the dispatch path hands to downtracks.
pub fn extended(
    kind: RTPCodecType,
    ssrc: u32,
    seq: u16,
    ts: u32,
    arrival_ns: u64,
    payload: Vec<u8>,
) -> ExtendedPacket {
    let payload = Bytes::from(payload);
    let keyframe = if kind == RTPCodecType::Video {
        crate::codec::is_keyframe("video/VP8", &payload)
    } else {
        false
    };
    let vp8 = if kind == RTPCodecType::Video {
        Vp8Descriptor::parse(&payload).ok()
    } else {
        None
    };
    ExtendedPacket {
        packet: Packet {
            header: Header {
                version: 2,
                payload_type: if kind == RTPCodecType::Video { 96 } else { 111 },
                sequence_number: seq,
                timestamp: ts,
                ssrc,
                ..Default::default()
            },
            payload,
        },
        arrival_ns: if arrival_ns == 0 { monotonic_ns() } else { arrival_ns },
        keyframe,
        head: true,
        vp8,
    }
}

/// Audio packet helper.
pub fn audio_packet(ssrc: u32, seq: u16, ts: u32) -> ExtendedPacket {
    extended(RTPCodecType::Audio, ssrc, seq, ts, 0, vec![0x01, 0x02, 0x03])
}
