//! Codec capability matching and keyframe detection.

use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::error::{Error, Result};
use crate::vp8::Vp8Descriptor;

/// Find the haystack entry matching an offered capability.
///
/// Preference order: exact match on mime type plus fmtp line, then a partial
/// match on mime type alone (case-insensitive). Mirrors how transports settle
/// on a negotiated codec when fmtp parameters differ between endpoints.
pub fn fuzzy_match_codec(
    needle: &RTCRtpCodecParameters,
    haystack: &[RTCRtpCodecParameters],
) -> Result<RTCRtpCodecParameters> {
    let needle_mime = needle.capability.mime_type.to_lowercase();

    for c in haystack {
        if c.capability.mime_type.to_lowercase() == needle_mime
            && c.capability.sdp_fmtp_line == needle.capability.sdp_fmtp_line
        {
            return Ok(c.clone());
        }
    }
    for c in haystack {
        if c.capability.mime_type.to_lowercase() == needle_mime {
            return Ok(c.clone());
        }
    }
    Err(Error::CodecNotFound)
}

/// Decide whether an RTP payload begins an independently decodable frame.
///
/// Only video payloads can be keyframes; unknown codecs conservatively
/// report false so layer switches wait for a codec we understand.
pub fn is_keyframe(mime_type: &str, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    match mime_type.to_lowercase().as_str() {
        "video/vp8" => Vp8Descriptor::parse(payload)
            .map(|d| d.is_keyframe)
            .unwrap_or(false),
        "video/vp9" => {
            // P bit clear on the first descriptor byte marks an intra picture.
            payload[0] & 0x40 == 0 && payload[0] & 0x80 != 0
        }
        "video/h264" => h264_is_keyframe(payload),
        _ => false,
    }
}

fn h264_is_keyframe(payload: &[u8]) -> bool {
    let nalu_type = payload[0] & 0x1F;
    match nalu_type {
        // IDR slice or SPS
        5 | 7 => true,
        // STAP-A: scan aggregated NALUs
        24 => {
            let mut idx = 1usize;
            while idx + 2 < payload.len() {
                let size = (usize::from(payload[idx]) << 8) | usize::from(payload[idx + 1]);
                idx += 2;
                if idx >= payload.len() {
                    break;
                }
                let t = payload[idx] & 0x1F;
                if t == 5 || t == 7 {
                    return true;
                }
                idx += size;
            }
            false
        }
        // FU-A: start fragment carrying an IDR
        28 => payload.len() > 1 && payload[1] & 0x80 != 0 && payload[1] & 0x1F == 5,
        _ => false,
    }
}
