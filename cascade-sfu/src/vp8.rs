//! VP8 payload descriptor handling.
//!
//! The forwarder rewrites PictureID and TL0PICIDX in place when a subscriber
//! is moved between simulcast encodings, so the parser records the byte
//! offsets of both fields alongside their values. Partition layout (the S bit
//! and PID field) is never touched.

use crate::error::{Error, Result};

/// Parsed VP8 payload descriptor.
///
/// ```text
///       0 1 2 3 4 5 6 7
///      +-+-+-+-+-+-+-+-+
///      |X|R|N|S|R| PID | (REQUIRED)
///      +-+-+-+-+-+-+-+-+
/// X:   |I|L|T|K| RSV   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// I:   |M| PictureID   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// L:   |   tl0picidx   | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// T/K: |tid|Y| KEYIDX  | (OPTIONAL)
///      +-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Vp8Descriptor {
    /// 7- or 15-bit picture id
    pub picture_id: u16,
    /// Byte offset of the first PictureID byte, 0 when absent
    pub pic_id_idx: usize,
    /// PictureID uses the 15-bit form
    pub mbit: bool,
    /// Temporal level zero index
    pub tl0_pic_idx: u8,
    /// Byte offset of TL0PICIDX, 0 when absent
    pub tlz_idx: usize,
    /// Temporal layer index
    pub tid: u8,
    /// T bit was present; the stream carries temporal scalability info
    pub temporal_supported: bool,
    /// Payload starts an independently decodable frame
    pub is_keyframe: bool,
    /// Total descriptor length in bytes
    pub header_size: usize,
}

impl Vp8Descriptor {
    /// Parse the descriptor at the head of `payload`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::NilPacket);
        }
        let mut desc = Vp8Descriptor::default();
        let mut idx = 0usize;

        let b0 = payload[idx];
        let xbit = b0 & 0x80 != 0;
        let sbit = b0 & 0x10 != 0;
        let pid = b0 & 0x07;
        idx += 1;

        if xbit {
            if idx >= payload.len() {
                return Err(Error::ShortPacket);
            }
            let b1 = payload[idx];
            let ibit = b1 & 0x80 != 0;
            let lbit = b1 & 0x40 != 0;
            let tbit = b1 & 0x20 != 0;
            let kbit = b1 & 0x10 != 0;
            idx += 1;

            if ibit {
                if idx >= payload.len() {
                    return Err(Error::ShortPacket);
                }
                desc.pic_id_idx = idx;
                let pid_byte = payload[idx];
                if pid_byte & 0x80 != 0 {
                    if idx + 1 >= payload.len() {
                        return Err(Error::ShortPacket);
                    }
                    desc.mbit = true;
                    desc.picture_id =
                        (u16::from(pid_byte & 0x7F) << 8) | u16::from(payload[idx + 1]);
                    idx += 2;
                } else {
                    desc.picture_id = u16::from(pid_byte);
                    idx += 1;
                }
            }
            if lbit {
                if idx >= payload.len() {
                    return Err(Error::ShortPacket);
                }
                desc.tlz_idx = idx;
                desc.tl0_pic_idx = payload[idx];
                idx += 1;
            }
            if tbit || kbit {
                if idx >= payload.len() {
                    return Err(Error::ShortPacket);
                }
                if tbit {
                    desc.tid = payload[idx] >> 6;
                    desc.temporal_supported = true;
                }
                idx += 1;
            }
        }

        if idx >= payload.len() {
            return Err(Error::ShortPacket);
        }
        desc.header_size = idx;
        // A keyframe starts a partition (S=1, PID=0) and its first frame-header
        // byte has the inverse-keyframe bit cleared.
        desc.is_keyframe = sbit && pid == 0 && payload[idx] & 0x01 == 0;
        Ok(desc)
    }

    /// Write `picture_id` and `tl0_pic_idx` back into a payload previously
    /// parsed into this descriptor. The wire width of PictureID is preserved.
    pub fn rewrite(&self, payload: &mut [u8], picture_id: u16, tl0_pic_idx: u8) {
        if self.pic_id_idx > 0 {
            if self.mbit {
                payload[self.pic_id_idx] = 0x80 | ((picture_id >> 8) & 0x7F) as u8;
                payload[self.pic_id_idx + 1] = (picture_id & 0xFF) as u8;
            } else {
                payload[self.pic_id_idx] = (picture_id & 0x7F) as u8;
            }
        }
        if self.tlz_idx > 0 {
            payload[self.tlz_idx] = tl0_pic_idx;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // X + I(15 bit) + L + T, picture id 0x1234, tl0 10, tid 2, keyframe
    fn sample_payload() -> Vec<u8> {
        vec![
            0x90, // X=1, S=1, PID=0
            0xE0, // I=1, L=1, T=1
            0x92, 0x34, // M=1, picture id 0x1234
            0x0A, // tl0picidx
            0x80, // tid=2
            0x00, 0x01, 0x02, // frame header, keyframe bit clear
        ]
    }

    #[test]
    fn parses_extended_descriptor() {
        let desc = Vp8Descriptor::parse(&sample_payload()).unwrap();
        assert_eq!(desc.picture_id, 0x1234);
        assert!(desc.mbit);
        assert_eq!(desc.tl0_pic_idx, 10);
        assert_eq!(desc.tid, 2);
        assert!(desc.temporal_supported);
        assert!(desc.is_keyframe);
        assert_eq!(desc.header_size, 6);
    }

    #[test]
    fn parses_seven_bit_picture_id() {
        let payload = vec![0x80, 0x80, 0x55, 0x01];
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        assert_eq!(desc.picture_id, 0x55);
        assert!(!desc.mbit);
        assert!(!desc.is_keyframe); // S bit unset
    }

    #[test]
    fn rewrite_round_trips() {
        let mut payload = sample_payload();
        let desc = Vp8Descriptor::parse(&payload).unwrap();
        desc.rewrite(&mut payload, 0x2345, 77);

        let reparsed = Vp8Descriptor::parse(&payload).unwrap();
        assert_eq!(reparsed.picture_id, 0x2345);
        assert_eq!(reparsed.tl0_pic_idx, 77);
        // partition layout untouched
        assert_eq!(payload[0], 0x90);
        assert_eq!(&payload[6..], &sample_payload()[6..]);
    }

    #[test]
    fn truncated_payload_rejected() {
        assert!(matches!(
            Vp8Descriptor::parse(&[]),
            Err(Error::NilPacket)
        ));
        assert!(matches!(
            Vp8Descriptor::parse(&[0x80]),
            Err(Error::ShortPacket)
        ));
        assert!(matches!(
            Vp8Descriptor::parse(&[0x80, 0x80]),
            Err(Error::ShortPacket)
        ));
    }
}
