//! XNL wire frame encode/decode (spec.md §3/§4.2). The framer owns no
//! state; the session layer (§4.3) is responsible for the read pattern
//! that pulls exactly one frame off the transport.

use deku::prelude::*;
use thiserror::Error;

pub const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XnlFrameError {
    #[error("frame shorter than the {HEADER_LEN}-byte header ({0} bytes)")]
    ShortFrame(usize),
    #[error("declared length {declared} does not match actual frame length {actual}")]
    LengthMismatch { declared: u16, actual: usize },
    #[error("failed to parse frame: {0}")]
    Malformed(String),
}

/// One XNL frame. `total_length` always equals `HEADER_LEN + payload.len()`;
/// [`XnlFrame::encode`] computes it so callers never set it by hand.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct XnlFrame {
    pub total_length: u16,
    reserved: u8,
    pub opcode: u8,
    pub xcmp_flag: u8,
    pub flags: u8,
    pub dest_address: u16,
    pub src_address: u16,
    pub txid: u16,
    pub payload_length: u16,
    #[deku(count = "payload_length")]
    pub payload: Vec<u8>,
}

impl XnlFrame {
    pub fn new(
        opcode: u8,
        dest_address: u16,
        src_address: u16,
        txid: u16,
        payload: Vec<u8>,
    ) -> Self {
        let payload_length = payload.len() as u16;
        XnlFrame {
            total_length: (HEADER_LEN + payload.len()) as u16,
            reserved: 0,
            opcode,
            xcmp_flag: 0,
            flags: 0,
            dest_address,
            src_address,
            txid,
            payload_length,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_bytes().expect("XnlFrame fields are always encodable")
    }

    /// Decode a single frame from exactly `total_length` bytes, as read
    /// by the session's length-prefixed read loop.
    pub fn decode(data: &[u8]) -> Result<XnlFrame, XnlFrameError> {
        if data.len() < HEADER_LEN {
            return Err(XnlFrameError::ShortFrame(data.len()));
        }
        let declared = u16::from_be_bytes([data[0], data[1]]);
        if declared as usize != data.len() {
            return Err(XnlFrameError::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }
        let ((rest, _), frame) =
            XnlFrame::from_bytes((data, 0)).map_err(|e| XnlFrameError::Malformed(e.to_string()))?;
        if !rest.is_empty() {
            return Err(XnlFrameError::Malformed(format!(
                "{} trailing bytes after frame",
                rest.len()
            )));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let frame = XnlFrame::new(0x08, 0x0A55, 0x0001, 42, vec![1, 2, 3, 4, 5]);
        let encoded = frame.encode();
        let decoded = XnlFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trips_with_empty_payload() {
        let frame = XnlFrame::new(0x03, 0, 0, 0, vec![]);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(XnlFrame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn rejects_short_frames() {
        let err = XnlFrame::decode(&[0, 1, 2]).unwrap_err();
        assert_eq!(err, XnlFrameError::ShortFrame(3));
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut encoded = XnlFrame::new(0x08, 1, 1, 1, vec![9, 9]).encode();
        encoded[1] += 1; // corrupt the declared length
        let err = XnlFrame::decode(&encoded).unwrap_err();
        assert!(matches!(err, XnlFrameError::LengthMismatch { .. }));
    }
}
