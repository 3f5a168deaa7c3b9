use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::PeerId;

/// Fixed wire header length: code, size, src, dst (u32 each) + seq (u64),
/// all little-endian.
pub const HEADER_SIZE: usize = 24;

/// Extra bytes requested on every read so that back-to-back frames usually
/// arrive in one transport call.
pub const RECV_READAHEAD: usize = 64;

/// Message code of the built-in response frame.
pub const CODE_RESP: u32 = 0;

/// One framed message on a stream.
///
/// The core is agnostic to payloads; `body` is opaque bytes interpreted by
/// the callback registered for `code`. A `seq` of 0 marks fire-and-forget;
/// any other value correlates a request with its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub src: PeerId,
    pub dst: PeerId,
    pub seq: u64,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(code: u32, src: PeerId, dst: PeerId, body: Vec<u8>) -> Message {
        Message {
            code,
            src,
            dst,
            seq: 0,
            body,
        }
    }

    /// Total frame length on the wire, header included.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&self.code.to_le_bytes());
        buf.extend_from_slice(&(self.wire_size() as u32).to_le_bytes());
        buf.extend_from_slice(&self.src.to_le_bytes());
        buf.extend_from_slice(&self.dst.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub code: u32,
    pub size: u32,
    pub src: PeerId,
    pub dst: PeerId,
    pub seq: u64,
}

impl Header {
    /// Decodes the fixed header from the first [`HEADER_SIZE`] bytes of
    /// `buf`. A frame shorter than its own header is malformed.
    pub fn decode(buf: &[u8]) -> Result<Header> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Inval);
        }

        let header = Header {
            code: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            size: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            src: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            dst: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            seq: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        };

        if (header.size as usize) < HEADER_SIZE {
            return Err(Error::Inval);
        }

        Ok(header)
    }

    /// Rebuilds a full message from this header and the frame bytes it was
    /// decoded from.
    pub fn into_message(self, frame: &[u8]) -> Message {
        debug_assert!(frame.len() == self.size as usize);

        Message {
            code: self.code,
            src: self.src,
            dst: self.dst,
            seq: self.seq,
            body: frame[HEADER_SIZE..].to_vec(),
        }
    }
}

/// Builds the response frame for a request: `CODE_RESP` carrying `retval`
/// as a little-endian i32 body, correlated by the request's `seq`.
pub fn response(src: PeerId, dst: PeerId, retval: i32, seq: u64) -> Message {
    let mut msg = Message::new(CODE_RESP, src, dst, retval.to_le_bytes().to_vec());
    msg.seq = seq;
    msg
}

/// Reads the retval out of a response body. Short bodies decode as 0.
pub fn response_retval(msg: &Message) -> i32 {
    match msg.body.get(0..4) {
        Some(raw) => i32::from_le_bytes(raw.try_into().unwrap()),
        None => 0,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut msg = Message::new(7, 3, 4, b"hello".to_vec());
        msg.seq = 0x1122334455667788;

        let wire = msg.encode();
        assert_eq!(wire.len(), HEADER_SIZE + 5);

        let header = Header::decode(&wire).unwrap();
        assert_eq!(header.code, 7);
        assert_eq!(header.size as usize, wire.len());
        assert_eq!(header.src, 3);
        assert_eq!(header.dst, 4);
        assert_eq!(header.seq, 0x1122334455667788);

        let back = header.into_message(&wire);
        assert_eq!(back, msg);
    }

    #[test]
    fn header_is_little_endian() {
        let msg = Message::new(1, 2, 3, Vec::new());
        let wire = msg.encode();

        assert_eq!(&wire[0..4], &[1, 0, 0, 0]);
        assert_eq!(&wire[4..8], &[HEADER_SIZE as u8, 0, 0, 0]);
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(Header::decode(&[0u8; HEADER_SIZE - 1]).is_err());
    }

    #[test]
    fn response_carries_retval() {
        let resp = response(1, 2, -7, 42);
        assert_eq!(resp.code, CODE_RESP);
        assert_eq!(resp.seq, 42);
        assert_eq!(response_retval(&resp), -7);
    }
}
