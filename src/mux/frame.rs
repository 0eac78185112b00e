//! Frame encoding/decoding for the multiplexer.
//!
//! Wire layout, 8-byte header followed by the payload:
//!
//! ```text
//! +-----+-----+----------+---------------+
//! | Ver | Cmd | Len (2B) | Stream ID (4B)|
//! +-----+-----+----------+---------------+
//! |               Payload               |
//! +-------------------------------------+
//! ```

use super::MuxError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version carried in every frame.
pub const VERSION: u8 = 2;

/// Header bytes: version, command, payload length, stream id.
pub const HEADER_LEN: usize = 8;

/// Cap on a single data frame's payload.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Open a stream.
    Syn = 0,
    /// Close the sender's half of a stream.
    Fin = 1,
    /// Stream data.
    Psh = 2,
    /// Keep-alive, no payload.
    Nop = 3,
    /// Return receive credit: payload is a u32-BE byte count.
    Upd = 4,
}

impl TryFrom<u8> for Command {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, MuxError> {
        match value {
            0 => Ok(Command::Syn),
            1 => Ok(Command::Fin),
            2 => Ok(Command::Psh),
            3 => Ok(Command::Nop),
            4 => Ok(Command::Upd),
            other => Err(MuxError::InvalidFrame(format!("unknown command {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: Command,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32) -> Self {
        Frame {
            cmd: Command::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Frame {
            cmd: Command::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    pub fn psh(stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_FRAME_PAYLOAD);
        Frame {
            cmd: Command::Psh,
            stream_id,
            payload,
        }
    }

    pub fn nop() -> Self {
        Frame {
            cmd: Command::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    pub fn upd(stream_id: u32, consumed: u32) -> Self {
        Frame {
            cmd: Command::Upd,
            stream_id,
            payload: Bytes::copy_from_slice(&consumed.to_be_bytes()),
        }
    }

    /// Credit carried by an Upd frame.
    pub fn upd_consumed(&self) -> Option<u32> {
        if self.cmd != Command::Upd || self.payload.len() != 4 {
            return None;
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload);
        Some(u32::from_be_bytes(b))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(VERSION);
        buf.put_u8(self.cmd as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_u32(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Decode one frame from the front of `buf`, consuming it. Returns
    /// `None` when the buffer does not yet hold a complete frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        if buf[0] != VERSION {
            return Err(MuxError::Version(buf[0]));
        }
        let cmd = Command::try_from(buf[1])?;
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame {
            cmd,
            stream_id,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::psh(7, Bytes::from_static(b"payload"));
        let mut buf = BytesMut::from(&frame.encode()[..]);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.cmd, Command::Psh);
        assert_eq!(decoded.stream_id, 7);
        assert_eq!(&decoded.payload[..], b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = Frame::psh(1, Bytes::from_static(b"abcdef"));
        let encoded = frame.encode();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&encoded[encoded.len() - 1..]);
        assert!(Frame::decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::syn(3).encode());
        buf.extend_from_slice(&Frame::upd(3, 1024).encode());
        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.cmd, Command::Syn);
        assert_eq!(second.upd_consumed(), Some(1024));
    }

    #[test]
    fn test_bad_version_rejected() {
        let mut encoded = Frame::nop().encode();
        encoded[0] = 9;
        let mut buf = BytesMut::from(&encoded[..]);
        assert!(matches!(Frame::decode(&mut buf), Err(MuxError::Version(9))));
    }
}
