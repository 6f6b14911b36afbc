//! # Datagram
//!
//! The unit that is sent, acknowledged and retransmitted: a flag byte, a
//! 3-byte sequence number, then encapsulated frames until the buffer runs
//! out.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{WireRead, WireWrite, TRIAD_MASK};
use crate::error::DecodeError;
use crate::frame::{Frame, FRAME_HEADER_MIN};
use crate::wire::id;

/// Flag byte + sequence number.
pub const DATAGRAM_HEADER_LEN: usize = 4;

/// A sequence-numbered bundle of frames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u32,
    pub frames: Vec<Frame>,
}

impl Datagram {
    pub fn new(sequence: u32) -> Self {
        Datagram {
            sequence: sequence & TRIAD_MASK,
            frames: Vec::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        DATAGRAM_HEADER_LEN + self.frames.iter().map(Frame::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(id::DATAGRAM);
        buf.write_triad(self.sequence);
        for frame in &self.frames {
            frame.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decode a full datagram from wire bytes, including the flag byte.
    pub fn decode(mut raw: Bytes) -> Result<Self, DecodeError> {
        let flag = raw.read_u8()?;
        if !id::is_datagram(flag) {
            return Err(DecodeError::UnknownPacketId(flag));
        }
        let sequence = raw.read_triad()?;
        let mut frames = Vec::new();
        while raw.len() >= FRAME_HEADER_MIN {
            frames.push(Frame::decode(&mut raw)?);
        }
        Ok(Datagram { sequence, frames })
    }

    /// Whether the datagram must be kept until acknowledged.
    pub fn needs_recovery(&self) -> bool {
        self.frames.iter().any(|f| {
            f.reliability.is_reliable() || f.reliability.requires_ack_receipt()
        })
    }
}
