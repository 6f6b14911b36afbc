//! # Encapsulated Frame
//!
//! One application message (or one fragment of it) plus its reliability
//! metadata. Layout:
//!
//! ```text
//!   flags        u8      reliability << 5 | 0x10 if split
//!   bit_length   u16     payload length in bits
//!   [msg_index   u24]    reliable kinds
//!   [order_index u24     ordered / sequenced kinds
//!    channel     u8]
//!   [split_count u32     split flag set
//!    split_id    u16
//!    split_index u32]
//!   payload
//! ```

use bytes::{BufMut, Bytes};

use crate::codec::{WireRead, WireWrite, TRIAD_MASK};
use crate::error::DecodeError;
use crate::reliability::Reliability;

const SPLIT_FLAG: u8 = 0x10;

/// Smallest possible frame header: flags + bit length.
pub const FRAME_HEADER_MIN: usize = 3;

/// Largest possible frame header.
pub const FRAME_HEADER_MAX: usize = FRAME_HEADER_MIN + 3 + 4 + 10;

/// Fragment coordinates of a split message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SplitInfo {
    /// Total number of fragments.
    pub count: u32,
    /// Identifier shared by every fragment of one message.
    pub id: u16,
    /// Zero-based position of this fragment.
    pub index: u32,
}

/// A reliability-tagged unit of payload inside a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub reliability: Reliability,
    /// Only transmitted for ordered and sequenced kinds; decodes as 0 otherwise.
    pub channel: u8,
    pub message_index: Option<u32>,
    pub order_index: Option<u32>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(reliability: Reliability, payload: Bytes) -> Self {
        Frame {
            reliability,
            channel: 0,
            message_index: None,
            order_index: None,
            split: None,
            payload,
        }
    }

    /// Header size for a frame of this kind.
    pub fn header_len(reliability: Reliability, split: bool) -> usize {
        let mut len = FRAME_HEADER_MIN;
        if reliability.is_reliable() {
            len += 3;
        }
        if reliability.has_order_index() {
            len += 4;
        }
        if split {
            len += 10;
        }
        len
    }

    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.reliability, self.split.is_some()) + self.payload.len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        debug_assert!(self.payload.len() <= (u16::MAX / 8) as usize);

        let mut flags = self.reliability.id() << 5;
        if self.split.is_some() {
            flags |= SPLIT_FLAG;
        }
        buf.put_u8(flags);
        buf.put_u16_le((self.payload.len() * 8) as u16);

        if self.reliability.is_reliable() {
            buf.write_triad(self.message_index.unwrap_or(0) & TRIAD_MASK);
        }
        if self.reliability.has_order_index() {
            buf.write_triad(self.order_index.unwrap_or(0) & TRIAD_MASK);
            buf.put_u8(self.channel);
        }
        if let Some(split) = &self.split {
            buf.put_u32_le(split.count);
            buf.put_u16_le(split.id);
            buf.put_u32_le(split.index);
        }
        buf.put_slice(&self.payload);
    }

    /// Decode one frame, advancing `buf` past it. The payload shares `buf`'s
    /// allocation.
    pub fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let flags = buf.read_u8()?;
        let reliability = Reliability::from_id(flags >> 5)?;
        let bits = buf.read_u16()? as usize;
        let len = bits.div_ceil(8);

        let message_index = if reliability.is_reliable() {
            Some(buf.read_triad()?)
        } else {
            None
        };

        let (order_index, channel) = if reliability.has_order_index() {
            let index = buf.read_triad()?;
            (Some(index), buf.read_u8()?)
        } else {
            (None, 0)
        };

        let split = if flags & SPLIT_FLAG != 0 {
            let count = buf.read_u32()?;
            let id = buf.read_u16()?;
            let index = buf.read_u32()?;
            if count == 0 || index >= count {
                return Err(DecodeError::InvalidSplit);
            }
            Some(SplitInfo { count, id, index })
        } else {
            None
        };

        let payload = buf.read_bytes(len)?;

        Ok(Frame {
            reliability,
            channel,
            message_index,
            order_index,
            split,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn unreliable_frame_layout() {
        let frame = Frame::new(Reliability::Unreliable, Bytes::from_static(b"hi"));
        let wire = encode(&frame);
        assert_eq!(&wire[..], &[0x00, 16, 0, b'h', b'i']);
        assert_eq!(wire.len(), frame.encoded_len());
    }

    #[test]
    fn reliable_ordered_split_layout() {
        let frame = Frame {
            reliability: Reliability::ReliableOrdered,
            channel: 4,
            message_index: Some(0x010203),
            order_index: Some(0x000007),
            split: Some(SplitInfo {
                count: 3,
                id: 0x0102,
                index: 2,
            }),
            payload: Bytes::from_static(&[0xaa]),
        };
        let wire = encode(&frame);
        assert_eq!(wire[0], (3 << 5) | 0x10);
        assert_eq!(&wire[1..3], &[8, 0]);
        assert_eq!(&wire[3..6], &[0x03, 0x02, 0x01]);
        assert_eq!(&wire[6..10], &[0x07, 0x00, 0x00, 0x04]);
        assert_eq!(&wire[10..14], &[3, 0, 0, 0]);
        assert_eq!(&wire[14..16], &[0x02, 0x01]);
        assert_eq!(&wire[16..20], &[2, 0, 0, 0]);
        assert_eq!(wire[20], 0xaa);
        assert_eq!(wire.len(), FRAME_HEADER_MAX + 1);

        let mut rd = wire.clone();
        assert_eq!(Frame::decode(&mut rd).unwrap(), frame);
        assert!(rd.is_empty());
    }

    #[test]
    fn header_len_by_kind() {
        assert_eq!(Frame::header_len(Reliability::Unreliable, false), 3);
        assert_eq!(Frame::header_len(Reliability::UnreliableSequenced, false), 7);
        assert_eq!(Frame::header_len(Reliability::Reliable, false), 6);
        assert_eq!(Frame::header_len(Reliability::ReliableOrdered, false), 10);
        assert_eq!(Frame::header_len(Reliability::ReliableOrdered, true), 20);
    }

    #[test]
    fn sequenced_frame_keeps_channel() {
        let mut frame = Frame::new(Reliability::UnreliableSequenced, Bytes::from_static(b"pos"));
        frame.channel = 9;
        frame.order_index = Some(55);
        let mut wire = encode(&frame);
        assert_eq!(Frame::decode(&mut wire).unwrap(), frame);
    }

    #[test]
    fn consecutive_frames_decode_in_sequence() {
        let a = Frame::new(Reliability::Unreliable, Bytes::from_static(b"one"));
        let mut b = Frame::new(Reliability::Reliable, Bytes::from_static(b"two"));
        b.message_index = Some(1);
        let mut buf = BytesMut::new();
        a.encode(&mut buf);
        b.encode(&mut buf);
        let mut wire = buf.freeze();
        assert_eq!(Frame::decode(&mut wire).unwrap(), a);
        assert_eq!(Frame::decode(&mut wire).unwrap(), b);
        assert!(wire.is_empty());
    }

    #[test]
    fn truncated_payload_rejected() {
        let frame = Frame::new(Reliability::Unreliable, Bytes::from_static(b"hello"));
        let wire = encode(&frame);
        let mut short = wire.slice(..wire.len() - 1);
        assert!(matches!(
            Frame::decode(&mut short),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn split_index_beyond_count_rejected() {
        let mut frame = Frame::new(Reliability::Reliable, Bytes::from_static(b"x"));
        frame.message_index = Some(0);
        frame.split = Some(SplitInfo {
            count: 2,
            id: 1,
            index: 2,
        });
        let mut wire = encode(&frame);
        assert_eq!(Frame::decode(&mut wire), Err(DecodeError::InvalidSplit));
    }

    #[test]
    fn bit_length_rounds_up() {
        // 9 bits announces two payload bytes.
        let mut wire = Bytes::from_static(&[0x00, 9, 0, 1, 2]);
        let frame = Frame::decode(&mut wire).unwrap();
        assert_eq!(&frame.payload[..], &[1, 2]);
    }
}
