//! # Record Set
//!
//! Compact ranges of datagram sequence numbers, as carried by ACK and NACK
//! packets.
//!
//! ## Wire layout
//!
//! ```text
//!   count   u16
//!   count × { single u8 (1 = single, 0 = range), start u32, [end u32] }
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{WireRead, TRIAD_MASK};
use crate::error::DecodeError;

/// Widest range accepted from the wire. Keeps `expand` bounded against
/// hostile records such as `0..=u32::MAX`.
pub const MAX_RECORD_SPAN: u32 = 1 << 16;

const SINGLE_LEN: usize = 1 + 4;
const RANGE_LEN: usize = 1 + 4 + 4;

// ─── Record ─────────────────────────────────────────────────────────────────

/// A single index or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record {
    pub start: u32,
    pub end: Option<u32>,
}

impl Record {
    pub fn single(index: u32) -> Self {
        Record {
            start: index,
            end: None,
        }
    }

    /// Inclusive range; collapses to a single record when `start == end`.
    pub fn range(start: u32, end: u32) -> Self {
        debug_assert!(end >= start);
        if start == end {
            Record::single(start)
        } else {
            Record {
                start,
                end: Some(end),
            }
        }
    }

    pub fn last(&self) -> u32 {
        self.end.unwrap_or(self.start)
    }

    pub fn is_single(&self) -> bool {
        self.end.is_none()
    }

    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index <= self.last()
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.start..=self.last()
    }

    fn encoded_len(&self) -> usize {
        if self.is_single() {
            SINGLE_LEN
        } else {
            RANGE_LEN
        }
    }
}

// ─── Condense / Expand ──────────────────────────────────────────────────────

/// Sort, deduplicate and merge consecutive runs into ranged records.
pub fn condense(indices: &[u32]) -> Vec<Record> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut records = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return records;
    };
    let mut end = start;

    for index in iter {
        if end.checked_add(1) == Some(index) {
            end = index;
        } else {
            records.push(Record::range(start, end));
            start = index;
            end = index;
        }
    }
    records.push(Record::range(start, end));
    records
}

/// Every index covered by `records`, sorted and deduplicated.
pub fn expand(records: &[Record]) -> Vec<u32> {
    let mut indices: Vec<u32> = records.iter().flat_map(Record::indices).collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

// ─── RecordSet ──────────────────────────────────────────────────────────────

/// The body of an ACK or NACK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn from_indices(indices: &[u32]) -> Self {
        RecordSet {
            records: condense(indices),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn indices(&self) -> Vec<u32> {
        expand(&self.records)
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.records.iter().map(Record::encoded_len).sum::<usize>()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        debug_assert!(self.records.len() <= u16::MAX as usize);
        buf.put_u16_le(self.records.len() as u16);
        for record in &self.records {
            match record.end {
                None => {
                    buf.put_u8(1);
                    buf.put_u32_le(record.start);
                }
                Some(end) => {
                    buf.put_u8(0);
                    buf.put_u32_le(record.start);
                    buf.put_u32_le(end);
                }
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, DecodeError> {
        let count = buf.read_u16()? as usize;
        let mut records = Vec::with_capacity(count.min(buf.remaining() / SINGLE_LEN));
        for _ in 0..count {
            let single = buf.read_bool()?;
            let start = buf.read_u32()?;
            if start > TRIAD_MASK {
                return Err(DecodeError::InvalidRecord);
            }
            if single {
                records.push(Record::single(start));
            } else {
                let end = buf.read_u32()?;
                if end > TRIAD_MASK || end < start || end - start >= MAX_RECORD_SPAN {
                    return Err(DecodeError::InvalidRecord);
                }
                records.push(Record::range(start, end));
            }
        }
        Ok(RecordSet { records })
    }

    /// Encode as one or more packets of at most `max_len` bytes, each
    /// prefixed with `id`.
    pub fn encode_chunks(&self, id: u8, max_len: usize) -> Vec<Bytes> {
        let budget = max_len.saturating_sub(1 + 2).max(RANGE_LEN);
        let mut packets = Vec::new();
        let mut chunk = RecordSet::default();
        let mut used = 0;

        for record in &self.records {
            let len = record.encoded_len();
            if used + len > budget || chunk.records.len() == u16::MAX as usize {
                packets.push(chunk.to_packet(id));
                chunk.records.clear();
                used = 0;
            }
            chunk.records.push(*record);
            used += len;
        }
        if !chunk.is_empty() {
            packets.push(chunk.to_packet(id));
        }
        packets
    }

    fn to_packet(&self, id: u8) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.encoded_len());
        buf.put_u8(id);
        self.encode(&mut buf);
        buf.freeze()
    }
}
