//! # Reliability & Ordering Engine
//!
//! Index assignment on the way out, duplicate suppression and per-channel
//! ordering on the way in.
//!
//! ## Inbound pipeline
//!
//! ```text
//!   reliable frame ──▶ MessageWindow (seen?) ──▶ [split reassembly] ──▶ lane
//!                                                                       │
//!          unordered: deliver ◀───────────────────────────────────────┤
//!          sequenced: deliver if newer, else drop ◀───────────────────┤
//!          ordered:   deliver run / buffer ahead / drop behind ◀──────┘
//! ```
//!
//! All indices are triads and compare with serial-number arithmetic, so
//! every counter survives the wrap at `2^24`.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::codec::{triad_add, triad_distance, triad_newer, TRIAD_HALF};
use crate::error::SessionError;
use crate::reliability::Reliability;

// ─── Message Window ─────────────────────────────────────────────────────────

/// Which reliable message indices have already been processed.
///
/// Everything before `base` has been seen; `above` holds the seen indices
/// past a gap. When `above` outgrows `capacity` the base jumps to the oldest
/// held index, forgetting the gap.
#[derive(Debug, Clone)]
pub struct MessageWindow {
    base: u32,
    above: BTreeSet<u32>,
    capacity: usize,
}

impl MessageWindow {
    pub fn new(capacity: usize) -> Self {
        MessageWindow {
            base: 0,
            above: BTreeSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `index`; returns `false` if it was already seen.
    pub fn insert(&mut self, index: u32) -> bool {
        let distance = triad_distance(self.base, index);
        if distance >= TRIAD_HALF {
            return false;
        }
        if distance == 0 {
            self.base = triad_add(self.base, 1);
            self.advance();
            return true;
        }
        if !self.above.insert(index) {
            return false;
        }
        if self.above.len() > self.capacity {
            self.slide();
        }
        true
    }

    pub fn contains(&self, index: u32) -> bool {
        triad_distance(self.base, index) >= TRIAD_HALF || self.above.contains(&index)
    }

    /// Next index that has not been seen contiguously.
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Indices held past a gap.
    pub fn pending(&self) -> usize {
        self.above.len()
    }

    fn advance(&mut self) {
        while self.above.remove(&self.base) {
            self.base = triad_add(self.base, 1);
        }
    }

    fn slide(&mut self) {
        let base = self.base;
        if let Some(&oldest) = self
            .above
            .iter()
            .min_by_key(|&&index| triad_distance(base, index))
        {
            tracing::debug!(from = base, to = oldest, "dedup window overflow, skipping gap");
            self.base = oldest;
            self.advance();
        }
    }
}

// ─── Inbound Lanes ──────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct OrderedLane {
    expected: u32,
    /// Keyed by order index; drained by probing `expected`, so wrap is harmless.
    held: BTreeMap<u32, Bytes>,
}

/// Outcome of handing one complete message to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This many messages were appended to the output, in order.
    Delivered(usize),
    /// Ahead of the ordered lane; held until the gap fills.
    Held,
    /// Behind the lane or older than the newest sequenced message.
    Stale,
}

// ─── Ordering Engine ────────────────────────────────────────────────────────

/// Per-session counters and receive lanes for every channel.
#[derive(Debug, Clone)]
pub struct OrderingEngine {
    channels: u8,
    max_held: usize,
    next_message: u32,
    send_order: Vec<u32>,
    send_sequence: Vec<u32>,
    ordered: Vec<OrderedLane>,
    sequenced: Vec<Option<u32>>,
    seen: MessageWindow,
}

impl OrderingEngine {
    pub fn new(channels: u8, max_ordering_queue: usize, dedup_window: usize) -> Self {
        let n = channels as usize;
        OrderingEngine {
            channels,
            max_held: max_ordering_queue,
            next_message: 0,
            send_order: vec![0; n],
            send_sequence: vec![0; n],
            ordered: vec![OrderedLane::default(); n],
            sequenced: vec![None; n],
            seen: MessageWindow::new(dedup_window),
        }
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn check_channel(&self, channel: u8) -> Result<(), SessionError> {
        if channel < self.channels {
            Ok(())
        } else {
            Err(SessionError::InvalidChannel {
                channel,
                channels: self.channels,
            })
        }
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Session-wide index for one reliable frame.
    pub fn next_message_index(&mut self) -> u32 {
        let index = self.next_message;
        self.next_message = triad_add(index, 1);
        index
    }

    pub fn next_order_index(&mut self, channel: u8) -> Result<u32, SessionError> {
        self.check_channel(channel)?;
        let slot = &mut self.send_order[channel as usize];
        let index = *slot;
        *slot = triad_add(index, 1);
        Ok(index)
    }

    pub fn next_sequence_index(&mut self, channel: u8) -> Result<u32, SessionError> {
        self.check_channel(channel)?;
        let slot = &mut self.send_sequence[channel as usize];
        let index = *slot;
        *slot = triad_add(index, 1);
        Ok(index)
    }

    /// Order index for a new outbound message of this kind, if it carries one.
    pub fn assign(
        &mut self,
        reliability: Reliability,
        channel: u8,
    ) -> Result<Option<u32>, SessionError> {
        if reliability.is_ordered() {
            self.next_order_index(channel).map(Some)
        } else if reliability.is_sequenced() {
            self.next_sequence_index(channel).map(Some)
        } else {
            Ok(None)
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Record a reliable frame's message index; `false` means duplicate.
    pub fn accept_message_index(&mut self, index: u32) -> bool {
        self.seen.insert(index)
    }

    /// Route one complete message through its channel's lane, appending
    /// whatever becomes deliverable to `out` as `(channel, payload)`.
    pub fn admit(
        &mut self,
        reliability: Reliability,
        channel: u8,
        order_index: Option<u32>,
        payload: Bytes,
        out: &mut Vec<(u8, Bytes)>,
    ) -> Result<Admission, SessionError> {
        if !reliability.has_order_index() {
            out.push((channel, payload));
            return Ok(Admission::Delivered(1));
        }
        self.check_channel(channel)?;
        let index = order_index.unwrap_or(0);

        if reliability.is_sequenced() {
            let last = &mut self.sequenced[channel as usize];
            return Ok(match *last {
                Some(prev) if !triad_newer(index, prev) => Admission::Stale,
                _ => {
                    *last = Some(index);
                    out.push((channel, payload));
                    Admission::Delivered(1)
                }
            });
        }

        let lane = &mut self.ordered[channel as usize];
        let distance = triad_distance(lane.expected, index);
        if distance == 0 {
            out.push((channel, payload));
            lane.expected = triad_add(lane.expected, 1);
            let mut delivered = 1;
            while let Some(next) = lane.held.remove(&lane.expected) {
                out.push((channel, next));
                lane.expected = triad_add(lane.expected, 1);
                delivered += 1;
            }
            Ok(Admission::Delivered(delivered))
        } else if distance < TRIAD_HALF {
            if lane.held.len() >= self.max_held && !lane.held.contains_key(&index) {
                return Err(SessionError::OrderingQueueOverload);
            }
            lane.held.entry(index).or_insert(payload);
            Ok(Admission::Held)
        } else {
            Ok(Admission::Stale)
        }
    }

    /// Messages waiting on a gap, across all channels.
    pub fn held(&self) -> usize {
        self.ordered.iter().map(|lane| lane.held.len()).sum()
    }

    pub fn clear(&mut self) {
        for lane in &mut self.ordered {
            lane.held.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TRIAD_MASK;

    fn bytes(n: u32) -> Bytes {
        Bytes::from(n.to_le_bytes().to_vec())
    }

    fn admit_ordered(
        engine: &mut OrderingEngine,
        index: u32,
        out: &mut Vec<(u8, Bytes)>,
    ) -> Admission {
        engine
            .admit(Reliability::ReliableOrdered, 0, Some(index), bytes(index), out)
            .unwrap()
    }

    // ─── Message Window Tests ───────────────────────────────────────────

    #[test]
    fn window_rejects_duplicates() {
        let mut w = MessageWindow::new(16);
        assert!(w.insert(0));
        assert!(!w.insert(0));
        assert!(w.insert(2));
        assert!(!w.insert(2));
        assert_eq!(w.base(), 1);
        assert!(w.insert(1));
        assert_eq!(w.base(), 3);
        assert_eq!(w.pending(), 0);
        assert!(w.contains(1));
        assert!(!w.contains(3));
    }

    #[test]
    fn window_wraps() {
        let mut w = MessageWindow::new(16);
        w.base = TRIAD_MASK - 3;
        let start = w.base();
        for k in 0..8 {
            assert!(w.insert(triad_add(start, k)));
        }
        assert_eq!(w.base(), triad_add(start, 8));
        assert!(!w.insert(TRIAD_MASK));
    }

    #[test]
    fn window_overflow_slides_base() {
        let mut w = MessageWindow::new(4);
        // Index 0 never arrives.
        for i in 1..=5 {
            assert!(w.insert(i));
        }
        assert_eq!(w.base(), 6);
        assert_eq!(w.pending(), 0);
    }

    // ─── Outbound Tests ─────────────────────────────────────────────────

    #[test]
    fn counters_are_independent() {
        let mut e = OrderingEngine::new(4, 8, 8);
        assert_eq!(e.next_message_index(), 0);
        assert_eq!(e.next_message_index(), 1);
        assert_eq!(e.assign(Reliability::ReliableOrdered, 1).unwrap(), Some(0));
        assert_eq!(e.assign(Reliability::ReliableOrdered, 1).unwrap(), Some(1));
        assert_eq!(e.assign(Reliability::UnreliableSequenced, 1).unwrap(), Some(0));
        assert_eq!(e.assign(Reliability::ReliableOrdered, 2).unwrap(), Some(0));
        assert_eq!(e.assign(Reliability::Reliable, 1).unwrap(), None);
    }

    #[test]
    fn invalid_channel_rejected() {
        let mut e = OrderingEngine::new(4, 8, 8);
        assert_eq!(
            e.assign(Reliability::ReliableOrdered, 4),
            Err(SessionError::InvalidChannel {
                channel: 4,
                channels: 4
            })
        );
    }

    // ─── Inbound Tests ──────────────────────────────────────────────────

    #[test]
    fn ordered_buffers_until_gap_fills() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        assert_eq!(admit_ordered(&mut e, 2, &mut out), Admission::Held);
        assert_eq!(admit_ordered(&mut e, 1, &mut out), Admission::Held);
        assert!(out.is_empty());
        assert_eq!(admit_ordered(&mut e, 0, &mut out), Admission::Delivered(3));
        let order: Vec<_> = out.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(order, vec![bytes(0), bytes(1), bytes(2)]);
        assert_eq!(e.held(), 0);
    }

    #[test]
    fn ordered_arrival_2_0_3_1_delivers_0_to_3() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        assert_eq!(admit_ordered(&mut e, 2, &mut out), Admission::Held);
        assert_eq!(admit_ordered(&mut e, 0, &mut out), Admission::Delivered(1));
        assert_eq!(admit_ordered(&mut e, 3, &mut out), Admission::Held);
        assert_eq!(admit_ordered(&mut e, 1, &mut out), Admission::Delivered(3));
        let order: Vec<_> = out.into_iter().map(|(_, p)| p).collect();
        assert_eq!(order, vec![bytes(0), bytes(1), bytes(2), bytes(3)]);
    }

    #[test]
    fn ordered_drops_behind() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        admit_ordered(&mut e, 0, &mut out);
        assert_eq!(admit_ordered(&mut e, 0, &mut out), Admission::Stale);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ordered_overload() {
        let mut e = OrderingEngine::new(1, 2, 8);
        let mut out = Vec::new();
        admit_ordered(&mut e, 1, &mut out);
        admit_ordered(&mut e, 2, &mut out);
        assert_eq!(
            e.admit(Reliability::ReliableOrdered, 0, Some(3), bytes(3), &mut out),
            Err(SessionError::OrderingQueueOverload)
        );
    }

    #[test]
    fn ordered_lanes_are_per_channel() {
        let mut e = OrderingEngine::new(2, 8, 8);
        let mut out = Vec::new();
        e.admit(Reliability::ReliableOrdered, 0, Some(1), bytes(1), &mut out)
            .unwrap();
        let admitted = e
            .admit(Reliability::ReliableOrdered, 1, Some(0), bytes(0), &mut out)
            .unwrap();
        assert_eq!(admitted, Admission::Delivered(1));
        assert_eq!(out, vec![(1, bytes(0))]);
    }

    #[test]
    fn sequenced_keeps_newest_only() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        let seq = Reliability::UnreliableSequenced;
        assert_eq!(
            e.admit(seq, 0, Some(5), bytes(5), &mut out).unwrap(),
            Admission::Delivered(1)
        );
        assert_eq!(
            e.admit(seq, 0, Some(3), bytes(3), &mut out).unwrap(),
            Admission::Stale
        );
        assert_eq!(
            e.admit(seq, 0, Some(5), bytes(5), &mut out).unwrap(),
            Admission::Stale
        );
        assert_eq!(
            e.admit(seq, 0, Some(6), bytes(6), &mut out).unwrap(),
            Admission::Delivered(1)
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn sequenced_arrival_5_3_7_6_delivers_5_7() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        for index in [5, 3, 7, 6] {
            e.admit(Reliability::UnreliableSequenced, 0, Some(index), bytes(index), &mut out)
                .unwrap();
        }
        let delivered: Vec<_> = out.into_iter().map(|(_, p)| p).collect();
        assert_eq!(delivered, vec![bytes(5), bytes(7)]);
    }

    #[test]
    fn sequenced_across_wrap() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        let seq = Reliability::ReliableSequenced;
        e.admit(seq, 0, Some(TRIAD_MASK), bytes(0), &mut out).unwrap();
        assert_eq!(
            e.admit(seq, 0, Some(0), bytes(1), &mut out).unwrap(),
            Admission::Delivered(1)
        );
    }

    #[test]
    fn unordered_delivers_immediately() {
        let mut e = OrderingEngine::new(1, 8, 8);
        let mut out = Vec::new();
        let admitted = e
            .admit(Reliability::Reliable, 0, None, bytes(9), &mut out)
            .unwrap();
        assert_eq!(admitted, Admission::Delivered(1));
    }
}
