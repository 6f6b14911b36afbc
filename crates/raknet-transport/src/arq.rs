//! # ARQ (Automatic Repeat reQuest)
//!
//! Sender side: every datagram that carries a reliable or ack-receipt frame
//! is held in a [`ResendBuffer`] until an ACK covers its sequence number.
//! NACKs trigger an immediate resend; otherwise it is resent once it is
//! older than the RTO, backing off exponentially. Resends reuse the original
//! bytes and sequence number.
//!
//! Receiver side: [`ReceiveTracker`] detects duplicate datagrams. It queues
//! every arrival for acknowledgement and every gap for a NACK.
//!
//! ## Key design decisions
//!
//! - **Karn's rule**: only never-resent datagrams yield RTT samples
//! - **Retry budget**: more than `max_retransmits` resends fails the session
//! - **Bounded**: a full resend buffer is backpressure, not an error

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::codec::{triad_add, triad_distance, triad_newer, TRIAD_HALF};
use crate::error::SessionError;
use crate::record::RecordSet;

/// The RTO doubles per resend of an entry, up to this many times.
const MAX_BACKOFF_SHIFT: u32 = 4;

/// Caller-visible handle for an ack-receipt message.
pub type ReceiptId = u32;

// ─── Resend Buffer (Sender-Side) ────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Unacked {
    bytes: Bytes,
    sent_at: Instant,
    resends: u32,
    /// `false` when only unreliable ack-receipt frames are aboard: such a
    /// datagram is reported lost instead of being resent.
    resendable: bool,
    receipts: Vec<ReceiptId>,
}

/// What an ACK resolved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Acknowledged {
    /// Datagrams removed from the buffer.
    pub datagrams: usize,
    /// Ack receipts carried by those datagrams.
    pub receipts: Vec<ReceiptId>,
    /// One sample per never-resent datagram.
    pub rtt_samples: Vec<Duration>,
}

/// What a NACK or RTO sweep asks the session to do.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Encoded datagrams to put back on the wire.
    pub resend: Vec<Bytes>,
    /// Receipts of unreliable datagrams given up on.
    pub lost: Vec<ReceiptId>,
}

/// Sent-but-unacknowledged datagrams keyed by sequence number.
#[derive(Debug)]
pub struct ResendBuffer {
    entries: BTreeMap<u32, Unacked>,
    capacity: usize,
    max_retransmits: u32,
}

impl ResendBuffer {
    pub fn new(capacity: usize, max_retransmits: u32) -> Self {
        ResendBuffer {
            entries: BTreeMap::new(),
            capacity,
            max_retransmits,
        }
    }

    pub fn insert(
        &mut self,
        sequence: u32,
        bytes: Bytes,
        resendable: bool,
        receipts: Vec<ReceiptId>,
        now: Instant,
    ) {
        self.entries.insert(
            sequence,
            Unacked {
                bytes,
                sent_at: now,
                resends: 0,
                resendable,
                receipts,
            },
        );
    }

    pub fn acknowledge(&mut self, records: &RecordSet, now: Instant) -> Acknowledged {
        let mut acked = Acknowledged::default();
        for sequence in self.held(records) {
            let Some(entry) = self.entries.remove(&sequence) else {
                continue;
            };
            acked.datagrams += 1;
            if entry.resends == 0 {
                acked
                    .rtt_samples
                    .push(now.saturating_duration_since(entry.sent_at));
            }
            acked.receipts.extend(entry.receipts);
        }
        acked
    }

    /// Resend every NACKed sequence still held, right away.
    pub fn negative_acknowledge(
        &mut self,
        records: &RecordSet,
        now: Instant,
    ) -> Result<Recovery, SessionError> {
        let mut recovery = Recovery::default();
        for sequence in self.held(records) {
            self.recover(sequence, now, &mut recovery)?;
        }
        Ok(recovery)
    }

    /// Held sequences covered by `records`, each once. Cost follows the
    /// entries actually held, not the width of the ranges.
    fn held(&self, records: &RecordSet) -> Vec<u32> {
        let mut held: Vec<u32> = records
            .records
            .iter()
            .filter(|record| record.start <= record.last())
            .flat_map(|record| self.entries.range(record.start..=record.last()))
            .map(|(&sequence, _)| sequence)
            .collect();
        held.sort_unstable();
        held.dedup();
        held
    }

    /// Resend everything older than `rto`, doubled for each earlier resend.
    pub fn sweep(&mut self, now: Instant, rto: Duration) -> Result<Recovery, SessionError> {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                let wait = rto.saturating_mul(1 << e.resends.min(MAX_BACKOFF_SHIFT));
                now.saturating_duration_since(e.sent_at) >= wait
            })
            .map(|(&sequence, _)| sequence)
            .collect();
        let mut recovery = Recovery::default();
        for sequence in expired {
            self.recover(sequence, now, &mut recovery)?;
        }
        Ok(recovery)
    }

    fn recover(
        &mut self,
        sequence: u32,
        now: Instant,
        recovery: &mut Recovery,
    ) -> Result<(), SessionError> {
        let Some(entry) = self.entries.get_mut(&sequence) else {
            return Ok(());
        };
        if !entry.resendable {
            if let Some(entry) = self.entries.remove(&sequence) {
                recovery.lost.extend(entry.receipts);
            }
            return Ok(());
        }
        recovery
            .resend
            .push(Self::retransmit(entry, sequence, now, self.max_retransmits)?);
        Ok(())
    }

    fn retransmit(
        entry: &mut Unacked,
        sequence: u32,
        now: Instant,
        max_retransmits: u32,
    ) -> Result<Bytes, SessionError> {
        entry.resends += 1;
        if entry.resends > max_retransmits {
            tracing::debug!(sequence, resends = entry.resends, "retransmit budget exhausted");
            return Err(SessionError::SessionTimeout);
        }
        tracing::trace!(sequence, resends = entry.resends, "retransmit");
        entry.sent_at = now;
        Ok(entry.bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Drop everything, returning receipts that will never be acknowledged.
    pub fn clear(&mut self) -> Vec<ReceiptId> {
        let receipts = self
            .entries
            .values_mut()
            .flat_map(|e| std::mem::take(&mut e.receipts))
            .collect();
        self.entries.clear();
        receipts
    }
}

// ─── Receive Tracker (Receiver-Side) ────────────────────────────────────────

/// Tracks received datagram sequence numbers and what to ACK/NACK next.
#[derive(Debug)]
pub struct ReceiveTracker {
    /// Every sequence before this has arrived.
    base: u32,
    /// Arrivals past a gap.
    above: BTreeSet<u32>,
    highest: Option<u32>,
    capacity: usize,
    acks: Vec<u32>,
    nacks: Vec<u32>,
}

impl ReceiveTracker {
    pub fn new(capacity: usize) -> Self {
        ReceiveTracker {
            base: 0,
            above: BTreeSet::new(),
            highest: None,
            capacity: capacity.max(1),
            acks: Vec::new(),
            nacks: Vec::new(),
        }
    }

    /// Record an arrival. Returns `false` for a duplicate, which is still
    /// acknowledged so the sender stops resending it.
    pub fn record(&mut self, sequence: u32) -> bool {
        self.acks.push(sequence);

        let distance = triad_distance(self.base, sequence);
        if distance >= TRIAD_HALF || self.above.contains(&sequence) {
            return false;
        }

        match self.highest {
            Some(highest) if !triad_newer(sequence, highest) => {
                // Late arrival filling a gap.
                self.nacks.retain(|&s| s != sequence);
            }
            _ => {
                let next = self.highest.map_or(self.base, |h| triad_add(h, 1));
                let gap = triad_distance(next, sequence) as usize;
                for k in 0..gap.min(self.capacity) {
                    self.nacks.push(triad_add(next, k as u32));
                }
                self.highest = Some(sequence);
            }
        }

        if distance == 0 {
            self.base = triad_add(self.base, 1);
            self.advance();
        } else {
            self.above.insert(sequence);
            if self.above.len() > self.capacity {
                self.slide();
            }
        }
        true
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
            .min_by_key(|&&s| triad_distance(base, s))
        {
            self.nacks
                .retain(|&s| triad_distance(base, s) >= triad_distance(base, oldest));
            self.base = oldest;
            self.advance();
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.acks.is_empty() || !self.nacks.is_empty()
    }

    pub fn take_acks(&mut self) -> RecordSet {
        let set = RecordSet::from_indices(&self.acks);
        self.acks.clear();
        set
    }

    pub fn take_nacks(&mut self) -> RecordSet {
        let set = RecordSet::from_indices(&self.nacks);
        self.nacks.clear();
        set
    }

    pub fn highest(&self) -> Option<u32> {
        self.highest
    }
}
