//! # Split Reassembly
//!
//! Messages larger than one datagram are cut into fragments sharing a split
//! id. The receiving side collects fragments in a bounded slab arena until
//! every index is present, then hands back the concatenated payload.
//!
//! Bounds:
//!
//! - at most `max_split_entries` partially received messages at once;
//! - at most `max_split_count` fragments per message;
//! - an entry older than `split_timeout` fails the session.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use quanta::Instant;
use slab::Slab;

use crate::error::SessionError;
use crate::frame::SplitInfo;

// ─── Outbound ───────────────────────────────────────────────────────────────

/// Cut `payload` into zero-copy slices of at most `max_fragment` bytes.
pub fn split_payload(payload: &Bytes, max_fragment: usize) -> Vec<Bytes> {
    let max_fragment = max_fragment.max(1);
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    (0..payload.len())
        .step_by(max_fragment)
        .map(|start| payload.slice(start..(start + max_fragment).min(payload.len())))
        .collect()
}

/// Wrapping source of split ids.
#[derive(Debug, Default, Clone)]
pub struct SplitIdGenerator {
    next: u16,
}

impl SplitIdGenerator {
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

// ─── Reassembly Entry ───────────────────────────────────────────────────────

#[derive(Debug)]
struct Entry {
    split_id: u16,
    fragments: Vec<Option<Bytes>>,
    received: u32,
    first_seen: Instant,
    reliable: bool,
}

impl Entry {
    fn count(&self) -> u32 {
        self.fragments.len() as u32
    }

    fn assemble(self) -> Bytes {
        let len = self.fragments.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(len);
        for fragment in self.fragments.into_iter().flatten() {
            buf.extend_from_slice(&fragment);
        }
        buf.freeze()
    }
}

/// What happened to one inbound fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    /// Stored; the message is still incomplete.
    Pending,
    /// Last missing fragment; the full payload.
    Complete(Bytes),
    /// Duplicate index or a count that disagrees with the open entry.
    Dropped,
}

// ─── Reassembly Buffer ──────────────────────────────────────────────────────

/// Bounded arena of partially received split messages.
#[derive(Debug)]
pub struct ReassemblyBuffer {
    entries: Slab<Entry>,
    by_id: HashMap<u16, usize>,
    max_entries: usize,
    max_count: u32,
    timeout: Duration,
}

impl ReassemblyBuffer {
    pub fn new(max_entries: usize, max_count: u32, timeout: Duration) -> Self {
        ReassemblyBuffer {
            entries: Slab::with_capacity(max_entries),
            by_id: HashMap::with_capacity(max_entries),
            max_entries: max_entries.max(1),
            max_count,
            timeout,
        }
    }

    /// Store one fragment. `reliable` marks whether the sender will resend
    /// missing pieces; only unreliable entries may be evicted for room.
    pub fn insert(
        &mut self,
        split: SplitInfo,
        payload: Bytes,
        reliable: bool,
        now: Instant,
    ) -> Result<Fragment, SessionError> {
        if split.count > self.max_count {
            tracing::debug!(
                split_id = split.id,
                count = split.count,
                max = self.max_count,
                "split count over limit"
            );
            return Err(SessionError::SplitQueueOverload);
        }
        if split.index >= split.count {
            return Ok(Fragment::Dropped);
        }

        let key = match self.by_id.get(&split.id) {
            Some(&key) => key,
            None => {
                if self.entries.len() >= self.max_entries {
                    self.evict_unreliable()?;
                }
                let key = self.entries.insert(Entry {
                    split_id: split.id,
                    fragments: vec![None; split.count as usize],
                    received: 0,
                    first_seen: now,
                    reliable,
                });
                self.by_id.insert(split.id, key);
                key
            }
        };

        let entry = &mut self.entries[key];
        if entry.count() != split.count {
            tracing::debug!(
                split_id = split.id,
                expected = entry.count(),
                got = split.count,
                "split count mismatch"
            );
            return Ok(Fragment::Dropped);
        }
        let slot = &mut entry.fragments[split.index as usize];
        if slot.is_some() {
            return Ok(Fragment::Dropped);
        }
        *slot = Some(payload);
        entry.received += 1;
        entry.reliable |= reliable;

        if entry.received < entry.count() {
            return Ok(Fragment::Pending);
        }
        self.by_id.remove(&split.id);
        Ok(Fragment::Complete(self.entries.remove(key).assemble()))
    }

    fn evict_unreliable(&mut self) -> Result<(), SessionError> {
        let victim = self
            .entries
            .iter()
            .filter(|(_, e)| !e.reliable)
            .min_by_key(|(_, e)| e.first_seen)
            .map(|(key, _)| key);
        match victim {
            Some(key) => {
                let entry = self.entries.remove(key);
                self.by_id.remove(&entry.split_id);
                tracing::debug!(
                    split_id = entry.split_id,
                    received = entry.received,
                    count = entry.count(),
                    "evicted unreliable split"
                );
                Ok(())
            }
            None => Err(SessionError::SplitQueueOverload),
        }
    }

    /// Fail if any entry has waited longer than the split timeout.
    pub fn sweep(&self, now: Instant) -> Result<(), SessionError> {
        let expired = self
            .entries
            .iter()
            .find(|(_, e)| now.saturating_duration_since(e.first_seen) > self.timeout);
        if let Some((_, entry)) = expired {
            tracing::debug!(
                split_id = entry.split_id,
                received = entry.received,
                count = entry.count(),
                "split reassembly timed out"
            );
            return Err(SessionError::SplitQueueOverload);
        }
        Ok(())
    }

    /// Number of partially received messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_id.clear();
    }
}
