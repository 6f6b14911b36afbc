//! # Session Statistics
//!
//! Per-session counters. All stats serialize to JSON for the runtime's
//! status output.

use std::collections::VecDeque;
use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

use crate::rtt::LatencyStats;

// ─── Session Stats ──────────────────────────────────────────────────────────

/// Counters for one session, both directions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Datagrams sent, including retransmissions.
    pub datagrams_sent: u64,
    /// Data datagrams received, including duplicates.
    pub datagrams_received: u64,
    /// Datagrams resent after a NACK or RTO.
    pub retransmits: u64,
    pub nacks_sent: u64,
    pub nacks_received: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    /// Datagrams or reliable frames seen before.
    pub duplicates_dropped: u64,
    /// Messages handed to the application.
    pub messages_delivered: u64,
    /// Messages accepted from the application.
    pub messages_sent: u64,
    /// Ordered or sequenced frames that arrived behind their lane.
    pub stale_dropped: u64,
    /// Frames that were not valid in the session's state.
    pub handshake_violations: u64,
    /// Datagrams that failed to decode.
    pub decode_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub latency: LatencyStats,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retransmission overhead ratio.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.datagrams_sent == 0 {
            0.0
        } else {
            self.retransmits as f64 / self.datagrams_sent as f64
        }
    }

    /// Duplicates vs. datagrams received.
    pub fn duplicate_ratio(&self) -> f64 {
        if self.datagrams_received == 0 {
            0.0
        } else {
            self.duplicates_dropped as f64 / self.datagrams_received as f64
        }
    }
}

// ─── Rate Counter ───────────────────────────────────────────────────────────

/// Windowed rate counter for bytes/sec or datagrams/sec.
#[derive(Debug, Clone)]
pub struct RateCounter {
    /// Recent samples: (timestamp, value).
    samples: VecDeque<(Instant, u64)>,
    /// Window duration.
    window: Duration,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        RateCounter {
            samples: VecDeque::with_capacity(128),
            window,
        }
    }

    /// Record a sample.
    pub fn record(&mut self, now: Instant, value: u64) {
        self.samples.push_back((now, value));
        self.cleanup(now);
    }

    /// Sum of values in the window, per second.
    pub fn rate(&self, now: Instant) -> f64 {
        self.count_in_window(now) as f64 / self.window.as_secs_f64()
    }

    /// Total count within the window.
    pub fn count_in_window(&self, now: Instant) -> u64 {
        self.samples
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= self.window)
            .map(|(_, v)| v)
            .sum()
    }

    fn cleanup(&mut self, now: Instant) {
        while let Some((t, _)) = self.samples.front() {
            if now.saturating_duration_since(*t) <= self.window {
                break;
            }
            self.samples.pop_front();
        }
    }
}
