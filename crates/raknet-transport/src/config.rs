//! Session tuning knobs. Every bound, timer and backoff constant used by the
//! protocol engine lives here so the runtime can override it from its config
//! file.

use std::time::Duration;

/// Protocol version byte sent in the first MTU probe.
pub const PROTOCOL_VERSION: u8 = 9;

/// Per-session configuration shared by [`Connector`](crate::handshake::Connector),
/// [`Responder`](crate::handshake::Responder) and [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Number of ordering channels; valid channels are `0..channels`.
    pub channels: u8,
    pub protocol_version: u8,

    // MTU discovery
    /// Probe sizes, largest first.
    pub mtu_candidates: Vec<u16>,
    /// Probes sent per candidate before falling back to the next one.
    pub mtu_attempts: u32,
    pub mtu_probe_timeout: Duration,
    pub min_mtu: u16,
    pub max_mtu: u16,

    // Timers
    pub handshake_timeout: Duration,
    /// Silence after which a peer is considered gone.
    pub liveness_timeout: Duration,
    pub ping_interval: Duration,
    /// Idle time before a keep-alive is sent.
    pub keepalive_interval: Duration,

    // Retransmission
    pub initial_rto: Duration,
    pub rto_floor: Duration,
    pub rto_ceiling: Duration,
    pub max_retransmits: u32,

    // Bounds
    pub max_resend_buffer: usize,
    pub max_split_entries: usize,
    pub max_split_count: u32,
    pub split_timeout: Duration,
    pub max_ordering_queue: usize,
    pub dedup_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            channels: 32,
            protocol_version: PROTOCOL_VERSION,
            mtu_candidates: vec![1492, 1200, 576],
            mtu_attempts: 2,
            mtu_probe_timeout: Duration::from_millis(500),
            min_mtu: 400,
            max_mtu: 1492,
            handshake_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(25),
            ping_interval: Duration::from_millis(2500),
            keepalive_interval: Duration::from_secs(5),
            initial_rto: Duration::from_millis(250),
            rto_floor: Duration::from_millis(50),
            rto_ceiling: Duration::from_secs(4),
            max_retransmits: 16,
            max_resend_buffer: 4096,
            max_split_entries: 16,
            max_split_count: 128,
            split_timeout: Duration::from_secs(30),
            max_ordering_queue: 4096,
            dedup_window: 4096,
        }
    }
}

impl SessionConfig {
    /// Largest MTU this side will agree to.
    pub fn clamp_mtu(&self, mtu: u16) -> u16 {
        mtu.min(self.max_mtu)
    }

    pub fn accepts_mtu(&self, mtu: u16) -> bool {
        (self.min_mtu..=self.max_mtu).contains(&mtu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.channels, 32);
        assert_eq!(cfg.protocol_version, 9);
        assert_eq!(cfg.mtu_candidates, vec![1492, 1200, 576]);
        assert!(cfg.rto_floor < cfg.initial_rto && cfg.initial_rto < cfg.rto_ceiling);
    }

    #[test]
    fn mtu_bounds() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.clamp_mtu(9000), 1492);
        assert_eq!(cfg.clamp_mtu(1200), 1200);
        assert!(cfg.accepts_mtu(400));
        assert!(!cfg.accepts_mtu(399));
        assert!(!cfg.accepts_mtu(1500));
    }
}
