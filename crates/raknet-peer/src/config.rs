use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context as _};
use raknet_transport::SessionConfig;
use serde::Deserialize;

/// Raw TOML shape. Every field is optional; durations are milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerConfigInput {
    pub bind: Option<String>,
    pub guid: Option<u64>,
    pub identifier: Option<String>,
    pub max_connections: Option<usize>,
    pub tick_interval_ms: Option<u64>,
    pub command_capacity: Option<usize>,
    pub session: SessionConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub channels: Option<u8>,
    pub protocol_version: Option<u8>,
    pub mtu_candidates: Option<Vec<u16>>,
    pub mtu_attempts: Option<u32>,
    pub mtu_probe_timeout_ms: Option<u64>,
    pub min_mtu: Option<u16>,
    pub max_mtu: Option<u16>,
    pub handshake_timeout_ms: Option<u64>,
    pub liveness_timeout_ms: Option<u64>,
    pub ping_interval_ms: Option<u64>,
    pub keepalive_interval_ms: Option<u64>,
    pub initial_rto_ms: Option<u64>,
    pub rto_floor_ms: Option<u64>,
    pub rto_ceiling_ms: Option<u64>,
    pub max_retransmits: Option<u32>,
    pub max_resend_buffer: Option<usize>,
    pub max_split_entries: Option<usize>,
    pub max_split_count: Option<u32>,
    pub split_timeout_ms: Option<u64>,
    pub max_ordering_queue: Option<usize>,
    pub dedup_window: Option<usize>,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub bind: SocketAddr,
    /// Random when not configured.
    pub guid: Option<u64>,
    /// Server identifier returned in unconnected pongs.
    pub identifier: String,
    pub max_connections: usize,
    /// Socket read timeout and session tick period.
    pub tick_interval: Duration,
    pub command_capacity: usize,
    pub session: SessionConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 19132)),
            guid: None,
            identifier: String::new(),
            max_connections: 64,
            tick_interval: Duration::from_millis(10),
            command_capacity: 1024,
            session: SessionConfig::default(),
        }
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl SessionConfigInput {
    pub fn resolve(self) -> anyhow::Result<SessionConfig> {
        let d = SessionConfig::default();
        let config = SessionConfig {
            channels: self.channels.unwrap_or(d.channels),
            protocol_version: self.protocol_version.unwrap_or(d.protocol_version),
            mtu_candidates: self.mtu_candidates.unwrap_or(d.mtu_candidates),
            mtu_attempts: self.mtu_attempts.unwrap_or(d.mtu_attempts).max(1),
            mtu_probe_timeout: millis(self.mtu_probe_timeout_ms, d.mtu_probe_timeout),
            min_mtu: self.min_mtu.unwrap_or(d.min_mtu),
            max_mtu: self.max_mtu.unwrap_or(d.max_mtu),
            handshake_timeout: millis(self.handshake_timeout_ms, d.handshake_timeout),
            liveness_timeout: millis(self.liveness_timeout_ms, d.liveness_timeout),
            ping_interval: millis(self.ping_interval_ms, d.ping_interval),
            keepalive_interval: millis(self.keepalive_interval_ms, d.keepalive_interval),
            initial_rto: millis(self.initial_rto_ms, d.initial_rto),
            rto_floor: millis(self.rto_floor_ms, d.rto_floor),
            rto_ceiling: millis(self.rto_ceiling_ms, d.rto_ceiling),
            max_retransmits: self.max_retransmits.unwrap_or(d.max_retransmits),
            max_resend_buffer: self.max_resend_buffer.unwrap_or(d.max_resend_buffer).max(16),
            max_split_entries: self.max_split_entries.unwrap_or(d.max_split_entries).max(1),
            max_split_count: self.max_split_count.unwrap_or(d.max_split_count).max(1),
            split_timeout: millis(self.split_timeout_ms, d.split_timeout),
            max_ordering_queue: self.max_ordering_queue.unwrap_or(d.max_ordering_queue),
            dedup_window: self.dedup_window.unwrap_or(d.dedup_window).max(16),
        };

        if config.channels == 0 {
            bail!("session.channels must be at least 1");
        }
        if config.min_mtu > config.max_mtu {
            bail!(
                "session.min_mtu {} exceeds max_mtu {}",
                config.min_mtu,
                config.max_mtu
            );
        }
        if config.mtu_candidates.is_empty() {
            bail!("session.mtu_candidates is empty");
        }
        if let Some(bad) = config
            .mtu_candidates
            .iter()
            .find(|&&mtu| !config.accepts_mtu(mtu))
        {
            bail!(
                "mtu candidate {bad} outside {}..={}",
                config.min_mtu,
                config.max_mtu
            );
        }
        if config.rto_floor > config.rto_ceiling {
            bail!("session.rto_floor_ms exceeds rto_ceiling_ms");
        }
        Ok(config)
    }
}

impl PeerConfigInput {
    pub fn resolve(self) -> anyhow::Result<PeerConfig> {
        let d = PeerConfig::default();
        let bind = match self.bind.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => addr
                .parse()
                .with_context(|| format!("invalid bind address '{addr}'"))?,
            _ => d.bind,
        };
        Ok(PeerConfig {
            bind,
            guid: self.guid,
            identifier: self.identifier.unwrap_or(d.identifier),
            max_connections: self.max_connections.unwrap_or(d.max_connections),
            tick_interval: millis(self.tick_interval_ms, d.tick_interval).max(Duration::from_millis(1)),
            command_capacity: self.command_capacity.unwrap_or(d.command_capacity).max(1),
            session: self.session.resolve()?,
        })
    }
}

impl PeerConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        if input.trim().is_empty() {
            return Ok(PeerConfig::default());
        }
        let parsed: PeerConfigInput = toml::from_str(input).context("invalid config TOML")?;
        parsed.resolve()
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}
