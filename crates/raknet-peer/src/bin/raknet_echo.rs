//! # raknet-echo
//!
//! Echo server (and optional client) over the RakNet transport.
//!
//! ## Usage
//!
//! ```bash
//! # Serve on the default port, echoing every message back on its channel
//! raknet-echo --bind 0.0.0.0:19132
//!
//! # Load settings from TOML
//! raknet-echo --config echo.toml
//!
//! # Connect to a server and send 100 reliable ordered messages
//! raknet-echo --bind 0.0.0.0:0 --connect 127.0.0.1:19132 --count 100
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use raknet_peer::{Context, Peer, PeerConfig, PeerInfo, SessionHandler};
use raknet_transport::{DisconnectReason, Reliability, SessionError};

struct EchoHandler {
    connected: Arc<Mutex<HashSet<SocketAddr>>>,
    /// Client mode: echoes are counted, not returned.
    echo: bool,
    received: Arc<AtomicU64>,
}

impl SessionHandler for EchoHandler {
    fn on_connect(&mut self, peer: &PeerInfo, _ctx: &mut Context<'_>) {
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.address);
    }

    fn on_disconnect(&mut self, peer: &PeerInfo, reason: &DisconnectReason) {
        tracing::info!(address = %peer.address, %reason, "peer left");
        self.connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer.address);
    }

    fn on_message(&mut self, peer: &PeerInfo, channel: u8, payload: Bytes, ctx: &mut Context<'_>) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if !self.echo {
            return;
        }
        if let Err(e) = ctx.send(peer.address, Reliability::ReliableOrdered, channel, payload) {
            tracing::warn!(address = %peer.address, error = %e, "echo failed");
        }
    }

    fn on_connect_failed(&mut self, address: SocketAddr, error: &SessionError) {
        tracing::error!(%address, %error, "could not connect");
    }
}

#[derive(Parser)]
#[command(name = "raknet-echo", about = "RakNet echo server and test client")]
struct Cli {
    /// TOML peer configuration.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Local address, overriding the configuration.
    #[arg(long, short)]
    bind: Option<SocketAddr>,

    /// Run as a client against this server instead of echoing.
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Messages to send in client mode.
    #[arg(long, short = 'n', default_value_t = 10)]
    count: u32,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let args = Cli::parse();
    let mut config = match &args.config {
        Some(path) => PeerConfig::load(path)?,
        None => PeerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if config.identifier.is_empty() {
        config.identifier = "raknet-echo".into();
    }

    let connected = Arc::new(Mutex::new(HashSet::new()));
    let received = Arc::new(AtomicU64::new(0));
    let handler = EchoHandler {
        connected: connected.clone(),
        echo: args.connect.is_none(),
        received: received.clone(),
    };

    let mut peer = Peer::bind(config, handler)?;
    let handle = peer.handle();
    tracing::info!(addr = %peer.local_addr(), guid = peer.guid(), "raknet-echo started");

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Client mode ─────────────────────────────────────────────
    if let Some(server) = args.connect {
        handle.connect(server)?;
        let mut waited = Duration::ZERO;
        while running.load(Ordering::Relaxed)
            && !connected
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&server)
        {
            if waited > Duration::from_secs(15) {
                anyhow::bail!("timed out connecting to {server}");
            }
            std::thread::sleep(Duration::from_millis(50));
            waited += Duration::from_millis(50);
        }
        for i in 0..args.count {
            let payload = Bytes::from(format!("echo-{i}"));
            handle.send(server, Reliability::ReliableOrdered, 0, payload)?;
        }
        tracing::info!(count = args.count, %server, "messages sent");
    }

    // ── Stats loop ──────────────────────────────────────────────
    let stats_interval = Duration::from_secs(5);
    let mut last_stats = std::time::Instant::now();
    while running.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_stats.elapsed() < stats_interval {
            continue;
        }
        last_stats = std::time::Instant::now();
        let peers: Vec<SocketAddr> = connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        for address in peers {
            if let Ok(stats) = handle.stats(address) {
                tracing::info!(%address, stats = %serde_json::to_string(&stats)?, "session stats");
            }
        }
        tracing::info!(
            received = received.load(Ordering::Relaxed),
            "messages received"
        );
    }

    peer.shutdown();
    Ok(())
}
