use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::thread;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use quanta::{Clock, Instant};
use raknet_transport::arq::ReceiptId;
use raknet_transport::stats::SessionStats;
use raknet_transport::wire::{id, OfflinePacket};
use raknet_transport::{
    Connector, HandshakeOutcome, RefusalReason, Reliability, Responder, Response, Session,
    SessionError, SessionEvent, SessionState,
};

use crate::config::PeerConfig;
use crate::handler::{Context, PeerInfo, SessionHandler};
use crate::socket::{PeerSocket, RECV_BUFFER};

/// Error returned by [`PeerHandle`] operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer worker has stopped")]
    Stopped,
    #[error("command queue is full")]
    Full,
    #[error("no session with {0}")]
    UnknownPeer(SocketAddr),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Requests from the application to the worker thread.
enum Command {
    Connect(SocketAddr),
    Send {
        address: SocketAddr,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
        reply: Sender<Result<Option<ReceiptId>, PeerError>>,
    },
    Disconnect(SocketAddr),
    Stats {
        address: SocketAddr,
        reply: Sender<Option<SessionStats>>,
    },
    Block {
        address: IpAddr,
        duration: Option<Duration>,
    },
    Unblock(IpAddr),
    Shutdown,
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Cloneable, thread-safe handle to a running [`Peer`].
#[derive(Clone)]
pub struct PeerHandle {
    commands: Sender<Command>,
    local_addr: SocketAddr,
    guid: u64,
}

impl PeerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    fn command(&self, command: Command) -> Result<(), PeerError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => PeerError::Full,
            TrySendError::Disconnected(_) => PeerError::Stopped,
        })
    }

    /// Start the offline handshake with `address`. The outcome arrives as
    /// `on_connect` or `on_connect_failed`.
    pub fn connect(&self, address: SocketAddr) -> Result<(), PeerError> {
        self.command(Command::Connect(address))
    }

    /// Queue a message; waits for the worker to accept or reject it.
    pub fn send(
        &self,
        address: SocketAddr,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<ReceiptId>, PeerError> {
        let (reply, result) = bounded(1);
        self.command(Command::Send {
            address,
            reliability,
            channel,
            payload,
            reply,
        })?;
        result.recv().map_err(|_| PeerError::Stopped)?
    }

    pub fn disconnect(&self, address: SocketAddr) -> Result<(), PeerError> {
        self.command(Command::Disconnect(address))
    }

    pub fn stats(&self, address: SocketAddr) -> Result<SessionStats, PeerError> {
        let (reply, result) = bounded(1);
        self.command(Command::Stats { address, reply })?;
        result
            .recv()
            .map_err(|_| PeerError::Stopped)?
            .ok_or(PeerError::UnknownPeer(address))
    }

    /// Refuse `address` for `duration` (`None` blocks until [`unblock`]).
    /// Its sessions are closed, new attempts are answered with
    /// ConnectionBanned and its connected traffic is dropped.
    ///
    /// [`unblock`]: PeerHandle::unblock
    pub fn block(&self, address: IpAddr, duration: Option<Duration>) -> Result<(), PeerError> {
        self.command(Command::Block { address, duration })
    }

    pub fn unblock(&self, address: IpAddr) -> Result<(), PeerError> {
        self.command(Command::Unblock(address))
    }

    /// Ask the worker to disconnect every session and exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

/// A bound UDP socket with its worker thread.
///
/// The worker owns every session; the application talks to it through a
/// bounded command channel. Dropping the peer disconnects all sessions and
/// joins the worker.
pub struct Peer {
    handle: PeerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl Peer {
    pub fn bind(config: PeerConfig, handler: impl SessionHandler) -> anyhow::Result<Self> {
        let socket = PeerSocket::bind(config.bind, config.tick_interval)
            .with_context(|| format!("binding {}", config.bind))?;
        let local_addr = socket.local_addr()?;
        let guid = config.guid.unwrap_or_else(rand::random::<u64>);
        let (commands, command_rx) = bounded(config.command_capacity);

        let worker = Worker::new(config, guid, socket, handler);
        let thread = thread::Builder::new()
            .name("raknet-peer".into())
            .spawn(move || worker.run(command_rx))
            .context("spawning peer worker")?;

        tracing::info!(%local_addr, guid, "peer bound");
        Ok(Peer {
            handle: PeerHandle {
                commands,
                local_addr,
                guid,
            },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn guid(&self) -> u64 {
        self.handle.guid
    }

    /// Disconnect everything and wait for the worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

struct Worker<H> {
    config: PeerConfig,
    guid: u64,
    socket: PeerSocket,
    clock: Clock,
    responder: Responder,
    sessions: HashMap<SocketAddr, Session>,
    connecting: HashMap<SocketAddr, Connector>,
    /// Blocked hosts and when the block lapses (`None` = never).
    blocked: HashMap<IpAddr, Option<Instant>>,
    handler: H,
    last_tick: Instant,
}

impl<H: SessionHandler> Worker<H> {
    fn new(config: PeerConfig, guid: u64, socket: PeerSocket, handler: H) -> Self {
        let clock = Clock::new();
        let responder = Responder::new(config.session.clone(), guid, config.identifier.clone());
        Worker {
            last_tick: clock.now(),
            config,
            guid,
            socket,
            clock,
            responder,
            sessions: HashMap::new(),
            connecting: HashMap::new(),
            blocked: HashMap::new(),
            handler,
        }
    }

    fn run(mut self, commands: Receiver<Command>) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            loop {
                match commands.try_recv() {
                    Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                        self.shutdown();
                        return;
                    }
                    Ok(command) => self.apply(command),
                    Err(TryRecvError::Empty) => break,
                }
            }

            match self.socket.recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    let now = self.clock.now();
                    self.on_datagram(Bytes::copy_from_slice(&buf[..n]), from, now);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "recv failed");
                    thread::sleep(self.config.tick_interval);
                }
            }

            let now = self.clock.now();
            if now.saturating_duration_since(self.last_tick) >= self.config.tick_interval {
                self.tick(now);
                self.last_tick = now;
            }
            self.service(now);
        }
    }

    fn apply(&mut self, command: Command) {
        let now = self.clock.now();
        match command {
            Command::Connect(address) => {
                if self.sessions.contains_key(&address) || self.connecting.contains_key(&address) {
                    tracing::debug!(%address, "already connected or connecting");
                    return;
                }
                tracing::debug!(%address, "connecting");
                let mut connector =
                    Connector::new(self.config.session.clone(), self.guid, address, now);
                match connector.poll(now) {
                    Ok(Some(probe)) => self.socket.send_to(&probe, address),
                    Ok(None) => {}
                    Err(e) => {
                        self.handler.on_connect_failed(address, &e);
                        return;
                    }
                }
                self.connecting.insert(address, connector);
            }
            Command::Send {
                address,
                reliability,
                channel,
                payload,
                reply,
            } => {
                let result = match self.sessions.get_mut(&address) {
                    Some(session) => session
                        .send(reliability, channel, payload)
                        .map_err(PeerError::from),
                    None => Err(PeerError::UnknownPeer(address)),
                };
                let _ = reply.send(result);
            }
            Command::Disconnect(address) => {
                if let Some(session) = self.sessions.get_mut(&address) {
                    session.disconnect(now);
                } else if self.connecting.remove(&address).is_some() {
                    tracing::debug!(%address, "connection attempt abandoned");
                }
            }
            Command::Stats { address, reply } => {
                let _ = reply.send(self.sessions.get(&address).map(Session::stats));
            }
            Command::Block { address, duration } => {
                tracing::info!(%address, ?duration, "address blocked");
                self.blocked.insert(address, duration.map(|d| now + d));
                for (addr, session) in self.sessions.iter_mut() {
                    if addr.ip() == address {
                        session.disconnect(now);
                    }
                }
            }
            Command::Unblock(address) => {
                if self.blocked.remove(&address).is_some() {
                    tracing::info!(%address, "address unblocked");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn is_blocked(&self, address: IpAddr, now: Instant) -> bool {
        match self.blocked.get(&address) {
            Some(Some(until)) => now < *until,
            Some(None) => true,
            None => false,
        }
    }

    fn on_datagram(&mut self, raw: Bytes, from: SocketAddr, now: Instant) {
        let Some(&first) = raw.first() else {
            return;
        };
        if self.is_blocked(from.ip(), now) {
            if first == id::OPEN_CONNECTION_REQUEST_1 || first == id::OPEN_CONNECTION_REQUEST_2 {
                tracing::debug!(%from, "connection attempt from blocked address");
                let refusal = self.responder.refuse(RefusalReason::Banned);
                self.socket.send_to(&refusal, from);
            }
            return;
        }
        if id::is_datagram(first) || first == id::ACK || first == id::NACK {
            match self.sessions.get_mut(&from) {
                Some(session) => session.receive(raw, now),
                None => tracing::trace!(%from, "connected traffic from unknown address"),
            }
            return;
        }

        let packet = match OfflinePacket::decode(raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::trace!(%from, error = %e, "undecodable offline packet");
                return;
            }
        };

        if let Some(connector) = self.connecting.get_mut(&from) {
            match connector.handle(&packet, now) {
                Ok(HandshakeOutcome::Send(bytes)) => self.socket.send_to(&bytes, from),
                Ok(HandshakeOutcome::Connected(session)) => {
                    self.connecting.remove(&from);
                    self.sessions.insert(from, *session);
                }
                Ok(HandshakeOutcome::Ignored) => {}
                Err(e) => {
                    self.connecting.remove(&from);
                    tracing::info!(address = %from, error = %e, "connection attempt failed");
                    self.handler.on_connect_failed(from, &e);
                }
            }
            return;
        }
        self.respond(&packet, from, now);
    }

    fn is_full(&self) -> bool {
        self.sessions.len() >= self.config.max_connections
    }

    /// Server side of the offline exchange.
    fn respond(&mut self, packet: &OfflinePacket, from: SocketAddr, now: Instant) {
        match *packet {
            OfflinePacket::UnconnectedPing {
                open_connections_only: true,
                ..
            } if self.is_full() => return,
            OfflinePacket::OpenConnectionRequest2 { client_guid, .. } => {
                if let Some(existing) = self.sessions.get(&from) {
                    let retry = existing.state() == SessionState::Handshaking
                        && existing.remote_guid() == client_guid;
                    if !retry {
                        tracing::debug!(%from, "request 2 from a connected address");
                        let refusal = self.responder.refuse(RefusalReason::AlreadyConnected);
                        self.socket.send_to(&refusal, from);
                        return;
                    }
                    // Reply 2 was lost: answer again and keep the session.
                    if let Response::Accept { reply, .. } = self.responder.handle(packet, from, now) {
                        self.socket.send_to(&reply, from);
                    }
                    return;
                }
                if self.is_full() {
                    tracing::debug!(%from, sessions = self.sessions.len(), "no free incoming connections");
                    let refusal = self.responder.refuse(RefusalReason::NoFreeSlots);
                    self.socket.send_to(&refusal, from);
                    return;
                }
            }
            _ => {}
        }

        match self.responder.handle(packet, from, now) {
            Response::Reply(bytes) => self.socket.send_to(&bytes, from),
            Response::Accept { reply, session } => {
                tracing::debug!(%from, guid = session.remote_guid(), mtu = session.mtu(), "session allocated");
                self.socket.send_to(&reply, from);
                self.sessions.insert(from, *session);
            }
            Response::Ignore => tracing::trace!(%from, id = packet.id(), "offline packet ignored"),
        }
    }

    fn tick(&mut self, now: Instant) {
        self.blocked.retain(|address, until| match until {
            Some(until) if now >= *until => {
                tracing::info!(%address, "block expired");
                false
            }
            _ => true,
        });

        for session in self.sessions.values_mut() {
            session.tick(now);
        }

        let mut failed = Vec::new();
        for (address, connector) in self.connecting.iter_mut() {
            match connector.poll(now) {
                Ok(Some(bytes)) => self.socket.send_to(&bytes, *address),
                Ok(None) => {}
                Err(e) => failed.push((*address, e)),
            }
        }
        for (address, error) in failed {
            self.connecting.remove(&address);
            tracing::info!(%address, %error, "connection attempt failed");
            self.handler.on_connect_failed(address, &error);
        }
    }

    /// Flush every session to the socket and hand its events to the handler.
    fn service(&mut self, now: Instant) {
        let mut pending = Vec::new();
        let mut closed = Vec::new();
        for (address, session) in self.sessions.iter_mut() {
            session.flush(now);
            for raw in session.drain_output() {
                self.socket.send_to(&raw, *address);
            }
            let events: Vec<SessionEvent> = session.drain_events().collect();
            if !events.is_empty() {
                pending.push((PeerInfo::from(&*session), events));
            }
            // Everything up to and including Disconnected has been drained.
            if session.is_closed() {
                closed.push(*address);
            }
        }

        for (peer, events) in pending {
            let mut ctx = Context {
                sessions: &mut self.sessions,
                now,
            };
            for event in events {
                match event {
                    SessionEvent::Connected => {
                        tracing::info!(address = %peer.address, guid = peer.guid, mtu = peer.mtu, "peer connected");
                        self.handler.on_connect(&peer, &mut ctx);
                    }
                    SessionEvent::Message { channel, payload } => {
                        self.handler.on_message(&peer, channel, payload, &mut ctx);
                    }
                    SessionEvent::Acknowledged(receipt) => {
                        self.handler.on_receipt(&peer, receipt, true);
                    }
                    SessionEvent::Lost(receipt) => {
                        self.handler.on_receipt(&peer, receipt, false);
                    }
                    SessionEvent::Disconnected(reason) => {
                        self.handler.on_disconnect(&peer, &reason);
                    }
                }
            }
        }

        for address in closed {
            self.sessions.remove(&address);
        }
    }

    fn shutdown(&mut self) {
        let now = self.clock.now();
        for session in self.sessions.values_mut() {
            session.disconnect(now);
        }
        self.connecting.clear();
        self.service(now);
        tracing::info!(
            datagrams_sent = self.socket.datagrams_sent(),
            bytes_sent = self.socket.bytes_sent(),
            send_errors = self.socket.send_errors(),
            "peer stopped"
        );
    }
}
