//! # Offline Handshake
//!
//! The two unconnected round trips that precede a [`Session`]:
//!
//! ```text
//!   Connector                                   Responder
//!   ── OpenConnectionRequest1 (padded to MTU) ──▶
//!   ◀───────────── OpenConnectionReply1 (guid, mtu)
//!   ── OpenConnectionRequest2 (addr, mtu, guid) ─▶
//!   ◀─── OpenConnectionReply2 ──── Session::server allocated here
//!   Session::client
//! ```
//!
//! Probes that go unanswered fall back to the next smaller MTU candidate.

use std::net::SocketAddr;

use bytes::Bytes;
use quanta::Instant;

use crate::config::SessionConfig;
use crate::error::{RefusalReason, SessionError};
use crate::session::{Session, SessionState};
use crate::wire::OfflinePacket;

// ─── Connector ──────────────────────────────────────────────────────────────

/// Result of feeding an offline reply to the [`Connector`].
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Send these bytes to the server.
    Send(Bytes),
    /// Offline phase done; the session has its connection request queued.
    Connected(Box<Session>),
    /// Not valid in the current state; nothing changed.
    Ignored,
}

/// Initiator side of the offline exchange, including MTU discovery.
#[derive(Debug)]
pub struct Connector {
    config: SessionConfig,
    guid: u64,
    server_address: SocketAddr,
    state: SessionState,
    candidate: usize,
    /// Probes sent at the current candidate (or request 2 sends).
    attempts: u32,
    last_sent: Option<Instant>,
    started_at: Instant,
    server_guid: u64,
    mtu: u16,
}

impl Connector {
    pub fn new(config: SessionConfig, guid: u64, server_address: SocketAddr, now: Instant) -> Self {
        Connector {
            config,
            guid,
            server_address,
            state: SessionState::OfflineHandshake1,
            candidate: 0,
            attempts: 0,
            last_sent: None,
            started_at: now,
            server_guid: 0,
            mtu: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    /// MTU currently being probed, or the agreed one after reply 1.
    pub fn mtu(&self) -> Option<u16> {
        match self.state {
            SessionState::OfflineHandshake1 => self.config.mtu_candidates.get(self.candidate).copied(),
            _ => Some(self.mtu),
        }
    }

    /// Bytes to send now, if a probe or request 2 is due.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Bytes>, SessionError> {
        if now.saturating_duration_since(self.started_at) > self.config.handshake_timeout {
            return Err(SessionError::SessionTimeout);
        }
        let due = match self.last_sent {
            Some(sent) => now.saturating_duration_since(sent) >= self.config.mtu_probe_timeout,
            None => true,
        };
        if !due {
            return Ok(None);
        }

        let packet = match self.state {
            SessionState::OfflineHandshake1 => {
                if self.attempts >= self.config.mtu_attempts {
                    self.candidate += 1;
                    self.attempts = 0;
                }
                let Some(&mtu) = self.config.mtu_candidates.get(self.candidate) else {
                    tracing::debug!(addr = %self.server_address, "mtu candidates exhausted");
                    return Err(SessionError::SessionTimeout);
                };
                if self.attempts == 0 && self.candidate > 0 {
                    tracing::debug!(addr = %self.server_address, mtu, "falling back to smaller mtu");
                }
                OfflinePacket::OpenConnectionRequest1 {
                    protocol: self.config.protocol_version,
                    mtu,
                }
            }
            SessionState::OfflineHandshake2 => self.request_2(),
            _ => return Ok(None),
        };
        self.attempts += 1;
        self.last_sent = Some(now);
        Ok(Some(packet.encode()))
    }

    fn request_2(&self) -> OfflinePacket {
        OfflinePacket::OpenConnectionRequest2 {
            server_address: self.server_address,
            mtu: self.mtu,
            client_guid: self.guid,
        }
    }

    /// Consume one offline packet from the server.
    pub fn handle(
        &mut self,
        packet: &OfflinePacket,
        now: Instant,
    ) -> Result<HandshakeOutcome, SessionError> {
        match (self.state, packet) {
            (
                SessionState::OfflineHandshake1,
                &OfflinePacket::OpenConnectionReply1 {
                    server_guid,
                    use_security,
                    mtu,
                },
            ) => {
                if use_security {
                    return Err(SessionError::SecurityUnsupported);
                }
                let mtu = self.config.clamp_mtu(mtu);
                if mtu < self.config.min_mtu {
                    tracing::debug!(mtu, "reply 1 mtu below minimum");
                    return Ok(HandshakeOutcome::Ignored);
                }
                self.server_guid = server_guid;
                self.mtu = mtu;
                self.state = SessionState::OfflineHandshake2;
                self.attempts = 1;
                self.last_sent = Some(now);
                Ok(HandshakeOutcome::Send(self.request_2().encode()))
            }
            (
                SessionState::OfflineHandshake2,
                &OfflinePacket::OpenConnectionReply2 {
                    server_guid,
                    mtu,
                    use_encryption,
                    ..
                },
            ) => {
                if use_encryption {
                    return Err(SessionError::SecurityUnsupported);
                }
                if server_guid != self.server_guid {
                    tracing::debug!(
                        expected = self.server_guid,
                        got = server_guid,
                        "reply 2 from a different server"
                    );
                    return Ok(HandshakeOutcome::Ignored);
                }
                let mtu = self.config.clamp_mtu(mtu).max(self.config.min_mtu);
                self.state = SessionState::Handshaking;
                let session = Session::client(
                    self.config.clone(),
                    self.guid,
                    server_guid,
                    self.server_address,
                    mtu,
                    now,
                );
                Ok(HandshakeOutcome::Connected(Box::new(session)))
            }
            (
                SessionState::OfflineHandshake1 | SessionState::OfflineHandshake2,
                &OfflinePacket::IncompatibleProtocolVersion { protocol, .. },
            ) => Err(SessionError::IncompatibleProtocol {
                ours: self.config.protocol_version,
                theirs: protocol,
            }),
            (
                SessionState::OfflineHandshake1 | SessionState::OfflineHandshake2,
                OfflinePacket::NoFreeIncomingConnections { .. },
            ) => Err(SessionError::ConnectionRefused(RefusalReason::NoFreeSlots)),
            (
                SessionState::OfflineHandshake1 | SessionState::OfflineHandshake2,
                OfflinePacket::AlreadyConnected { .. },
            ) => Err(SessionError::ConnectionRefused(RefusalReason::AlreadyConnected)),
            (
                SessionState::OfflineHandshake1 | SessionState::OfflineHandshake2,
                OfflinePacket::ConnectionBanned { .. },
            ) => Err(SessionError::ConnectionRefused(RefusalReason::Banned)),
            (state, packet) => {
                tracing::debug!(
                    ?state,
                    id = packet.id(),
                    error = %SessionError::HandshakeViolation("offline packet invalid for state"),
                    "ignoring"
                );
                Ok(HandshakeOutcome::Ignored)
            }
        }
    }
}

// ─── Responder ──────────────────────────────────────────────────────────────

/// What the [`Responder`] wants done with an offline packet.
#[derive(Debug)]
pub enum Response {
    Reply(Bytes),
    /// Reply 2, plus the session allocated for the new peer.
    Accept { reply: Bytes, session: Box<Session> },
    Ignore,
}

/// Server side of the offline exchange. Stateless: a session exists only
/// once request 2 is accepted.
#[derive(Debug, Clone)]
pub struct Responder {
    config: SessionConfig,
    guid: u64,
    identifier: String,
}

impl Responder {
    pub fn new(config: SessionConfig, guid: u64, identifier: impl Into<String>) -> Self {
        Responder {
            config,
            guid,
            identifier: identifier.into(),
        }
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Refusal for a request 2 the caller will not accept.
    pub fn refuse(&self, reason: RefusalReason) -> Bytes {
        let server_guid = self.guid;
        let packet = match reason {
            RefusalReason::NoFreeSlots => OfflinePacket::NoFreeIncomingConnections { server_guid },
            RefusalReason::AlreadyConnected => OfflinePacket::AlreadyConnected { server_guid },
            RefusalReason::Banned => OfflinePacket::ConnectionBanned { server_guid },
        };
        packet.encode()
    }

    pub fn handle(&self, packet: &OfflinePacket, from: SocketAddr, now: Instant) -> Response {
        match *packet {
            OfflinePacket::UnconnectedPing { timestamp, .. } => {
                Response::Reply(self.pong(timestamp))
            }
            OfflinePacket::OpenConnectionRequest1 { protocol, mtu } => {
                if protocol != self.config.protocol_version {
                    tracing::debug!(%from, ours = self.config.protocol_version, theirs = protocol, "protocol mismatch");
                    return Response::Reply(
                        OfflinePacket::IncompatibleProtocolVersion {
                            protocol: self.config.protocol_version,
                            server_guid: self.guid,
                        }
                        .encode(),
                    );
                }
                if mtu < self.config.min_mtu {
                    tracing::trace!(%from, mtu, "probe below minimum mtu");
                    return Response::Ignore;
                }
                Response::Reply(
                    OfflinePacket::OpenConnectionReply1 {
                        server_guid: self.guid,
                        use_security: false,
                        mtu: self.config.clamp_mtu(mtu),
                    }
                    .encode(),
                )
            }
            OfflinePacket::OpenConnectionRequest2 {
                mtu, client_guid, ..
            } => {
                let mtu = self.config.clamp_mtu(mtu);
                if mtu < self.config.min_mtu {
                    tracing::debug!(%from, mtu, "request 2 mtu below minimum");
                    return Response::Ignore;
                }
                let reply = OfflinePacket::OpenConnectionReply2 {
                    server_guid: self.guid,
                    client_address: from,
                    mtu,
                    use_encryption: false,
                }
                .encode();
                let session =
                    Session::server(self.config.clone(), self.guid, client_guid, from, mtu, now);
                Response::Accept {
                    reply,
                    session: Box::new(session),
                }
            }
            _ => Response::Ignore,
        }
    }

    /// Unconnected pong echoing the ping's timestamp.
    pub fn pong(&self, timestamp: i64) -> Bytes {
        OfflinePacket::UnconnectedPong {
            timestamp,
            server_guid: self.guid,
            identifier: self.identifier.clone(),
        }
        .encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Packet, UDP_HEADER_LEN};
    use quanta::Clock;
    use std::time::Duration;

    const CLIENT: &str = "10.0.0.1:50000";
    const SERVER: &str = "10.0.0.2:19132";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn offline(raw: Bytes) -> OfflinePacket {
        match Packet::decode(raw).unwrap() {
            Packet::Offline(p) => p,
            other => panic!("expected offline packet, got {other:?}"),
        }
    }

    fn reply(responder: &Responder, raw: Bytes, now: Instant) -> Bytes {
        match responder.handle(&offline(raw), addr(CLIENT), now) {
            Response::Reply(bytes) => bytes,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    // ─── MTU Discovery Tests ────────────────────────────────────────────

    #[test]
    fn probes_fall_back_through_candidates() {
        let (clock, mock) = Clock::mock();
        let config = SessionConfig::default();
        let timeout = config.mtu_probe_timeout;
        let mut c = Connector::new(config, 1, addr(SERVER), clock.now());

        let mut sizes = Vec::new();
        for _ in 0..6 {
            let request_1 = c.poll(clock.now()).unwrap().unwrap();
            sizes.push(request_1.len());
            assert_eq!(c.poll(clock.now()).unwrap(), None);
            mock.increment(timeout);
        }
        let sizes: Vec<usize> = sizes.into_iter().map(|n| n + UDP_HEADER_LEN).collect();
        assert_eq!(sizes, vec![1492, 1492, 1200, 1200, 576, 576]);
        assert_eq!(c.poll(clock.now()), Err(SessionError::SessionTimeout));
    }

    #[test]
    fn overall_timeout() {
        let (clock, mock) = Clock::mock();
        let mut c = Connector::new(SessionConfig::default(), 1, addr(SERVER), clock.now());
        c.poll(clock.now()).unwrap();
        mock.increment(Duration::from_secs(11));
        assert_eq!(c.poll(clock.now()), Err(SessionError::SessionTimeout));
    }

    // ─── Exchange Tests ─────────────────────────────────────────────────

    #[test]
    fn full_offline_exchange() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let config = SessionConfig::default();
        let responder = Responder::new(config.clone(), 99, "test");
        let mut c = Connector::new(config, 1, addr(SERVER), now);

        let request_1 = c.poll(now).unwrap().unwrap();
        let reply_1 = reply(&responder, request_1, now);
        let HandshakeOutcome::Send(request_2) = c.handle(&offline(reply_1), now).unwrap() else {
            panic!("expected request 2");
        };
        assert_eq!(c.state(), SessionState::OfflineHandshake2);
        assert_eq!(c.mtu(), Some(1492));

        let Response::Accept { reply, session } =
            responder.handle(&offline(request_2), addr(CLIENT), now)
        else {
            panic!("expected accept");
        };
        assert_eq!(session.state(), SessionState::Handshaking);
        assert_eq!(session.remote_guid(), 1);
        assert_eq!(session.remote_address(), addr(CLIENT));

        let HandshakeOutcome::Connected(mut client) = c.handle(&offline(reply), now).unwrap() else {
            panic!("expected session");
        };
        assert_eq!(client.remote_guid(), 99);
        assert_eq!(client.mtu(), 1492);
        assert_eq!(client.drain_output().count(), 1, "connection request queued");
    }

    #[test]
    fn request_2_is_resent() {
        let (clock, mock) = Clock::mock();
        let config = SessionConfig::default();
        let responder = Responder::new(config.clone(), 99, "");
        let mut c = Connector::new(config, 1, addr(SERVER), clock.now());
        let request_1 = c.poll(clock.now()).unwrap().unwrap();
        let reply_1 = reply(&responder, request_1, clock.now());
        c.handle(&offline(reply_1), clock.now()).unwrap();

        mock.increment(Duration::from_millis(500));
        let again = c.poll(clock.now()).unwrap().unwrap();
        assert!(matches!(
            offline(again),
            OfflinePacket::OpenConnectionRequest2 { mtu: 1492, client_guid: 1, .. }
        ));
    }

    #[test]
    fn server_clamps_mtu() {
        let (clock, _mock) = Clock::mock();
        let mut config = SessionConfig::default();
        config.max_mtu = 1200;
        let responder = Responder::new(config, 99, "");
        let request_1 = OfflinePacket::OpenConnectionRequest1 {
            protocol: 9,
            mtu: 1492,
        }
        .encode();
        let reply_1 = offline(reply(&responder, request_1, clock.now()));
        assert!(matches!(
            reply_1,
            OfflinePacket::OpenConnectionReply1 { mtu: 1200, .. }
        ));
    }

    #[test]
    fn small_probe_ignored() {
        let (clock, _mock) = Clock::mock();
        let responder = Responder::new(SessionConfig::default(), 99, "");
        let request_1 = OfflinePacket::OpenConnectionRequest1 {
            protocol: 9,
            mtu: 300,
        };
        assert!(matches!(
            responder.handle(&request_1, addr(CLIENT), clock.now()),
            Response::Ignore
        ));
    }

    #[test]
    fn protocol_mismatch() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let mut newer = SessionConfig::default();
        newer.protocol_version = 10;
        let responder = Responder::new(newer, 99, "");
        let mut c = Connector::new(SessionConfig::default(), 1, addr(SERVER), now);
        let request_1 = c.poll(now).unwrap().unwrap();
        let answer = reply(&responder, request_1, now);
        assert_eq!(
            c.handle(&offline(answer), now).unwrap_err(),
            SessionError::IncompatibleProtocol { ours: 9, theirs: 10 }
        );
    }

    #[test]
    fn security_and_refusals() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let secure = OfflinePacket::OpenConnectionReply1 {
            server_guid: 5,
            use_security: true,
            mtu: 1200,
        };
        let mut c = Connector::new(SessionConfig::default(), 1, addr(SERVER), now);
        assert_eq!(
            c.handle(&secure, now).unwrap_err(),
            SessionError::SecurityUnsupported
        );

        let responder = Responder::new(SessionConfig::default(), 5, "");
        for (reason, raw) in [
            (RefusalReason::NoFreeSlots, responder.refuse(RefusalReason::NoFreeSlots)),
            (RefusalReason::AlreadyConnected, responder.refuse(RefusalReason::AlreadyConnected)),
            (RefusalReason::Banned, responder.refuse(RefusalReason::Banned)),
        ] {
            let mut c = Connector::new(SessionConfig::default(), 1, addr(SERVER), now);
            assert_eq!(
                c.handle(&offline(raw), now).unwrap_err(),
                SessionError::ConnectionRefused(reason)
            );
        }
    }

    #[test]
    fn out_of_state_reply_ignored() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let mut c = Connector::new(SessionConfig::default(), 1, addr(SERVER), now);
        let early = OfflinePacket::OpenConnectionReply2 {
            server_guid: 5,
            client_address: addr(CLIENT),
            mtu: 1200,
            use_encryption: false,
        };
        assert!(matches!(c.handle(&early, now).unwrap(), HandshakeOutcome::Ignored));
        assert_eq!(c.state(), SessionState::OfflineHandshake1);
    }

    #[test]
    fn unconnected_ping_answered() {
        let (clock, _mock) = Clock::mock();
        let responder = Responder::new(SessionConfig::default(), 42, "MCPE;demo");
        let ping = OfflinePacket::UnconnectedPing {
            timestamp: 1234,
            client_guid: 7,
            open_connections_only: false,
        };
        let Response::Reply(raw) = responder.handle(&ping, addr(CLIENT), clock.now()) else {
            panic!("expected pong");
        };
        assert_eq!(
            offline(raw),
            OfflinePacket::UnconnectedPong {
                timestamp: 1234,
                server_guid: 42,
                identifier: "MCPE;demo".into(),
            }
        );
    }
}
