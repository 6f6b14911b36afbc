//! Application callbacks, invoked on the worker thread.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use quanta::Instant;
use raknet_transport::arq::ReceiptId;
use raknet_transport::{DisconnectReason, Reliability, Session, SessionError};

/// Identity of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub guid: u64,
    pub mtu: u16,
}

impl From<&Session> for PeerInfo {
    fn from(session: &Session) -> Self {
        PeerInfo {
            address: session.remote_address(),
            guid: session.remote_guid(),
            mtu: session.mtu(),
        }
    }
}

/// Lets callbacks act on sessions without going through the command
/// channel. Sends are flushed on the next worker iteration.
pub struct Context<'a> {
    pub(crate) sessions: &'a mut HashMap<SocketAddr, Session>,
    pub(crate) now: Instant,
}

impl Context<'_> {
    pub fn send(
        &mut self,
        address: SocketAddr,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<ReceiptId>, SessionError> {
        self.sessions
            .get_mut(&address)
            .ok_or(SessionError::NotConnected)?
            .send(reliability, channel, payload)
    }

    pub fn disconnect(&mut self, address: SocketAddr) {
        if let Some(session) = self.sessions.get_mut(&address) {
            session.disconnect(self.now);
        }
    }

    pub fn connected(&self) -> impl Iterator<Item = PeerInfo> + '_ {
        self.sessions
            .values()
            .filter(|s| s.is_connected())
            .map(PeerInfo::from)
    }
}

/// Session lifecycle and message callbacks.
///
/// Runs on the worker thread: blocking here stalls every session on the
/// socket. Do not call [`PeerHandle`](crate::PeerHandle) methods that wait
/// for a reply from inside a callback; use the [`Context`] instead.
pub trait SessionHandler: Send + 'static {
    fn on_connect(&mut self, _peer: &PeerInfo, _ctx: &mut Context<'_>) {}

    fn on_disconnect(&mut self, _peer: &PeerInfo, _reason: &DisconnectReason) {}

    fn on_message(&mut self, peer: &PeerInfo, channel: u8, payload: Bytes, ctx: &mut Context<'_>);

    /// `delivered` is false when the message was given up on.
    fn on_receipt(&mut self, _peer: &PeerInfo, _receipt: ReceiptId, _delivered: bool) {}

    /// An outbound connection attempt failed before a session existed.
    fn on_connect_failed(&mut self, _address: SocketAddr, _error: &SessionError) {}
}
