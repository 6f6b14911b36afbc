//! # Errors
//!
//! Two layers of failure:
//!
//! - [`DecodeError`]: a single datagram could not be parsed. The datagram is
//!   dropped and the owning session carries on.
//! - [`SessionError`]: something that either rejects an API call up front
//!   (`InvalidChannel`, `MessageTooLarge`, `NotConnected`) or terminates one
//!   session. It never reaches other sessions or the socket.

use std::fmt;

use bytes::TryGetError;
use thiserror::Error;

// ─── Decode Errors ──────────────────────────────────────────────────────────

/// Failure to parse bytes received from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("offline magic mismatch")]
    BadMagic,
    #[error("unknown packet id {0:#04x}")]
    UnknownPacketId(u8),
    #[error("invalid reliability id {0}")]
    InvalidReliability(u8),
    #[error("invalid address family {0}")]
    InvalidAddressFamily(u8),
    #[error("string is not valid UTF-8")]
    InvalidString,
    #[error("malformed acknowledgement record")]
    InvalidRecord,
    #[error("malformed split header")]
    InvalidSplit,
}

impl From<TryGetError> for DecodeError {
    fn from(e: TryGetError) -> Self {
        DecodeError::Truncated {
            needed: e.requested,
            available: e.available,
        }
    }
}

// ─── Session Errors ─────────────────────────────────────────────────────────

/// Why the remote end refused an offline connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// The server has no free session slots.
    NoFreeSlots,
    /// The server already holds a session for our address.
    AlreadyConnected,
    /// Our address is banned.
    Banned,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefusalReason::NoFreeSlots => "no free incoming connections",
            RefusalReason::AlreadyConnected => "already connected",
            RefusalReason::Banned => "connection banned",
        };
        f.write_str(s)
    }
}

/// Session-level failures and API rejections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("channel {channel} out of range (session has {channels} channels)")]
    InvalidChannel { channel: u8, channels: u8 },
    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("session is not connected")]
    NotConnected,
    #[error("message id {0:#04x} is reserved for session control")]
    ReservedMessageId(u8),
    #[error("split reassembly queue overloaded")]
    SplitQueueOverload,
    #[error("ordering queue overloaded")]
    OrderingQueueOverload,
    #[error("session timed out")]
    SessionTimeout,
    #[error("incompatible protocol version: ours {ours}, theirs {theirs}")]
    IncompatibleProtocol { ours: u8, theirs: u8 },
    #[error("peer requested unsupported connection security")]
    SecurityUnsupported,
    #[error("connection refused: {0}")]
    ConnectionRefused(RefusalReason),
    #[error("handshake violation: {0}")]
    HandshakeViolation(&'static str),
}

// ─── Disconnect Reason ──────────────────────────────────────────────────────

/// Why a session ended. Reported exactly once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Closed locally via `disconnect()`.
    Closed,
    /// The peer sent a disconnection notification.
    PeerClosed,
    /// Terminated by a protocol failure.
    Failed(SessionError),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::PeerClosed => f.write_str("peer closed"),
            DisconnectReason::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}
