//! # raknet-transport
//!
//! Sans-IO RakNet-compatible reliable messaging over UDP.
//!
//! Every operation takes the current [`quanta::Instant`] and returns bytes to
//! send or events to hand up; the crate never touches a socket or a clock on
//! its own.
//!
//! ## Crate structure
//!
//! - [`codec`]: little-endian primitives, triads, magic, addresses
//! - [`record`]: condensed ACK/NACK index ranges
//! - [`reliability`]: the eight delivery classes
//! - [`frame`]: encapsulated frame header and payload
//! - [`datagram`]: sequenced container of frames
//! - [`wire`]: offline and connected control packets
//! - [`ordering`]: dedup windows, ordering and sequencing lanes
//! - [`split`]: fragmentation and reassembly
//! - [`arq`]: resend buffer and receive-side ACK/NACK tracking
//! - [`rtt`]: RTT estimator and RTO
//! - [`handshake`]: offline exchange and MTU discovery
//! - [`session`]: connected session state machine
//! - [`stats`]: per-session counters
//! - [`config`]: tuning knobs

pub mod arq;
pub mod codec;
pub mod config;
pub mod datagram;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod ordering;
pub mod record;
pub mod reliability;
pub mod rtt;
pub mod session;
pub mod split;
pub mod stats;
pub mod wire;

pub use config::SessionConfig;
pub use error::{DecodeError, DisconnectReason, RefusalReason, SessionError};
pub use handshake::{Connector, HandshakeOutcome, Responder, Response};
pub use reliability::Reliability;
pub use session::{Role, Session, SessionEvent, SessionState};
