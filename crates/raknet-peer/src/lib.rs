//! # raknet-peer
//!
//! Socket runtime for `raknet-transport`: one UDP socket, one worker thread
//! that owns every session on it, and a [`SessionHandler`] receiving
//! lifecycle and message callbacks.
//!
//! ## Crate structure
//!
//! - [`config`]: TOML configuration
//! - [`handler`]: application callbacks and their [`Context`]
//! - [`socket`]: UDP socket wrapper
//! - [`runtime`]: [`Peer`], [`PeerHandle`] and the worker loop

pub mod config;
pub mod handler;
pub mod runtime;
pub mod socket;

pub use config::PeerConfig;
pub use handler::{Context, PeerInfo, SessionHandler};
pub use runtime::{Peer, PeerError, PeerHandle};
