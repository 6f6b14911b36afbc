//! # Wire Format
//!
//! Every packet kind as a tagged union, decoded from the leading id byte.
//!
//! ## Packet layers
//!
//! - [`Packet`]: what arrives on the socket. Offline handshake packets,
//!   data datagrams, ACKs and NACKs.
//! - [`OfflinePacket`]: unconnected ping/pong and the open-connection
//!   exchange. Always carries the 16-byte magic.
//! - [`ConnectedMessage`]: control messages that travel *inside* frames once
//!   a session exists (connection request/accept, pings, disconnect).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{WireRead, WireWrite, MAGIC};
use crate::datagram::Datagram;
use crate::error::DecodeError;
use crate::record::RecordSet;

// ─── Packet Identifiers ─────────────────────────────────────────────────────

pub mod id {
    pub const CONNECTED_PING: u8 = 0x00;
    pub const UNCONNECTED_PING: u8 = 0x01;
    pub const UNCONNECTED_PING_OPEN_CONNECTIONS: u8 = 0x02;
    pub const CONNECTED_PONG: u8 = 0x03;
    pub const DETECT_LOST_CONNECTIONS: u8 = 0x04;
    pub const OPEN_CONNECTION_REQUEST_1: u8 = 0x05;
    pub const OPEN_CONNECTION_REPLY_1: u8 = 0x06;
    pub const OPEN_CONNECTION_REQUEST_2: u8 = 0x07;
    pub const OPEN_CONNECTION_REPLY_2: u8 = 0x08;
    pub const CONNECTION_REQUEST: u8 = 0x09;
    pub const CONNECTION_REQUEST_ACCEPTED: u8 = 0x10;
    pub const ALREADY_CONNECTED: u8 = 0x12;
    pub const NEW_INCOMING_CONNECTION: u8 = 0x13;
    pub const NO_FREE_INCOMING_CONNECTIONS: u8 = 0x14;
    pub const DISCONNECTION_NOTIFICATION: u8 = 0x15;
    pub const CONNECTION_BANNED: u8 = 0x17;
    pub const INCOMPATIBLE_PROTOCOL_VERSION: u8 = 0x19;
    pub const UNCONNECTED_PONG: u8 = 0x1c;
    /// First id free for application messages.
    pub const USER_PACKET: u8 = 0x86;
    /// Id used for outgoing data datagrams.
    pub const DATAGRAM: u8 = 0x84;
    pub const NACK: u8 = 0xa0;
    pub const ACK: u8 = 0xc0;

    /// Data datagrams may use any id in `0x80..=0x8f`.
    pub fn is_datagram(id: u8) -> bool {
        (0x80..=0x8f).contains(&id)
    }

    /// Ids a session consumes itself when they lead a frame payload.
    pub fn is_connected_control(id: u8) -> bool {
        matches!(
            id,
            CONNECTED_PING
                | CONNECTED_PONG
                | DETECT_LOST_CONNECTIONS
                | CONNECTION_REQUEST
                | CONNECTION_REQUEST_ACCEPTED
                | NEW_INCOMING_CONNECTION
                | DISCONNECTION_NOTIFICATION
        )
    }
}

/// Addresses carried in connection accept / new incoming connection.
pub const SYSTEM_ADDRESS_COUNT: usize = 10;

/// Bytes of an open connection request 1 before its MTU padding.
pub const REQUEST_1_OVERHEAD: usize = 1 + MAGIC.len() + 1;

/// IPv4 plus UDP header. MTUs count it; UDP payloads do not.
pub const UDP_HEADER_LEN: usize = 28;

// ─── Packet ─────────────────────────────────────────────────────────────────

/// Any packet that can arrive on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Offline(OfflinePacket),
    Datagram(Datagram),
    Ack(RecordSet),
    Nack(RecordSet),
}

impl Packet {
    pub fn decode(raw: Bytes) -> Result<Self, DecodeError> {
        let Some(&first) = raw.first() else {
            return Err(DecodeError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        match first {
            id::ACK | id::NACK => {
                let mut body = raw.slice(1..);
                let set = RecordSet::decode(&mut body)?;
                Ok(if first == id::ACK {
                    Packet::Ack(set)
                } else {
                    Packet::Nack(set)
                })
            }
            f if id::is_datagram(f) => Ok(Packet::Datagram(Datagram::decode(raw)?)),
            _ => Ok(Packet::Offline(OfflinePacket::decode(raw)?)),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Packet::Offline(p) => p.encode(),
            Packet::Datagram(d) => d.encode(),
            Packet::Ack(set) | Packet::Nack(set) => {
                let mut buf = BytesMut::with_capacity(1 + set.encoded_len());
                buf.put_u8(if matches!(self, Packet::Ack(_)) {
                    id::ACK
                } else {
                    id::NACK
                });
                set.encode(&mut buf);
                buf.freeze()
            }
        }
    }
}

// ─── Offline Packets ────────────────────────────────────────────────────────

/// Packets exchanged before a session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfflinePacket {
    UnconnectedPing {
        timestamp: i64,
        client_guid: u64,
        /// Only servers with free slots should answer.
        open_connections_only: bool,
    },
    UnconnectedPong {
        timestamp: i64,
        server_guid: u64,
        identifier: String,
    },
    /// MTU probe. Padded so that, with the IP and UDP headers, the packet on
    /// the wire is exactly `mtu` bytes.
    OpenConnectionRequest1 { protocol: u8, mtu: u16 },
    OpenConnectionReply1 {
        server_guid: u64,
        use_security: bool,
        mtu: u16,
    },
    OpenConnectionRequest2 {
        server_address: SocketAddr,
        mtu: u16,
        client_guid: u64,
    },
    OpenConnectionReply2 {
        server_guid: u64,
        client_address: SocketAddr,
        mtu: u16,
        use_encryption: bool,
    },
    IncompatibleProtocolVersion { protocol: u8, server_guid: u64 },
    NoFreeIncomingConnections { server_guid: u64 },
    AlreadyConnected { server_guid: u64 },
    ConnectionBanned { server_guid: u64 },
}

impl OfflinePacket {
    pub fn id(&self) -> u8 {
        match self {
            OfflinePacket::UnconnectedPing {
                open_connections_only: false,
                ..
            } => id::UNCONNECTED_PING,
            OfflinePacket::UnconnectedPing { .. } => id::UNCONNECTED_PING_OPEN_CONNECTIONS,
            OfflinePacket::UnconnectedPong { .. } => id::UNCONNECTED_PONG,
            OfflinePacket::OpenConnectionRequest1 { .. } => id::OPEN_CONNECTION_REQUEST_1,
            OfflinePacket::OpenConnectionReply1 { .. } => id::OPEN_CONNECTION_REPLY_1,
            OfflinePacket::OpenConnectionRequest2 { .. } => id::OPEN_CONNECTION_REQUEST_2,
            OfflinePacket::OpenConnectionReply2 { .. } => id::OPEN_CONNECTION_REPLY_2,
            OfflinePacket::IncompatibleProtocolVersion { .. } => id::INCOMPATIBLE_PROTOCOL_VERSION,
            OfflinePacket::NoFreeIncomingConnections { .. } => id::NO_FREE_INCOMING_CONNECTIONS,
            OfflinePacket::AlreadyConnected { .. } => id::ALREADY_CONNECTED,
            OfflinePacket::ConnectionBanned { .. } => id::CONNECTION_BANNED,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.id());
        match self {
            OfflinePacket::UnconnectedPing {
                timestamp,
                client_guid,
                ..
            } => {
                buf.put_i64_le(*timestamp);
                buf.write_magic();
                buf.put_u64_le(*client_guid);
            }
            OfflinePacket::UnconnectedPong {
                timestamp,
                server_guid,
                identifier,
            } => {
                buf.put_i64_le(*timestamp);
                buf.put_u64_le(*server_guid);
                buf.write_magic();
                buf.write_string(identifier);
            }
            OfflinePacket::OpenConnectionRequest1 { protocol, mtu } => {
                buf.write_magic();
                buf.put_u8(*protocol);
                buf.pad((*mtu as usize).saturating_sub(UDP_HEADER_LEN + REQUEST_1_OVERHEAD));
            }
            OfflinePacket::OpenConnectionReply1 {
                server_guid,
                use_security,
                mtu,
            } => {
                buf.write_magic();
                buf.put_u64_le(*server_guid);
                buf.write_bool(*use_security);
                buf.put_u16_le(*mtu);
            }
            OfflinePacket::OpenConnectionRequest2 {
                server_address,
                mtu,
                client_guid,
            } => {
                buf.write_magic();
                buf.write_address(server_address);
                buf.put_u16_le(*mtu);
                buf.put_u64_le(*client_guid);
            }
            OfflinePacket::OpenConnectionReply2 {
                server_guid,
                client_address,
                mtu,
                use_encryption,
            } => {
                buf.write_magic();
                buf.put_u64_le(*server_guid);
                buf.write_address(client_address);
                buf.put_u16_le(*mtu);
                buf.write_bool(*use_encryption);
            }
            OfflinePacket::IncompatibleProtocolVersion {
                protocol,
                server_guid,
            } => {
                buf.put_u8(*protocol);
                buf.write_magic();
                buf.put_u64_le(*server_guid);
            }
            OfflinePacket::NoFreeIncomingConnections { server_guid }
            | OfflinePacket::AlreadyConnected { server_guid }
            | OfflinePacket::ConnectionBanned { server_guid } => {
                buf.write_magic();
                buf.put_u64_le(*server_guid);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, DecodeError> {
        let total = raw.len();
        let packet_id = raw.read_u8()?;
        let packet = match packet_id {
            id::UNCONNECTED_PING | id::UNCONNECTED_PING_OPEN_CONNECTIONS => {
                let timestamp = raw.read_i64()?;
                raw.read_magic()?;
                OfflinePacket::UnconnectedPing {
                    timestamp,
                    client_guid: raw.read_u64()?,
                    open_connections_only: packet_id == id::UNCONNECTED_PING_OPEN_CONNECTIONS,
                }
            }
            id::UNCONNECTED_PONG => {
                let timestamp = raw.read_i64()?;
                let server_guid = raw.read_u64()?;
                raw.read_magic()?;
                OfflinePacket::UnconnectedPong {
                    timestamp,
                    server_guid,
                    identifier: raw.read_string()?,
                }
            }
            id::OPEN_CONNECTION_REQUEST_1 => {
                raw.read_magic()?;
                let protocol = raw.read_u8()?;
                OfflinePacket::OpenConnectionRequest1 {
                    protocol,
                    mtu: (total + UDP_HEADER_LEN).min(u16::MAX as usize) as u16,
                }
            }
            id::OPEN_CONNECTION_REPLY_1 => {
                raw.read_magic()?;
                OfflinePacket::OpenConnectionReply1 {
                    server_guid: raw.read_u64()?,
                    use_security: raw.read_bool()?,
                    mtu: raw.read_u16()?,
                }
            }
            id::OPEN_CONNECTION_REQUEST_2 => {
                raw.read_magic()?;
                OfflinePacket::OpenConnectionRequest2 {
                    server_address: raw.read_address()?,
                    mtu: raw.read_u16()?,
                    client_guid: raw.read_u64()?,
                }
            }
            id::OPEN_CONNECTION_REPLY_2 => {
                raw.read_magic()?;
                OfflinePacket::OpenConnectionReply2 {
                    server_guid: raw.read_u64()?,
                    client_address: raw.read_address()?,
                    mtu: raw.read_u16()?,
                    use_encryption: raw.read_bool()?,
                }
            }
            id::INCOMPATIBLE_PROTOCOL_VERSION => {
                let protocol = raw.read_u8()?;
                raw.read_magic()?;
                OfflinePacket::IncompatibleProtocolVersion {
                    protocol,
                    server_guid: raw.read_u64()?,
                }
            }
            id::NO_FREE_INCOMING_CONNECTIONS | id::ALREADY_CONNECTED | id::CONNECTION_BANNED => {
                raw.read_magic()?;
                let server_guid = raw.read_u64()?;
                match packet_id {
                    id::NO_FREE_INCOMING_CONNECTIONS => {
                        OfflinePacket::NoFreeIncomingConnections { server_guid }
                    }
                    id::ALREADY_CONNECTED => OfflinePacket::AlreadyConnected { server_guid },
                    _ => OfflinePacket::ConnectionBanned { server_guid },
                }
            }
            other => return Err(DecodeError::UnknownPacketId(other)),
        };
        Ok(packet)
    }
}

// ─── Connected Messages ─────────────────────────────────────────────────────

/// In-session control messages, carried as frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedMessage {
    ConnectedPing {
        timestamp: i64,
    },
    ConnectedPong {
        ping_timestamp: i64,
        pong_timestamp: i64,
    },
    DetectLostConnections,
    ConnectionRequest {
        client_guid: u64,
        timestamp: i64,
        use_security: bool,
    },
    ConnectionRequestAccepted {
        client_address: SocketAddr,
        system_index: u16,
        request_timestamp: i64,
        accept_timestamp: i64,
    },
    NewIncomingConnection {
        server_address: SocketAddr,
        accept_timestamp: i64,
        timestamp: i64,
    },
    DisconnectionNotification,
}

impl ConnectedMessage {
    pub fn id(&self) -> u8 {
        match self {
            ConnectedMessage::ConnectedPing { .. } => id::CONNECTED_PING,
            ConnectedMessage::ConnectedPong { .. } => id::CONNECTED_PONG,
            ConnectedMessage::DetectLostConnections => id::DETECT_LOST_CONNECTIONS,
            ConnectedMessage::ConnectionRequest { .. } => id::CONNECTION_REQUEST,
            ConnectedMessage::ConnectionRequestAccepted { .. } => id::CONNECTION_REQUEST_ACCEPTED,
            ConnectedMessage::NewIncomingConnection { .. } => id::NEW_INCOMING_CONNECTION,
            ConnectedMessage::DisconnectionNotification => id::DISCONNECTION_NOTIFICATION,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.id());
        match self {
            ConnectedMessage::ConnectedPing { timestamp } => buf.put_i64_le(*timestamp),
            ConnectedMessage::ConnectedPong {
                ping_timestamp,
                pong_timestamp,
            } => {
                buf.put_i64_le(*ping_timestamp);
                buf.put_i64_le(*pong_timestamp);
            }
            ConnectedMessage::DetectLostConnections
            | ConnectedMessage::DisconnectionNotification => {}
            ConnectedMessage::ConnectionRequest {
                client_guid,
                timestamp,
                use_security,
            } => {
                buf.put_u64_le(*client_guid);
                buf.put_i64_le(*timestamp);
                buf.write_bool(*use_security);
            }
            ConnectedMessage::ConnectionRequestAccepted {
                client_address,
                system_index,
                request_timestamp,
                accept_timestamp,
            } => {
                buf.write_address(client_address);
                buf.put_u16_le(*system_index);
                write_system_addresses(&mut buf);
                buf.put_i64_le(*request_timestamp);
                buf.put_i64_le(*accept_timestamp);
            }
            ConnectedMessage::NewIncomingConnection {
                server_address,
                accept_timestamp,
                timestamp,
            } => {
                buf.write_address(server_address);
                write_system_addresses(&mut buf);
                buf.put_i64_le(*accept_timestamp);
                buf.put_i64_le(*timestamp);
            }
        }
        buf.freeze()
    }

    /// Decode a frame payload. `Ok(None)` means the payload is application
    /// data rather than a control message.
    pub fn decode(payload: &Bytes) -> Result<Option<Self>, DecodeError> {
        let mut raw = payload.clone();
        let Ok(message_id) = raw.read_u8() else {
            return Ok(None);
        };
        let message = match message_id {
            id::CONNECTED_PING => ConnectedMessage::ConnectedPing {
                timestamp: raw.read_i64()?,
            },
            id::CONNECTED_PONG => ConnectedMessage::ConnectedPong {
                ping_timestamp: raw.read_i64()?,
                pong_timestamp: raw.read_i64()?,
            },
            id::DETECT_LOST_CONNECTIONS => ConnectedMessage::DetectLostConnections,
            id::CONNECTION_REQUEST => ConnectedMessage::ConnectionRequest {
                client_guid: raw.read_u64()?,
                timestamp: raw.read_i64()?,
                use_security: raw.read_bool()?,
            },
            id::CONNECTION_REQUEST_ACCEPTED => {
                let client_address = raw.read_address()?;
                let system_index = raw.read_u16()?;
                skip_system_addresses(&mut raw)?;
                ConnectedMessage::ConnectionRequestAccepted {
                    client_address,
                    system_index,
                    request_timestamp: raw.read_i64()?,
                    accept_timestamp: raw.read_i64()?,
                }
            }
            id::NEW_INCOMING_CONNECTION => {
                let server_address = raw.read_address()?;
                skip_system_addresses(&mut raw)?;
                ConnectedMessage::NewIncomingConnection {
                    server_address,
                    accept_timestamp: raw.read_i64()?,
                    timestamp: raw.read_i64()?,
                }
            }
            id::DISCONNECTION_NOTIFICATION => ConnectedMessage::DisconnectionNotification,
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

fn write_system_addresses(buf: &mut BytesMut) {
    let unspecified = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    for _ in 0..SYSTEM_ADDRESS_COUNT {
        buf.write_address(&unspecified);
    }
}

/// Peers disagree on how many system addresses they send, so read
/// addresses until only the two trailing timestamps remain.
fn skip_system_addresses(raw: &mut Bytes) -> Result<(), DecodeError> {
    while raw.remaining() > 16 {
        raw.read_address()?;
    }
    Ok(())
}
