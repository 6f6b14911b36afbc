//! Blocking UDP socket with a read timeout, shared by the worker.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Largest datagram accepted from the wire.
pub const RECV_BUFFER: usize = 2048;

pub struct PeerSocket {
    socket: UdpSocket,
    bytes_sent: AtomicU64,
    datagrams_sent: AtomicU64,
    send_errors: AtomicU64,
}

impl PeerSocket {
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(PeerSocket {
            socket,
            bytes_sent: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Best-effort send; failures are logged and counted.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) {
        match self.socket.send_to(data, addr) {
            Ok(n) => {
                self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%addr, error = %e, "send failed");
            }
        }
    }

    /// `Ok(None)` when the read timeout elapsed with nothing to read.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            // ICMP port unreachable from an earlier send surfaces here on some
            // platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn datagrams_sent(&self) -> u64 {
        self.datagrams_sent.load(Ordering::Relaxed)
    }

    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}
