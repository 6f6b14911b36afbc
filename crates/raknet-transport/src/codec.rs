//! # Wire Codec
//!
//! Bounds-checked primitive reads and writes shared by every packet type.
//!
//! [`WireRead`] extends any [`bytes::Buf`] and [`WireWrite`] any
//! [`bytes::BufMut`]. Integers are little-endian; "triads" are 3-byte
//! unsigned values used for sequence, message and order indices. Reads go
//! through `Buf::try_get_*` so a short buffer yields
//! [`DecodeError::Truncated`] instead of a panic.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes};

use crate::error::DecodeError;

/// Offline message marker carried by every unconnected packet.
pub const MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe, 0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56,
    0x78,
];

/// Largest value a triad can hold.
pub const TRIAD_MASK: u32 = 0x00ff_ffff;

/// Half of the triad space; distances at or above this count as "behind".
pub const TRIAD_HALF: u32 = 0x0080_0000;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

// ─── Triad Arithmetic ───────────────────────────────────────────────────────

/// `value + n` in triad space.
#[inline]
pub fn triad_add(value: u32, n: u32) -> u32 {
    value.wrapping_add(n) & TRIAD_MASK
}

/// Forward distance from `from` to `to` in triad space.
#[inline]
pub fn triad_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & TRIAD_MASK
}

/// Serial-number comparison: is `a` strictly newer than `b`?
#[inline]
pub fn triad_newer(a: u32, b: u32) -> bool {
    let d = triad_distance(b, a);
    d != 0 && d < TRIAD_HALF
}

// ─── Reading ────────────────────────────────────────────────────────────────

/// Checked reads over any [`Buf`].
pub trait WireRead: Buf {
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.try_get_u8()?)
    }

    fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.try_get_i8()?)
    }

    fn read_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.try_get_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(self.try_get_u16_le()?)
    }

    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.try_get_i16_le()?)
    }

    fn read_triad(&mut self) -> Result<u32, DecodeError> {
        Ok(self.try_get_uint_le(3)? as u32)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.try_get_u32_le()?)
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.try_get_i32_le()?)
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(self.try_get_u64_le()?)
    }

    fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.try_get_i64_le()?)
    }

    /// Take `len` bytes without copying when the underlying buffer is `Bytes`.
    fn read_bytes(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        ensure(self, len)?;
        Ok(self.copy_to_bytes(len))
    }

    /// u16 length prefix followed by UTF-8 bytes.
    fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString)
    }

    /// Consume the offline magic and verify it.
    fn read_magic(&mut self) -> Result<(), DecodeError> {
        ensure(self, MAGIC.len())?;
        let mut magic = [0u8; 16];
        self.copy_to_slice(&mut magic);
        if magic == MAGIC {
            Ok(())
        } else {
            Err(DecodeError::BadMagic)
        }
    }

    fn read_address(&mut self) -> Result<SocketAddr, DecodeError> {
        match self.read_u8()? {
            FAMILY_V4 => {
                ensure(self, 4)?;
                let mut octets = [0u8; 4];
                self.copy_to_slice(&mut octets);
                let ip = Ipv4Addr::from(octets.map(|b| !b));
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_V6 => {
                ensure(self, 16)?;
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let port = self.read_u16()?;
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            other => Err(DecodeError::InvalidAddressFamily(other)),
        }
    }

    /// Skip `len` bytes of padding.
    fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        ensure(self, len)?;
        self.advance(len);
        Ok(())
    }
}

impl<B: Buf + ?Sized> WireRead for B {}

fn ensure<B: Buf + ?Sized>(buf: &B, needed: usize) -> Result<(), DecodeError> {
    let available = buf.remaining();
    if available < needed {
        return Err(DecodeError::Truncated { needed, available });
    }
    Ok(())
}

// ─── Writing ────────────────────────────────────────────────────────────────

/// Writes mirroring [`WireRead`].
pub trait WireWrite: BufMut {
    fn write_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn write_triad(&mut self, value: u32) {
        self.put_uint_le((value & TRIAD_MASK) as u64, 3);
    }

    /// Strings longer than `u16::MAX` bytes are truncated at a char boundary.
    fn write_string(&mut self, value: &str) {
        let mut end = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.put_u16_le(end as u16);
        self.put_slice(&value.as_bytes()[..end]);
    }

    fn write_magic(&mut self) {
        self.put_slice(&MAGIC);
    }

    fn write_address(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(FAMILY_V4);
                self.put_slice(&ip.octets().map(|b| !b));
            }
            IpAddr::V6(ip) => {
                self.put_u8(FAMILY_V6);
                self.put_slice(&ip.octets());
            }
        }
        self.put_u16_le(addr.port());
    }

    /// `len` zero bytes, used to size MTU probes.
    fn pad(&mut self, len: usize) {
        self.put_bytes(0, len);
    }
}

impl<B: BufMut + ?Sized> WireWrite for B {}

/// Encoded size of a socket address.
pub fn address_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 1 + 4 + 2,
        SocketAddr::V6(_) => 1 + 16 + 2,
    }
}
