//! Primitive encoder and decoder.
//!
//! | type | encoding |
//! |---|---|
//! | `u8` | 1 byte |
//! | `u16` | 2 bytes, little-endian |
//! | `u32` | 4 bytes, little-endian |
//! | fixed array | raw bytes |
//! | buffer / string | `u32` length, then bytes |
//! | array | `u32` count, then elements |
//! | socket address | family (4 or 6), address bytes, `u16` port |
//!
//! Optional fields are announced by a flag byte at the start of the payload.

use crate::error::CodecError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Append-only payload writer
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    /// Create an empty encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an encoder with preallocated space
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Write one byte
    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Write a little-endian `u16`
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a little-endian `u32`
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write bytes without a length prefix
    pub fn fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Write a length-prefixed buffer
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if the buffer exceeds `u32::MAX`.
    pub fn buffer(&mut self, bytes: &[u8]) -> Result<&mut Self, CodecError> {
        self.length(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    /// Write a length-prefixed UTF-8 string
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::LengthOverflow`] if the string exceeds `u32::MAX`.
    pub fn string(&mut self, value: &str) -> Result<&mut Self, CodecError> {
        self.buffer(value.as_bytes())
    }

    /// Write a socket address
    pub fn socket_addr(&mut self, addr: &SocketAddr) -> &mut Self {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.u8(4).fixed(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.u8(6).fixed(&ip.octets());
            }
        }
        self.u16(addr.port())
    }

    /// Write a counted array, encoding each element with `f`
    ///
    /// # Errors
    ///
    /// Returns the first error from `f`, or [`CodecError::LengthOverflow`].
    pub fn array<T, F>(&mut self, items: &[T], mut f: F) -> Result<&mut Self, CodecError>
    where
        F: FnMut(&mut Self, &T) -> Result<(), CodecError>,
    {
        self.length(items.len())?;
        for item in items {
            f(self, item)?;
        }
        Ok(self)
    }

    fn length(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::LengthOverflow)?;
        self.u32(len);
        Ok(())
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded payload
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one byte
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] at end of buffer.
    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16`
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] at end of buffer.
    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.fixed::<2>()?))
    }

    /// Read a little-endian `u32`
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] at end of buffer.
    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.fixed::<4>()?))
    }

    /// Read `N` raw bytes
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if fewer than `N` bytes remain.
    pub fn fixed<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a length-prefixed buffer
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Truncated`] if the declared length overruns.
    pub fn buffer(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidUtf8`] for non-UTF-8 content.
    pub fn string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.buffer()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a socket address
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidAddressFamily`] for unknown families.
    pub fn socket_addr(&mut self) -> Result<SocketAddr, CodecError> {
        let ip = match self.u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(self.fixed::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(self.fixed::<16>()?)),
            family => return Err(CodecError::InvalidAddressFamily(family)),
        };
        Ok(SocketAddr::new(ip, self.u16()?))
    }

    /// Read a counted array, decoding each element with `f`
    ///
    /// # Errors
    ///
    /// Returns the first element error.
    pub fn array<T, F>(&mut self, mut f: F) -> Result<Vec<T>, CodecError>
    where
        F: FnMut(&mut Self) -> Result<T, CodecError>,
    {
        let count = self.u32()? as usize;
        // Every element takes at least one byte.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    /// Read a flag byte, rejecting bits outside `allowed`
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFlags`] for undefined bits.
    pub fn flags(&mut self, allowed: u8) -> Result<u8, CodecError> {
        let flags = self.u8()?;
        if flags & !allowed != 0 {
            return Err(CodecError::InvalidFlags { flags, allowed });
        }
        Ok(flags)
    }

    /// Ensure the whole payload was consumed
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TrailingBytes`] if bytes are left.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_little_endian() {
        let mut enc = Encoder::new();
        enc.u8(0xAB).u16(0x0102).u32(0x0A0B_0C0D);
        let bytes = enc.finish();
        assert_eq!(bytes, [0xAB, 0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A]);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.u8().unwrap(), 0xAB);
        assert_eq!(dec.u16().unwrap(), 0x0102);
        assert_eq!(dec.u32().unwrap(), 0x0A0B_0C0D);
        dec.finish().unwrap();
    }

    #[test]
    fn test_buffer_length_prefix() {
        let mut enc = Encoder::new();
        enc.buffer(b"abc").unwrap();
        assert_eq!(enc.finish(), [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_socket_addr_v4_and_v6() {
        let v4: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let v6: SocketAddr = "[::1]:8080".parse().unwrap();
        let mut enc = Encoder::new();
        enc.socket_addr(&v4).socket_addr(&v6);
        let bytes = enc.finish();
        assert_eq!(bytes.len(), (1 + 4 + 2) + (1 + 16 + 2));

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.socket_addr().unwrap(), v4);
        assert_eq!(dec.socket_addr().unwrap(), v6);
    }

    #[test]
    fn test_truncated_buffer() {
        let bytes = [10, 0, 0, 0, 1, 2];
        let mut dec = Decoder::new(&bytes);
        assert_eq!(
            dec.buffer(),
            Err(CodecError::Truncated {
                needed: 10,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_invalid_utf8() {
        let mut enc = Encoder::new();
        enc.buffer(&[0xFF, 0xFE]).unwrap();
        let bytes = enc.finish();
        assert_eq!(Decoder::new(&bytes).string(), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn test_undefined_flag_bits_rejected() {
        let bytes = [0b0000_0101];
        assert_eq!(
            Decoder::new(&bytes).flags(0b0000_0001),
            Err(CodecError::InvalidFlags {
                flags: 0b0000_0101,
                allowed: 0b0000_0001
            })
        );
    }

    #[test]
    fn test_trailing_bytes() {
        let bytes = [1, 2, 3];
        let mut dec = Decoder::new(&bytes);
        dec.u8().unwrap();
        assert_eq!(dec.finish(), Err(CodecError::TrailingBytes(2)));
    }

    #[test]
    fn test_huge_array_count_does_not_preallocate() {
        let bytes = u32::MAX.to_le_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(dec.array(|d| d.u8()).is_err());
    }

    #[test]
    fn test_unknown_address_family() {
        let bytes = [5, 0, 0];
        assert_eq!(
            Decoder::new(&bytes).socket_addr(),
            Err(CodecError::InvalidAddressFamily(5))
        );
    }
}
