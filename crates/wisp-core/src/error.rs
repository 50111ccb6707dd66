//! Error types for the WISP wire protocol.

use thiserror::Error;

/// Core protocol errors
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame or payload
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] wisp_crypto::CryptoError),
}

impl Error {
    /// Whether the peer sent something that violates the wire format
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Codec(_))
    }
}

/// Wire decoding errors.
///
/// Every variant is a protocol violation; the receiving side closes the
/// transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Buffer ended before a field was complete
    #[error("truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field needs
        needed: usize,
        /// Bytes left in the buffer
        remaining: usize,
    },

    /// Opcode outside the catalog
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),

    /// Flag byte has bits the message does not define
    #[error("invalid flags 0x{flags:02X} (allowed 0x{allowed:02X})")]
    InvalidFlags {
        /// Received flags
        flags: u8,
        /// Bits the message defines
        allowed: u8,
    },

    /// String field is not UTF-8
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Payload continued after the last field
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// Socket address family other than 4 or 6
    #[error("invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Frame exceeds the configured maximum
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared or encoded size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Frame without an opcode byte
    #[error("empty frame")]
    EmptyFrame,

    /// Field longer than a `u32` length prefix can describe
    #[error("field length overflows u32")]
    LengthOverflow,
}
