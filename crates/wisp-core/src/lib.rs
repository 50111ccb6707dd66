//! # WISP Core
//!
//! Wire protocol for the WISP relay.
//!
//! This crate provides:
//! - Primitive little-endian encoder/decoder
//! - The closed opcode catalog and [`Message`] enum
//! - Length-prefixed frame I/O over any async byte stream
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Frame                                   │
//! │   (u32 length prefix, read/written over a duplex stream)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Message                                 │
//! │   (opcode + payload, exhaustive enum)                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Codec                                   │
//! │   (integers, fixed keys, buffers, arrays, addresses, flags)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::{CodecError, Error};
pub use frame::{
    DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE, decode_frame, encode_frame, parse_frame,
    read_frame, write_frame,
};
pub use message::{Message, Opcode, Peer, QueryReply};

/// Version of the opcode catalog
pub const PROTOCOL_VERSION: u32 = 1;
