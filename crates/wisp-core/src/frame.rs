//! Length-prefixed frames.
//!
//! ```text
//! ┌──────────────────────┬────────┬─────────────────┐
//! │ length (u32 LE)      │ opcode │ payload         │
//! │ = 1 + payload length │ 1 byte │ length - 1 bytes│
//! └──────────────────────┴────────┴─────────────────┘
//! ```

use crate::codec::Encoder;
use crate::error::{CodecError, Error};
use crate::message::{Message, Opcode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound on `opcode + payload` (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode `message` as a complete frame, prefix included
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] if the frame body exceeds `max_frame_size`.
pub fn encode_frame(message: &Message, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let mut enc = Encoder::with_capacity(64);
    enc.fixed(&[0u8; LENGTH_PREFIX_SIZE]).u8(message.opcode() as u8);
    message.encode_payload(&mut enc)?;
    let mut frame = enc.finish();

    let body = frame.len() - LENGTH_PREFIX_SIZE;
    if body > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: body,
            max: max_frame_size,
        });
    }
    let prefix = u32::try_from(body).map_err(|_| CodecError::LengthOverflow)?;
    frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&prefix.to_le_bytes());
    Ok(frame)
}

/// Decode a frame body (`opcode ‖ payload`)
///
/// # Errors
///
/// Returns [`CodecError::EmptyFrame`], [`CodecError::UnknownOpcode`] or any
/// payload error.
pub fn decode_frame(body: &[u8]) -> Result<Message, CodecError> {
    let (&opcode, payload) = body.split_first().ok_or(CodecError::EmptyFrame)?;
    Message::decode_payload(Opcode::try_from(opcode)?, payload)
}

/// Try to take one complete frame off the front of `buf`.
///
/// Returns the message and the number of bytes consumed, or `None` if more
/// bytes are needed.
///
/// # Errors
///
/// Returns a [`CodecError`] for oversized or malformed frames.
pub fn parse_frame(buf: &[u8], max_frame_size: usize) -> Result<Option<(Message, usize)>, CodecError> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let len = body_length(prefix, max_frame_size)?;
    let end = LENGTH_PREFIX_SIZE + len;
    match buf.get(LENGTH_PREFIX_SIZE..end) {
        Some(body) => Ok(Some((decode_frame(body)?, end))),
        None => Ok(None),
    }
}

fn body_length(prefix: &[u8], max_frame_size: usize) -> Result<usize, CodecError> {
    let mut bytes = [0u8; LENGTH_PREFIX_SIZE];
    bytes.copy_from_slice(prefix);
    let len = u32::from_le_bytes(bytes) as usize;
    if len == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    Ok(len)
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
///
/// # Errors
///
/// Returns [`Error::Io`] on transport failure or EOF inside a frame, and
/// [`Error::Codec`] for malformed frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
    }

    let len = body_length(&prefix, max_frame_size)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(decode_frame(&body)?))
}

/// Write one frame and flush
///
/// # Errors
///
/// Returns [`Error::Codec`] if the message is too large and [`Error::Io`] on
/// transport failure.
pub async fn write_frame<W>(writer: &mut W, message: &Message, max_frame_size: usize) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
