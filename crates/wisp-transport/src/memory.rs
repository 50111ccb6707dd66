//! In-memory transport.
//!
//! Both ends live in the same process; used to run a relay and its endpoints
//! without sockets.

use tokio::io::DuplexStream;

/// Default bytes buffered in each direction
pub const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Connected pair of in-memory streams
#[must_use]
pub fn pipe() -> (DuplexStream, DuplexStream) {
    pipe_with_capacity(DEFAULT_PIPE_CAPACITY)
}

/// Connected pair buffering up to `capacity` bytes per direction
#[must_use]
pub fn pipe_with_capacity(capacity: usize) -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_is_bidirectional() {
        let (mut a, mut b) = pipe();
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_drop_is_eof() {
        let (a, mut b) = pipe();
        drop(a);
        let mut buf = Vec::new();
        assert_eq!(b.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
