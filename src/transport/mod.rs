//! Length-prefixed frame transport over a reliable async byte-stream (spec §4.1).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MashError, MashResult};

/// Default cap on a single frame's payload length. Frames above this are
/// rejected before the payload is even read, so a malicious peer can't make
/// us allocate an unbounded buffer.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Wraps a reliable byte-stream (a TLS connection, in practice) with
/// `u32_be(length) || payload` framing (spec §4.1, §6).
pub struct FramedConnection<S> {
    stream: S,
    max_frame_len: u32,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }

    pub fn with_max_frame_len(stream: S, max_frame_len: u32) -> Self {
        Self { stream, max_frame_len }
    }

    /// Writes a 4-byte big-endian length prefix followed by `bytes`.
    pub async fn send(&mut self, bytes: &[u8]) -> MashResult<()> {
        if bytes.len() as u64 > self.max_frame_len as u64 {
            return Err(MashError::Transport(format!(
                "outbound frame of {} bytes exceeds max {}",
                bytes.len(),
                self.max_frame_len
            )));
        }
        let len = bytes.len() as u32;
        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the length prefix, rejects lengths above `max_frame_len`, and
    /// returns the exact payload. Any short read fails the session (spec
    /// §4.1: "Failure to read a full frame fails the session.").
    pub async fn read_frame(&mut self) -> MashResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > self.max_frame_len {
            return Err(MashError::Transport(format!(
                "inbound frame length {} exceeds max {}",
                len, self.max_frame_len
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Generic trait over a framed connection so callers can be agnostic to the
/// concrete stream type (TLS vs. an in-memory duplex pipe in tests).
#[async_trait::async_trait]
pub trait FrameIo: Send {
    async fn send_frame(&mut self, bytes: &[u8]) -> MashResult<()>;
    async fn read_frame(&mut self) -> MashResult<Vec<u8>>;
}

#[async_trait::async_trait]
impl<S> FrameIo for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, bytes: &[u8]) -> MashResult<()> {
        self.send(bytes).await
    }

    async fn read_frame(&mut self) -> MashResult<Vec<u8>> {
        FramedConnection::read_frame(self).await
    }
}

/// Lets callers hold a `&mut` to some `FrameIo` and still satisfy a
/// `T: FrameIo` bound (used where a connection is borrowed across a routing
/// decision before being handed off to the commissioning or operational
/// path).
#[async_trait::async_trait]
impl<T: FrameIo + ?Sized> FrameIo for &mut T {
    async fn send_frame(&mut self, bytes: &[u8]) -> MashResult<()> {
        (**self).send_frame(bytes).await
    }

    async fn read_frame(&mut self) -> MashResult<Vec<u8>> {
        (**self).read_frame().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (a, b) = duplex(4096);
        let mut writer = FramedConnection::new(a);
        let mut reader = FramedConnection::new(b);

        writer.send(b"hello mash").await.unwrap();
        let got = reader.read_frame().await.unwrap();
        assert_eq!(got, b"hello mash");
    }

    #[tokio::test]
    async fn rejects_oversized_outbound_frame() {
        let (a, _b) = duplex(16);
        let mut writer = FramedConnection::with_max_frame_len(a, 4);
        let err = writer.send(b"too long").await.unwrap_err();
        assert!(matches!(err, MashError::Transport(_)));
    }

    #[tokio::test]
    async fn rejects_oversized_inbound_length_prefix() {
        let (mut a, b) = duplex(64);
        let mut reader = FramedConnection::with_max_frame_len(b, 4);
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, MashError::Transport(_)));
    }
}
