//! Big-endian framing over an async byte stream.
//!
//! Every NBD frame is a sequence of big-endian integers and raw byte ranges,
//! so the protocol modules are written against these primitives instead of
//! the stream itself. All operations return [`ProtocolError`]; protocol code
//! short-circuits with `?` and the public entry points form the session
//! boundary where the error surfaces.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::ProtocolError;

/// How much to read at a time when draining bytes we do not want.
const DISCARD_CHUNK: usize = 4096;

/// Framing state for one connection.
///
/// A codec must not be shared between tasks: the buffered sub-message mode
/// below is per-session state.
pub(crate) struct Codec<S> {
    stream: S,
    /// When set, writes append here instead of going to the stream. Used to
    /// compute the length prefix of variable-length reply bodies.
    buf: Option<Vec<u8>>,
}

impl<S> Codec<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, buf: None }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Route subsequent writes into an in-memory buffer.
    pub fn begin_buffer(&mut self) {
        self.buf = Some(Vec::new());
    }

    /// End buffered mode and return everything written since
    /// [`begin_buffer`](Self::begin_buffer).
    pub fn take_buffer(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if let Some(buf) = self.buf.as_mut() {
            buf.extend_from_slice(bytes);
            return Ok(());
        }
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    pub async fn write_u16(&mut self, v: u16) -> Result<(), ProtocolError> {
        self.write_all(&v.to_be_bytes()).await
    }

    pub async fn write_u32(&mut self, v: u32) -> Result<(), ProtocolError> {
        self.write_all(&v.to_be_bytes()).await
    }

    pub async fn write_u64(&mut self, v: u64) -> Result<(), ProtocolError> {
        self.write_all(&v.to_be_bytes()).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ProtocolError> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }

    pub async fn read_vec(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b).await?;
        Ok(u16::from_be_bytes(b))
    }

    pub async fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b).await?;
        Ok(u32::from_be_bytes(b))
    }

    pub async fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b).await?;
        Ok(u64::from_be_bytes(b))
    }

    /// Consume and drop exactly `n` bytes, keeping the stream aligned on the
    /// next frame.
    pub async fn discard(&mut self, n: u32) -> Result<(), ProtocolError> {
        let mut chunk = [0u8; DISCARD_CHUNK];
        let mut remaining = n as usize;
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            self.read_exact(&mut chunk[..take]).await?;
            remaining -= take;
        }
        Ok(())
    }
}
