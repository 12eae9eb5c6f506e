//! The device contract consumed by the server engine.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::protocol::Errno;

/// A block device backing an [`Export`](crate::Export).
///
/// The server engine may dispatch overlapping requests from distinct
/// connections; implementations that allow that must synchronise internally.
#[async_trait]
pub trait Device: Send + Sync {
    /// Fill `buf` with bytes starting at byte `offset`, returning the number
    /// of bytes read.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError>;

    /// Write all of `buf` at byte `offset`, returning the number of bytes
    /// written.
    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, DeviceError>;

    /// Return only once all previously completed writes are durable.
    async fn sync(&self) -> Result<(), DeviceError>;
}

/// A device failure with the error number that travels back over the wire.
///
/// Build one with [`DeviceError::new`] to control the reported errno.
/// Conversions from plain I/O errors report [`Errno::EIO`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeviceError {
    errno: Errno,
    message: String,
}

impl DeviceError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    /// The error number reported in the reply frame.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        Self::new(Errno::EIO, err.to_string())
    }
}

impl From<Errno> for DeviceError {
    fn from(errno: Errno) -> Self {
        Self::new(errno, errno.to_string())
    }
}

/// A fixed-size in-memory device.
///
/// Mostly useful for tests and as a scratch backend; reads past the end
/// report `EINVAL`, writes past the end report `ENOSPC`.
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
}

impl MemDevice {
    /// A zero-filled device of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    /// A device over an existing byte buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    fn range(len: usize, offset: u64, want: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(want)?;
        (end <= len).then_some(start..end)
    }
}

#[async_trait]
impl Device for MemDevice {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError> {
        let data = self.data.read().await;
        let range = Self::range(data.len(), offset, buf.len())
            .ok_or_else(|| DeviceError::new(Errno::EINVAL, "read beyond end of device"))?;
        buf.copy_from_slice(&data[range]);
        Ok(buf.len())
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, DeviceError> {
        let mut data = self.data.write().await;
        let range = Self::range(data.len(), offset, buf.len())
            .ok_or_else(|| DeviceError::new(Errno::ENOSPC, "write beyond end of device"))?;
        data[range].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn sync(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}
