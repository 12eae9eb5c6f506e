//! Crate-level error type.

use std::io;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Any failure surfaced by the public API.
#[derive(Debug, Error)]
pub enum Error {
    /// A wire-protocol session failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A kernel control-plane command failed.
    #[cfg(all(target_os = "linux", feature = "device"))]
    #[error(transparent)]
    Netlink(#[from] crate::kernel::NetlinkError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
