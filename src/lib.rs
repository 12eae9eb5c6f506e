//! NBD (Network Block Device) protocol implementation.
//!
//! This crate implements both sides of the NBD wire protocol — the
//! fixed-newstyle handshake and the request/reply transmission phase — plus
//! a server engine that serves user-supplied [`Device`] implementations.
//! Frame layouts follow
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>.
//!
//! On Linux, the `device` feature adds a control plane for the kernel NBD
//! driver: `kernel` talks to the `"nbd"` generic-netlink family, and
//! `loopback` combines it with the server engine so a [`Device`] backs a
//! local `/dev/nbdN` block device.
//!
//! # Serving an export
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! let export = nbdhost::Export {
//!     name: "scratch".into(),
//!     description: "in-memory scratch device".into(),
//!     size: 1 << 30,
//!     flags: nbdhost::FLAG_HAS_FLAGS | nbdhost::FLAG_SEND_FLUSH,
//!     block_sizes: None,
//!     device: Arc::new(nbdhost::MemDevice::new(1 << 30)),
//! };
//! let listener = TcpListener::bind("127.0.0.1:10809").await?;
//! nbdhost::listen_and_serve(CancellationToken::new(), listener, vec![export]).await?;
//! ```
//!
//! # Features
//!
//! - `device` — Linux kernel NBD device support (requires the privileges of
//!   the nbd netlink family, typically `CAP_SYS_ADMIN`)

mod client;
mod codec;
mod device;
mod error;
mod handshake;
mod protocol;
mod server;

#[cfg(all(target_os = "linux", feature = "device"))]
pub mod kernel;
#[cfg(all(target_os = "linux", feature = "device"))]
mod loopback;

pub use client::{Client, ExportInfo, TransmissionClient};
pub use device::{Device, DeviceError, MemDevice};
pub use error::Error;
pub use handshake::{BlockSizeConstraints, Export};
pub use protocol::{
    Errno, ProtocolError, ReplyError, Request, SimpleReply, FLAG_CAN_MULTICONN, FLAG_HAS_FLAGS,
    FLAG_READ_ONLY, FLAG_SEND_FLUSH, FLAG_SEND_FUA, FLAG_SEND_TRIM,
};
pub use server::{listen_and_serve, serve, Listener, StreamListener};

#[cfg(all(target_os = "linux", feature = "device"))]
pub use loopback::{configure, loopback, Loopback};
