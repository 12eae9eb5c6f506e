//! Back a local `/dev/nbdN` device with an in-process [`Device`].
//!
//! [`loopback`] wires a socket pair between the kernel NBD client and this
//! crate's transmission loop, so a userspace device shows up as a regular
//! block device without any network in between.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::sync::Arc;

use nix::libc;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::codec::Codec;
use crate::device::Device;
use crate::error::Error;
use crate::handshake::{ConnParameters, Export, DEFAULT_BLOCK_SIZES};
use crate::kernel::{self, ClientFlags, ConnectOptions, NetlinkError, ServerFlags};
use crate::protocol::{ProtocolError, FLAG_HAS_FLAGS, FLAG_SEND_FLUSH};
use crate::server::{transmission_loop, CancelStream};

/// Hand already-negotiated sockets for `export` to the kernel, letting it
/// pick a device number. The sockets must be in transmission phase and all
/// connected to the same server. Returns the chosen device number; pass it
/// to [`kernel::disconnect`] when done.
pub fn configure(export: &Export, sockets: &[BorrowedFd<'_>]) -> Result<u32, NetlinkError> {
    let mut options = ConnectOptions::default();
    if let Some(sizes) = export.block_sizes {
        options.block_size = Some(u64::from(sizes.preferred));
    }
    kernel::connect(
        kernel::INDEX_ANY,
        sockets,
        export.size,
        ClientFlags::empty(),
        ServerFlags::from_bits_retain(u64::from(export.flags)),
        options,
    )
}

/// A device served over a private socket pair and connected to the kernel.
///
/// Dropping the handle abandons the device; call [`wait`](Self::wait) to
/// tear it down and collect errors.
pub struct Loopback {
    index: u32,
    task: JoinHandle<Result<(), Error>>,
    kernel_socket: OwnedFd,
}

/// Serve `device` on one end of a socket pair and connect the other end to
/// the kernel as an NBD device of `size` bytes.
///
/// Cancelling `shutdown` is the normal way to stop: it ends the serving
/// task, after which [`Loopback::wait`] disconnects the kernel device and
/// closes both socket ends.
pub async fn loopback(
    shutdown: CancellationToken,
    device: Arc<dyn Device>,
    size: u64,
) -> Result<Loopback, Error> {
    let (kernel_socket, serve_socket) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| Error::Io(io::Error::from(e)))?;

    let export = Export {
        name: String::new(),
        description: String::new(),
        size,
        flags: FLAG_HAS_FLAGS | FLAG_SEND_FLUSH,
        block_sizes: Some(DEFAULT_BLOCK_SIZES),
        device,
    };

    let std_stream = std::os::unix::net::UnixStream::from(serve_socket);
    std_stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(std_stream)?;

    let index = configure(&export, &[kernel_socket.as_fd()])?;
    info!(index, size, "loopback device connected");

    let params = ConnParameters {
        export,
        block_sizes: DEFAULT_BLOCK_SIZES,
    };
    let token = shutdown.child_token();
    let task = tokio::spawn(async move {
        // The kernel socket is already in transmission phase: no handshake.
        let mut codec = Codec::new(CancelStream::new(stream, token.clone()));
        let result = transmission_loop(&mut codec, &params).await;
        match result {
            Err(_) if token.is_cancelled() => Err(ProtocolError::Cancelled.into()),
            other => other.map_err(Error::from),
        }
        // The serving end of the socket pair closes here with the stream.
    });

    Ok(Loopback {
        index,
        task,
        kernel_socket,
    })
}

impl Loopback {
    /// The device number the kernel assigned; the device is `/dev/nbdN` for
    /// this index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Block until serving ends, then disconnect the kernel device and
    /// close the kernel-side socket.
    ///
    /// Cancellation is the expected way for serving to end and is not an
    /// error. Returns the first of: serve error, disconnect error, socket
    /// close error.
    pub async fn wait(self) -> Result<(), Error> {
        let mut first: Option<Error> = match self.task.await {
            Ok(Ok(())) => None,
            Ok(Err(Error::Protocol(ProtocolError::Cancelled))) => None,
            Ok(Err(error)) => Some(error),
            Err(join) => Some(Error::Io(io::Error::other(format!(
                "serve task failed: {join}"
            )))),
        };

        if let Err(error) = kernel::disconnect(self.index) {
            first.get_or_insert(error.into());
        }

        let fd = self.kernel_socket.into_raw_fd();
        if unsafe { libc::close(fd) } < 0 {
            first.get_or_insert(Error::Io(io::Error::last_os_error()));
        }

        match first {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
