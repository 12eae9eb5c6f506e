//! Control plane for the Linux kernel NBD driver.
//!
//! Drives the `"nbd"` generic-netlink family to hand connected sockets to
//! the in-kernel NBD client, enumerate device status, and disconnect
//! devices. Sockets passed here must already be in transmission phase: the
//! kernel only speaks the transmission half of the protocol.
//!
//! The netlink session is process-wide, lazily dialled on first use, and
//! serialises all commands behind a mutex. Commands need the privileges of
//! the NBD netlink family, typically `CAP_SYS_ADMIN`.

mod attr;
mod genl;

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;
use tracing::debug;

use attr::{get_u32, get_u8, AttrEncoder, AttrIter};
use genl::GenlSession;

const FAMILY_NAME: &str = "nbd";
const MIN_FAMILY_VERSION: u32 = 1;

/// Lets the kernel choose a suitable device number, creating one if needed.
pub const INDEX_ANY: u32 = u32::MAX;

// Family commands.
const CMD_CONNECT: u8 = 1;
const CMD_DISCONNECT: u8 = 2;
const CMD_RECONFIGURE: u8 = 3;
const CMD_STATUS: u8 = 5;

// Family attributes.
const ATTR_INDEX: u16 = 1;
const ATTR_SIZE_BYTES: u16 = 2;
const ATTR_BLOCK_SIZE_BYTES: u16 = 3;
const ATTR_TIMEOUT: u16 = 4;
const ATTR_SERVER_FLAGS: u16 = 5;
const ATTR_CLIENT_FLAGS: u16 = 6;
const ATTR_SOCKETS: u16 = 7;
const ATTR_DEADCONN_TIMEOUT: u16 = 8;
const ATTR_DEVICE_LIST: u16 = 9;

// Items inside ATTR_SOCKETS.
const SOCK_ITEM: u16 = 1;
const SOCK_FD: u16 = 1;

// Items inside ATTR_DEVICE_LIST.
const DEVICE_ITEM: u16 = 1;
const DEVICE_INDEX: u16 = 1;
const DEVICE_CONNECTED: u16 = 2;

bitflags! {
    /// Flags configuring the in-kernel client's behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u64 {
        /// Delete the nbd device on disconnect.
        const DESTROY_ON_DISCONNECT = 1 << 0;
        /// Disconnect the nbd device when the last opener closes it.
        const DISCONNECT_ON_CLOSE = 1 << 1;
    }

    /// Optional features the server behind the sockets supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerFlags: u64 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const SEND_TRIM = 1 << 5;
        const CAN_MULTICONN = 1 << 8;
    }
}

/// Failures talking to the kernel control plane.
#[derive(Debug, Error)]
pub enum NetlinkError {
    #[error("nbd netlink family not found")]
    FamilyNotFound,

    #[error("kernel supports nbd-netlink v{found}, need v{want}")]
    UnsupportedVersion { found: u32, want: u32 },

    #[error("kernel refused command: os error {0}")]
    Kernel(i32),

    #[error("malformed netlink reply: {0}")]
    Malformed(&'static str),

    #[error("kernel assigned no device index")]
    NoIndex,

    #[error("device not found")]
    DeviceNotFound,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetlinkError {
    fn from_errno(errno: nix::errno::Errno) -> Self {
        Self::Io(io::Error::from(errno))
    }
}

/// Status of one NBD device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    pub index: u32,
    pub connected: bool,
}

/// Optional settings for [`connect`] and [`reconfigure`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Block size used by the kernel client. Ignored by [`reconfigure`].
    pub block_size: Option<u64>,
    /// Request timeout, rounded down to whole seconds.
    pub timeout: Option<Duration>,
    /// How long before an unreachable server is considered dead.
    pub dead_connection_timeout: Option<Duration>,
}

static SESSION: Mutex<Option<GenlSession>> = Mutex::new(None);

/// Run `f` against the shared session, dialling it first if this is the
/// first use. Concurrent callers serialise here.
fn with_session<T>(
    f: impl FnOnce(&mut GenlSession) -> Result<T, NetlinkError>,
) -> Result<T, NetlinkError> {
    let mut guard = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    let session = match &mut *guard {
        Some(session) => session,
        slot @ None => slot.insert(GenlSession::open(FAMILY_NAME, MIN_FAMILY_VERSION)?),
    };
    f(session)
}

fn encode_sockets(e: &mut AttrEncoder, sockets: &[BorrowedFd<'_>]) {
    e.nested(ATTR_SOCKETS, |e| {
        for socket in sockets {
            let fd = socket.as_raw_fd() as u32;
            e.nested(SOCK_ITEM, |e| e.u32(SOCK_FD, fd));
        }
    });
}

/// Connect `sockets` to the NBD device numbered `index`, or to a
/// kernel-chosen device when `index` is [`INDEX_ANY`]. The sockets must all
/// be connected to the same server and in transmission phase. Returns the
/// device number; `/dev/nbdX` is then usable as a block device until
/// [`disconnect`].
pub fn connect(
    index: u32,
    sockets: &[BorrowedFd<'_>],
    size: u64,
    client_flags: ClientFlags,
    server_flags: ServerFlags,
    options: ConnectOptions,
) -> Result<u32, NetlinkError> {
    let mut e = AttrEncoder::new();
    if index != INDEX_ANY {
        e.u32(ATTR_INDEX, index);
    }
    e.u64(ATTR_SIZE_BYTES, size);
    encode_sockets(&mut e, sockets);
    e.u64(ATTR_CLIENT_FLAGS, client_flags.bits());
    e.u64(ATTR_SERVER_FLAGS, server_flags.bits());
    if let Some(block_size) = options.block_size {
        e.u64(ATTR_BLOCK_SIZE_BYTES, block_size);
    }
    encode_timeouts(&mut e, &options);

    let replies = with_session(|s| s.execute(CMD_CONNECT, false, &e.finish()))?;

    let mut assigned = INDEX_ANY;
    for payload in &replies {
        for item in AttrIter::new(payload) {
            let (typ, value) = item?;
            if typ == ATTR_INDEX {
                assigned = get_u32(value)?;
            }
        }
    }
    if assigned == INDEX_ANY {
        return Err(NetlinkError::NoIndex);
    }
    debug!(index = assigned, "device connected");
    Ok(assigned)
}

/// Replace the sockets backing an already-connected device. Equivalent to
/// [`connect`] except the index is required and the block size cannot
/// change.
pub fn reconfigure(
    index: u32,
    sockets: &[BorrowedFd<'_>],
    client_flags: ClientFlags,
    server_flags: ServerFlags,
    options: ConnectOptions,
) -> Result<(), NetlinkError> {
    let mut e = AttrEncoder::new();
    e.u32(ATTR_INDEX, index);
    encode_sockets(&mut e, sockets);
    e.u64(ATTR_CLIENT_FLAGS, client_flags.bits());
    e.u64(ATTR_SERVER_FLAGS, server_flags.bits());
    encode_timeouts(&mut e, &options);

    // The kernel sends no data reply for reconfigure; ask for an ack.
    with_session(|s| s.execute(CMD_RECONFIGURE, true, &e.finish()))?;
    Ok(())
}

fn encode_timeouts(e: &mut AttrEncoder, options: &ConnectOptions) {
    if let Some(timeout) = options.timeout {
        e.u64(ATTR_TIMEOUT, timeout.as_secs());
    }
    if let Some(timeout) = options.dead_connection_timeout {
        e.u64(ATTR_DEADCONN_TIMEOUT, timeout.as_secs());
    }
}

/// Disconnect the device numbered `index`.
pub fn disconnect(index: u32) -> Result<(), NetlinkError> {
    let mut e = AttrEncoder::new();
    e.u32(ATTR_INDEX, index);
    // No data reply for disconnect either; ask for an ack.
    with_session(|s| s.execute(CMD_DISCONNECT, true, &e.finish()))?;
    debug!(index, "device disconnected");
    Ok(())
}

/// Status of the device numbered `index`, or
/// [`NetlinkError::DeviceNotFound`].
pub fn status(index: u32) -> Result<DeviceStatus, NetlinkError> {
    let devices = query_status(index)?;
    devices
        .into_iter()
        .find(|d| d.index == index)
        .ok_or(NetlinkError::DeviceNotFound)
}

/// Status of every NBD device slot, ordered by ascending index. An empty
/// list is not an error.
pub fn status_all() -> Result<Vec<DeviceStatus>, NetlinkError> {
    query_status(INDEX_ANY)
}

fn query_status(index: u32) -> Result<Vec<DeviceStatus>, NetlinkError> {
    let mut e = AttrEncoder::new();
    e.u32(ATTR_INDEX, index);
    let replies = with_session(|s| s.execute(CMD_STATUS, false, &e.finish()))?;

    let mut devices = Vec::new();
    for payload in &replies {
        for item in AttrIter::new(payload) {
            let (typ, value) = item?;
            if typ == ATTR_DEVICE_LIST {
                decode_device_list(value, &mut devices)?;
            }
        }
    }
    devices.sort_by_key(|d| d.index);
    Ok(devices)
}

fn decode_device_list(buf: &[u8], out: &mut Vec<DeviceStatus>) -> Result<(), NetlinkError> {
    for item in AttrIter::new(buf) {
        let (typ, value) = item?;
        if typ == DEVICE_ITEM {
            out.push(decode_device_item(value)?);
        }
    }
    Ok(())
}

fn decode_device_item(buf: &[u8]) -> Result<DeviceStatus, NetlinkError> {
    let mut device = DeviceStatus {
        index: 0,
        connected: false,
    };
    for item in AttrIter::new(buf) {
        let (typ, value) = item?;
        match typ {
            DEVICE_INDEX => device.index = get_u32(value)?,
            DEVICE_CONNECTED => device.connected = get_u8(value)? != 0,
            _ => {}
        }
    }
    Ok(device)
}
