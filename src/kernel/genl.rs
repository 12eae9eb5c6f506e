//! A minimal generic-netlink session.
//!
//! Speaks just enough of the protocol for the NBD control plane: resolve a
//! family by name through the nlctrl family, then exchange single
//! request/reply (or request/ack) pairs. Message headers are host-endian;
//! see netlink(7) and the genetlink kernel sources for the layout.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{
    bind, getsockname, recv, sendto, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
    SockProtocol, SockType,
};

use super::attr::{align, get_u16, get_u32, AttrEncoder, AttrIter};
use super::NetlinkError;

// netlink message types
const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

// netlink message flags
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_MULTI: u16 = 0x2;
const NLM_F_ACK: u16 = 0x4;

// generic netlink controller
const GENL_ID_CTRL: u16 = 0x10;
const CTRL_CMD_GETFAMILY: u8 = 3;
const CTRL_VERSION: u8 = 2;
const CTRL_ATTR_FAMILY_ID: u16 = 1;
const CTRL_ATTR_FAMILY_NAME: u16 = 2;
const CTRL_ATTR_VERSION: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;

/// One connected generic-netlink socket with a resolved family.
///
/// All commands for the family go through [`execute`](Self::execute); the
/// session is not safe for concurrent use and is expected to live behind a
/// mutex.
pub(crate) struct GenlSession {
    fd: OwnedFd,
    portid: u32,
    family: u16,
    seq: u32,
}

impl GenlSession {
    /// Dial generic netlink and resolve `family_name`, requiring at least
    /// `min_version`.
    pub fn open(family_name: &str, min_version: u32) -> Result<Self, NetlinkError> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkGeneric,
        )
        .map_err(NetlinkError::from_errno)?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0)).map_err(NetlinkError::from_errno)?;
        let local: NetlinkAddr =
            getsockname(fd.as_raw_fd()).map_err(NetlinkError::from_errno)?;

        let mut session = Self {
            fd,
            portid: local.pid(),
            family: 0,
            seq: 1,
        };

        let mut attrs = AttrEncoder::new();
        attrs.string(CTRL_ATTR_FAMILY_NAME, family_name);
        let replies = session.roundtrip(
            GENL_ID_CTRL,
            CTRL_CMD_GETFAMILY,
            CTRL_VERSION,
            false,
            &attrs.finish(),
        )?;

        let mut family = None;
        let mut version = 0u32;
        for payload in &replies {
            for attr in AttrIter::new(payload) {
                let (typ, value) = attr?;
                match typ {
                    CTRL_ATTR_FAMILY_ID => family = Some(get_u16(value)?),
                    CTRL_ATTR_VERSION => version = get_u32(value)?,
                    _ => {}
                }
            }
        }
        let family = family.ok_or(NetlinkError::FamilyNotFound)?;
        if version < min_version {
            return Err(NetlinkError::UnsupportedVersion {
                found: version,
                want: min_version,
            });
        }
        session.family = family;
        Ok(session)
    }

    /// Issue one command against the resolved family. With `ack`, the kernel
    /// is asked to confirm commands that produce no data reply. Returns the
    /// attribute payload of each data message.
    pub fn execute(
        &mut self,
        command: u8,
        ack: bool,
        attrs: &[u8],
    ) -> Result<Vec<Vec<u8>>, NetlinkError> {
        self.roundtrip(self.family, command, 0, ack, attrs)
    }

    fn roundtrip(
        &mut self,
        msg_type: u16,
        command: u8,
        version: u8,
        ack: bool,
        attrs: &[u8],
    ) -> Result<Vec<Vec<u8>>, NetlinkError> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut flags = NLM_F_REQUEST;
        if ack {
            flags |= NLM_F_ACK;
        }

        let total = NLMSG_HDRLEN + GENL_HDRLEN + attrs.len();
        let mut msg = Vec::with_capacity(total);
        msg.extend_from_slice(&(total as u32).to_ne_bytes());
        msg.extend_from_slice(&msg_type.to_ne_bytes());
        msg.extend_from_slice(&flags.to_ne_bytes());
        msg.extend_from_slice(&seq.to_ne_bytes());
        msg.extend_from_slice(&self.portid.to_ne_bytes());
        msg.push(command);
        msg.push(version);
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(attrs);

        let kernel = NetlinkAddr::new(0, 0);
        sendto(self.fd.as_raw_fd(), &msg, &kernel, MsgFlags::empty())
            .map_err(NetlinkError::from_errno)?;

        let mut out = Vec::new();
        let mut buf = vec![0u8; 1 << 16];
        loop {
            let n = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())
                .map_err(NetlinkError::from_errno)?;
            let mut rest = &buf[..n];
            while !rest.is_empty() {
                if rest.len() < NLMSG_HDRLEN {
                    return Err(NetlinkError::Malformed("truncated message header"));
                }
                let len = u32::from_ne_bytes(rest[0..4].try_into().unwrap()) as usize;
                let typ = u16::from_ne_bytes(rest[4..6].try_into().unwrap());
                let flags = u16::from_ne_bytes(rest[6..8].try_into().unwrap());
                let rseq = u32::from_ne_bytes(rest[8..12].try_into().unwrap());
                if len < NLMSG_HDRLEN || len > rest.len() {
                    return Err(NetlinkError::Malformed("bad message length"));
                }
                if rseq != seq {
                    return Err(NetlinkError::Malformed("reply sequence mismatch"));
                }
                let body = &rest[NLMSG_HDRLEN..len];

                match typ {
                    NLMSG_NOOP => {}
                    NLMSG_DONE => return Ok(out),
                    NLMSG_ERROR => {
                        if body.len() < 4 {
                            return Err(NetlinkError::Malformed("truncated error message"));
                        }
                        let code = i32::from_ne_bytes(body[0..4].try_into().unwrap());
                        if code != 0 {
                            return Err(NetlinkError::Kernel(-code));
                        }
                        // code 0 is the requested ack
                        return Ok(out);
                    }
                    t if t == msg_type => {
                        if body.len() < GENL_HDRLEN {
                            return Err(NetlinkError::Malformed("truncated genl header"));
                        }
                        out.push(body[GENL_HDRLEN..].to_vec());
                        if flags & NLM_F_MULTI == 0 {
                            return Ok(out);
                        }
                    }
                    _ => return Err(NetlinkError::Malformed("unexpected message type")),
                }
                rest = &rest[align(len).min(rest.len())..];
            }
        }
    }
}
