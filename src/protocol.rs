//! NBD wire protocol constants and message types.
//!
//! Covers both phases of the protocol: the option-negotiation handshake and
//! the request/reply transmission phase. Frame layouts follow
//! <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>.
//!
//! Everything on the wire is big-endian. Each message type carries its own
//! encode/decode against [`Codec`]; decoding rejects bad magic values with a
//! terminal [`ProtocolError`], while recoverable validation failures are
//! reported as values so the session can answer them and continue.

use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::Codec;
use crate::handshake::BlockSizeConstraints;

// Magic values.
pub(crate) const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub(crate) const OPT_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub(crate) const REPLY_MAGIC: u64 = 0x0003e889045565a9;
pub(crate) const REQUEST_MAGIC: u32 = 0x25609513;
pub(crate) const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Handshake flags. Both peers must advertise exactly these bits.
pub(crate) const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub(crate) const FLAG_NO_ZEROES: u16 = 1 << 1;
pub(crate) const FLAG_DEFAULTS: u16 = FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES;

/// Transmission flags advertised by an [`Export`](crate::Export).
pub const FLAG_HAS_FLAGS: u16 = 1 << 0;
/// The export is read-only; writes are answered `EPERM`.
pub const FLAG_READ_ONLY: u16 = 1 << 1;
/// The export supports the FLUSH command.
pub const FLAG_SEND_FLUSH: u16 = 1 << 2;
/// The export supports the forced-unit-access command flag.
pub const FLAG_SEND_FUA: u16 = 1 << 3;
/// The export supports the TRIM command.
pub const FLAG_SEND_TRIM: u16 = 1 << 5;
/// The export can serve multiple connections.
pub const FLAG_CAN_MULTICONN: u16 = 1 << 8;

// Option codes.
pub(crate) const OPT_EXPORT_NAME: u32 = 1;
pub(crate) const OPT_ABORT: u32 = 2;
pub(crate) const OPT_LIST: u32 = 3;
pub(crate) const OPT_INFO: u32 = 6;
pub(crate) const OPT_GO: u32 = 7;

// Option reply codes.
pub(crate) const REP_ACK: u32 = 1;
pub(crate) const REP_SERVER: u32 = 2;
pub(crate) const REP_INFO: u32 = 3;

// Info kinds carried by INFO replies.
pub(crate) const INFO_EXPORT: u16 = 0;
pub(crate) const INFO_NAME: u16 = 1;
pub(crate) const INFO_DESCRIPTION: u16 = 2;
pub(crate) const INFO_BLOCK_SIZE: u16 = 3;

// Transmission commands.
pub(crate) const CMD_READ: u16 = 0;
pub(crate) const CMD_WRITE: u16 = 1;
pub(crate) const CMD_DISC: u16 = 2;
pub(crate) const CMD_FLUSH: u16 = 3;

/// Option bodies longer than this are drained and refused with
/// [`ReplyError::TOO_BIG`].
pub(crate) const MAX_OPTION_LEN: u32 = 4 << 10;
/// WRITE payloads longer than this are drained and answered `EOVERFLOW`.
pub(crate) const MAX_PAYLOAD_LEN: u32 = 4 << 20;
/// Bound for option-reply bodies accepted by the client.
pub(crate) const MAX_REPLY_LEN: u32 = 64 << 10;
/// Bound for name and description strings accepted by the client.
pub(crate) const MAX_STRING_LEN: u32 = 4 << 10;
/// Bound for the message carried by a handshake error reply.
pub(crate) const MAX_ERROR_LEN: u32 = 4 << 20;

/// Error number carried in a simple reply.
///
/// These values are specified by the protocol and are the only ones safe to
/// send over the wire; they happen to match the usual Unix numbering. Device
/// errors that do not name one of them are reported as [`Errno::EIO`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub u32);

impl Errno {
    pub const EPERM: Errno = Errno(1);
    pub const EIO: Errno = Errno(5);
    pub const ENOMEM: Errno = Errno(12);
    pub const EINVAL: Errno = Errno(22);
    pub const ENOSPC: Errno = Errno(28);
    pub const EOVERFLOW: Errno = Errno(75);
    pub const ESHUTDOWN: Errno = Errno(108);
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Errno::EPERM => f.write_str("operation not permitted"),
            Errno::EIO => f.write_str("input/output error"),
            Errno::ENOMEM => f.write_str("cannot allocate memory"),
            Errno::EINVAL => f.write_str("invalid argument"),
            Errno::ENOSPC => f.write_str("no space left on device"),
            Errno::EOVERFLOW => f.write_str("value too large for defined data type"),
            Errno::ESHUTDOWN => f.write_str("cannot send after transport endpoint shutdown"),
            Errno(code) => write!(f, "NBD_ERROR({code})"),
        }
    }
}

/// Error code carried by a handshake error reply. Bit 31 is always set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplyError(pub u32);

impl ReplyError {
    const BIT: u32 = 1 << 31;

    pub const UNSUP: ReplyError = ReplyError(Self::BIT + 1);
    pub const POLICY: ReplyError = ReplyError(Self::BIT + 2);
    pub const INVALID: ReplyError = ReplyError(Self::BIT + 3);
    pub const PLATFORM: ReplyError = ReplyError(Self::BIT + 4);
    pub const TLS_REQD: ReplyError = ReplyError(Self::BIT + 5);
    pub const UNKNOWN: ReplyError = ReplyError(Self::BIT + 6);
    pub const SHUTDOWN: ReplyError = ReplyError(Self::BIT + 7);
    pub const BLOCK_SIZE_REQD: ReplyError = ReplyError(Self::BIT + 8);
    pub const TOO_BIG: ReplyError = ReplyError(Self::BIT + 9);
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ReplyError::UNSUP => f.write_str("unsupported option"),
            ReplyError::POLICY => f.write_str("forbidden by policy"),
            ReplyError::INVALID => f.write_str("invalid option request"),
            ReplyError::PLATFORM => f.write_str("not supported on this platform"),
            ReplyError::TLS_REQD => f.write_str("TLS required"),
            ReplyError::UNKNOWN => f.write_str("unknown export"),
            ReplyError::SHUTDOWN => f.write_str("server is shutting down"),
            ReplyError::BLOCK_SIZE_REQD => f.write_str("block size negotiation required"),
            ReplyError::TOO_BIG => f.write_str("option request too large"),
            ReplyError(code) => write!(f, "handshake error {code:#x}"),
        }
    }
}

/// Terminal session errors.
///
/// One of these ends the handshake or the transmission session it occurred
/// on. Per-request validation failures are not represented here; they travel
/// back to the peer as reply errnos and the session continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid {context} magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic {
        context: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("handshake failed: {0}")]
    Negotiation(String),

    #[error("client aborted negotiation")]
    Aborted,

    #[error("server rejected option: {code}: {message}")]
    OptionRefused { code: ReplyError, message: String },

    #[error("server replied to handle {actual:#x}, expected {expected:#x}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("request failed: {0}")]
    Command(Errno),

    #[error("connection cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Export and info-kind selection carried by INFO and GO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct InfoRequest {
    pub name: String,
    pub requests: Vec<u16>,
}

/// One option request, as decoded by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OptionRequest {
    ExportName(String),
    Abort,
    List,
    Info(InfoRequest),
    Go(InfoRequest),
    /// An option code this side does not implement. The body has already
    /// been consumed so the stream stays aligned on the next option.
    Unknown { option: u32, length: u32 },
}

impl OptionRequest {
    pub fn code(&self) -> u32 {
        match self {
            OptionRequest::ExportName(_) => OPT_EXPORT_NAME,
            OptionRequest::Abort => OPT_ABORT,
            OptionRequest::List => OPT_LIST,
            OptionRequest::Info(_) => OPT_INFO,
            OptionRequest::Go(_) => OPT_GO,
            OptionRequest::Unknown { option, .. } => *option,
        }
    }

    async fn encode_body<S>(&self, c: &mut Codec<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            OptionRequest::ExportName(name) => c.write_all(name.as_bytes()).await,
            OptionRequest::Abort | OptionRequest::List => Ok(()),
            OptionRequest::Info(req) | OptionRequest::Go(req) => {
                c.write_u32(req.name.len() as u32).await?;
                c.write_all(req.name.as_bytes()).await?;
                c.write_u16(req.requests.len() as u16).await?;
                for r in &req.requests {
                    c.write_u16(*r).await?;
                }
                Ok(())
            }
            OptionRequest::Unknown { .. } => Ok(()),
        }
    }
}

/// Send one option request, client to server. The body is buffered first so
/// its length can prefix it.
pub(crate) async fn write_option<S>(
    c: &mut Codec<S>,
    option: &OptionRequest,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    c.write_u64(OPT_MAGIC).await?;
    c.write_u32(option.code()).await?;
    c.begin_buffer();
    option.encode_body(c).await?;
    let body = c.take_buffer();
    c.write_u32(body.len() as u32).await?;
    c.write_all(&body).await?;
    Ok(())
}

/// Outcome of decoding one option request on the server side. In all cases
/// the option body has been fully consumed.
pub(crate) enum OptionOutcome {
    Parsed(OptionRequest),
    /// The body was malformed or oversized; answer with this error reply and
    /// keep negotiating.
    Refuse(ReplyError),
}

/// Decode one option request. Returns the option code alongside the outcome
/// so refusals can be addressed to the option that caused them.
pub(crate) async fn read_option<S>(c: &mut Codec<S>) -> Result<(u32, OptionOutcome), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = c.read_u64().await?;
    if magic != OPT_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            context: "option",
            expected: OPT_MAGIC,
            actual: magic,
        });
    }
    let option = c.read_u32().await?;
    let length = c.read_u32().await?;

    if length > MAX_OPTION_LEN {
        c.discard(length).await?;
        return Ok((option, OptionOutcome::Refuse(ReplyError::TOO_BIG)));
    }

    let outcome = match option {
        OPT_EXPORT_NAME => {
            let name = c.read_vec(length as usize).await?;
            OptionOutcome::Parsed(OptionRequest::ExportName(lossy(&name)))
        }
        OPT_ABORT | OPT_LIST => {
            if length != 0 {
                c.discard(length).await?;
                OptionOutcome::Refuse(ReplyError::INVALID)
            } else if option == OPT_ABORT {
                OptionOutcome::Parsed(OptionRequest::Abort)
            } else {
                OptionOutcome::Parsed(OptionRequest::List)
            }
        }
        OPT_INFO | OPT_GO => {
            let body = c.read_vec(length as usize).await?;
            match parse_info_request(&body) {
                Some(req) if option == OPT_GO => OptionOutcome::Parsed(OptionRequest::Go(req)),
                Some(req) => OptionOutcome::Parsed(OptionRequest::Info(req)),
                None => OptionOutcome::Refuse(ReplyError::INVALID),
            }
        }
        _ => {
            c.discard(length).await?;
            OptionOutcome::Parsed(OptionRequest::Unknown { option, length })
        }
    };
    Ok((option, outcome))
}

/// Body layout: `name_length (u32) | name | req_count (u16) | req_count × u16`.
fn parse_info_request(body: &[u8]) -> Option<InfoRequest> {
    if body.len() < 6 {
        return None;
    }
    let name_len = u32::from_be_bytes(body[0..4].try_into().ok()?) as usize;
    if body.len() < 4 + name_len + 2 {
        return None;
    }
    let name = lossy(&body[4..4 + name_len]);
    let count_at = 4 + name_len;
    let count = u16::from_be_bytes(body[count_at..count_at + 2].try_into().ok()?) as usize;
    let rest = &body[count_at + 2..];
    if rest.len() != count * 2 {
        return None;
    }
    let requests = rest
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Some(InfoRequest { name, requests })
}

/// One piece of export information carried by an INFO reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InfoReply {
    Export { size: u64, flags: u16 },
    Name(String),
    Description(String),
    BlockSize(BlockSizeConstraints),
}

/// One option reply, server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OptionReply {
    Ack,
    Server { name: String, details: String },
    Info(InfoReply),
    Error { code: ReplyError, message: String },
}

impl OptionReply {
    fn code(&self) -> u32 {
        match self {
            OptionReply::Ack => REP_ACK,
            OptionReply::Server { .. } => REP_SERVER,
            OptionReply::Info(_) => REP_INFO,
            OptionReply::Error { code, .. } => code.0,
        }
    }

    async fn encode_body<S>(&self, c: &mut Codec<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            OptionReply::Ack => Ok(()),
            OptionReply::Server { name, details } => {
                c.write_u32(name.len() as u32).await?;
                c.write_all(name.as_bytes()).await?;
                c.write_all(details.as_bytes()).await?;
                Ok(())
            }
            OptionReply::Info(info) => match info {
                InfoReply::Export { size, flags } => {
                    c.write_u16(INFO_EXPORT).await?;
                    c.write_u64(*size).await?;
                    c.write_u16(*flags).await?;
                    Ok(())
                }
                InfoReply::Name(name) => {
                    c.write_u16(INFO_NAME).await?;
                    c.write_all(name.as_bytes()).await?;
                    Ok(())
                }
                InfoReply::Description(description) => {
                    c.write_u16(INFO_DESCRIPTION).await?;
                    c.write_all(description.as_bytes()).await?;
                    Ok(())
                }
                InfoReply::BlockSize(sizes) => {
                    c.write_u16(INFO_BLOCK_SIZE).await?;
                    c.write_u32(sizes.min).await?;
                    c.write_u32(sizes.preferred).await?;
                    c.write_u32(sizes.max).await?;
                    Ok(())
                }
            },
            OptionReply::Error { message, .. } => c.write_all(message.as_bytes()).await,
        }
    }
}

/// Send one option reply. The body is buffered to compute its length prefix.
pub(crate) async fn write_option_reply<S>(
    c: &mut Codec<S>,
    option: u32,
    reply: &OptionReply,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    c.write_u64(REPLY_MAGIC).await?;
    c.write_u32(option).await?;
    c.write_u32(reply.code()).await?;
    c.begin_buffer();
    reply.encode_body(c).await?;
    let body = c.take_buffer();
    c.write_u32(body.len() as u32).await?;
    c.write_all(&body).await?;
    Ok(())
}

/// Decode one option reply on the client side.
///
/// `expect_option` is the option the client last sent; a reply addressed to
/// any other option is a terminal error. Error replies are surfaced as
/// [`ProtocolError::OptionRefused`]. `Ok(None)` means an INFO reply of an
/// unknown kind was skipped (its body is consumed); callers keep reading.
pub(crate) async fn read_option_reply<S>(
    c: &mut Codec<S>,
    expect_option: u32,
) -> Result<Option<OptionReply>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let magic = c.read_u64().await?;
    if magic != REPLY_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            context: "option reply",
            expected: REPLY_MAGIC,
            actual: magic,
        });
    }
    let option = c.read_u32().await?;
    if option != expect_option {
        return Err(ProtocolError::Negotiation(format!(
            "server replied to option {option}, expected {expect_option}"
        )));
    }
    let code = c.read_u32().await?;
    let length = c.read_u32().await?;

    if code & (1 << 31) != 0 {
        if length > MAX_ERROR_LEN {
            return Err(ProtocolError::Negotiation(
                "oversized error reply from server".into(),
            ));
        }
        let message = c.read_vec(length as usize).await?;
        return Err(ProtocolError::OptionRefused {
            code: ReplyError(code),
            message: lossy(&message),
        });
    }
    if length > MAX_REPLY_LEN {
        return Err(ProtocolError::Negotiation(
            "oversized option reply from server".into(),
        ));
    }

    match code {
        REP_ACK => {
            if length != 0 {
                return Err(ProtocolError::Negotiation("non-empty ack reply".into()));
            }
            Ok(Some(OptionReply::Ack))
        }
        REP_SERVER => {
            if length < 4 {
                return Err(ProtocolError::Negotiation("truncated server reply".into()));
            }
            let name_len = c.read_u32().await? as usize;
            let rest = c.read_vec(length as usize - 4).await?;
            if name_len > rest.len() {
                return Err(ProtocolError::Negotiation("malformed server reply".into()));
            }
            Ok(Some(OptionReply::Server {
                name: lossy(&rest[..name_len]),
                details: lossy(&rest[name_len..]),
            }))
        }
        REP_INFO => {
            if length < 2 {
                return Err(ProtocolError::Negotiation("truncated info reply".into()));
            }
            read_info_reply(c, length - 2).await
        }
        other => Err(ProtocolError::Negotiation(format!(
            "unknown reply code {other:#x}"
        ))),
    }
}

/// Decode the body of an INFO reply; `length` excludes the leading info kind.
async fn read_info_reply<S>(
    c: &mut Codec<S>,
    length: u32,
) -> Result<Option<OptionReply>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let kind = c.read_u16().await?;
    let info = match kind {
        INFO_EXPORT => {
            if length != 10 {
                return Err(ProtocolError::Negotiation(
                    "bad length for export info".into(),
                ));
            }
            let size = c.read_u64().await?;
            let flags = c.read_u16().await?;
            InfoReply::Export { size, flags }
        }
        INFO_NAME | INFO_DESCRIPTION => {
            if length > MAX_STRING_LEN {
                return Err(ProtocolError::Negotiation(
                    "oversized string in info reply".into(),
                ));
            }
            let text = lossy(&c.read_vec(length as usize).await?);
            if kind == INFO_NAME {
                InfoReply::Name(text)
            } else {
                InfoReply::Description(text)
            }
        }
        INFO_BLOCK_SIZE => {
            if length != 12 {
                return Err(ProtocolError::Negotiation(
                    "bad length for block size info".into(),
                ));
            }
            InfoReply::BlockSize(BlockSizeConstraints {
                min: c.read_u32().await?,
                preferred: c.read_u32().await?,
                max: c.read_u32().await?,
            })
        }
        _ => {
            // Unknown info kind: skip it, the stream stays aligned.
            c.discard(length).await?;
            return Ok(None);
        }
    };
    Ok(Some(OptionReply::Info(info)))
}

/// One transmission request.
///
/// `handle` is an opaque correlation token chosen by the client and echoed
/// in the reply. `data` is non-empty only for WRITE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub flags: u16,
    pub kind: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
    pub data: Bytes,
}

/// Outcome of decoding one request frame. `Invalid` frames have had their
/// payload drained; the server answers them with the errno and continues.
pub(crate) enum DecodedRequest {
    Valid(Request),
    Invalid { handle: u64, errno: Errno },
}

impl Request {
    pub(crate) async fn encode<S>(&self, c: &mut Codec<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        c.write_u32(REQUEST_MAGIC).await?;
        c.write_u16(self.flags).await?;
        c.write_u16(self.kind).await?;
        c.write_u64(self.handle).await?;
        c.write_u64(self.offset).await?;
        c.write_u32(self.length).await?;
        if !self.data.is_empty() {
            c.write_all(&self.data).await?;
        }
        Ok(())
    }

    pub(crate) async fn decode<S>(c: &mut Codec<S>) -> Result<DecodedRequest, ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let magic = c.read_u32().await?;
        if magic != REQUEST_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                context: "request",
                expected: REQUEST_MAGIC as u64,
                actual: magic as u64,
            });
        }
        let flags = c.read_u16().await?;
        let kind = c.read_u16().await?;
        let handle = c.read_u64().await?;
        let offset = c.read_u64().await?;
        let length = c.read_u32().await?;

        let mut data = Bytes::new();
        if kind == CMD_WRITE {
            if length > MAX_PAYLOAD_LEN {
                c.discard(length).await?;
                return Ok(DecodedRequest::Invalid {
                    handle,
                    errno: Errno::EOVERFLOW,
                });
            }
            let mut buf = BytesMut::with_capacity(length as usize);
            buf.resize(length as usize, 0);
            c.read_exact(&mut buf).await?;
            data = buf.freeze();
        }
        if offset & (1 << 63) != 0 {
            return Ok(DecodedRequest::Invalid {
                handle,
                errno: Errno::EOVERFLOW,
            });
        }

        Ok(DecodedRequest::Valid(Request {
            flags,
            kind,
            handle,
            offset,
            length,
            data,
        }))
    }
}

/// One simple reply. The payload is non-empty only for a successful READ,
/// where it is exactly the requested byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleReply {
    pub errno: u32,
    pub handle: u64,
    pub data: Bytes,
}

impl SimpleReply {
    pub(crate) fn ok(handle: u64, data: Bytes) -> Self {
        Self {
            errno: 0,
            handle,
            data,
        }
    }

    pub(crate) fn error(handle: u64, errno: Errno) -> Self {
        Self {
            errno: errno.0,
            handle,
            data: Bytes::new(),
        }
    }

    pub(crate) async fn encode<S>(&self, c: &mut Codec<S>) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        c.write_u32(SIMPLE_REPLY_MAGIC).await?;
        c.write_u32(self.errno).await?;
        c.write_u64(self.handle).await?;
        if !self.data.is_empty() {
            c.write_all(&self.data).await?;
        }
        Ok(())
    }

    /// Decode the fixed 16-byte header. The caller reads any READ payload
    /// itself, since its length comes from the matching request.
    pub(crate) async fn decode_header<S>(c: &mut Codec<S>) -> Result<(u32, u64), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let magic = c.read_u32().await?;
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                context: "simple reply",
                expected: SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }
        let errno = c.read_u32().await?;
        let handle = c.read_u64().await?;
        Ok((errno, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn pipe() -> (Codec<DuplexStream>, Codec<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (Codec::new(a), Codec::new(b))
    }

    async fn option_roundtrip(request: OptionRequest) -> OptionRequest {
        let (mut w, mut r) = pipe();
        write_option(&mut w, &request).await.unwrap();
        let (code, outcome) = read_option(&mut r).await.unwrap();
        assert_eq!(code, request.code());
        match outcome {
            OptionOutcome::Parsed(parsed) => parsed,
            OptionOutcome::Refuse(e) => panic!("refused: {e}"),
        }
    }

    #[tokio::test]
    async fn option_request_roundtrips() {
        for request in [
            OptionRequest::ExportName("disk0".into()),
            OptionRequest::Abort,
            OptionRequest::List,
            OptionRequest::Info(InfoRequest {
                name: "disk0".into(),
                requests: vec![INFO_EXPORT, INFO_BLOCK_SIZE],
            }),
            OptionRequest::Go(InfoRequest {
                name: String::new(),
                requests: vec![],
            }),
        ] {
            assert_eq!(option_roundtrip(request.clone()).await, request);
        }
    }

    #[tokio::test]
    async fn option_bad_magic_is_terminal() {
        let (mut w, mut r) = pipe();
        w.write_u64(0x1122334455667788).await.unwrap();
        w.write_u32(OPT_LIST).await.unwrap();
        w.write_u32(0).await.unwrap();
        assert!(matches!(
            read_option(&mut r).await,
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_option_is_drained_and_refused() {
        let (mut w, mut r) = pipe();
        let len = MAX_OPTION_LEN + 1;
        w.write_u64(OPT_MAGIC).await.unwrap();
        w.write_u32(OPT_LIST).await.unwrap();
        w.write_u32(len).await.unwrap();
        w.write_all(&vec![0u8; len as usize]).await.unwrap();
        // A well-formed option follows; decoding it proves the oversized
        // body was fully drained.
        write_option(&mut w, &OptionRequest::Abort).await.unwrap();

        let (code, outcome) = read_option(&mut r).await.unwrap();
        assert_eq!(code, OPT_LIST);
        assert!(matches!(
            outcome,
            OptionOutcome::Refuse(e) if e == ReplyError::TOO_BIG
        ));

        let (_, outcome) = read_option(&mut r).await.unwrap();
        assert!(matches!(
            outcome,
            OptionOutcome::Parsed(OptionRequest::Abort)
        ));
    }

    #[tokio::test]
    async fn unknown_option_consumes_body() {
        let (mut w, mut r) = pipe();
        w.write_u64(OPT_MAGIC).await.unwrap();
        w.write_u32(9999).await.unwrap();
        w.write_u32(5).await.unwrap();
        w.write_all(b"hello").await.unwrap();
        write_option(&mut w, &OptionRequest::List).await.unwrap();

        let (code, outcome) = read_option(&mut r).await.unwrap();
        assert_eq!(code, 9999);
        assert!(matches!(
            outcome,
            OptionOutcome::Parsed(OptionRequest::Unknown {
                option: 9999,
                length: 5
            })
        ));
        let (_, outcome) = read_option(&mut r).await.unwrap();
        assert!(matches!(outcome, OptionOutcome::Parsed(OptionRequest::List)));
    }

    #[tokio::test]
    async fn malformed_info_body_is_invalid() {
        let (mut w, mut r) = pipe();
        // name_length claims more bytes than the body holds
        w.write_u64(OPT_MAGIC).await.unwrap();
        w.write_u32(OPT_GO).await.unwrap();
        w.write_u32(6).await.unwrap();
        w.write_u32(100).await.unwrap();
        w.write_u16(0).await.unwrap();

        let (code, outcome) = read_option(&mut r).await.unwrap();
        assert_eq!(code, OPT_GO);
        assert!(matches!(
            outcome,
            OptionOutcome::Refuse(e) if e == ReplyError::INVALID
        ));
    }

    async fn reply_roundtrip(reply: OptionReply) -> OptionReply {
        let (mut w, mut r) = pipe();
        write_option_reply(&mut w, OPT_LIST, &reply).await.unwrap();
        read_option_reply(&mut r, OPT_LIST)
            .await
            .unwrap()
            .expect("reply should not be skipped")
    }

    #[tokio::test]
    async fn option_reply_roundtrips() {
        for reply in [
            OptionReply::Ack,
            OptionReply::Server {
                name: "disk0".into(),
                details: "first disk".into(),
            },
            OptionReply::Info(InfoReply::Export {
                size: 1 << 30,
                flags: FLAG_HAS_FLAGS | FLAG_SEND_FLUSH,
            }),
            OptionReply::Info(InfoReply::Name("disk0".into())),
            OptionReply::Info(InfoReply::Description("scratch".into())),
            OptionReply::Info(InfoReply::BlockSize(BlockSizeConstraints {
                min: 1,
                preferred: 4096,
                max: u32::MAX,
            })),
        ] {
            assert_eq!(reply_roundtrip(reply.clone()).await, reply);
        }
    }

    #[tokio::test]
    async fn error_reply_surfaces_code_and_message() {
        let (mut w, mut r) = pipe();
        let reply = OptionReply::Error {
            code: ReplyError::UNKNOWN,
            message: "no such export".into(),
        };
        write_option_reply(&mut w, OPT_GO, &reply).await.unwrap();

        match read_option_reply(&mut r, OPT_GO).await {
            Err(ProtocolError::OptionRefused { code, message }) => {
                assert_eq!(code, ReplyError::UNKNOWN);
                assert_eq!(message, "no such export");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_to_wrong_option_is_terminal() {
        let (mut w, mut r) = pipe();
        write_option_reply(&mut w, OPT_LIST, &OptionReply::Ack)
            .await
            .unwrap();
        assert!(matches!(
            read_option_reply(&mut r, OPT_GO).await,
            Err(ProtocolError::Negotiation(_))
        ));
    }

    #[tokio::test]
    async fn unknown_info_kind_is_skipped() {
        let (mut w, mut r) = pipe();
        w.write_u64(REPLY_MAGIC).await.unwrap();
        w.write_u32(OPT_INFO).await.unwrap();
        w.write_u32(REP_INFO).await.unwrap();
        w.write_u32(2 + 4).await.unwrap();
        w.write_u16(999).await.unwrap();
        w.write_u32(0xdeadbeef).await.unwrap();
        write_option_reply(&mut w, OPT_INFO, &OptionReply::Ack)
            .await
            .unwrap();

        assert!(read_option_reply(&mut r, OPT_INFO).await.unwrap().is_none());
        assert_eq!(
            read_option_reply(&mut r, OPT_INFO).await.unwrap(),
            Some(OptionReply::Ack)
        );
    }

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut w, mut r) = pipe();
        let request = Request {
            flags: 0,
            kind: CMD_WRITE,
            handle: 0xfeed,
            offset: 4096,
            length: 4,
            data: Bytes::from_static(b"data"),
        };
        request.encode(&mut w).await.unwrap();
        match Request::decode(&mut r).await.unwrap() {
            DecodedRequest::Valid(decoded) => assert_eq!(decoded, request),
            DecodedRequest::Invalid { .. } => panic!("request should be valid"),
        }
    }

    #[tokio::test]
    async fn request_bad_magic_is_terminal() {
        let (mut w, mut r) = pipe();
        w.write_u32(0xbadc0de).await.unwrap();
        w.write_all(&[0u8; 24]).await.unwrap();
        assert!(matches!(
            Request::decode(&mut r).await,
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[tokio::test]
    async fn request_offset_high_bit_is_invalid() {
        let (mut w, mut r) = pipe();
        Request {
            flags: 0,
            kind: CMD_READ,
            handle: 7,
            offset: 1 << 63,
            length: 512,
            data: Bytes::new(),
        }
        .encode(&mut w)
        .await
        .unwrap();
        match Request::decode(&mut r).await.unwrap() {
            DecodedRequest::Invalid { handle, errno } => {
                assert_eq!(handle, 7);
                assert_eq!(errno, Errno::EOVERFLOW);
            }
            DecodedRequest::Valid(_) => panic!("offset guard missed"),
        }
    }

    #[tokio::test]
    async fn oversized_write_is_drained() {
        let (mut w, mut r) = pipe();
        let length = MAX_PAYLOAD_LEN + 1;
        tokio::spawn(async move {
            Request {
                flags: 0,
                kind: CMD_WRITE,
                handle: 9,
                offset: 0,
                length,
                data: Bytes::from(vec![0u8; length as usize]),
            }
            .encode(&mut w)
            .await
            .unwrap();
            Request {
                flags: 0,
                kind: CMD_FLUSH,
                handle: 10,
                offset: 0,
                length: 0,
                data: Bytes::new(),
            }
            .encode(&mut w)
            .await
            .unwrap();
        });

        match Request::decode(&mut r).await.unwrap() {
            DecodedRequest::Invalid { handle, errno } => {
                assert_eq!(handle, 9);
                assert_eq!(errno, Errno::EOVERFLOW);
            }
            DecodedRequest::Valid(_) => panic!("payload bound missed"),
        }
        // The next frame decodes cleanly: the payload was drained.
        match Request::decode(&mut r).await.unwrap() {
            DecodedRequest::Valid(req) => assert_eq!(req.kind, CMD_FLUSH),
            DecodedRequest::Invalid { .. } => panic!("flush should be valid"),
        }
    }

    #[tokio::test]
    async fn simple_reply_roundtrip() {
        let (mut w, mut r) = pipe();
        let reply = SimpleReply::ok(0xabcd, Bytes::from_static(b"payload"));
        reply.encode(&mut w).await.unwrap();

        let (errno, handle) = SimpleReply::decode_header(&mut r).await.unwrap();
        assert_eq!(errno, 0);
        assert_eq!(handle, 0xabcd);
        assert_eq!(r.read_vec(7).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn errno_display_matches_strerror() {
        assert_eq!(Errno::EIO.to_string(), "input/output error");
        assert_eq!(Errno(200).to_string(), "NBD_ERROR(200)");
    }

    #[test]
    fn reply_error_values_are_consecutive() {
        assert_eq!(ReplyError::UNSUP.0, (1 << 31) + 1);
        assert_eq!(ReplyError::TOO_BIG.0, (1 << 31) + 9);
    }
}
