//! NBD client: handshake negotiation and the transmission phase.
//!
//! [`Client`] drives the handshake (`list` / `info` / `go` / `abort`) over
//! any async stream. A successful [`Client::go`] hands the stream over to a
//! [`TransmissionClient`] for data I/O.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::Codec;
use crate::handshake::BlockSizeConstraints;
use crate::protocol::{
    read_option_reply, write_option, Errno, InfoReply, InfoRequest, OptionReply, OptionRequest,
    ProtocolError, Request, SimpleReply, CMD_DISC, CMD_FLUSH, CMD_READ, CMD_WRITE, FLAG_DEFAULTS,
    INFO_BLOCK_SIZE, INFO_DESCRIPTION, INFO_EXPORT, INFO_NAME, NBD_MAGIC, OPT_MAGIC,
};

/// Export details reported by a server during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub description: String,
    pub size: u64,
    pub flags: u16,
    pub block_sizes: Option<BlockSizeConstraints>,
}

/// Client half of the handshake phase.
///
/// The client borrows nothing: it owns the stream for the duration of the
/// negotiation and gives it back through [`into_inner`](Self::into_inner),
/// [`go`](Self::go), or [`abort`](Self::abort). It never closes it.
pub struct Client<S> {
    codec: Codec<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the fixed-newstyle greeting over `stream`.
    ///
    /// Fails unless the server advertises exactly the mandatory handshake
    /// flags (fixed newstyle, no zeroes).
    pub async fn handshake(stream: S) -> Result<Self, ProtocolError> {
        let mut codec = Codec::new(stream);

        let magic = codec.read_u64().await?;
        if magic != NBD_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                context: "server greeting",
                expected: NBD_MAGIC,
                actual: magic,
            });
        }
        let magic = codec.read_u64().await?;
        if magic != OPT_MAGIC {
            return Err(ProtocolError::InvalidMagic {
                context: "server greeting",
                expected: OPT_MAGIC,
                actual: magic,
            });
        }
        let server_flags = codec.read_u16().await?;
        if server_flags != FLAG_DEFAULTS {
            return Err(ProtocolError::Negotiation(
                "refusing deprecated handshake flags".into(),
            ));
        }
        codec.write_u32(u32::from(FLAG_DEFAULTS)).await?;

        Ok(Self { codec })
    }

    /// Give the stream back without ending the negotiation.
    pub fn into_inner(self) -> S {
        self.codec.into_inner()
    }

    async fn send(&mut self, request: &OptionRequest) -> Result<(), ProtocolError> {
        write_option(&mut self.codec, request).await
    }

    /// Read replies until one is not skipped.
    async fn recv(&mut self, option: u32) -> Result<OptionReply, ProtocolError> {
        loop {
            if let Some(reply) = read_option_reply(&mut self.codec, option).await? {
                return Ok(reply);
            }
        }
    }

    /// The names of the exports the server is providing, in server order.
    pub async fn list(&mut self) -> Result<Vec<String>, ProtocolError> {
        self.send(&OptionRequest::List).await?;
        let mut names = Vec::new();
        loop {
            match self.recv(OptionRequest::List.code()).await? {
                OptionReply::Ack => return Ok(names),
                OptionReply::Server { name, .. } => names.push(name),
                _ => {
                    return Err(ProtocolError::Negotiation(
                        "unexpected reply to list option".into(),
                    ))
                }
            }
        }
    }

    /// Query an export without opening it. The empty name queries the
    /// default export.
    pub async fn info(&mut self, export_name: &str) -> Result<ExportInfo, ProtocolError> {
        self.query(export_name, false).await
    }

    /// End the handshake by opening an export. The empty name opens the
    /// default export. On success the stream is in transmission phase.
    pub async fn go(
        mut self,
        export_name: &str,
    ) -> Result<(ExportInfo, TransmissionClient<S>), ProtocolError> {
        let info = self.query(export_name, true).await?;
        Ok((info, TransmissionClient::new(self.codec)))
    }

    /// Abort the negotiation. The server acknowledges and both sides drop
    /// the session.
    pub async fn abort(mut self) -> Result<S, ProtocolError> {
        self.send(&OptionRequest::Abort).await?;
        match self.recv(OptionRequest::Abort.code()).await? {
            OptionReply::Ack => Ok(self.codec.into_inner()),
            _ => Err(ProtocolError::Negotiation(
                "unexpected reply to abort option".into(),
            )),
        }
    }

    async fn query(&mut self, name: &str, done: bool) -> Result<ExportInfo, ProtocolError> {
        let req = InfoRequest {
            name: name.to_string(),
            requests: vec![INFO_EXPORT, INFO_NAME, INFO_DESCRIPTION, INFO_BLOCK_SIZE],
        };
        let request = if done {
            OptionRequest::Go(req)
        } else {
            OptionRequest::Info(req)
        };
        self.send(&request).await?;

        let mut info = ExportInfo::default();
        loop {
            match self.recv(request.code()).await? {
                OptionReply::Ack => return Ok(info),
                OptionReply::Info(piece) => match piece {
                    InfoReply::Export { size, flags } => {
                        info.size = size;
                        info.flags = flags;
                    }
                    InfoReply::Name(name) => info.name = name,
                    InfoReply::Description(description) => info.description = description,
                    InfoReply::BlockSize(sizes) => info.block_sizes = Some(sizes),
                },
                _ => {
                    return Err(ProtocolError::Negotiation(
                        "unexpected reply to info option".into(),
                    ))
                }
            }
        }
    }
}

/// Client half of the transmission phase.
///
/// One request is in flight at a time; the handle counter only exists to
/// catch a server that correlates replies incorrectly.
pub struct TransmissionClient<S> {
    codec: Codec<S>,
    next_handle: u64,
}

impl<S> TransmissionClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(codec: Codec<S>) -> Self {
        Self {
            codec,
            next_handle: 0,
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    async fn send(
        &mut self,
        kind: u16,
        offset: u64,
        length: u32,
        data: Bytes,
    ) -> Result<u64, ProtocolError> {
        let handle = self.next_handle();
        let request = Request {
            flags: 0,
            kind,
            handle,
            offset,
            length,
            data,
        };
        request.encode(&mut self.codec).await?;
        Ok(handle)
    }

    /// Read the reply header for `handle`, surfacing non-zero errnos.
    async fn check_reply(&mut self, handle: u64) -> Result<(), ProtocolError> {
        let (errno, reply_handle) = SimpleReply::decode_header(&mut self.codec).await?;
        if reply_handle != handle {
            return Err(ProtocolError::HandleMismatch {
                expected: handle,
                actual: reply_handle,
            });
        }
        if errno != 0 {
            return Err(ProtocolError::Command(Errno(errno)));
        }
        Ok(())
    }

    /// Read `length` bytes starting at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, ProtocolError> {
        let handle = self.send(CMD_READ, offset, length, Bytes::new()).await?;
        self.check_reply(handle).await?;

        let mut data = BytesMut::with_capacity(length as usize);
        data.resize(length as usize, 0);
        self.codec.read_exact(&mut data).await?;
        Ok(data.freeze())
    }

    /// Write `data` starting at `offset`.
    pub async fn write(&mut self, offset: u64, data: Bytes) -> Result<(), ProtocolError> {
        let length = data.len() as u32;
        let handle = self.send(CMD_WRITE, offset, length, data).await?;
        self.check_reply(handle).await
    }

    /// Ask the server to make all completed writes durable.
    pub async fn flush(&mut self) -> Result<(), ProtocolError> {
        let handle = self.send(CMD_FLUSH, 0, 0, Bytes::new()).await?;
        self.check_reply(handle).await
    }

    /// End the session gracefully. There is no reply to a disconnect;
    /// the stream is handed back to the caller to close.
    pub async fn disconnect(mut self) -> Result<S, ProtocolError> {
        self.send(CMD_DISC, 0, 0, Bytes::new()).await?;
        Ok(self.codec.into_inner())
    }

    /// Give the stream back without disconnecting.
    pub fn into_inner(self) -> S {
        self.codec.into_inner()
    }
}
