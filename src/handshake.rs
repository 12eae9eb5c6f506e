//! Server side of the option-negotiation handshake.

use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::codec::Codec;
use crate::device::Device;
use crate::protocol::{
    read_option, write_option_reply, InfoReply, OptionOutcome, OptionReply, OptionRequest,
    ProtocolError, ReplyError, FLAG_DEFAULTS, INFO_BLOCK_SIZE, INFO_DESCRIPTION, INFO_EXPORT,
    INFO_NAME, NBD_MAGIC, OPT_MAGIC,
};

/// One block device offered by a server.
///
/// The first export in a server's list doubles as the default: clients that
/// ask for the empty name get it. An export is shared by every connection
/// that selects it and must outlive them all.
#[derive(Clone)]
pub struct Export {
    /// Advertised name; empty means this is only reachable as the default.
    pub name: String,
    /// Human-readable description returned from INFO requests.
    pub description: String,
    /// Size in bytes.
    pub size: u64,
    /// Transmission flags, a bitwise OR of the `FLAG_*` constants.
    pub flags: u16,
    /// Advertised block-size constraints. `None` advertises the defaults.
    pub block_sizes: Option<BlockSizeConstraints>,
    /// The backing device.
    pub device: Arc<dyn Device>,
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("block_sizes", &self.block_sizes)
            .finish_non_exhaustive()
    }
}

/// Block-size constraints advertised for an export.
///
/// Invariant: `1 <= min <= preferred <= max`. The server does not currently
/// enforce these against incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeConstraints {
    pub min: u32,
    pub preferred: u32,
    pub max: u32,
}

impl Default for BlockSizeConstraints {
    fn default() -> Self {
        DEFAULT_BLOCK_SIZES
    }
}

pub(crate) const DEFAULT_BLOCK_SIZES: BlockSizeConstraints = BlockSizeConstraints {
    min: 1,
    preferred: 4096,
    max: u32::MAX,
};

/// What the handshake settled on for one connection; consumed by the
/// transmission loop.
#[derive(Debug, Clone)]
pub(crate) struct ConnParameters {
    pub export: Export,
    pub block_sizes: BlockSizeConstraints,
}

/// An empty name selects the first export, otherwise a linear search by
/// name. Linear is fine: export lists are small.
pub(crate) fn find_export<'a>(name: &str, exports: &'a [Export]) -> Option<&'a Export> {
    if name.is_empty() {
        return exports.first();
    }
    exports.iter().find(|e| e.name == name)
}

/// Run the server handshake until a client selects an export (EXPORT_NAME
/// or GO) or the negotiation dies.
pub(crate) async fn server_handshake<S>(
    c: &mut Codec<S>,
    exports: &[Export],
) -> Result<ConnParameters, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    c.write_u64(NBD_MAGIC).await?;
    c.write_u64(OPT_MAGIC).await?;
    c.write_u16(FLAG_DEFAULTS).await?;

    let client_flags = c.read_u32().await?;
    if client_flags & !u32::from(FLAG_DEFAULTS) != 0 {
        return Err(ProtocolError::Negotiation(
            "unknown handshake flags from client".into(),
        ));
    }
    if client_flags != u32::from(FLAG_DEFAULTS) {
        return Err(ProtocolError::Negotiation(
            "refusing deprecated handshake flags".into(),
        ));
    }

    loop {
        let (code, outcome) = read_option(c).await?;
        debug!(option = code, "option received");
        let request = match outcome {
            OptionOutcome::Parsed(request) => request,
            OptionOutcome::Refuse(error) => {
                refuse(c, code, error).await?;
                continue;
            }
        };
        let done = matches!(request, OptionRequest::Go(_));
        match request {
            OptionRequest::ExportName(name) => {
                let Some(export) = find_export(&name, exports) else {
                    refuse(c, code, ReplyError::UNKNOWN).await?;
                    continue;
                };
                // Terminal: reply with size and flags, then straight into
                // transmission. No zero padding; NO_ZEROES is mandatory.
                c.write_u64(export.size).await?;
                c.write_u16(export.flags).await?;
                return Ok(ConnParameters {
                    export: export.clone(),
                    block_sizes: DEFAULT_BLOCK_SIZES,
                });
            }
            OptionRequest::Abort => {
                write_option_reply(c, code, &OptionReply::Ack).await?;
                return Err(ProtocolError::Aborted);
            }
            OptionRequest::List => {
                for export in exports {
                    let reply = OptionReply::Server {
                        name: export.name.clone(),
                        details: String::new(),
                    };
                    write_option_reply(c, code, &reply).await?;
                }
                write_option_reply(c, code, &OptionReply::Ack).await?;
            }
            OptionRequest::Info(req) | OptionRequest::Go(req) => {
                let Some(export) = find_export(&req.name, exports) else {
                    refuse(c, code, ReplyError::UNKNOWN).await?;
                    continue;
                };
                let mut block_sizes = DEFAULT_BLOCK_SIZES;

                // An EXPORT info reply always goes out, requested or not.
                let info = InfoReply::Export {
                    size: export.size,
                    flags: export.flags,
                };
                write_option_reply(c, code, &OptionReply::Info(info)).await?;

                for kind in &req.requests {
                    match *kind {
                        INFO_EXPORT => {} // already sent
                        INFO_NAME => {
                            let info = InfoReply::Name(export.name.clone());
                            write_option_reply(c, code, &OptionReply::Info(info)).await?;
                        }
                        INFO_DESCRIPTION => {
                            let info = InfoReply::Description(export.description.clone());
                            write_option_reply(c, code, &OptionReply::Info(info)).await?;
                        }
                        INFO_BLOCK_SIZE => {
                            let Some(sizes) = export.block_sizes else {
                                continue;
                            };
                            if done {
                                block_sizes = sizes;
                            }
                            let info = InfoReply::BlockSize(block_sizes);
                            write_option_reply(c, code, &OptionReply::Info(info)).await?;
                        }
                        _ => {}
                    }
                }
                write_option_reply(c, code, &OptionReply::Ack).await?;
                if done {
                    return Ok(ConnParameters {
                        export: export.clone(),
                        block_sizes,
                    });
                }
            }
            OptionRequest::Unknown { option, length } => {
                debug!(option, length, "unsupported option");
                refuse(c, code, ReplyError::UNSUP).await?;
            }
        }
    }
}

async fn refuse<S>(c: &mut Codec<S>, option: u32, code: ReplyError) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reply = OptionReply::Error {
        code,
        message: String::new(),
    };
    write_option_reply(c, option, &reply).await
}
