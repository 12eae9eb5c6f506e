//! The server engine: accept loop, per-connection sessions, and the
//! transmission loop.
//!
//! [`listen_and_serve`] accepts connections and runs each one as its own
//! task; [`serve`] drives a single connection through handshake and
//! transmission. Cancelling the token passed to either unblocks any
//! in-flight I/O and tears the session down.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::codec::Codec;
use crate::error::Error;
use crate::handshake::{server_handshake, ConnParameters, Export};
use crate::protocol::{
    DecodedRequest, Errno, ProtocolError, Request, SimpleReply, CMD_DISC, CMD_FLUSH, CMD_READ,
    CMD_WRITE, FLAG_READ_ONLY,
};

/// A source of incoming connections.
///
/// Implemented for [`TcpListener`], [`UnixListener`], and the channel-fed
/// [`StreamListener`] used in tests.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept the next incoming connection.
    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        UnixListener::accept(self).await.map(|(stream, _)| stream)
    }
}

/// A listener fed from a channel, for wiring in-memory duplex streams to the
/// accept loop in tests and benchmarks.
pub struct StreamListener<S> {
    rx: mpsc::Receiver<S>,
}

impl<S> StreamListener<S> {
    /// Returns the sending half for pushing streams and the listener itself.
    /// The listener reports `BrokenPipe` once every sender is dropped.
    pub fn new(buffer: usize) -> (mpsc::Sender<S>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl<S> Listener for StreamListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Stream = S;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream channel closed"))
    }
}

/// Accept connections from `listener` and serve `exports` on each, the
/// first export acting as the default.
///
/// Every connection runs as its own task; connection failures are logged,
/// not propagated. Returns `Ok` once `shutdown` is cancelled or `Err` when
/// the listener fails — in both cases only after every outstanding
/// connection task has finished.
pub async fn listen_and_serve<L>(
    shutdown: CancellationToken,
    mut listener: L,
    exports: Vec<Export>,
) -> Result<(), Error>
where
    L: Listener,
{
    let exports = Arc::new(exports);
    let mut sessions = JoinSet::new();
    info!(exports = exports.len(), "accepting connections");

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(stream) => {
                    let exports = Arc::clone(&exports);
                    let token = shutdown.child_token();
                    sessions.spawn(async move {
                        match serve(token, stream, &exports).await {
                            Ok(()) => debug!("connection finished"),
                            Err(Error::Protocol(ProtocolError::Cancelled)) => {
                                debug!("connection cancelled")
                            }
                            Err(error) => warn!(%error, "connection failed"),
                        }
                        // The stream drops (and closes) here, after the
                        // session is done with it.
                    });
                }
                Err(error) => {
                    warn!(%error, "listener failed");
                    break Err(error.into());
                }
            },
        }
    };

    while sessions.join_next().await.is_some() {}
    result
}

/// Serve one connection: handshake, then the transmission loop.
///
/// Cancelling `shutdown` interrupts any in-flight read or write; the
/// session then fails with [`ProtocolError::Cancelled`].
pub async fn serve<S>(
    shutdown: CancellationToken,
    stream: S,
    exports: &[Export],
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = Codec::new(CancelStream::new(stream, shutdown.clone()));
    let result = async {
        let params = server_handshake(&mut codec, exports).await?;
        debug!(export = %params.export.name, "entering transmission");
        transmission_loop(&mut codec, &params).await
    }
    .await;

    match result {
        Err(_) if shutdown.is_cancelled() => Err(ProtocolError::Cancelled.into()),
        other => other.map_err(Error::from),
    }
}

/// Decode requests and answer them one at a time until the client
/// disconnects or the session dies.
///
/// Malformed-but-framed requests (bad offset, oversized payload, zero
/// lengths) are answered with an errno and the loop continues; only framing
/// errors are terminal. Replies go out in request order.
pub(crate) async fn transmission_loop<S>(
    c: &mut Codec<S>,
    params: &ConnParameters,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let export = &params.export;
    let read_only = export.flags & FLAG_READ_ONLY != 0;

    loop {
        let request = match Request::decode(c).await? {
            DecodedRequest::Valid(request) => request,
            DecodedRequest::Invalid { handle, errno } => {
                SimpleReply::error(handle, errno).encode(c).await?;
                continue;
            }
        };

        match request.kind {
            CMD_READ => {
                if request.length == 0 {
                    SimpleReply::error(request.handle, Errno::EINVAL)
                        .encode(c)
                        .await?;
                    continue;
                }
                let mut buf = BytesMut::with_capacity(request.length as usize);
                buf.resize(request.length as usize, 0);
                match export.device.read_at(&mut buf, request.offset).await {
                    Ok(_) => {
                        SimpleReply::ok(request.handle, buf.freeze())
                            .encode(c)
                            .await?;
                    }
                    Err(error) => {
                        warn!(%error, offset = request.offset, "read failed");
                        SimpleReply::error(request.handle, error.errno())
                            .encode(c)
                            .await?;
                    }
                }
            }
            CMD_WRITE => {
                if request.length == 0 {
                    SimpleReply::error(request.handle, Errno::EINVAL)
                        .encode(c)
                        .await?;
                    continue;
                }
                if read_only {
                    SimpleReply::error(request.handle, Errno::EPERM)
                        .encode(c)
                        .await?;
                    continue;
                }
                match export.device.write_at(&request.data, request.offset).await {
                    Ok(_) => SimpleReply::ok(request.handle, Default::default())
                        .encode(c)
                        .await?,
                    Err(error) => {
                        warn!(%error, offset = request.offset, "write failed");
                        SimpleReply::error(request.handle, error.errno())
                            .encode(c)
                            .await?;
                    }
                }
            }
            CMD_DISC => return Ok(()),
            CMD_FLUSH => {
                if request.length != 0 || request.offset != 0 {
                    SimpleReply::error(request.handle, Errno::EINVAL)
                        .encode(c)
                        .await?;
                    continue;
                }
                match export.device.sync().await {
                    Ok(()) => SimpleReply::ok(request.handle, Default::default())
                        .encode(c)
                        .await?,
                    Err(error) => {
                        warn!(%error, "flush failed");
                        SimpleReply::error(request.handle, error.errno())
                            .encode(c)
                            .await?;
                    }
                }
            }
            _ => {
                SimpleReply::error(request.handle, Errno::EINVAL)
                    .encode(c)
                    .await?;
            }
        }
    }
}

/// Wraps a stream so that cancelling a token fails any in-progress or
/// future read/write.
///
/// Every poll first polls the cancellation future; once the token fires the
/// pending I/O wakes and observes a cancellation error. The wrapper never
/// closes the inner stream — its owner does that after the session returns.
pub(crate) struct CancelStream<S> {
    inner: S,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> CancelStream<S> {
    pub fn new(inner: S, token: CancellationToken) -> Self {
        Self {
            inner,
            cancelled: Box::pin(token.cancelled_owned()),
        }
    }

    fn check_cancelled(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "i/o aborted by shutdown",
            ));
        }
        Ok(())
    }
}

impl<S> AsyncRead for CancelStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(e) = this.check_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for CancelStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Err(e) = this.check_cancelled(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::device::{Device, DeviceError, MemDevice};
    use crate::protocol::{FLAG_HAS_FLAGS, FLAG_SEND_FLUSH};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pattern_device(size: usize) -> Arc<MemDevice> {
        let data = (0..size).map(|i| (i % 256) as u8).collect();
        Arc::new(MemDevice::from_vec(data))
    }

    fn export(name: &str, device: Arc<dyn Device>, size: u64, flags: u16) -> Export {
        Export {
            name: name.to_string(),
            description: format!("{name} test export"),
            size,
            flags,
            block_sizes: None,
            device,
        }
    }

    /// Spawn `serve` over one end of a duplex pipe, returning the client end.
    fn spawn_server(exports: Vec<Export>) -> (DuplexStream, CancellationToken) {
        let (client_end, server_end) = duplex(1 << 20);
        let token = CancellationToken::new();
        let serve_token = token.clone();
        tokio::spawn(async move {
            let _ = serve(serve_token, server_end, &exports).await;
        });
        (client_end, token)
    }

    #[tokio::test]
    async fn list_returns_exports_in_order() {
        let dev = pattern_device(1024);
        let exports = vec![
            export("a", dev.clone(), 1024, 1),
            export("b", dev, 1024, 1),
        ];
        let (stream, _token) = spawn_server(exports);

        let mut client = Client::handshake(stream).await.unwrap();
        assert_eq!(client.list().await.unwrap(), ["a", "b"]);
    }

    #[tokio::test]
    async fn go_with_empty_name_selects_default() {
        let exports = vec![export("a", pattern_device(1024), 1024, 1)];
        let (stream, _token) = spawn_server(exports);

        let client = Client::handshake(stream).await.unwrap();
        let (info, _tx) = client.go("").await.unwrap();
        assert_eq!(info.name, "a");
        assert_eq!(info.size, 1024);
        assert_eq!(info.flags, 1);
    }

    #[tokio::test]
    async fn go_unknown_export_is_refused() {
        let exports = vec![export("a", pattern_device(1024), 1024, 1)];
        let (stream, _token) = spawn_server(exports);

        let client = Client::handshake(stream).await.unwrap();
        match client.go("nope").await {
            Err(ProtocolError::OptionRefused { code, .. }) => {
                assert_eq!(code, crate::protocol::ReplyError::UNKNOWN);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn info_reports_description_and_defaults() {
        let mut exp = export("a", pattern_device(1024), 1024, 1);
        exp.block_sizes = Some(crate::BlockSizeConstraints {
            min: 512,
            preferred: 4096,
            max: 1 << 20,
        });
        let (stream, _token) = spawn_server(vec![exp]);

        let mut client = Client::handshake(stream).await.unwrap();
        let info = client.info("a").await.unwrap();
        assert_eq!(info.name, "a");
        assert_eq!(info.description, "a test export");
        // INFO (as opposed to GO) reports the default constraints.
        assert_eq!(info.block_sizes.unwrap(), crate::BlockSizeConstraints::default());

        // The client is still usable for another option afterwards.
        assert_eq!(client.list().await.unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn abort_is_acknowledged() {
        let exports = vec![export("a", pattern_device(1024), 1024, 1)];
        let (stream, _token) = spawn_server(exports);

        let client = Client::handshake(stream).await.unwrap();
        client.abort().await.unwrap();
    }

    #[tokio::test]
    async fn read_returns_device_bytes() {
        let exports = vec![export("a", pattern_device(1024), 1024, FLAG_HAS_FLAGS)];
        let (stream, _token) = spawn_server(exports);

        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        let data = tx.read(0, 512).await.unwrap();
        let expected: Vec<u8> = (0..512).map(|i| (i % 256) as u8).collect();
        assert_eq!(&data[..], &expected[..]);
    }

    #[tokio::test]
    async fn write_flush_read_roundtrip() {
        let exports = vec![export(
            "a",
            Arc::new(MemDevice::new(1024)),
            1024,
            FLAG_HAS_FLAGS | FLAG_SEND_FLUSH,
        )];
        let (stream, _token) = spawn_server(exports);

        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        tx.write(10, Bytes::from_static(b"\x01\x02\x03\x04"))
            .await
            .unwrap();
        tx.flush().await.unwrap();
        let data = tx.read(10, 4).await.unwrap();
        assert_eq!(&data[..], b"\x01\x02\x03\x04");

        tx.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn flush_with_nonzero_offset_is_einval() {
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, tx) = client.go("a").await.unwrap();
        let mut codec = Codec::new(tx.into_inner());

        Request {
            flags: 0,
            kind: CMD_FLUSH,
            handle: 3,
            offset: 8,
            length: 0,
            data: Bytes::new(),
        }
        .encode(&mut codec)
        .await
        .unwrap();

        let (errno, handle) = SimpleReply::decode_header(&mut codec).await.unwrap();
        assert_eq!(errno, Errno::EINVAL.0);
        assert_eq!(handle, 3);
    }

    #[tokio::test]
    async fn zero_length_read_is_einval() {
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        match tx.read(0, 0).await {
            Err(ProtocolError::Command(errno)) => assert_eq!(errno, Errno::EINVAL),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn offset_high_bit_is_eoverflow() {
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        match tx.read(1 << 63, 16).await {
            Err(ProtocolError::Command(errno)) => assert_eq!(errno, Errno::EOVERFLOW),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        // The session survives a per-request failure.
        assert_eq!(tx.read(0, 1).await.unwrap()[..], [0]);
    }

    #[tokio::test]
    async fn unknown_command_is_einval() {
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, tx) = client.go("a").await.unwrap();
        let mut codec = Codec::new(tx.into_inner());

        Request {
            flags: 0,
            kind: 77,
            handle: 5,
            offset: 0,
            length: 0,
            data: Bytes::new(),
        }
        .encode(&mut codec)
        .await
        .unwrap();

        let (errno, handle) = SimpleReply::decode_header(&mut codec).await.unwrap();
        assert_eq!(errno, Errno::EINVAL.0);
        assert_eq!(handle, 5);
    }

    #[tokio::test]
    async fn read_only_export_refuses_writes() {
        let exports = vec![export(
            "a",
            Arc::new(MemDevice::new(64)),
            64,
            FLAG_HAS_FLAGS | FLAG_READ_ONLY,
        )];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        match tx.write(0, Bytes::from_static(b"x")).await {
            Err(ProtocolError::Command(errno)) => assert_eq!(errno, Errno::EPERM),
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// A device whose errors carry specific errnos.
    struct FailingDevice(Errno);

    #[async_trait]
    impl Device for FailingDevice {
        async fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize, DeviceError> {
            Err(DeviceError::new(self.0, "injected failure"))
        }

        async fn write_at(&self, _buf: &[u8], _offset: u64) -> Result<usize, DeviceError> {
            Err(DeviceError::new(self.0, "injected failure"))
        }

        async fn sync(&self) -> Result<(), DeviceError> {
            Err(io::Error::other("sync blew up").into())
        }
    }

    #[tokio::test]
    async fn device_errnos_pass_through_and_plain_errors_are_eio() {
        let exports = vec![export(
            "a",
            Arc::new(FailingDevice(Errno::ENOSPC)),
            64,
            FLAG_HAS_FLAGS | FLAG_SEND_FLUSH,
        )];
        let (stream, _token) = spawn_server(exports);
        let client = Client::handshake(stream).await.unwrap();
        let (_, mut tx) = client.go("a").await.unwrap();

        match tx.write(0, Bytes::from_static(b"x")).await {
            Err(ProtocolError::Command(errno)) => assert_eq!(errno, Errno::ENOSPC),
            other => panic!("unexpected: {other:?}"),
        }
        // sync() fails with a plain io::Error, which maps to EIO.
        match tx.flush().await {
            Err(ProtocolError::Command(errno)) => assert_eq!(errno, Errno::EIO),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn listen_and_serve_stops_on_cancel_with_idle_connection() {
        let (tx, listener) = StreamListener::new(4);
        let token = CancellationToken::new();
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];

        let server = tokio::spawn(listen_and_serve(token.clone(), listener, exports));

        // Connect and complete a handshake so a connection task is live,
        // then leave it idle.
        let (client_end, server_end) = duplex(1 << 16);
        tx.send(server_end).await.unwrap();
        let client = Client::handshake(client_end).await.unwrap();
        let (_, mut conn) = client.go("a").await.unwrap();
        assert_eq!(conn.read(0, 1).await.unwrap()[..], [0]);

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("listen_and_serve did not stop after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn listener_failure_stops_accepting() {
        let (tx, listener) = StreamListener::<DuplexStream>::new(1);
        let token = CancellationToken::new();
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];

        let server = tokio::spawn(listen_and_serve(token, listener, exports));
        drop(tx); // every sender gone: accept reports BrokenPipe

        let result = tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("listen_and_serve did not stop on listener failure")
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn one_bad_connection_does_not_stop_the_server() {
        let (tx, listener) = StreamListener::new(4);
        let token = CancellationToken::new();
        let exports = vec![export("a", pattern_device(64), 64, FLAG_HAS_FLAGS)];
        tokio::spawn(listen_and_serve(token.clone(), listener, exports));

        // First connection sends garbage instead of client flags.
        let (mut bad, server_end) = duplex(1 << 16);
        tx.send(server_end).await.unwrap();
        let mut greeting = [0u8; 18];
        bad.read_exact(&mut greeting).await.unwrap();
        bad.write_all(&0xffff_ffffu32.to_be_bytes()).await.unwrap();
        drop(bad);

        // A later connection still negotiates fine.
        let (client_end, server_end) = duplex(1 << 16);
        tx.send(server_end).await.unwrap();
        let mut client = Client::handshake(client_end).await.unwrap();
        assert_eq!(client.list().await.unwrap(), ["a"]);

        token.cancel();
    }

    #[tokio::test]
    async fn cancel_stream_unblocks_pending_read() {
        let (_hold_open, stream) = duplex(64);
        let token = CancellationToken::new();
        let mut wrapped = CancelStream::new(stream, token.clone());

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            wrapped.read_exact(&mut buf).await
        });
        tokio::task::yield_now().await;
        token.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("read did not unblock on cancellation")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
