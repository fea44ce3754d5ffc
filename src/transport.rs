//! Transport primitives: duplex byte streams, listeners and dialers.
//!
//! The connection engine only ever sees a [`BoxedStream`]; where the bytes
//! come from (a TCP socket, a unix socket, an in-memory pipe, a stdio
//! pair) is decided here.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A bidirectional byte stream.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// The stream type handed to connections.
pub type BoxedStream = Box<dyn Duplex>;

/// Accepts inbound connections for a server.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Block until an inbound connection arrives or the listener shuts
    /// down; after [`close`](Listener::close) it fails with a closing
    /// error.
    async fn accept(&self) -> Result<BoxedStream, Error>;

    /// Stop accepting new connections. Idempotent; streams already
    /// accepted are unaffected.
    async fn close(&self) -> Result<(), Error>;

    /// A dialer that connects to this listener from the same process, if
    /// the transport supports one.
    fn dialer(&self) -> Option<Box<dyn Dialer>>;
}

/// Opens a new byte stream to a listening server.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Return a new communication byte stream to the server.
    async fn dial(&self) -> Result<BoxedStream, Error>;
}

enum NetSocket {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, std::path::PathBuf),
}

enum NetTarget {
    Tcp(std::net::SocketAddr),
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

/// A listener over an operating-system socket.
pub struct NetListener {
    socket: NetSocket,
    closed: CancellationToken,
}

impl NetListener {
    /// Listen on a TCP address.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs) -> Result<Self, Error> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            socket: NetSocket::Tcp(listener),
            closed: CancellationToken::new(),
        })
    }

    /// Listen on a unix domain socket. The socket file is removed again
    /// when the listener is closed.
    #[cfg(unix)]
    pub fn bind_unix(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Self {
            socket: NetSocket::Unix(listener, path),
            closed: CancellationToken::new(),
        })
    }

    async fn accept_stream(&self) -> Result<BoxedStream, Error> {
        match &self.socket {
            NetSocket::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            NetSocket::Unix(listener, _) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    fn target(&self) -> Result<NetTarget, Error> {
        match &self.socket {
            NetSocket::Tcp(listener) => Ok(NetTarget::Tcp(listener.local_addr()?)),
            #[cfg(unix)]
            NetSocket::Unix(_, path) => Ok(NetTarget::Unix(path.clone())),
        }
    }
}

#[async_trait]
impl Listener for NetListener {
    async fn accept(&self) -> Result<BoxedStream, Error> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Closed),
            stream = self.accept_stream() => stream,
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        #[cfg(unix)]
        if let NetSocket::Unix(_, path) = &self.socket {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn dialer(&self) -> Option<Box<dyn Dialer>> {
        self.target().ok().map(|target| {
            Box::new(NetDialer { target }) as Box<dyn Dialer>
        })
    }
}

/// Dials the address a [`NetListener`] is bound to.
pub struct NetDialer {
    target: NetTarget,
}

impl NetDialer {
    /// Dial a TCP address.
    pub fn tcp(addr: std::net::SocketAddr) -> Self {
        Self {
            target: NetTarget::Tcp(addr),
        }
    }

    /// Dial a unix domain socket.
    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            target: NetTarget::Unix(path.into()),
        }
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self) -> Result<BoxedStream, Error> {
        match &self.target {
            NetTarget::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr).await?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            NetTarget::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// An in-memory listener. Every dial produces a fresh paired stream, the
/// other half of which is delivered to the next [`accept`](Listener::accept).
pub struct PipeListener {
    dialed_tx: mpsc::UnboundedSender<BoxedStream>,
    dialed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
    closed: CancellationToken,
}

impl PipeListener {
    pub fn new() -> Self {
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        Self {
            dialed_tx,
            dialed_rx: tokio::sync::Mutex::new(dialed_rx),
            closed: CancellationToken::new(),
        }
    }
}

impl Default for PipeListener {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Listener for PipeListener {
    async fn accept(&self) -> Result<BoxedStream, Error> {
        let mut dialed = self.dialed_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Closed),
            stream = dialed.recv() => stream.ok_or(Error::Closed),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        Ok(())
    }

    fn dialer(&self) -> Option<Box<dyn Dialer>> {
        Some(Box::new(PipeDialer {
            dialed_tx: self.dialed_tx.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct PipeDialer {
    dialed_tx: mpsc::UnboundedSender<BoxedStream>,
    closed: CancellationToken,
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self) -> Result<BoxedStream, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        self.dialed_tx
            .send(Box::new(theirs))
            .map_err(|_| Error::Closed)?;
        Ok(Box::new(ours))
    }
}

/// Adapts an arbitrary reader/writer pair into one single-use duplex
/// stream, for transports that hand the directions out separately
/// (process pipes, stdio).
pub struct StreamPair<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> StreamPair<R, W>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// The pair as a [`BoxedStream`].
    pub fn boxed(reader: R, writer: W) -> BoxedStream {
        Box::new(Self::new(reader, writer))
    }
}

impl<R: AsyncRead + Unpin, W: Unpin> AsyncRead for StreamPair<R, W> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl<R: Unpin, W: AsyncWrite + Unpin> AsyncWrite for StreamPair<R, W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}

/// The current process's stdin and stdout as one duplex stream, for
/// peers spoken to over a parent process's pipes.
pub fn stdio() -> BoxedStream {
    StreamPair::boxed(tokio::io::stdin(), tokio::io::stdout())
}

/// Wraps a listener with an inactivity bound.
///
/// When no accepted connection has been alive for `timeout`, the wrapped
/// listener is closed and pending and future accepts fail with
/// [`Error::IdleTimeout`].
pub struct IdleListener {
    inner: Arc<dyn Listener>,
    conns_tx: mpsc::UnboundedSender<CancellationToken>,
    closed: CancellationToken,
    timed_out: Arc<AtomicBool>,
}

impl IdleListener {
    pub fn new(timeout: Duration, inner: Arc<dyn Listener>) -> Self {
        let (conns_tx, conns_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let timed_out = Arc::new(AtomicBool::new(false));
        tokio::spawn(idle_tracker(
            inner.clone(),
            conns_rx,
            closed.clone(),
            timed_out.clone(),
            timeout,
        ));
        Self {
            inner,
            conns_tx,
            closed,
            timed_out,
        }
    }
}

#[async_trait]
impl Listener for IdleListener {
    async fn accept(&self) -> Result<BoxedStream, Error> {
        match self.inner.accept().await {
            Ok(stream) => {
                let conn_closed = CancellationToken::new();
                let _ = self.conns_tx.send(conn_closed.clone());
                Ok(Box::new(IdleStream {
                    inner: stream,
                    closed: conn_closed,
                }))
            }
            Err(e) if e.is_closing() => {
                self.closed.cancel();
                if self.timed_out.load(Ordering::SeqCst) {
                    Err(Error::IdleTimeout)
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.closed.cancel();
        self.inner.close().await
    }

    fn dialer(&self) -> Option<Box<dyn Dialer>> {
        self.inner.dialer()
    }
}

/// Tracks the active accepted connections; arms the timeout only while
/// the set is empty.
async fn idle_tracker(
    inner: Arc<dyn Listener>,
    mut conns_rx: mpsc::UnboundedReceiver<CancellationToken>,
    closed: CancellationToken,
    timed_out: Arc<AtomicBool>,
    timeout: Duration,
) {
    let mut conns: Vec<CancellationToken> = Vec::new();
    loop {
        conns.retain(|conn| !conn.is_cancelled());
        if conns.is_empty() {
            tokio::select! {
                _ = closed.cancelled() => return,
                conn = conns_rx.recv() => match conn {
                    Some(conn) => conns.push(conn),
                    None => return,
                },
                _ = tokio::time::sleep(timeout) => {
                    log::debug!("idle timeout, closing listener");
                    timed_out.store(true, Ordering::SeqCst);
                    let _ = inner.close().await;
                    return;
                }
            }
        } else {
            let first = conns[0].clone();
            tokio::select! {
                _ = closed.cancelled() => return,
                conn = conns_rx.recv() => match conn {
                    Some(conn) => conns.push(conn),
                    None => return,
                },
                _ = first.cancelled() => {
                    conns.remove(0);
                }
            }
        }
    }
}

/// An accepted stream that reports its closure back to the idle tracker,
/// either through a read failure/EOF or by being dropped.
struct IdleStream {
    inner: BoxedStream,
    closed: CancellationToken,
}

impl Drop for IdleStream {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl AsyncRead for IdleStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                this.closed.cancel();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.closed.cancel();
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }
}

impl AsyncWrite for IdleStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        // write failures are left for the next read to notice
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
