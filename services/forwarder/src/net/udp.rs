//! UDP as a stream transport.
//!
//! A UDP listener has no accept in the socket API, so [`UdpListener`]
//! demultiplexes datagrams by peer address: the first datagram from an unknown
//! peer yields a new [`UdpSession`], later datagrams are queued to it. Each
//! read returns one datagram and each write sends one, so datagram boundaries
//! survive a relay as long as the copy buffer fits a full datagram.
//!
//! Zero-length datagrams are dropped; a zero-byte read means the session ended.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Sleep};
use tracing::{debug, trace};

use super::{Accepted, NetListener};

/// Sessions without traffic for this long end.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest possible UDP payload.
const MAX_DATAGRAM: usize = 65_535;

/// Datagrams queued per session before new ones are dropped.
const SESSION_QUEUE: usize = 256;

/// UDP listener yielding one session per remote peer.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    sessions: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    idle_timeout: Duration,
    buf: Vec<u8>,
}

impl UdpListener {
    pub fn new(socket: UdpSocket, idle_timeout: Duration) -> Self {
        Self {
            socket: Arc::new(socket),
            sessions: HashMap::new(),
            idle_timeout,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub async fn bind(addr: SocketAddr, idle_timeout: Duration) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?, idle_timeout))
    }
}

#[async_trait]
impl NetListener for UdpListener {
    async fn accept(&mut self) -> io::Result<Accepted> {
        loop {
            let (n, peer) = self.socket.recv_from(&mut self.buf).await?;
            if n == 0 {
                continue;
            }

            let mut datagram = Bytes::copy_from_slice(&self.buf[..n]);

            if let Some(tx) = self.sessions.get(&peer) {
                match tx.try_send(datagram) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => {
                        trace!(peer = %peer, "UDP session queue full, dropping datagram");
                        continue;
                    }
                    Err(TrySendError::Closed(returned)) => datagram = returned,
                }
                // The previous session ended; this datagram opens a new one.
                self.sessions.remove(&peer);
            }

            self.sessions.retain(|_, tx| !tx.is_closed());

            let (tx, rx) = mpsc::channel(SESSION_QUEUE);
            let _ = tx.try_send(datagram);
            self.sessions.insert(peer, tx);

            debug!(peer = %peer, sessions = self.sessions.len(), "New UDP session");

            let session = UdpSession::new(Arc::clone(&self.socket), peer, rx, self.idle_timeout);
            return Ok(Accepted::ready(peer, Box::new(session)));
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// One peer's traffic on a shared UDP listener socket.
pub struct UdpSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    idle_timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl UdpSession {
    fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        rx: mpsc::Receiver<Bytes>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            socket,
            peer,
            rx,
            idle_timeout,
            idle: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }

    fn touch(&mut self) {
        let deadline = Instant::now() + self.idle_timeout;
        self.idle.as_mut().reset(deadline);
    }
}

impl AsyncRead for UdpSession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                // Oversized datagrams are truncated, as with recv(2).
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);
                this.touch();
                Poll::Ready(Ok(()))
            }
            // Listener gone.
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => match this.idle.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    debug!(peer = %this.peer, "UDP session idle, closing");
                    Poll::Ready(Ok(()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = this.socket.poll_send_to(cx, buf, this.peer);
        if let Poll::Ready(Ok(_)) = result {
            this.touch();
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connected outbound UDP socket.
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    /// Resolve `addr` and connect a fresh socket of the matching family.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let target = lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {}", addr),
            )
        })?;

        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;

        Ok(Self { socket })
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let before = buf.filled().len();
            match this.socket.poll_recv(cx, buf) {
                Poll::Ready(Ok(())) if buf.filled().len() == before => continue,
                other => return other,
            }
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
