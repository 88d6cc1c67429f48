//! Network primitives shared by the overlay node and the forwarders.
//!
//! Every listener, TCP, TLS or UDP, yields boxed byte streams, so the
//! forwarders never care which transport they are relaying.

mod tls;
mod udp;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::rule::Transport;

pub use tls::{TlsMaterial, TlsNetListener, TLS_CERT_FILE, TLS_KEY_FILE};
pub use udp::{UdpListener, UdpSession, UdpStream, DEFAULT_UDP_IDLE_TIMEOUT};

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedConnection = Box<dyn Connection>;

type Handshake = Pin<Box<dyn Future<Output = io::Result<BoxedConnection>> + Send>>;

/// A connection returned by a listener.
///
/// Some transports (TLS) still need a handshake after accept. The handshake
/// runs in [`Accepted::establish`], on the connection's own task, so a slow
/// client never stalls the accept loop.
pub struct Accepted {
    peer: SocketAddr,
    handshake: Handshake,
}

impl Accepted {
    /// A connection that is usable right away.
    pub fn ready(peer: SocketAddr, conn: BoxedConnection) -> Self {
        Self {
            peer,
            handshake: Box::pin(async move { Ok(conn) }),
        }
    }

    /// A connection that becomes usable once `handshake` completes.
    pub fn pending<F>(peer: SocketAddr, handshake: F) -> Self
    where
        F: Future<Output = io::Result<BoxedConnection>> + Send + 'static,
    {
        Self {
            peer,
            handshake: Box::pin(handshake),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Complete any pending handshake.
    pub async fn establish(self) -> io::Result<BoxedConnection> {
        self.handshake.await
    }
}

/// A listener yielding [`Accepted`] connections.
#[async_trait]
pub trait NetListener: Send {
    async fn accept(&mut self) -> io::Result<Accepted>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub type BoxedListener = Box<dyn NetListener>;

/// Plain TCP listener.
pub struct TcpNetListener {
    inner: TcpListener,
}

impl TcpNetListener {
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }

    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }
}

#[async_trait]
impl NetListener for TcpNetListener {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        Ok(Accepted::ready(peer, Box::new(stream)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Dial `addr` over the general network.
pub async fn dial(transport: Transport, addr: &str) -> io::Result<BoxedConnection> {
    match transport {
        Transport::Tcp => {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
        Transport::Udp => Ok(Box::new(UdpStream::connect(addr).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_listener_accepts_ready_connections() {
        let mut listener = TcpNetListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer_addr().ip(), addr.ip());

        let mut conn = accepted.establish().await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(dial(Transport::Tcp, &addr.to_string()).await.is_err());
    }
}
