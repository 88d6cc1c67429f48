//! Raw socket forwarding.
//!
//! Every accepted connection gets its own outbound connection to the rule's
//! target and a [`RelaySession`] copying bytes both ways until either side
//! finishes or shutdown is signalled.

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::listener::{serve, ActiveListener, ConnectionHandler};
use super::wait_for_shutdown;
use crate::error::ForwardError;
use crate::net::{self, Accepted, BoxedConnection};
use crate::overlay::Overlay;
use crate::rule::ForwardingRule;

/// Copy buffer size. Large enough for any UDP datagram, so datagram
/// boundaries survive the relay.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Relay direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to target.
    ToTarget,
    /// Target to client.
    FromTarget,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ToTarget => f.write_str("to_target"),
            Direction::FromTarget => f.write_str("from_target"),
        }
    }
}

/// How a relay session ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// One direction reached end of stream.
    Finished { direction: Direction, bytes: u64 },
    /// One direction failed.
    Failed {
        direction: Direction,
        error: io::Error,
    },
    /// A copy task panicked or was aborted.
    Aborted,
    /// Shutdown was signalled mid-transfer.
    Cancelled,
}

/// Copy `reader` into `writer` until end of stream, then shut the writer down.
///
/// Returns the number of bytes copied.
pub async fn copy_stream<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await?;
                total += n as u64;
            }
            Err(e) => return Err(e),
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

/// A pair of copy tasks relaying between two connections.
///
/// Both connections are owned by the copy tasks and are dropped, closing
/// them, when the session ends.
pub struct RelaySession {
    tasks: JoinSet<(Direction, io::Result<u64>)>,
}

impl RelaySession {
    /// Spawn the copy tasks.
    pub fn start<A, B>(inbound: A, outbound: B) -> Self
    where
        A: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (inbound_read, inbound_write) = tokio::io::split(inbound);
        let (outbound_read, outbound_write) = tokio::io::split(outbound);

        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            (
                Direction::ToTarget,
                copy_stream(inbound_read, outbound_write).await,
            )
        });
        tasks.spawn(async move {
            (
                Direction::FromTarget,
                copy_stream(outbound_read, inbound_write).await,
            )
        });

        Self { tasks }
    }

    /// Wait until either direction ends or shutdown fires, then tear down
    /// the other direction without draining it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RelayOutcome {
        let outcome = tokio::select! {
            joined = self.tasks.join_next() => match joined {
                Some(Ok((direction, Ok(bytes)))) => RelayOutcome::Finished { direction, bytes },
                Some(Ok((direction, Err(error)))) => RelayOutcome::Failed { direction, error },
                Some(Err(_)) | None => RelayOutcome::Aborted,
            },
            _ = wait_for_shutdown(&mut shutdown) => RelayOutcome::Cancelled,
        };

        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        outcome
    }
}

/// Forwarder relaying raw sockets to a `host:port` target.
pub struct SocketForwarder {
    rule: Arc<ForwardingRule>,
    target_addr: String,
    overlay: Arc<dyn Overlay>,
    shutdown: watch::Receiver<bool>,
}

impl SocketForwarder {
    pub fn new(
        rule: Arc<ForwardingRule>,
        overlay: Arc<dyn Overlay>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let target_addr = rule.target().to_string();
        Self {
            rule,
            target_addr,
            overlay,
            shutdown,
        }
    }

    /// Accept and relay connections until the listener closes.
    pub async fn run(self, listener: ActiveListener) {
        info!(
            rule = %self.rule,
            local_addr = %listener.local_addr(),
            "Socket forwarder started"
        );
        serve(listener, Arc::new(self)).await;
    }

    async fn dial_target(&self) -> Result<BoxedConnection, ForwardError> {
        let transport = self.rule.transport();
        let result = if self.rule.target().is_overlay() {
            self.overlay.dial(transport, &self.target_addr).await
        } else {
            net::dial(transport, &self.target_addr).await
        };

        result.map_err(|source| ForwardError::Dial {
            target: self.target_addr.clone(),
            source,
        })
    }
}

#[async_trait]
impl ConnectionHandler for SocketForwarder {
    async fn handle(self: Arc<Self>, accepted: Accepted) {
        let inbound = match accepted.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                let err = ForwardError::Handshake(e);
                warn!(error = %err, hint = err.hint(), "Connection setup failed");
                return;
            }
        };

        debug!(target_addr = %self.target_addr, "New connection");

        // The inbound connection is dropped, and closed, on dial failure.
        let outbound = match self.dial_target().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, hint = err.hint(), "Failed to connect to target");
                return;
            }
        };

        match RelaySession::start(inbound, outbound)
            .run(self.shutdown.clone())
            .await
        {
            RelayOutcome::Finished { direction, bytes } => {
                debug!(direction = %direction, bytes, "Connection closed");
            }
            RelayOutcome::Failed { direction, error } => {
                let err = ForwardError::Relay(error);
                debug!(direction = %direction, error = %err, hint = err.hint(), "Connection closed with error");
            }
            RelayOutcome::Aborted => debug!("Connection closed, relay task aborted"),
            RelayOutcome::Cancelled => debug!("Connection closed by shutdown"),
        }
    }
}
