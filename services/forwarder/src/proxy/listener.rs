//! Listener lifecycle and the shared accept loop.
//!
//! An [`ActiveListener`] is bound to exactly one rule and is closed exactly
//! once: either through its [`ListenerCloser`] or when the accept loop that
//! owns it returns. Closing wakes a pending accept with
//! [`AcceptError::Closed`], which the accept loop treats as a clean exit.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use super::wait_for_shutdown;
use crate::error::{ForwardError, ProxyError};
use crate::net::{Accepted, BoxedListener};
use crate::overlay::Overlay;
use crate::rule::ForwardingRule;

/// Pause after a failed accept to avoid spinning on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept failures.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed. Not a failure.
    #[error("listener closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Closes an [`ActiveListener`] from outside its accept loop.
///
/// Dropping the closer also closes the listener.
#[derive(Debug)]
pub struct ListenerCloser {
    tx: watch::Sender<bool>,
}

impl ListenerCloser {
    pub fn close(&self) {
        let _ = self.tx.send(true);
    }
}

/// A live listener bound to one rule.
pub struct ActiveListener {
    inner: BoxedListener,
    local_addr: SocketAddr,
    closed: watch::Receiver<bool>,
}

impl ActiveListener {
    /// Wrap a bound listener.
    pub fn new(inner: BoxedListener) -> io::Result<(Self, ListenerCloser)> {
        let local_addr = inner.local_addr()?;
        let (tx, closed) = watch::channel(false);

        Ok((
            Self {
                inner,
                local_addr,
                closed,
            },
            ListenerCloser { tx },
        ))
    }

    /// Open the listener `rule` asks for on the overlay node.
    pub async fn open(
        overlay: &dyn Overlay,
        rule: &ForwardingRule,
    ) -> Result<(Self, ListenerCloser), ProxyError> {
        let listen_error = |source| ProxyError::Listen {
            transport: rule.transport(),
            port: rule.listen_port(),
            secure: rule.secure(),
            source,
        };

        let inner = if rule.secure() {
            overlay.listen_tls(rule.listen_port()).await
        } else {
            overlay.listen(rule.transport(), rule.listen_port()).await
        }
        .map_err(listen_error)?;

        Self::new(inner).map_err(listen_error)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection, or for the listener to close.
    pub async fn accept(&mut self) -> Result<Accepted, AcceptError> {
        if *self.closed.borrow() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut self.closed) => Err(AcceptError::Closed),
            accepted = self.inner.accept() => accepted.map_err(AcceptError::Io),
        }
    }
}

/// Per-connection behavior plugged into [`serve`].
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Handle one accepted connection. Runs on its own task.
    async fn handle(self: Arc<Self>, accepted: Accepted);
}

/// Accept connections until the listener closes, spawning `handler` per
/// connection.
///
/// Accept errors other than [`AcceptError::Closed`] are logged and the loop
/// keeps going. On return the listener socket is closed and every connection
/// task it spawned is aborted, releasing both sockets of each session. The
/// same happens if the task running `serve` is itself aborted.
pub async fn serve<H: ConnectionHandler>(mut listener: ActiveListener, handler: Arc<H>) {
    let local_addr = listener.local_addr();
    debug!(local_addr = %local_addr, "Accept loop started");

    let mut connections = JoinSet::new();

    loop {
        let result = listener.accept().await;
        while connections.try_join_next().is_some() {}

        match result {
            Ok(accepted) => {
                let peer = accepted.peer_addr();
                let handler = Arc::clone(&handler);
                connections.spawn(
                    handler
                        .handle(accepted)
                        .instrument(tracing::info_span!("connection", peer = %peer, listener = %local_addr)),
                );
            }
            Err(AcceptError::Closed) => {
                debug!(
                    local_addr = %local_addr,
                    connections = connections.len(),
                    "Listener closed"
                );
                break;
            }
            Err(AcceptError::Io(e)) => {
                let err = ForwardError::Accept(e);
                warn!(local_addr = %local_addr, error = %err, hint = err.hint(), "Accept error");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    drop(listener);
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}
