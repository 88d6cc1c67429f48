//! Listener-and-forwarding engine.
//!
//! This module provides:
//! - Listener lifecycle (open, accept, close)
//! - Raw socket relaying for `host:port` targets
//! - HTTP reverse proxying for `http(s)://` targets
//! - Supervision of one forwarder per rule with coordinated shutdown
//!
//! ## Architecture
//!
//! ```text
//! Client -> ActiveListener -> SocketForwarder -> dial (overlay | general) -> Target
//!                          \-> HttpForwarder  -> HTTP client (overlay | standard) -> Target
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let supervisor = ListenerSupervisor::new(overlay, rules);
//! let running = supervisor.start(shutdown_rx).await?;
//! tokio::spawn(running.wait());
//! // later
//! shutdown_tx.send(true)?;
//! ```

mod http;
mod listener;
mod socket;
mod supervisor;

use tokio::sync::watch;

pub use http::{standard_http_client, HttpForwarder};
pub use listener::{serve, AcceptError, ActiveListener, ConnectionHandler, ListenerCloser};
pub use socket::{copy_stream, Direction, RelayOutcome, RelaySession, SocketForwarder};
pub use supervisor::{BoundListener, ListenerSupervisor, RunningSupervisor};

/// Resolve once the shutdown flag is set or its sender is gone.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
