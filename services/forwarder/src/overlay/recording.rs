//! Overlay double that records what the engine asks of it.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{NodeStatus, Overlay};
use crate::net::{BoxedConnection, BoxedListener};
use crate::rule::Transport;

/// Answers dials with an in-memory stream and counts HTTP client requests.
/// Listening is not supported.
#[derive(Default)]
pub(crate) struct RecordingOverlay {
    dials: Mutex<Vec<(Transport, String)>>,
    http_clients: AtomicUsize,
}

impl RecordingOverlay {
    /// Addresses dialed so far, in order.
    pub(crate) fn dials(&self) -> Vec<(Transport, String)> {
        self.dials.lock().unwrap().clone()
    }

    /// How many times the overlay HTTP client was handed out.
    pub(crate) fn http_clients(&self) -> usize {
        self.http_clients.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Overlay for RecordingOverlay {
    async fn bring_up(&self) -> io::Result<NodeStatus> {
        Ok(NodeStatus {
            dns_name: "recording.test.".to_string(),
            addresses: vec![],
        })
    }

    async fn listen(&self, _transport: Transport, _port: u16) -> io::Result<BoxedListener> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    async fn listen_tls(&self, _port: u16) -> io::Result<BoxedListener> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    async fn dial(&self, transport: Transport, addr: &str) -> io::Result<BoxedConnection> {
        self.dials.lock().unwrap().push((transport, addr.to_string()));
        let (conn, _peer) = tokio::io::duplex(64);
        Ok(Box::new(conn))
    }

    fn http_client(&self) -> reqwest::Client {
        self.http_clients.fetch_add(1, Ordering::SeqCst);
        reqwest::Client::new()
    }

    async fn shutdown(&self) {}
}
