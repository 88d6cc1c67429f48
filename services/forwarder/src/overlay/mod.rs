//! Overlay network membership.
//!
//! The forwarding engine never talks to the network directly for its
//! listeners: it asks an [`Overlay`] node, which owns the node identity and
//! certificate material, for listeners, dials and HTTP clients bound to that
//! identity. The node is brought up before the engine starts and shut down
//! after it stops.

mod host;
#[cfg(test)]
mod recording;

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::net::{BoxedConnection, BoxedListener};
use crate::rule::Transport;

pub use host::{HostNode, HostNodeConfig};
#[cfg(test)]
pub(crate) use recording::RecordingOverlay;

/// State reported by a node once it is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Fully qualified DNS name, with trailing dot.
    pub dns_name: String,
    /// Addresses assigned to the node.
    pub addresses: Vec<IpAddr>,
}

impl NodeStatus {
    /// DNS name without the trailing root dot.
    pub fn hostname(&self) -> &str {
        self.dns_name.strip_suffix('.').unwrap_or(&self.dns_name)
    }
}

/// An overlay network node.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join the network and authenticate the node.
    async fn bring_up(&self) -> io::Result<NodeStatus>;

    /// Listen on `port` for plain traffic.
    async fn listen(&self, transport: Transport, port: u16) -> io::Result<BoxedListener>;

    /// Listen on TCP `port`, terminating TLS with the node's certificate.
    async fn listen_tls(&self, port: u16) -> io::Result<BoxedListener>;

    /// Dial an overlay-resident address.
    async fn dial(&self, transport: Transport, addr: &str) -> io::Result<BoxedConnection>;

    /// HTTP client routed through the overlay network.
    fn http_client(&self) -> reqwest::Client;

    /// Leave the network.
    async fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_trims_root_dot() {
        let status = NodeStatus {
            dns_name: "web.tail1234.ts.net.".to_string(),
            addresses: vec![],
        };
        assert_eq!(status.hostname(), "web.tail1234.ts.net");

        let status = NodeStatus {
            dns_name: "web".to_string(),
            addresses: vec![],
        };
        assert_eq!(status.hostname(), "web");
    }
}
