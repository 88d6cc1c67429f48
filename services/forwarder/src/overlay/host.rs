//! Overlay node backed by the host network stack.
//!
//! Listeners bind the configured host address, dials go out over the general
//! network and the node certificate is self-signed unless one is provided in
//! the data directory. This lets the engine run, and be tested, without a
//! membership service.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::{NodeStatus, Overlay};
use crate::net::{
    self, BoxedConnection, BoxedListener, TcpNetListener, TlsMaterial, TlsNetListener,
    UdpListener, DEFAULT_UDP_IDLE_TIMEOUT,
};
use crate::rule::Transport;

/// Host node configuration.
#[derive(Debug, Clone)]
pub struct HostNodeConfig {
    /// Node name, also the certificate subject.
    pub hostname: String,
    /// Address listeners bind to.
    pub bind_addr: IpAddr,
    /// Directory holding the node's TLS material.
    pub data_dir: PathBuf,
    /// Keep no state on disk.
    pub ephemeral: bool,
    /// Idle timeout for UDP sessions.
    pub udp_idle_timeout: Duration,
}

impl HostNodeConfig {
    /// Ephemeral node listening on `bind_addr`.
    pub fn ephemeral(hostname: impl Into<String>, bind_addr: IpAddr) -> Self {
        Self {
            hostname: hostname.into(),
            bind_addr,
            data_dir: PathBuf::from("."),
            ephemeral: true,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }
}

impl Default for HostNodeConfig {
    fn default() -> Self {
        Self::ephemeral("tailport", IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

struct TlsState {
    material: TlsMaterial,
    acceptor: TlsAcceptor,
}

/// [`Overlay`] implementation on the host network.
pub struct HostNode {
    config: HostNodeConfig,
    tls: OnceLock<TlsState>,
    http_client: reqwest::Client,
}

impl HostNode {
    pub fn new(config: HostNodeConfig) -> io::Result<Self> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(io::Error::other)?;

        Ok(Self {
            config,
            tls: OnceLock::new(),
            http_client,
        })
    }

    /// Certificate presented by TLS listeners, once the node is up.
    pub fn certificate(&self) -> Option<CertificateDer<'static>> {
        self.tls.get().map(|state| state.material.certificate().clone())
    }

    fn bind_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.config.bind_addr, port)
    }
}

#[async_trait]
impl Overlay for HostNode {
    async fn bring_up(&self) -> io::Result<NodeStatus> {
        if self.tls.get().is_none() {
            let dir = (!self.config.ephemeral).then_some(self.config.data_dir.as_path());
            let material = TlsMaterial::load_or_generate(dir, &self.config.hostname)?;
            let acceptor = material.acceptor()?;
            let _ = self.tls.set(TlsState { material, acceptor });
        }

        debug!(
            hostname = %self.config.hostname,
            bind_addr = %self.config.bind_addr,
            ephemeral = self.config.ephemeral,
            data_dir = %self.config.data_dir.display(),
            "Host node up"
        );

        Ok(NodeStatus {
            dns_name: format!("{}.", self.config.hostname),
            addresses: vec![self.config.bind_addr],
        })
    }

    async fn listen(&self, transport: Transport, port: u16) -> io::Result<BoxedListener> {
        let addr = self.bind_addr(port);
        debug!(transport = %transport, addr = %addr, "Opening listener");

        match transport {
            Transport::Tcp => Ok(Box::new(TcpNetListener::bind(addr).await?)),
            Transport::Udp => Ok(Box::new(
                UdpListener::bind(addr, self.config.udp_idle_timeout).await?,
            )),
        }
    }

    async fn listen_tls(&self, port: u16) -> io::Result<BoxedListener> {
        let state = self.tls.get().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "node is not up, no TLS material")
        })?;

        let addr = self.bind_addr(port);
        debug!(addr = %addr, "Opening TLS listener");

        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TlsNetListener::new(listener, state.acceptor.clone())))
    }

    async fn dial(&self, transport: Transport, addr: &str) -> io::Result<BoxedConnection> {
        debug!(transport = %transport, addr, "Dialing");
        net::dial(transport, addr).await
    }

    fn http_client(&self) -> reqwest::Client {
        self.http_client.clone()
    }

    async fn shutdown(&self) {
        info!(hostname = %self.config.hostname, "Host node down");
    }
}
