//! TLS termination for secure listeners.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::{Accepted, BoxedConnection, NetListener};

/// Certificate chain file inside the node data directory.
pub const TLS_CERT_FILE: &str = "tls.crt";

/// Private key file inside the node data directory.
pub const TLS_KEY_FILE: &str = "tls.key";

/// Handshakes slower than this are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Certificate chain and private key presented by TLS listeners.
pub struct TlsMaterial {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsMaterial {
    /// Parse PEM-encoded certificate chain and private key.
    pub fn from_pem(mut cert_pem: &[u8], mut key_pem: &[u8]) -> io::Result<Self> {
        let certs = rustls_pemfile::certs(&mut cert_pem).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no certificates found in PEM input",
            ));
        }

        let key = rustls_pemfile::private_key(&mut key_pem)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "no private key found in PEM input")
        })?;

        Ok(Self { certs, key })
    }

    /// Generate a self-signed certificate for `hostname`.
    ///
    /// Returns the material plus its PEM encoding (certificate, key).
    pub fn self_signed(hostname: &str) -> io::Result<(Self, String, String)> {
        let certified = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
            .map_err(io::Error::other)?;

        let cert_pem = certified.cert.pem();
        let key_pem = certified.key_pair.serialize_pem();
        let material = Self::from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;

        Ok((material, cert_pem, key_pem))
    }

    /// Load material from `dir`, or generate it.
    ///
    /// Generated material is written back to `dir` when one is given, so the
    /// node keeps its certificate across restarts.
    pub fn load_or_generate(dir: Option<&Path>, hostname: &str) -> io::Result<Self> {
        if let Some(dir) = dir {
            let cert_path = dir.join(TLS_CERT_FILE);
            let key_path = dir.join(TLS_KEY_FILE);

            if cert_path.exists() && key_path.exists() {
                let material = Self::from_pem(&fs::read(&cert_path)?, &fs::read(&key_path)?)?;
                info!(cert = %cert_path.display(), "Loaded TLS certificate");
                return Ok(material);
            }

            let (material, cert_pem, key_pem) = Self::self_signed(hostname)?;
            fs::create_dir_all(dir)?;
            fs::write(&cert_path, cert_pem)?;
            write_private(&key_path, key_pem.as_bytes())?;
            info!(cert = %cert_path.display(), hostname, "Generated self-signed TLS certificate");
            return Ok(material);
        }

        let (material, _, _) = Self::self_signed(hostname)?;
        info!(hostname, "Generated ephemeral self-signed TLS certificate");
        Ok(material)
    }

    /// Leaf certificate.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certs[0]
    }

    /// Build a TLS acceptor presenting this material.
    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(io::Error::other)?
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(io::Error::other)?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Write `contents` to `path`, readable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(contents)
    }

    #[cfg(not(unix))]
    {
        fs::write(path, contents)
    }
}

/// TCP listener terminating TLS on every connection.
pub struct TlsNetListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsNetListener {
    pub fn new(inner: TcpListener, acceptor: TlsAcceptor) -> Self {
        Self { inner, acceptor }
    }
}

#[async_trait]
impl NetListener for TlsNetListener {
    async fn accept(&mut self) -> io::Result<Accepted> {
        let (stream, peer) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        let acceptor = self.acceptor.clone();

        Ok(Accepted::pending(peer, async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    debug!(peer = %peer, "TLS handshake complete");
                    Ok(Box::new(tls) as BoxedConnection)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "TLS handshake timed out",
                )),
            }
        }))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
