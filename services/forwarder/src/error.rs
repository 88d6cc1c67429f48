//! Error types for the forwarding engine.
//!
//! Startup errors ([`ProxyError`]) abort the whole run. Connection errors
//! ([`ForwardError`]) are logged where they happen and never reach the
//! supervisor.

use std::io;

use thiserror::Error;

use crate::rule::Transport;

/// Fatal errors raised while bringing the engine up.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No forwarding rules configured.
    #[error("no forwarding rules configured")]
    NoRules,

    /// The overlay node could not be started.
    #[error("overlay node failed to start: {0}")]
    BringUp(#[source] io::Error),

    /// The HTTP client for general-network targets could not be built.
    #[error("could not build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// A listener could not be opened.
    #[error("could not listen on {transport}:{port} (tls: {secure}): {source}")]
    Listen {
        transport: Transport,
        port: u16,
        secure: bool,
        #[source]
        source: io::Error,
    },
}

impl ProxyError {
    /// Operator advice logged next to the error.
    pub fn hint(&self) -> &'static str {
        match self {
            ProxyError::NoRules => "Specify at least one rule using --tcp, --tls or --udp.",
            ProxyError::BringUp(_) => {
                "Make sure the node name is valid and the data directory is writable."
            }
            ProxyError::HttpClient(_) => "Make sure the system TLS configuration is usable.",
            ProxyError::Listen { .. } => {
                "Make sure that you only specify one listener for each port, and that \
                 TLS certificate material is available when using --tls."
            }
        }
    }
}

/// Errors scoped to a single connection or request.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("could not accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("could not connect to {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    #[error("could not build request to target: {0}")]
    BuildRequest(String),

    #[error("could not forward request to {target}: {source}")]
    Forward {
        target: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("could not stream response from target: {0}")]
    ResponseStream(String),

    #[error("HTTP connection error: {0}")]
    HttpConnection(String),
}

impl ForwardError {
    pub fn hint(&self) -> &'static str {
        match self {
            ForwardError::Accept(_) | ForwardError::Handshake(_) => {
                "Make sure that your client is still connected to the overlay network."
            }
            ForwardError::Dial { .. } | ForwardError::Forward { .. } => {
                "Make sure that the target service is running and reachable, and that \
                 the rule names the correct target."
            }
            ForwardError::Relay(_) | ForwardError::ResponseStream(_) => {
                "The client or the target closed the connection mid-transfer."
            }
            ForwardError::BuildRequest(_) => {
                "Make sure that the rule names a valid target URL."
            }
            ForwardError::HttpConnection(_) => "The client sent a malformed HTTP request.",
        }
    }
}
