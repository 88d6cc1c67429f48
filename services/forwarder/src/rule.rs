//! Forwarding rules.
//!
//! A rule maps a listen port on the node to a target. Rules are written as:
//!
//! ```text
//! <listen_port>:<target_port>                      -> 127.0.0.1:<target_port>
//! <listen_port>:<target_host>:<target_port>        -> <target_host>:<target_port>
//! <listen_port>:http(s)://<host>[:port][/path...]  -> HTTP reverse proxy
//! ```
//!
//! Transport and TLS termination come from the rule group the string was
//! given in, never from the string itself.

use std::fmt;

use reqwest::Url;
use tailport_networking::{
    is_overlay_host, join_host_port, split_host_port, NetworkError,
};
use thiserror::Error;

/// Host used when a rule only names a target port.
pub const LOCAL_TARGET_HOST: &str = "127.0.0.1";

/// Transport protocol of a listener and its raw targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where forwarded traffic goes.
///
/// Decided once at parse time; forwarders never re-inspect the rule string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Raw socket target, relayed byte for byte.
    Raw { host: String, port: u16 },
    /// HTTP(S) target, forwarded request by request.
    Http(Url),
}

impl Target {
    /// Host part of the target (without brackets for IPv6 literals).
    pub fn host(&self) -> &str {
        match self {
            Target::Raw { host, .. } => host,
            Target::Http(url) => url
                .host_str()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
                .unwrap_or_default(),
        }
    }

    /// Whether the target must be reached through the overlay network.
    pub fn is_overlay(&self) -> bool {
        is_overlay_host(self.host())
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Target::Http(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Raw { host, port } => f.write_str(&join_host_port(host, *port)),
            Target::Http(url) => f.write_str(url.as_str()),
        }
    }
}

/// Rule parse errors.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {0:?} did not match the expected format <listen_port>:<target>")]
    MissingSeparator(String),

    #[error("rule {spec:?} has an invalid listen port {port:?}")]
    InvalidPort { spec: String, port: String },

    #[error("rule {0:?} has an empty target")]
    EmptyTarget(String),

    #[error("rule {spec:?} has an invalid target: {source}")]
    InvalidTarget {
        spec: String,
        #[source]
        source: NetworkError,
    },

    #[error("rule {spec:?} has an invalid target URL: {reason}")]
    InvalidUrl { spec: String, reason: String },

    #[error("rule {0:?} uses an HTTP target on a UDP listener")]
    HttpOverUdp(String),
}

impl RuleError {
    /// Operator advice for fixing the rule.
    pub fn hint(&self) -> &'static str {
        match self {
            RuleError::MissingSeparator(_) | RuleError::EmptyTarget(_) => {
                "To forward port 80 to local port 8080 use '80:8080'; \
                 to forward to a remote host use '80:example.com:8080'."
            }
            RuleError::InvalidPort { .. } => {
                "The listen port is the first part of the rule (i.e. 80:8080) \
                 and must be a number between 0 and 65535."
            }
            RuleError::InvalidTarget { .. } => {
                "Targets are a port, host:port, or [ipv6]:port."
            }
            RuleError::InvalidUrl { .. } => {
                "HTTP targets must be absolute URLs such as 'https://example.com'."
            }
            RuleError::HttpOverUdp(_) => "Use --tcp or --tls for HTTP targets.",
        }
    }
}

/// An immutable forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    transport: Transport,
    listen_port: u16,
    secure: bool,
    target: Target,
}

impl ForwardingRule {
    pub fn new(transport: Transport, listen_port: u16, secure: bool, target: Target) -> Self {
        Self {
            transport,
            listen_port,
            secure,
            target,
        }
    }

    /// Parse a rule string for the given transport and security mode.
    pub fn parse(spec: &str, transport: Transport, secure: bool) -> Result<Self, RuleError> {
        let Some((port, raw_target)) = spec.split_once(':') else {
            return Err(RuleError::MissingSeparator(spec.to_string()));
        };

        let listen_port = port.parse::<u16>().map_err(|_| RuleError::InvalidPort {
            spec: spec.to_string(),
            port: port.to_string(),
        })?;

        if raw_target.is_empty() {
            return Err(RuleError::EmptyTarget(spec.to_string()));
        }

        let target = if has_http_scheme(raw_target) {
            if transport == Transport::Udp {
                return Err(RuleError::HttpOverUdp(spec.to_string()));
            }
            let url = Url::parse(raw_target).map_err(|e| RuleError::InvalidUrl {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?;
            if url.host_str().is_none() {
                return Err(RuleError::InvalidUrl {
                    spec: spec.to_string(),
                    reason: "missing host".to_string(),
                });
            }
            Target::Http(url)
        } else if !raw_target.contains(':') {
            let port = raw_target
                .parse::<u16>()
                .map_err(|_| RuleError::InvalidTarget {
                    spec: spec.to_string(),
                    source: NetworkError::InvalidPort {
                        addr: raw_target.to_string(),
                        port: raw_target.to_string(),
                    },
                })?;
            Target::Raw {
                host: LOCAL_TARGET_HOST.to_string(),
                port,
            }
        } else {
            let (host, port) =
                split_host_port(raw_target).map_err(|source| RuleError::InvalidTarget {
                    spec: spec.to_string(),
                    source,
                })?;
            Target::Raw {
                host: host.to_string(),
                port,
            }
        };

        Ok(Self::new(transport, listen_port, secure, target))
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn target(&self) -> &Target {
        &self.target
    }
}

impl fmt::Display for ForwardingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "tls" } else { self.transport.as_str() };
        write!(f, "{}:{} -> {}", scheme, self.listen_port, self.target)
    }
}

fn has_http_scheme(s: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        s.len() >= scheme.len() && s.as_bytes()[..scheme.len()].eq_ignore_ascii_case(scheme.as_bytes())
    })
}
