//! Networking utilities for tailport.
//!
//! This library provides helpers for:
//! - Classifying hosts as overlay-resident (private tailnet address space)
//! - Splitting `host:port` strings, including bracketed IPv6 literals

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Address is not in `host:port` form.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Port component missing or not a number.
    #[error("invalid port in address {addr}: {port:?}")]
    InvalidPort { addr: String, port: String },
}

// ============================================================================
// Overlay address space
// ============================================================================

/// Private DNS suffix for overlay nodes (MagicDNS).
pub const OVERLAY_DNS_SUFFIX: &str = ".ts.net";

/// Reserved IPv4 prefix for overlay addresses (CGNAT range).
pub const OVERLAY_IPV4_PREFIX: &str = "100.";

/// Reserved IPv6 prefix for overlay addresses (ULA range).
pub const OVERLAY_IPV6_PREFIX: &str = "fd7a:115c:a1e0:";

/// Returns `true` if `host` syntactically belongs to the overlay network.
///
/// This is a best-guess string match, never a network lookup. Overlay members
/// assigned outside the reserved ranges are not detected; callers dial those
/// through the general network, which fails closed.
///
/// Accepts bare hosts as well as bracketed IPv6 literals (`[fd7a:...]`).
pub fn is_overlay_host(host: &str) -> bool {
    let host = unbracket(host);

    ends_with_ignore_case(host, OVERLAY_DNS_SUFFIX)
        || starts_with_ignore_case(host, OVERLAY_IPV4_PREFIX)
        || starts_with_ignore_case(host, OVERLAY_IPV6_PREFIX)
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn ends_with_ignore_case(s: &str, suffix: &str) -> bool {
    s.len() >= suffix.len()
        && s.as_bytes()[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix.as_bytes())
}

// ============================================================================
// host:port handling
// ============================================================================

/// Split `host:port` into its parts.
///
/// IPv6 literals must be bracketed (`[::1]:53`); the returned host has the
/// brackets removed.
pub fn split_host_port(addr: &str) -> Result<(&str, u16), NetworkError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(NetworkError::InvalidAddress(addr.to_string()));
        };
        let Some(port) = tail.strip_prefix(':') else {
            return Err(NetworkError::InvalidAddress(addr.to_string()));
        };
        (host, port)
    } else {
        let Some((host, port)) = addr.rsplit_once(':') else {
            return Err(NetworkError::InvalidAddress(addr.to_string()));
        };
        if host.contains(':') {
            // Unbracketed IPv6 literal; the port boundary is ambiguous.
            return Err(NetworkError::InvalidAddress(addr.to_string()));
        }
        (host, port)
    };

    if host.is_empty() {
        return Err(NetworkError::InvalidAddress(addr.to_string()));
    }

    let port = port.parse::<u16>().map_err(|_| NetworkError::InvalidPort {
        addr: addr.to_string(),
        port: port.to_string(),
    })?;

    Ok((host, port))
}

/// Join a host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
