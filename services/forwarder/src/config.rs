//! Command line and runtime configuration.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use directories::BaseDirs;
use thiserror::Error;
use tracing::warn;

use crate::overlay::HostNodeConfig;
use crate::rule::{ForwardingRule, RuleError, Transport};

/// Directory under the user config dir holding per-node state.
const APP_DIR: &str = "tailport";

/// Expose local and remote services on an overlay network node.
#[derive(Debug, Clone, Parser)]
#[command(name = "tailport")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Node name on the overlay network.
    #[arg(long, env = "TAILPORT_NAME", default_value = "tailport")]
    pub name: String,

    /// Register as an ephemeral node and keep no state on disk.
    #[arg(long, env = "TAILPORT_EPHEMERAL")]
    pub ephemeral: bool,

    /// Node state directory. Defaults to <config dir>/tailport/<name>.
    #[arg(long, env = "TAILPORT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Address the node's listeners bind to.
    #[arg(long, env = "TAILPORT_BIND", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// TCP forwarding rule, e.g. '80:8080' or '80:example.com:80'.
    #[arg(long, env = "TAILPORT_TCP", value_name = "RULE")]
    pub tcp: Vec<String>,

    /// TLS-terminated TCP forwarding rule, e.g. '443:http://127.0.0.1:8080'.
    #[arg(long, env = "TAILPORT_TLS", value_name = "RULE")]
    pub tls: Vec<String>,

    /// UDP forwarding rule, e.g. '53:10.0.0.2:53'.
    #[arg(long, env = "TAILPORT_UDP", value_name = "RULE")]
    pub udp: Vec<String>,

    /// Debug logging for the overlay node.
    #[arg(long, env = "TAILPORT_OVERLAY_DEBUG")]
    pub overlay_debug: bool,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "TAILPORT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "TAILPORT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Seconds a UDP session may stay idle before it is closed.
    #[arg(long, env = "TAILPORT_UDP_IDLE_TIMEOUT", default_value_t = 60)]
    pub udp_idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Configuration errors. All are fatal before any listener opens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid --{group} rule: {source}")]
    Rule {
        group: &'static str,
        #[source]
        source: RuleError,
    },

    #[error("no forwarding rules configured")]
    NoRules,
}

impl ConfigError {
    pub fn hint(&self) -> &'static str {
        match self {
            ConfigError::Rule { source, .. } => source.hint(),
            ConfigError::NoRules => "Specify at least one rule using --tcp, --tls or --udp.",
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub ephemeral: bool,
    pub data_dir: PathBuf,
    pub bind_addr: IpAddr,
    pub rules: Vec<ForwardingRule>,
    pub udp_idle_timeout: Duration,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let rules = parse_rules(&cli.tcp, &cli.tls, &cli.udp)?;
        let data_dir = resolve_data_dir(cli.data_dir.as_deref(), &cli.name);

        Ok(Self {
            name: cli.name.clone(),
            ephemeral: cli.ephemeral,
            data_dir,
            bind_addr: cli.bind,
            rules,
            udp_idle_timeout: Duration::from_secs(cli.udp_idle_timeout_secs),
        })
    }

    /// Overlay node settings.
    pub fn node_config(&self) -> HostNodeConfig {
        HostNodeConfig {
            hostname: self.name.clone(),
            bind_addr: self.bind_addr,
            data_dir: self.data_dir.clone(),
            ephemeral: self.ephemeral,
            udp_idle_timeout: self.udp_idle_timeout,
        }
    }
}

/// Parse every rule group in order: TCP, then TLS, then UDP.
///
/// The first invalid rule aborts parsing.
pub fn parse_rules(
    tcp: &[String],
    tls: &[String],
    udp: &[String],
) -> Result<Vec<ForwardingRule>, ConfigError> {
    let groups: [(&'static str, &[String], Transport, bool); 3] = [
        ("tcp", tcp, Transport::Tcp, false),
        ("tls", tls, Transport::Tcp, true),
        ("udp", udp, Transport::Udp, false),
    ];

    let mut rules = Vec::new();
    for (group, specs, transport, secure) in groups {
        for spec in specs {
            let rule = ForwardingRule::parse(spec, transport, secure)
                .map_err(|source| ConfigError::Rule { group, source })?;
            rules.push(rule);
        }
    }

    if rules.is_empty() {
        return Err(ConfigError::NoRules);
    }

    Ok(rules)
}

/// The node's data directory: `explicit` if given, otherwise
/// `<user config dir>/tailport/<hostname>`.
pub fn resolve_data_dir(explicit: Option<&Path>, hostname: &str) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }

    match BaseDirs::new() {
        Some(dirs) => dirs.config_dir().join(APP_DIR).join(hostname),
        None => {
            let fallback = Path::new(".").join(APP_DIR).join(hostname);
            warn!(
                data_dir = %fallback.display(),
                "No user config directory, using the working directory"
            );
            fallback
        }
    }
}
