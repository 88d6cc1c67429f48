//! tailport forwarder
//!
//! Exposes local and remote services on an overlay network node. Each
//! forwarding rule binds a listener on the node and relays every accepted
//! connection to its target, either byte for byte or, for `http(s)://`
//! targets, as a reverse proxy.

pub mod config;
pub mod error;
pub mod net;
pub mod overlay;
pub mod proxy;
pub mod rule;

pub use config::{Cli, Config, ConfigError, LogFormat};
pub use error::{ForwardError, ProxyError};
pub use overlay::{HostNode, HostNodeConfig, NodeStatus, Overlay};
pub use proxy::{BoundListener, ListenerSupervisor, RunningSupervisor};
pub use rule::{ForwardingRule, RuleError, Target, Transport};
