//! One forwarder per rule, started together and stopped together.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use super::http::{standard_http_client, HttpForwarder};
use super::listener::{ActiveListener, ListenerCloser};
use super::socket::SocketForwarder;
use super::wait_for_shutdown;
use crate::error::ProxyError;
use crate::overlay::Overlay;
use crate::rule::{ForwardingRule, Target};

/// How long workers get to exit after their listeners are closed.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// A listener that is up and serving one rule.
#[derive(Debug, Clone)]
pub struct BoundListener {
    pub rule: Arc<ForwardingRule>,
    pub local_addr: SocketAddr,
}

/// Starts and supervises one forwarder per rule.
pub struct ListenerSupervisor {
    overlay: Arc<dyn Overlay>,
    rules: Vec<Arc<ForwardingRule>>,
    grace: Duration,
}

impl ListenerSupervisor {
    pub fn new(overlay: Arc<dyn Overlay>, rules: Vec<ForwardingRule>) -> Self {
        Self {
            overlay,
            rules: rules.into_iter().map(Arc::new).collect(),
            grace: DEFAULT_GRACE,
        }
    }

    /// Bound on the wait for workers during close.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Open every listener, then spawn the forwarders.
    ///
    /// If any listener fails to open, those already opened are closed and
    /// the error is returned. Nothing is spawned in that case.
    pub async fn start(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RunningSupervisor, ProxyError> {
        if self.rules.is_empty() {
            return Err(ProxyError::NoRules);
        }

        let standard_client = standard_http_client().map_err(ProxyError::HttpClient)?;

        let mut opened: Vec<(Arc<ForwardingRule>, ActiveListener, ListenerCloser)> =
            Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            match ActiveListener::open(self.overlay.as_ref(), rule).await {
                Ok((listener, closer)) => opened.push((Arc::clone(rule), listener, closer)),
                Err(err) => {
                    for (rule, _, closer) in &opened {
                        debug!(rule = %rule, "Closing listener after startup failure");
                        closer.close();
                    }
                    return Err(err);
                }
            }
        }

        let mut bound = Vec::with_capacity(opened.len());
        let mut closers = Vec::with_capacity(opened.len());
        let mut workers = JoinSet::new();

        for (rule, listener, closer) in opened {
            let local_addr = listener.local_addr();
            let span = tracing::info_span!("listener", rule = %rule);

            match rule.target() {
                Target::Http(url) => {
                    info!(
                        listen = %local_addr,
                        target_url = %url,
                        secure = rule.secure(),
                        "Forwarding traffic (using http proxy mode)"
                    );
                    let client = HttpForwarder::client_for(
                        rule.target(),
                        self.overlay.as_ref(),
                        &standard_client,
                    );
                    let forwarder =
                        HttpForwarder::new(Arc::clone(&rule), url.clone(), client, shutdown.clone());
                    workers.spawn(forwarder.run(listener).instrument(span));
                }
                Target::Raw { .. } => {
                    info!(
                        listen = %local_addr,
                        transport = %rule.transport(),
                        target_addr = %rule.target(),
                        secure = rule.secure(),
                        "Forwarding traffic"
                    );
                    let forwarder = SocketForwarder::new(
                        Arc::clone(&rule),
                        Arc::clone(&self.overlay),
                        shutdown.clone(),
                    );
                    workers.spawn(forwarder.run(listener).instrument(span));
                }
            }

            bound.push(BoundListener { rule, local_addr });
            closers.push(closer);
        }

        Ok(RunningSupervisor {
            bound,
            closers,
            workers,
            shutdown,
            grace: self.grace,
        })
    }

    /// Start, then block until shutdown and close everything.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        self.start(shutdown).await?.wait().await;
        Ok(())
    }
}

/// Forwarders that are up. Dropping this closes every listener.
pub struct RunningSupervisor {
    bound: Vec<BoundListener>,
    closers: Vec<ListenerCloser>,
    workers: JoinSet<()>,
    shutdown: watch::Receiver<bool>,
    grace: Duration,
}

impl RunningSupervisor {
    /// Listeners in rule order.
    pub fn listeners(&self) -> &[BoundListener] {
        &self.bound
    }

    /// Block until shutdown is signalled, then close.
    pub async fn wait(mut self) {
        wait_for_shutdown(&mut self.shutdown).await;
        info!(listeners = self.bound.len(), "Shutting down listeners");
        self.close().await;
    }

    /// Close every listener and wait, up to the grace period, for the
    /// workers to exit.
    pub async fn close(mut self) {
        for closer in &self.closers {
            closer.close();
        }

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "Forwarder panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = self.workers.len(),
                "Forwarders did not stop in time, aborting"
            );
            self.workers.abort_all();
        }

        debug!("All listeners closed");
    }
}
