//! Proxy orchestration: listener lifecycle and the administration
//! contract.
//!
//! [`ProxyServer`] owns the shared ruleset snapshot handle and at most
//! one listener task per transport. Listeners are replace-on-stop:
//! `stop` retires the bound sockets with their tasks, and the next
//! `start` binds fresh ones, which is also how a dns-port change takes
//! effect. The admin methods are the contract consumed by the external
//! HTTP layer; every successful mutation publishes a new ruleset
//! snapshot and rewrites the configuration file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{self, ConfigError};
use crate::dispatch::Dispatcher;
use crate::rules::{LogLevel, Rule, RuleError, RuleSet, Strategy};
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};
use crate::upstream::Upstream;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("failed to persist configuration: {0}")]
    Persist(#[from] ConfigError),
}

/// Static configuration for the proxy.
pub struct ProxyConfig {
    /// Local address the listeners bind on.
    pub bind_ip: IpAddr,
    /// Whether to run the TCP listener alongside UDP. Historically the
    /// proxy ran UDP-only; TCP is opt-in.
    pub enable_tcp: bool,
    /// Where mutations are persisted; `None` disables persistence.
    pub config_path: Option<PathBuf>,
}

/// One running listener: cancel to stop, await to observe retirement.
struct ListenerTask {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerTask {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

pub struct ProxyServer {
    rules: Arc<ArcSwap<RuleSet>>,
    upstream: Arc<dyn Upstream>,
    bind_ip: IpAddr,
    enable_tcp: bool,
    config_path: Option<PathBuf>,
    udp: Option<ListenerTask>,
    tcp: Option<ListenerTask>,
    udp_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn new(rules: RuleSet, upstream: Arc<dyn Upstream>, config: ProxyConfig) -> Self {
        Self {
            rules: Arc::new(ArcSwap::from_pointee(rules)),
            upstream,
            bind_ip: config.bind_ip,
            enable_tcp: config.enable_tcp,
            config_path: config.config_path,
            udp: None,
            tcp: None,
            udp_addr: None,
        }
    }

    /// Starts the listeners if none are running. Starting a running
    /// proxy is a logged no-op.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.is_alive() {
            info!("proxy already running, start ignored");
            return Ok(());
        }
        // Clear out any terminated listeners; their sockets are gone.
        self.udp = None;
        self.tcp = None;

        let requested = SocketAddr::new(self.bind_ip, self.rules.load().dns_port());

        // Bind every transport before spawning any of them: a failed
        // bind must leave nothing running, or a retry start() would be
        // an is-alive no-op with only half the listeners up.
        let udp = UdpTransport::bind(requested).await?;
        let bound = udp.local_addr()?;
        let tcp = if self.enable_tcp {
            Some(TcpTransport::bind(bound).await?)
        } else {
            None
        };

        let shutdown = CancellationToken::new();
        let task = udp.start(self.dispatcher(), shutdown.clone());
        self.udp = Some(ListenerTask { shutdown, task });
        self.udp_addr = Some(bound);

        if let Some(tcp) = tcp {
            let shutdown = CancellationToken::new();
            let task = tcp.start(self.dispatcher(), shutdown.clone());
            self.tcp = Some(ListenerTask { shutdown, task });
        }

        info!(addr = %bound, tcp = self.enable_tcp, "proxy started");
        Ok(())
    }

    /// Stops all running listeners and retires them. A later `start`
    /// binds fresh listeners.
    pub async fn stop(&mut self) {
        if let Some(listener) = self.udp.take() {
            listener.stop().await;
        }
        if let Some(listener) = self.tcp.take() {
            listener.stop().await;
        }
        self.udp_addr = None;
        info!("proxy stopped");
    }

    /// True while any owned listener is running. A listener that died
    /// on a fatal socket error shows up here as not alive.
    pub fn is_alive(&self) -> bool {
        self.udp.as_ref().is_some_and(ListenerTask::is_alive)
            || self.tcp.as_ref().is_some_and(ListenerTask::is_alive)
    }

    /// The UDP listener's bound address while it is actually running.
    /// A listener that died on a fatal error no longer serves its
    /// address, so none is reported.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.udp.as_ref().is_some_and(ListenerTask::is_alive) {
            self.udp_addr
        } else {
            None
        }
    }

    fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(self.rules.clone(), self.upstream.clone()))
    }

    // Administration contract, wrapped by the external HTTP layer.

    /// Current rules in priority order.
    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.load().rules().to_vec()
    }

    /// Validates and appends a rule, publishing a new snapshot. A rule
    /// that fails validation leaves the published set untouched.
    pub fn add_rule(
        &self,
        pattern: &str,
        strategy: Strategy,
        answer: Option<Ipv4Addr>,
        min_log_level: LogLevel,
    ) -> Result<(), ServerError> {
        let rule = Rule::new(pattern, strategy, answer, min_log_level)?;
        self.mutate(|set| {
            set.push_rule(rule);
            Ok(())
        })
    }

    /// Removes the rule at `index`; out-of-range fails without
    /// modification.
    pub fn delete_rule(&self, index: usize) -> Result<(), ServerError> {
        self.mutate(|set| set.remove_rule(index).map(|_| ()))
    }

    pub fn get_dns_port(&self) -> u16 {
        self.rules.load().dns_port()
    }

    /// Changes the DNS port in the published configuration. The running
    /// listeners keep their socket; the new port applies on restart.
    pub fn set_dns_port(&self, port: u16) -> Result<(), ServerError> {
        self.mutate(|set| set.set_dns_port(port))
    }

    /// Clone-mutate-publish on the shared snapshot, then persist. The
    /// admin layer is the single mutator, so no compare-and-swap loop
    /// is needed; listeners only ever read.
    fn mutate(
        &self,
        apply: impl FnOnce(&mut RuleSet) -> Result<(), RuleError>,
    ) -> Result<(), ServerError> {
        let mut next = RuleSet::clone(&self.rules.load_full());
        apply(&mut next)?;
        self.rules.store(Arc::new(next));
        self.persist()
    }

    fn persist(&self) -> Result<(), ServerError> {
        if let Some(path) = &self.config_path {
            config::save(path, &self.rules.load())?;
        }
        Ok(())
    }
}
