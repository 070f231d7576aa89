//! Probe strategies
//!
//! Every strategy answers the same question for one node: is it up, and if we
//! can tell, how loaded is it. Strategies compose: remote nodes with SSH
//! credentials run `FallbackProbe(RemoteSshProbe, TcpPingProbe)`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::execution::{SshCredentials, SshRunner};
use crate::metrics::NodeMetrics;
use crate::parse::{parse_heartbeat_line, HEARTBEAT_COMMAND};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("SSH connection error: {0}")]
    SshConnection(String),
    #[error("SSH command error: {0}")]
    SshCommand(String),
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect error: {0}")]
    Connect(#[from] std::io::Error),
    #[error("metrics unavailable: {0}")]
    Metrics(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

/// What a probe needs to know about a node
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub name: String,
    pub ip: String,
    pub ssh_port: Option<u16>,
    pub credentials: Option<SshCredentials>,
}

impl ProbeTarget {
    pub fn ssh_port(&self) -> u16 {
        self.ssh_port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

/// Outcome of one probe invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatResult {
    /// `None` when the strategy can only tell reachability
    pub metrics: Option<NodeMetrics>,
    pub reachable: bool,
}

impl HeartbeatResult {
    pub fn with_metrics(metrics: NodeMetrics) -> Self {
        Self {
            metrics: Some(metrics),
            reachable: true,
        }
    }

    pub fn reachable() -> Self {
        Self {
            metrics: None,
            reachable: true,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            metrics: None,
            reachable: false,
        }
    }
}

#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> Result<HeartbeatResult, ProbeError>;
}

/// In-process metrics for the control-plane host; no network involved
#[derive(Debug, Clone, Default)]
pub struct LocalProbe;

#[async_trait]
impl NodeProbe for LocalProbe {
    async fn probe(&self, _target: &ProbeTarget) -> Result<HeartbeatResult, ProbeError> {
        let metrics = tokio::task::spawn_blocking(NodeMetrics::collect_local)
            .await
            .map_err(|e| ProbeError::Metrics(format!("collector task failed: {e}")))??;
        Ok(HeartbeatResult::with_metrics(metrics))
    }
}

/// Metrics through one SSH round trip
#[derive(Debug, Clone, Default)]
pub struct RemoteSshProbe {
    runner: SshRunner,
}

impl RemoteSshProbe {
    pub fn new(runner: SshRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl NodeProbe for RemoteSshProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<HeartbeatResult, ProbeError> {
        let credentials = target
            .credentials
            .as_ref()
            .ok_or_else(|| ProbeError::Credentials("no SSH credentials".to_string()))?;

        let line = self.runner.run(target, credentials, HEARTBEAT_COMMAND).await?;
        Ok(HeartbeatResult::with_metrics(parse_heartbeat_line(&line)))
    }
}

/// Reachability of the node's SSH port; never produces metrics
#[derive(Debug, Clone)]
pub struct TcpPingProbe {
    timeout: Duration,
}

impl Default for TcpPingProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl TcpPingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Raw TCP connect within the probe timeout
    pub async fn connect(&self, target: &ProbeTarget) -> Result<(), ProbeError> {
        let addr = (target.ip.as_str(), target.ssh_port());
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(ProbeError::Connect(e)),
            Err(_) => Err(ProbeError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl NodeProbe for TcpPingProbe {
    async fn probe(&self, target: &ProbeTarget) -> Result<HeartbeatResult, ProbeError> {
        match self.connect(target).await {
            Ok(()) => Ok(HeartbeatResult::reachable()),
            Err(e) => {
                debug!(node = %target.name, port = target.ssh_port(), "TCP probe failed: {}", e);
                Ok(HeartbeatResult::unreachable())
            }
        }
    }
}

/// Runs `fallback` whenever `primary` returns an error
#[derive(Debug, Clone)]
pub struct FallbackProbe<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackProbe<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: NodeProbe, F: NodeProbe> NodeProbe for FallbackProbe<P, F> {
    async fn probe(&self, target: &ProbeTarget) -> Result<HeartbeatResult, ProbeError> {
        match self.primary.probe(target).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(node = %target.name, "Primary probe failed, falling back: {}", e);
                self.fallback.probe(target).await
            }
        }
    }
}
