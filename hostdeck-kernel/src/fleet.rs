/**
 * FLEET HEARTBEAT MONITOR - Periodic liveness and resource checks
 *
 * ROLE : every interval, probe every node of the table and write the result
 * back into its row. One warm-up cycle runs shortly after boot.
 *
 * STRATEGY PER NODE :
 * - local node              -> LocalProbe (in-process, never marked offline)
 * - remote + credentials    -> RemoteSshProbe, TCP ping on failure
 * - remote, no credentials  -> TCP ping
 *
 * A failing or hanging node never holds back the others: checks run with
 * bounded concurrency and each one has its own deadline.
 */

use futures::stream::{self, StreamExt};
use hostdeck_probe::{
    FallbackProbe, HeartbeatResult, LocalProbe, NodeProbe, ProbeTarget, RemoteSshProbe, SshRunner,
    TcpPingProbe,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::FleetConf;
use crate::crypto::SecretBox;
use crate::nodes::{NodeStore, NodeUpdate, ServerNode};

/// Tally of one cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub active: usize,
    pub offline: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckOutcome {
    Active,
    Offline,
    Unchanged,
}

pub struct FleetHeartbeatMonitor {
    store: Arc<dyn NodeStore>,
    secrets: Option<Arc<SecretBox>>,
    local: Arc<dyn NodeProbe>,
    remote: Arc<dyn NodeProbe>,
    tcp: Arc<dyn NodeProbe>,
    interval: Duration,
    warmup: Duration,
    node_check_timeout: Duration,
    max_concurrent_checks: usize,
}

impl FleetHeartbeatMonitor {
    pub fn new(cfg: &FleetConf, store: Arc<dyn NodeStore>, secrets: Option<Arc<SecretBox>>) -> Self {
        let runner = SshRunner {
            ssh_program: cfg.ssh_program.clone(),
            password_helper: Some(cfg.password_helper.clone()).filter(|h| !h.is_empty()),
            connect_timeout: cfg.ssh_connect_timeout(),
            command_timeout: cfg.ssh_command_timeout(),
        };
        let tcp = TcpPingProbe::new(cfg.tcp_probe_timeout());

        Self {
            store,
            secrets,
            local: Arc::new(LocalProbe),
            remote: Arc::new(FallbackProbe::new(RemoteSshProbe::new(runner), tcp.clone())),
            tcp: Arc::new(tcp),
            interval: cfg.interval(),
            warmup: cfg.warmup(),
            node_check_timeout: cfg.node_check_timeout(),
            max_concurrent_checks: cfg.max_concurrent_checks.max(1),
        }
    }

    /// Replace the probe strategies (local, remote with credentials, bare TCP)
    pub fn with_probes(
        mut self,
        local: Arc<dyn NodeProbe>,
        remote: Arc<dyn NodeProbe>,
        tcp: Arc<dyn NodeProbe>,
    ) -> Self {
        self.local = local;
        self.remote = remote;
        self.tcp = tcp;
        self
    }

    /// Probe every node once and persist the results
    pub async fn run_cycle(&self) -> CycleReport {
        let nodes = match self.store.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!("Failed to read node table: {}", e);
                return CycleReport::default();
            }
        };

        let outcomes: Vec<CheckOutcome> = stream::iter(nodes)
            .map(|node| self.check_node(node))
            .buffer_unordered(self.max_concurrent_checks)
            .collect()
            .await;

        let mut report = CycleReport {
            checked: outcomes.len(),
            ..CycleReport::default()
        };
        for outcome in outcomes {
            match outcome {
                CheckOutcome::Active => report.active += 1,
                CheckOutcome::Offline => report.offline += 1,
                CheckOutcome::Unchanged => report.unchanged += 1,
            }
        }
        report
    }

    async fn check_node(&self, node: ServerNode) -> CheckOutcome {
        let (probe, target) = self.select_probe(&node);
        let result = tokio::time::timeout(self.node_check_timeout, probe.probe(&target)).await;
        drop(target);

        let update = match result {
            Ok(Ok(heartbeat)) => Some(update_for(heartbeat)),
            Ok(Err(e)) if node.is_local => {
                warn!(node_id = node.id, node = %node.name, "Local metrics failed, row left unchanged: {}", e);
                None
            }
            Err(_) if node.is_local => {
                warn!(node_id = node.id, node = %node.name, "Local metrics timed out, row left unchanged");
                None
            }
            Ok(Err(e)) => {
                warn!(node_id = node.id, node = %node.name, "Probe failed, marking offline: {}", e);
                Some(NodeUpdate::Offline)
            }
            Err(_) => {
                warn!(node_id = node.id, node = %node.name, timeout = ?self.node_check_timeout, "Check timed out, marking offline");
                Some(NodeUpdate::Offline)
            }
        };

        let Some(update) = update else {
            return CheckOutcome::Unchanged;
        };
        if let Err(e) = self.store.apply(node.id, update).await {
            error!(node_id = node.id, "Failed to persist heartbeat: {}", e);
            return CheckOutcome::Unchanged;
        }

        match update {
            NodeUpdate::Offline => CheckOutcome::Offline,
            NodeUpdate::Metrics(_) | NodeUpdate::Seen => CheckOutcome::Active,
        }
    }

    fn select_probe(&self, node: &ServerNode) -> (Arc<dyn NodeProbe>, ProbeTarget) {
        if node.is_local {
            return (self.local.clone(), node.bare_target());
        }
        if !node.has_credentials() {
            return (self.tcp.clone(), node.bare_target());
        }
        match node.probe_target(self.secrets.as_deref()) {
            Ok(target) => (self.remote.clone(), target),
            Err(e) => {
                // RemoteSshProbe rejects the bare target, so this lands on the TCP fallback
                warn!(node_id = node.id, node = %node.name, "Cannot decrypt SSH credentials: {}", e);
                (self.remote.clone(), node.bare_target())
            }
        }
    }

    /// Warm-up cycle after `warmup`, then one cycle per `interval`
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(interval = ?self.interval, warmup = ?self.warmup, "Starting fleet heartbeat monitor");
        tokio::spawn(async move {
            tokio::time::sleep(self.warmup).await;
            let report = self.run_cycle().await;
            info!(?report, "Warm-up heartbeat cycle done");

            let period = self.interval.max(Duration::from_secs(1));
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = self.run_cycle().await;
                info!(?report, "Heartbeat cycle done");
            }
        })
    }
}

fn update_for(heartbeat: HeartbeatResult) -> NodeUpdate {
    match heartbeat {
        HeartbeatResult { metrics: Some(m), .. } => NodeUpdate::Metrics(m),
        HeartbeatResult { reachable: true, .. } => NodeUpdate::Seen,
        HeartbeatResult { reachable: false, .. } => NodeUpdate::Offline,
    }
}
