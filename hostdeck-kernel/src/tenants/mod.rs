/**
 * TENANT MANAGER - One file-manager worker process per tenant
 *
 * ROLE :
 * Spawn a worker the first time a tenant is routed, hand its port back to the
 * proxy, reuse it while it lives, evict it once idle.
 *
 * LIFECYCLE :
 * - get_instance : live Running entry -> refresh last_access, return port
 *                  otherwise -> spawn, wait for a readiness line on stdout
 * - Starting     : inserted at spawn, flipped to Running on readiness
 * - exit         : the supervisor task removes its own entry (matched on instance_id)
 * - idle         : evict_idle() kills entries untouched for idle_timeout
 *
 * CONCURRENCY :
 * Check-then-spawn is serialized per tenant. The startup itself runs in a
 * detached task, so a caller going away never leaves a half-started worker.
 */

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TenantsConf;

mod launch;
mod readiness;

use launch::{ExecutableResolver, ProcessSpec};
use readiness::{LineSplitter, OutputTail, ReadinessDetector};

/// How long a killed worker gets to be reaped
const KILL_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for buffered output after an early exit
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);
/// Read size for worker pipes
const OUTPUT_CHUNK: usize = 8 * 1024;

type Shared<T> = Arc<Mutex<T>>;

#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    #[error("worker for tenant {tenant_id} not ready after {timeout:?}")]
    SpawnTimeout { tenant_id: u32, timeout: Duration },
    #[error("worker for tenant {tenant_id} exited before ready ({status})")]
    SpawnFailure {
        tenant_id: u32,
        status: String,
        /// Tail of the worker output, for logs only
        output: String,
    },
    #[error("cannot launch worker for tenant {tenant_id}: {source}")]
    SpawnError {
        tenant_id: u32,
        #[source]
        source: io::Error,
    },
    #[error("tenant {tenant_id} has no port: base port {base_port} + id exceeds 65535")]
    PortOutOfRange { tenant_id: u32, base_port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Starting,
    Running,
}

#[derive(Debug, Clone)]
enum WorkerExit {
    Status(ExitStatus),
    WaitFailed(String),
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Status(status) => write!(f, "{status}"),
            WorkerExit::WaitFailed(e) => write!(f, "wait failed: {e}"),
        }
    }
}

/// Registry entry; the process itself is owned by its supervisor task
struct TenantInstance {
    instance_id: Uuid,
    port: u16,
    pid: Option<u32>,
    state: InstanceState,
    last_access: Instant,
    started_at: OffsetDateTime,
    /// Dropping or firing this kills the worker
    kill: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<WorkerExit>>,
}

impl TenantInstance {
    /// Not killed and no exit recorded
    fn is_alive(&self) -> bool {
        self.kill.is_some() && self.exited.borrow().is_none()
    }

    fn is_idle(&self, now: Instant, threshold: Duration) -> bool {
        self.state == InstanceState::Running && now.saturating_duration_since(self.last_access) > threshold
    }

    async fn terminate(mut self) -> Option<WorkerExit> {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        wait_exit(&mut self.exited, KILL_GRACE).await
    }
}

/// Snapshot of one registry entry for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInfo {
    pub tenant_id: u32,
    pub port: u16,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub idle_seconds: u64,
    pub instance_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct TenantManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    conf: TenantsConf,
    resolver: ExecutableResolver,
    registry: Shared<HashMap<u32, TenantInstance>>,
    spawn_locks: Shared<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantManager {
    pub fn new(conf: TenantsConf) -> Self {
        let resolver = ExecutableResolver::new(&conf.worker);
        Self {
            inner: Arc::new(ManagerInner {
                conf,
                resolver,
                registry: Arc::new(Mutex::new(HashMap::new())),
                spawn_locks: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn config(&self) -> &TenantsConf {
        &self.inner.conf
    }

    /// `base_port + tenant_id`, rejected past 65535
    pub fn port_for(&self, tenant_id: u32) -> Result<u16, TenantError> {
        let base_port = self.inner.conf.base_port;
        u16::try_from(tenant_id)
            .ok()
            .and_then(|id| base_port.checked_add(id))
            .ok_or(TenantError::PortOutOfRange { tenant_id, base_port })
    }

    /// Port of a live, ready worker for this tenant, spawning one if needed
    pub async fn get_instance(&self, tenant_id: u32, root: &Path) -> Result<u16, TenantError> {
        if let Some(port) = self.touch_running(tenant_id) {
            return Ok(port);
        }
        let port = self.port_for(tenant_id)?;

        let guard = self.spawn_lock(tenant_id).lock_owned().await;
        let this = self.clone();
        let root = root.to_path_buf();
        let startup = tokio::spawn(async move {
            let _guard = guard;
            // another caller may have finished the spawn while we waited
            if let Some(port) = this.touch_running(tenant_id) {
                return Ok(port);
            }
            this.start_instance(tenant_id, port, &root).await
        });

        startup.await.map_err(|e| TenantError::SpawnError {
            tenant_id,
            source: io::Error::other(e),
        })?
    }

    fn touch_running(&self, tenant_id: u32) -> Option<u16> {
        let mut registry = self.inner.registry.lock();
        let instance = registry.get_mut(&tenant_id)?;
        if instance.is_alive() {
            if instance.state == InstanceState::Running {
                instance.last_access = Instant::now();
                return Some(instance.port);
            }
            return None;
        }
        if instance.state == InstanceState::Running {
            info!(tenant_id, "Worker is gone, discarding stale instance");
            registry.remove(&tenant_id);
        }
        None
    }

    fn spawn_lock(&self, tenant_id: u32) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.spawn_locks.lock().entry(tenant_id).or_default().clone()
    }

    /// Remove the entry only if it still belongs to this instance
    fn forget(&self, tenant_id: u32, instance_id: Uuid) -> Option<TenantInstance> {
        let mut registry = self.inner.registry.lock();
        match registry.get(&tenant_id) {
            Some(i) if i.instance_id == instance_id => registry.remove(&tenant_id),
            _ => None,
        }
    }

    async fn start_instance(&self, tenant_id: u32, port: u16, root: &Path) -> Result<u16, TenantError> {
        let conf = &self.inner.conf;
        if let Err(e) = tokio::fs::create_dir_all(root).await {
            warn!(tenant_id, root = %root.display(), "Cannot create tenant root, starting anyway: {}", e);
        }

        let spec = ProcessSpec::build(&conf.worker, tenant_id, port, root);
        let mut child = self.launch(&spec)?;
        let pid = child.id();
        let instance_id = Uuid::new_v4();

        let tail = Arc::new(Mutex::new(OutputTail::new(conf.output_buffer_lines)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let detector = ReadinessDetector::new(&conf.worker.ready_markers);
            readers.push(tokio::spawn(pump_output(
                stdout,
                tenant_id,
                "stdout",
                tail.clone(),
                Some((detector, ready_tx)),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(stderr, tenant_id, "stderr", tail.clone(), None)));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, mut exit_rx) = watch::channel(None);
        self.inner.registry.lock().insert(
            tenant_id,
            TenantInstance {
                instance_id,
                port,
                pid,
                state: InstanceState::Starting,
                last_access: Instant::now(),
                started_at: OffsetDateTime::now_utc(),
                kill: Some(kill_tx),
                exited: exit_rx.clone(),
            },
        );
        tokio::spawn(supervise(
            child,
            kill_rx,
            exit_tx,
            self.inner.registry.clone(),
            tenant_id,
            instance_id,
        ));
        info!(tenant_id, port, ?pid, %instance_id, "Worker starting");

        let ready = async {
            // stdout closed without a marker: leave it to the exit or timeout branch
            if ready_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        let timeout = conf.readiness_timeout();

        tokio::select! {
            biased;
            _ = ready => {
                if let Some(instance) = self
                    .inner
                    .registry
                    .lock()
                    .get_mut(&tenant_id)
                    .filter(|i| i.instance_id == instance_id)
                {
                    instance.state = InstanceState::Running;
                    instance.last_access = Instant::now();
                }
                info!(tenant_id, port, "Worker ready");
                Ok(port)
            }
            exit = exit_of(&mut exit_rx) => {
                let status = exit.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into());
                let _ = tokio::time::timeout(OUTPUT_DRAIN, futures::future::join_all(readers)).await;
                let output = tail.lock().render();
                warn!(tenant_id, %status, "Worker exited before ready");
                self.forget(tenant_id, instance_id);
                Err(TenantError::SpawnFailure { tenant_id, status, output })
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(tenant_id, ?timeout, "Worker not ready in time, killing it");
                if let Some(instance) = self.forget(tenant_id, instance_id) {
                    if instance.terminate().await.is_none() {
                        warn!(tenant_id, "Worker still not reaped after kill");
                    }
                }
                Err(TenantError::SpawnTimeout { tenant_id, timeout })
            }
        }
    }

    /// First candidate that launches wins; only a missing executable moves on to the next
    fn launch(&self, spec: &ProcessSpec) -> Result<Child, TenantError> {
        let mut last_err = None;
        for candidate in self.inner.resolver.candidates(spec) {
            let mut cmd = Command::new(&candidate.program);
            cmd.args(&candidate.args)
                .envs(spec.env.iter().map(|(k, v)| (k, v)))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match cmd.spawn() {
                Ok(child) => {
                    debug!(tenant_id = spec.tenant_id, program = %candidate.program.display(), "Worker launched");
                    return Ok(child);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(
                        tenant_id = spec.tenant_id,
                        program = %candidate.program.display(),
                        "Worker executable not found, trying next candidate"
                    );
                    last_err = Some(e);
                }
                Err(e) => {
                    return Err(TenantError::SpawnError {
                        tenant_id: spec.tenant_id,
                        source: e,
                    })
                }
            }
        }

        Err(TenantError::SpawnError {
            tenant_id: spec.tenant_id,
            source: last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "no worker executable available")
            }),
        })
    }

    /// One eviction sweep: kills every Running worker idle for longer than `idle_timeout`
    pub async fn evict_idle(&self, now: Instant) -> Vec<u32> {
        let threshold = self.inner.conf.idle_timeout();
        let candidates: Vec<u32> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, i)| i.is_idle(now, threshold))
            .map(|(id, _)| *id)
            .collect();

        let mut evicted = Vec::new();
        for tenant_id in candidates {
            // hold the spawn lock so no new worker grabs the port while the old one dies
            let lock = self.spawn_lock(tenant_id);
            let _guard = lock.lock().await;

            let instance = {
                let mut registry = self.inner.registry.lock();
                match registry.get(&tenant_id) {
                    Some(i) if i.is_idle(now, threshold) => registry.remove(&tenant_id),
                    _ => None,
                }
            };
            if let Some(instance) = instance {
                info!(tenant_id, port = instance.port, "Evicting idle worker");
                if instance.terminate().await.is_none() {
                    warn!(tenant_id, "Evicted worker still not reaped after kill");
                }
                evicted.push(tenant_id);
            }
        }
        evicted
    }

    pub fn spawn_eviction_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.inner.conf.sweep_interval().max(Duration::from_secs(1));
        info!(?period, idle_timeout = ?self.inner.conf.idle_timeout(), "Starting idle worker sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = this.evict_idle(Instant::now()).await;
                if !evicted.is_empty() {
                    info!(?evicted, "Idle sweep done");
                }
            }
        })
    }

    pub fn list_instances(&self) -> Vec<InstanceInfo> {
        let now = Instant::now();
        let mut out: Vec<InstanceInfo> = self
            .inner
            .registry
            .lock()
            .iter()
            .map(|(tenant_id, i)| InstanceInfo {
                tenant_id: *tenant_id,
                port: i.port,
                state: i.state,
                pid: i.pid,
                idle_seconds: now.saturating_duration_since(i.last_access).as_secs(),
                instance_id: i.instance_id.to_string(),
                started_at: i.started_at,
            })
            .collect();
        out.sort_by_key(|i| i.tenant_id);
        out
    }

    /// Kill every worker, used on graceful shutdown
    pub async fn shutdown_all(&self) {
        let instances: Vec<(u32, TenantInstance)> = self.inner.registry.lock().drain().collect();
        if instances.is_empty() {
            return;
        }

        info!(count = instances.len(), "Stopping all tenant workers");
        futures::future::join_all(instances.into_iter().map(|(tenant_id, instance)| async move {
            if instance.terminate().await.is_none() {
                warn!(tenant_id, "Worker did not exit in time");
            }
        }))
        .await;
    }
}

/// Owns the child until it exits, then records the exit and drops its registry entry
async fn supervise(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    registry: Shared<HashMap<u32, TenantInstance>>,
    tenant_id: u32,
    instance_id: Uuid,
) {
    let waited = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                warn!(tenant_id, "Failed to kill worker: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match waited {
        Ok(status) => WorkerExit::Status(status),
        Err(e) => WorkerExit::WaitFailed(e.to_string()),
    };
    info!(tenant_id, %instance_id, %exit, "Worker exited");
    exit_tx.send_replace(Some(exit));

    let mut registry = registry.lock();
    if registry.get(&tenant_id).is_some_and(|i| i.instance_id == instance_id) {
        registry.remove(&tenant_id);
        debug!(tenant_id, "Instance removed from registry");
    }
}

/// Drain one worker pipe until EOF. Dropping the pipe early would kill the
/// worker with SIGPIPE on its next write, so decode problems never stop the loop.
async fn pump_output<R>(
    mut stream: R,
    tenant_id: u32,
    stream_name: &'static str,
    tail: Shared<OutputTail>,
    mut readiness: Option<(ReadinessDetector, oneshot::Sender<()>)>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    let mut splitter = LineSplitter::default();
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(tenant_id, stream = stream_name, "Worker output read failed: {}", e);
                break;
            }
        };
        let chunk = &buf[..n];

        let is_ready = readiness
            .as_mut()
            .is_some_and(|(detector, _)| detector.observe(chunk));
        if is_ready {
            if let Some((_, ready)) = readiness.take() {
                let _ = ready.send(());
            }
        }
        for line in splitter.push(chunk) {
            record_line(tenant_id, stream_name, &tail, line);
        }
    }
    if let Some(line) = splitter.finish() {
        record_line(tenant_id, stream_name, &tail, line);
    }
}

fn record_line(tenant_id: u32, stream_name: &'static str, tail: &Shared<OutputTail>, line: String) {
    debug!(tenant_id, stream = stream_name, "{}", line);
    tail.lock().push(line);
}

async fn exit_of(rx: &mut watch::Receiver<Option<WorkerExit>>) -> Option<WorkerExit> {
    rx.wait_for(Option::is_some).await.ok().and_then(|e| (*e).clone())
}

async fn wait_exit(rx: &mut watch::Receiver<Option<WorkerExit>>, limit: Duration) -> Option<WorkerExit> {
    tokio::time::timeout(limit, exit_of(rx)).await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConf;
    use hostdeck_devkit::{FakeWorker, WorkerBehaviour};
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    fn conf_for(worker: &FakeWorker) -> TenantsConf {
        TenantsConf {
            base_port: 7000,
            readiness_timeout_seconds: 2,
            root_template: worker.dir().join("roots/{tenant_id}").to_string_lossy().to_string(),
            worker: WorkerConf {
                executable: worker.path().to_path_buf(),
                fallback_runner: String::new(),
                ..WorkerConf::default()
            },
            ..TenantsConf::default()
        }
    }

    fn pid_alive(pid: i32) -> bool {
        kill(Pid::from_raw(pid), None).is_ok()
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_second_call_reuses_worker() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(7);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(7, &root).await.unwrap(), 7007);
        assert_eq!(manager.get_instance(7, &root).await.unwrap(), 7007);
        assert_eq!(worker.spawn_count(), 1);
        assert!(root.is_dir());

        let args = worker.last_args();
        assert!(args.windows(2).any(|w| w == ["--port", "7007"]));
        assert!(args.windows(2).any(|w| w[0] == "--root" && w[1] == root.to_string_lossy()));

        let instances = manager.list_instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Running);

        manager.shutdown_all().await;
        assert!(!pid_alive(worker.pids()[0]));
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_spawn_once() {
        let worker = FakeWorker::new(WorkerBehaviour::SlowReady(Duration::from_millis(300))).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(3);
        let manager = TenantManager::new(conf);

        let calls = (0..16).map(|_| manager.get_instance(3, &root));
        let ports = futures::future::join_all(calls).await;
        assert!(ports.iter().all(|p| matches!(p, Ok(7003))));
        assert_eq!(worker.spawn_count(), 1);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_external_kill_respawns_on_same_port() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(5);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(5, &root).await.unwrap(), 7005);
        kill(Pid::from_raw(worker.pids()[0]), Signal::SIGKILL).unwrap();
        assert!(eventually(|| manager.list_instances().is_empty()).await);

        assert_eq!(manager.get_instance(5, &root).await.unwrap(), 7005);
        assert_eq!(worker.spawn_count(), 2);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_idle_worker_is_evicted_then_respawned() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(9);
        let manager = TenantManager::new(conf);

        manager.get_instance(9, &root).await.unwrap();
        assert!(manager.evict_idle(Instant::now()).await.is_empty());

        let later = Instant::now() + Duration::from_secs(60 * 60 + 1);
        assert_eq!(manager.evict_idle(later).await, vec![9]);
        assert!(manager.list_instances().is_empty());
        assert!(!pid_alive(worker.pids()[0]));

        manager.get_instance(9, &root).await.unwrap();
        assert_eq!(worker.spawn_count(), 2);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_silent_worker_times_out_and_is_killed() {
        let worker = FakeWorker::new(WorkerBehaviour::Silent).unwrap();
        let conf = TenantsConf {
            readiness_timeout_seconds: 1,
            ..conf_for(&worker)
        };
        let root = conf.root_for(1);
        let manager = TenantManager::new(conf);

        let err = manager.get_instance(1, &root).await.unwrap_err();
        assert!(matches!(err, TenantError::SpawnTimeout { tenant_id: 1, .. }));
        assert!(manager.list_instances().is_empty());
        assert!(!pid_alive(worker.pids()[0]));
    }

    #[tokio::test]
    async fn test_crash_before_ready_is_spawn_failure() {
        let worker = FakeWorker::new(WorkerBehaviour::CrashBeforeReady).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(2);
        let manager = TenantManager::new(conf);

        match manager.get_instance(2, &root).await {
            Err(TenantError::SpawnFailure { status, output, .. }) => {
                assert!(status.contains('3'), "status: {status}");
                assert!(output.contains("fatal: cannot open root"), "output: {output}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(manager.list_instances().is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable_and_runner_is_spawn_error() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let mut conf = conf_for(&worker);
        conf.worker.executable = worker.dir().join("missing-worker");
        conf.worker.fallback_runner = worker.dir().join("missing-npx").to_string_lossy().to_string();
        let root = conf.root_for(4);
        let manager = TenantManager::new(conf);

        let err = manager.get_instance(4, &root).await.unwrap_err();
        assert!(matches!(err, TenantError::SpawnError { tenant_id: 4, .. }));
        assert_eq!(worker.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_runner_fallback_when_primary_missing() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let mut conf = conf_for(&worker);
        conf.worker.executable = worker.dir().join("missing-worker");
        conf.worker.fallback_runner = worker.path().to_string_lossy().to_string();
        let root = conf.root_for(6);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(6, &root).await.unwrap(), 7006);
        let args = worker.last_args();
        assert_eq!(&args[..3], &["--yes", "filebrowser", "--address"]);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_exit_after_ready_drops_entry() {
        let worker = FakeWorker::new(WorkerBehaviour::ReadyThenExit(Duration::from_millis(300))).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(8);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(8, &root).await.unwrap(), 7008);
        assert!(eventually(|| manager.list_instances().is_empty()).await);

        manager.get_instance(8, &root).await.unwrap();
        assert_eq!(worker.spawn_count(), 2);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_worker_alive() {
        let worker = FakeWorker::new(WorkerBehaviour::BinaryNoise).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(11);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(11, &root).await.unwrap(), 7011);
        // past the post-readiness writes
        tokio::time::sleep(Duration::from_secs(1)).await;

        let instances = manager.list_instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Running);
        assert!(pid_alive(worker.pids()[0]));
        assert_eq!(worker.spawn_count(), 1);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_marker_without_newline_is_ready() {
        let worker = FakeWorker::new(WorkerBehaviour::ReadyWithoutNewline).unwrap();
        let conf = conf_for(&worker);
        let root = conf.root_for(12);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.get_instance(12, &root).await.unwrap(), 7012);
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_sweeper_evicts_idle_worker() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let conf = TenantsConf {
            idle_timeout_seconds: 60,
            sweep_interval_seconds: 30,
            ..conf_for(&worker)
        };
        let root = conf.root_for(13);
        let manager = TenantManager::new(conf);
        manager.get_instance(13, &root).await.unwrap();

        tokio::time::pause();
        let sweeper = manager.spawn_eviction_sweeper();

        // first sweep at 30s: not idle yet
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(manager.list_instances().len(), 1);

        // idle for over a minute by the 60s or 90s sweep
        tokio::time::sleep(Duration::from_secs(60)).await;
        let mut gone = false;
        for _ in 0..10 {
            if manager.list_instances().is_empty() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(gone);

        sweeper.abort();
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_port_out_of_range() {
        let worker = FakeWorker::new(WorkerBehaviour::Ready).unwrap();
        let conf = TenantsConf {
            base_port: 65_000,
            ..conf_for(&worker)
        };
        let root = conf.root_for(1000);
        let manager = TenantManager::new(conf);

        assert_eq!(manager.port_for(535).unwrap(), 65_535);
        let err = manager.get_instance(1000, &root).await.unwrap_err();
        assert!(matches!(err, TenantError::PortOutOfRange { tenant_id: 1000, base_port: 65_000 }));
        assert_eq!(worker.spawn_count(), 0);
    }
}
