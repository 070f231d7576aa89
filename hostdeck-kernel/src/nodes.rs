/**
 * NODE TABLE - Fleet machines and their last heartbeat
 *
 * ROLE : read the node rows written by the registration flow, write back the
 * heartbeat columns (status, last_seen, cpu/ram/disk usage, uptime).
 *
 * STORAGE : JSON file, re-read on every listing so new rows show up on the
 * next tick. Writes replace the file atomically.
 *
 * LOCKING : every read-modify-write holds an exclusive flock on the sidecar
 * `<table>.lock`. Registration tooling writing the same table must take that
 * lock too, or rows it adds can be overwritten by a heartbeat write.
 */

use async_trait::async_trait;
use hostdeck_probe::{NodeMetrics, ProbeTarget, SshCredentials};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::crypto::{CryptoError, SecretBox};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown node: {0}")]
    UnknownNode(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    #[default]
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNode {
    pub id: i64,
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub is_local: bool,
    #[serde(default)]
    pub ssh_user: Option<String>,
    /// Sealed with the control-plane key, see `crypto`
    #[serde(default)]
    pub ssh_password: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub ram_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub uptime: f64,
}

impl ServerNode {
    pub fn has_credentials(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.ssh_user) && filled(&self.ssh_password)
    }

    /// Probe input; the password is decrypted here and lives only as long as the target
    pub fn probe_target(&self, secrets: Option<&SecretBox>) -> Result<ProbeTarget, CryptoError> {
        let credentials = if self.is_local || !self.has_credentials() {
            None
        } else {
            let secrets = secrets.ok_or(CryptoError::InvalidKey)?;
            let sealed = self.ssh_password.as_deref().unwrap_or_default();
            Some(SshCredentials {
                user: self.ssh_user.clone().unwrap_or_default(),
                password: secrets.open(sealed)?,
            })
        };

        Ok(ProbeTarget {
            name: self.name.clone(),
            ip: self.ip.clone(),
            ssh_port: self.ssh_port,
            credentials,
        })
    }

    /// Same target without credentials, used when decryption fails
    pub fn bare_target(&self) -> ProbeTarget {
        ProbeTarget {
            name: self.name.clone(),
            ip: self.ip.clone(),
            ssh_port: self.ssh_port,
            credentials: None,
        }
    }

    pub fn apply(&mut self, update: &NodeUpdate, now: OffsetDateTime) {
        match update {
            NodeUpdate::Metrics(m) => {
                self.status = NodeStatus::Active;
                self.last_seen = Some(now);
                self.cpu_usage = m.cpu_usage;
                self.ram_usage = m.ram_usage;
                self.disk_usage = m.disk_usage;
                self.uptime = m.uptime;
            }
            NodeUpdate::Seen => {
                self.status = NodeStatus::Active;
                self.last_seen = Some(now);
            }
            NodeUpdate::Offline => {
                self.status = NodeStatus::Offline;
            }
        }
    }
}

/// Admin view of a node; secrets are never serialized
#[derive(Debug, Serialize)]
pub struct NodeView {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub is_local: bool,
    pub has_credentials: bool,
    pub status: NodeStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub disk_usage: f64,
    pub uptime: f64,
}

impl From<&ServerNode> for NodeView {
    fn from(n: &ServerNode) -> Self {
        Self {
            id: n.id,
            name: n.name.clone(),
            ip: n.ip.clone(),
            is_local: n.is_local,
            has_credentials: n.has_credentials(),
            status: n.status,
            last_seen: n.last_seen,
            cpu_usage: n.cpu_usage,
            ram_usage: n.ram_usage,
            disk_usage: n.disk_usage,
            uptime: n.uptime,
        }
    }
}

/// Heartbeat write for one row
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeUpdate {
    /// status=active, last_seen=now, all four metrics
    Metrics(NodeMetrics),
    /// status=active, last_seen=now, metrics untouched
    Seen,
    /// status=offline, metrics and last_seen untouched
    Offline,
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<ServerNode>, StoreError>;
    async fn apply(&self, id: i64, update: NodeUpdate) -> Result<(), StoreError>;
}

pub struct JsonNodeStore {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonNodeStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: lock_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Sidecar file every writer of the table must flock
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Exclusive table lock, released when the returned guard drops
    async fn lock_table(&self) -> Result<Flock<File>, StoreError> {
        let path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || lock_file(&path))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn read_all(&self) -> Result<Vec<ServerNode>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_all(&self, nodes: &[ServerNode]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(nodes)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeStore for JsonNodeStore {
    async fn list_nodes(&self) -> Result<Vec<ServerNode>, StoreError> {
        let nodes = self.read_all().await?;
        for n in nodes.iter().filter(|n| n.is_local && n.has_credentials()) {
            warn!(node_id = n.id, node = %n.name, "Local node carries SSH credentials, ignoring them");
        }
        Ok(nodes)
    }

    async fn apply(&self, id: i64, update: NodeUpdate) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let _table = self.lock_table().await?;
        let mut nodes = self.read_all().await?;
        let node = nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(StoreError::UnknownNode(id))?;
        node.apply(&update, OffsetDateTime::now_utc());
        debug!(node_id = id, status = ?node.status, "Node row updated");
        self.write_all(&nodes).await
    }
}

/// Blocking exclusive flock on `path`, created if missing
pub fn lock_file(path: &Path) -> Result<Flock<File>, StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_file, errno)| StoreError::Io(errno.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostdeck_devkit::{local_node, remote_node, write_nodes_file};
    use std::sync::Arc;
    use std::time::Duration;

    fn metrics() -> NodeMetrics {
        NodeMetrics {
            cpu_usage: 95.0,
            ram_usage: 50.0,
            disk_usage: 42.0,
            uptime: 123456.78,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonNodeStore::new(dir.path().join("nodes.json"));
        assert!(store.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_updates_only_target_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        write_nodes_file(&path, &[local_node(1), remote_node(2, "10.0.0.2", 22)]).unwrap();
        let store = JsonNodeStore::new(&path);

        store.apply(1, NodeUpdate::Metrics(metrics())).await.unwrap();
        store.apply(2, NodeUpdate::Offline).await.unwrap();

        let nodes = store.list_nodes().await.unwrap();
        let local = nodes.iter().find(|n| n.id == 1).unwrap();
        assert_eq!(local.status, NodeStatus::Active);
        assert!(local.last_seen.is_some());
        assert_eq!(local.cpu_usage, 95.0);
        assert_eq!(local.uptime, 123456.78);

        let remote = nodes.iter().find(|n| n.id == 2).unwrap();
        assert_eq!(remote.status, NodeStatus::Offline);
        assert_eq!(remote.cpu_usage, 11.0);
        assert_eq!(remote.disk_usage, 33.0);
        assert!(remote.last_seen.is_none());
    }

    #[tokio::test]
    async fn test_seen_keeps_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        write_nodes_file(&path, &[remote_node(5, "10.0.0.5", 22)]).unwrap();
        let store = JsonNodeStore::new(&path);

        store.apply(5, NodeUpdate::Seen).await.unwrap();
        let node = store.list_nodes().await.unwrap().remove(0);
        assert_eq!(node.status, NodeStatus::Active);
        assert!(node.last_seen.is_some());
        assert_eq!(node.ram_usage, 22.0);

        assert!(matches!(
            store.apply(99, NodeUpdate::Seen).await,
            Err(StoreError::UnknownNode(99))
        ));
    }

    #[tokio::test]
    async fn test_apply_waits_for_registration_and_keeps_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        write_nodes_file(&path, &[remote_node(1, "10.0.0.1", 22)]).unwrap();
        let store = Arc::new(JsonNodeStore::new(&path));
        store.apply(1, NodeUpdate::Offline).await.unwrap();

        // registration takes the table lock and appends a row
        let registration = lock_file(store.lock_path()).unwrap();
        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.apply(1, NodeUpdate::Seen).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pending.is_finished());
        write_nodes_file(&path, &[remote_node(1, "10.0.0.1", 22), remote_node(2, "10.0.0.2", 22)]).unwrap();
        drop(registration);

        pending.await.unwrap().unwrap();
        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.iter().find(|n| n.id == 1).unwrap().status, NodeStatus::Active);
        assert!(nodes.iter().any(|n| n.id == 2));
    }

    #[test]
    fn test_lock_path_is_sidecar() {
        let store = JsonNodeStore::new("/var/lib/hostdeck/nodes.json");
        assert_eq!(store.lock_path(), Path::new("/var/lib/hostdeck/nodes.json.lock"));
    }

    #[test]
    fn test_probe_target_decrypts_password() {
        let secrets = SecretBox::from_key_material("k").unwrap();
        let mut value = remote_node(3, "10.0.0.3", 2200);
        value["ssh_user"] = "root".into();
        value["ssh_password"] = secrets.seal("pw").unwrap().into();
        let node: ServerNode = serde_json::from_value(value).unwrap();

        assert!(node.has_credentials());
        let target = node.probe_target(Some(&secrets)).unwrap();
        assert_eq!(target.ssh_port(), 2200);
        let creds = target.credentials.unwrap();
        assert_eq!(creds.user, "root");
        assert_eq!(creds.password, "pw");

        assert!(node.probe_target(None).is_err());
    }

    #[test]
    fn test_local_node_never_gets_credentials() {
        let secrets = SecretBox::from_key_material("k").unwrap();
        let mut value = local_node(1);
        value["ssh_user"] = "root".into();
        value["ssh_password"] = secrets.seal("pw").unwrap().into();
        let node: ServerNode = serde_json::from_value(value).unwrap();
        assert!(node.probe_target(Some(&secrets)).unwrap().credentials.is_none());
    }

    #[test]
    fn test_view_hides_password() {
        let mut value = remote_node(3, "10.0.0.3", 22);
        value["ssh_user"] = "root".into();
        value["ssh_password"] = "c2VhbGVk".into();
        let node: ServerNode = serde_json::from_value(value).unwrap();
        let json = serde_json::to_string(&NodeView::from(&node)).unwrap();
        assert!(json.contains("\"has_credentials\":true"));
        assert!(!json.contains("c2VhbGVk"));
    }
}
