use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, path::Path, path::PathBuf, time::Duration};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub tenants: TenantsConf,
    pub router: RouterConf,
    pub fleet: FleetConf,
    /// Name of the env var holding the at-rest encryption key
    pub secret_key_env: SecretKeyEnv,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub listen: SocketAddr,
    pub api_key_env: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TenantsConf {
    pub base_port: u16,
    pub idle_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub readiness_timeout_seconds: u64,
    /// Tenant root path, `{tenant_id}` is substituted
    pub root_template: String,
    /// Worker output lines kept for error reports
    pub output_buffer_lines: usize,
    pub worker: WorkerConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConf {
    pub executable: PathBuf,
    /// Package runner used when `executable` is missing (ex: npx)
    pub fallback_runner: String,
    pub fallback_args: Vec<String>,
    /// Placeholders: {port} {root} {base_url} {address} {tenant_id}
    pub args: Vec<String>,
    pub address: String,
    /// Path prefix the worker serves under
    pub base_url: String,
    pub ready_markers: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouterConf {
    pub mount_path: String,
    /// Header carrying the tenant id, set by the authenticating front layer
    pub tenant_header: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FleetConf {
    pub nodes_file: PathBuf,
    pub interval_seconds: u64,
    pub warmup_seconds: u64,
    pub ssh_connect_timeout_seconds: u64,
    pub ssh_command_timeout_seconds: u64,
    pub tcp_probe_timeout_seconds: u64,
    pub node_check_timeout_seconds: u64,
    pub max_concurrent_checks: usize,
    pub ssh_program: String,
    /// Empty string disables the helper (key-based auth only)
    pub password_helper: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(transparent)]
pub struct SecretKeyEnv(pub String);

impl Default for SecretKeyEnv {
    fn default() -> Self {
        Self("HOSTDECK_SECRET_KEY".into())
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_key_env: "HOSTDECK_API_KEY".into(),
        }
    }
}

impl Default for TenantsConf {
    fn default() -> Self {
        Self {
            base_port: 7000,
            idle_timeout_seconds: 60 * 60,
            sweep_interval_seconds: 30 * 60,
            readiness_timeout_seconds: 15,
            root_template: "/srv/hostdeck/tenants/{tenant_id}".into(),
            output_buffer_lines: 50,
            worker: WorkerConf::default(),
        }
    }
}

impl Default for WorkerConf {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/usr/local/bin/filebrowser"),
            fallback_runner: "npx".into(),
            fallback_args: vec!["--yes".into(), "filebrowser".into()],
            args: [
                "--address", "{address}", "--port", "{port}", "--root", "{root}",
                "--baseurl", "{base_url}", "--noauth",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            address: "127.0.0.1".into(),
            base_url: "/files".into(),
            ready_markers: vec!["Listening on".into(), "Server running at".into()],
            env: HashMap::new(),
        }
    }
}

impl Default for RouterConf {
    fn default() -> Self {
        Self {
            mount_path: "/filemanager".into(),
            tenant_header: "x-tenant-id".into(),
        }
    }
}

impl Default for FleetConf {
    fn default() -> Self {
        Self {
            nodes_file: PathBuf::from("./data/nodes.json"),
            interval_seconds: 5 * 60,
            warmup_seconds: 10,
            ssh_connect_timeout_seconds: 10,
            ssh_command_timeout_seconds: 20,
            tcp_probe_timeout_seconds: 5,
            node_check_timeout_seconds: 60,
            max_concurrent_checks: 8,
            ssh_program: "ssh".into(),
            password_helper: "sshpass".into(),
        }
    }
}

impl TenantsConf {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn root_for(&self, tenant_id: u32) -> PathBuf {
        PathBuf::from(self.root_template.replace("{tenant_id}", &tenant_id.to_string()))
    }
}

impl FleetConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_seconds)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_seconds)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_seconds)
    }

    pub fn tcp_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_probe_timeout_seconds)
    }

    pub fn node_check_timeout(&self) -> Duration {
        Duration::from_secs(self.node_check_timeout_seconds)
    }
}

/// Parse a YAML document; empty means defaults
pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

/// Load the config from `HOSTDECK_CONFIG` (default `hostdeck.yaml`).
/// Missing or invalid files fall back to defaults.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("HOSTDECK_CONFIG").unwrap_or_else(|_| "hostdeck.yaml".into());
    if !Path::new(&path).exists() {
        info!(%path, "No config file, using defaults");
        return KernelConfig::default();
    }

    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    parse_config(&txt).unwrap_or_else(|e| {
        warn!(%path, "Invalid config, using defaults: {e}");
        KernelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.tenants.base_port, 7000);
        assert_eq!(cfg.tenants.idle_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.tenants.sweep_interval(), Duration::from_secs(1800));
        assert_eq!(cfg.tenants.readiness_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.fleet.interval(), Duration::from_secs(300));
        assert_eq!(cfg.fleet.tcp_probe_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.secret_key_env.0, "HOSTDECK_SECRET_KEY");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(
            "tenants:\n  base_port: 9000\n  worker:\n    base_url: /fm\nfleet:\n  interval_seconds: 60\n",
        )
        .unwrap();
        assert_eq!(cfg.tenants.base_port, 9000);
        assert_eq!(cfg.tenants.worker.base_url, "/fm");
        assert_eq!(cfg.tenants.worker.fallback_runner, "npx");
        assert_eq!(cfg.tenants.readiness_timeout_seconds, 15);
        assert_eq!(cfg.fleet.interval(), Duration::from_secs(60));
        assert_eq!(cfg.router.mount_path, "/filemanager");
    }

    #[test]
    fn test_empty_and_invalid_yaml() {
        assert_eq!(parse_config("  \n").unwrap().tenants.base_port, 7000);
        assert!(parse_config("tenants: [oops").is_err());
    }

    #[test]
    fn test_root_template() {
        let cfg = TenantsConf {
            root_template: "/data/{tenant_id}/files".into(),
            ..TenantsConf::default()
        };
        assert_eq!(cfg.root_for(12), PathBuf::from("/data/12/files"));
    }
}
