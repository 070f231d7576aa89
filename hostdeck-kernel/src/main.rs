/**
 * HOSTDECK KERNEL - Control plane entry point
 *
 * ROLE : wire config, node table, fleet heartbeat monitor, tenant workers and
 * the HTTP server together; tear the workers down on shutdown.
 */

mod config;
mod crypto;
mod fleet;
mod http;
mod nodes;
mod proxy;
mod tenants;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::load_config;
use crate::crypto::SecretBox;
use crate::fleet::FleetHeartbeatMonitor;
use crate::http::AppState;
use crate::nodes::{JsonNodeStore, NodeStore};
use crate::proxy::TenantRouter;
use crate::tenants::TenantManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hostdeck_kernel=info,hostdeck_probe=info")),
        )
        .init();

    let cfg = load_config().await;

    let secrets = match SecretBox::from_env(&cfg.secret_key_env.0) {
        Ok(sb) => Some(Arc::new(sb)),
        Err(e) => {
            warn!(var = %cfg.secret_key_env.0, "No credential key ({}), SSH nodes fall back to TCP checks", e);
            None
        }
    };

    let store: Arc<dyn NodeStore> = Arc::new(JsonNodeStore::new(&cfg.fleet.nodes_file));
    let monitor = Arc::new(FleetHeartbeatMonitor::new(&cfg.fleet, store.clone(), secrets));
    let heartbeat = monitor.spawn();

    let tenants = TenantManager::new(cfg.tenants.clone());
    let sweeper = tenants.spawn_eviction_sweeper();

    let api_key = std::env::var(&cfg.http.api_key_env)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty());
    if api_key.is_none() {
        warn!(var = %cfg.http.api_key_env, "Admin API key not set, /admin routes are locked");
    }

    let state = AppState {
        tenants: tenants.clone(),
        nodes: store,
        api_key: api_key.map(Arc::from),
    };
    let app = http::build_router(state, TenantRouter::new(tenants.clone(), &cfg.router));

    let listener = TcpListener::bind(cfg.http.listen)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.listen))?;
    info!(addr = %cfg.http.listen, mount = %cfg.router.mount_path, "Hostdeck kernel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    heartbeat.abort();
    sweeper.abort();
    tenants.shutdown_all().await;
    info!("Hostdeck kernel stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
