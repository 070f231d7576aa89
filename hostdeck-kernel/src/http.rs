/**
 * HTTP SURFACE - Control plane server
 *
 * ROUTES :
 * - GET /health         : liveness, no auth
 * - GET /admin/tenants  : live tenant workers
 * - GET /admin/nodes    : fleet table as last written by the heartbeat monitor
 * - {mount_path}/...    : tenant reverse proxy (see proxy.rs)
 *
 * SECURITY :
 * - the /admin routes require the x-api-key header; no configured key means no access
 * - tenant routes trust the tenant header set by the authenticating front layer
 */

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use tracing::{error, warn};

use crate::nodes::{NodeStore, NodeView};
use crate::proxy::{self, TenantRouter};
use crate::tenants::{InstanceInfo, TenantManager};

#[derive(Clone)]
pub struct AppState {
    pub tenants: TenantManager,
    pub nodes: Arc<dyn NodeStore>,
    /// Expected x-api-key value; `None` locks the admin routes
    pub api_key: Option<Arc<str>>,
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        warn!(path = %req.uri().path(), "Admin API key not configured, access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!(path = %req.uri().path(), "Rejected admin request with missing or wrong API key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: AppState, tenant_router: TenantRouter) -> Router {
    let admin = Router::new()
        .route("/admin/tenants", get(list_tenants))
        .route("/admin/nodes", get(list_nodes))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state);

    Router::new()
        .route("/health", get(health))
        .merge(admin)
        .merge(proxy::routes(tenant_router))
}

async fn health() -> &'static str {
    "ok"
}

async fn list_tenants(State(app): State<AppState>) -> Json<Vec<InstanceInfo>> {
    Json(app.tenants.list_instances())
}

async fn list_nodes(State(app): State<AppState>) -> Result<Json<Vec<NodeView>>, StatusCode> {
    match app.nodes.list_nodes().await {
        Ok(nodes) => Ok(Json(nodes.iter().map(NodeView::from).collect())),
        Err(e) => {
            error!("Failed to read node table: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
