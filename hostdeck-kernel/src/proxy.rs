/**
 * TENANT ROUTER - Reverse proxy in front of the per-tenant workers
 *
 * ROLE :
 * Every request under the mount path is resolved to its tenant's worker
 * (spawned on demand) and forwarded to 127.0.0.1:{port}.
 *
 * REWRITING :
 * {mount_path}/{rest}?{query}  ->  {worker.base_url}/{rest}?{query}
 * Hop-by-hop headers are dropped, x-forwarded-prefix carries the mount path.
 *
 * WEBSOCKET :
 * Upgrade requests keep their Connection/Upgrade headers. On a 101 from the
 * worker both connections are upgraded and bytes are copied both ways.
 *
 * ERRORS :
 * - no tenant id       -> 400
 * - worker unavailable -> 503 (plain text, Retry-After)
 * - worker unreachable -> 502
 */

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, HOST, RETRY_AFTER, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{debug, warn};

use crate::config::RouterConf;
use crate::tenants::{TenantError, TenantManager};

type HttpClient = Client<HttpConnector, Body>;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("tenant backend unavailable: {0}")]
    Unavailable(#[from] TenantError),
    #[error("missing or invalid tenant id")]
    MissingTenant,
    #[error("invalid upstream uri: {0}")]
    BadUri(#[from] axum::http::uri::InvalidUri),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ProxyError::Unavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "The file manager is not available right now, please retry in a few seconds.",
            ),
            ProxyError::MissingTenant => (StatusCode::BAD_REQUEST, "Missing tenant id."),
            ProxyError::BadUri(_) => (StatusCode::BAD_REQUEST, "Invalid request path."),
            ProxyError::Upstream(_) => (StatusCode::BAD_GATEWAY, "The file manager did not answer."),
        };
        debug!(%status, "Proxy error response: {}", self);

        let mut response = (status, message).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}

#[derive(Clone)]
pub struct TenantRouter {
    manager: TenantManager,
    client: HttpClient,
    mount: String,
    tenant_header: String,
    base_url: String,
    upstream_host: String,
}

impl TenantRouter {
    pub fn new(manager: TenantManager, conf: &RouterConf) -> Self {
        let worker = &manager.config().worker;
        let base_url = worker.base_url.trim_end_matches('/').to_string();
        let upstream_host = match worker.address.as_str() {
            "" | "0.0.0.0" => "127.0.0.1".to_string(),
            addr => addr.to_string(),
        };

        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            mount: normalize_mount(&conf.mount_path),
            tenant_header: conf.tenant_header.to_ascii_lowercase(),
            base_url,
            upstream_host,
            manager,
        }
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    fn tenant_id(&self, headers: &HeaderMap) -> Result<u32, ProxyError> {
        headers
            .get(self.tenant_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .ok_or(ProxyError::MissingTenant)
    }

    /// Mount prefix swapped for the worker base url, query kept
    fn upstream_path(&self, uri: &Uri) -> String {
        let path = uri.path();
        let rest = path.strip_prefix(self.mount.as_str()).unwrap_or(path);
        let mut out = format!("{}/{}", self.base_url, rest.trim_start_matches('/'));
        if let Some(query) = uri.query() {
            out.push('?');
            out.push_str(query);
        }
        out
    }

    pub async fn forward(&self, mut req: Request) -> Result<Response, ProxyError> {
        let tenant_id = self.tenant_id(req.headers())?;
        let root = self.manager.config().root_for(tenant_id);
        let port = self.manager.get_instance(tenant_id, &root).await.map_err(|e| {
            warn!(tenant_id, "Tenant backend unavailable: {}", e);
            ProxyError::Unavailable(e)
        })?;

        let upgrade = is_upgrade(req.headers());
        let client_upgrade = upgrade.then(|| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();
        parts.uri = format!("http://{}:{}{}", self.upstream_host, port, self.upstream_path(&parts.uri))
            .parse()?;
        strip_hop_headers(&mut parts.headers, upgrade);
        if let Some(host) = parts.headers.remove(HOST) {
            parts.headers.insert("x-forwarded-host", host);
        }
        if let Ok(prefix) = HeaderValue::from_str(&self.mount) {
            parts.headers.insert("x-forwarded-prefix", prefix);
        }
        debug!(tenant_id, port, uri = %parts.uri, upgrade, "Forwarding request");

        let mut response = self.client.request(Request::from_parts(parts, body)).await?;

        match client_upgrade {
            Some(client_side) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                let upstream_side = hyper::upgrade::on(&mut response);
                tokio::spawn(tunnel(tenant_id, client_side, upstream_side));
            }
            _ => strip_hop_headers(response.headers_mut(), false),
        }
        Ok(response.into_response())
    }
}

/// `{mount}`, `{mount}/` and `{mount}/{*rest}` all go to the tenant's worker
pub fn routes(router: TenantRouter) -> Router {
    let mount = router.mount().to_string();
    let app = if mount.is_empty() {
        Router::new().route("/", any(proxy)).route("/{*rest}", any(proxy))
    } else {
        Router::new()
            .route(&mount, any(proxy))
            .route(&format!("{mount}/"), any(proxy))
            .route(&format!("{mount}/{{*rest}}"), any(proxy))
    };
    app.with_state(router)
}

async fn proxy(State(router): State<TenantRouter>, req: Request) -> Result<Response, ProxyError> {
    router.forward(req).await
}

async fn tunnel(tenant_id: u32, client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(tenant_id, "Upgrade failed: {}", e);
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((sent, received)) => debug!(tenant_id, sent, received, "Upgraded connection closed"),
        Err(e) => debug!(tenant_id, "Upgraded connection ended: {}", e),
    }
}

fn normalize_mount(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(UPGRADE)
        && headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

fn strip_hop_headers(headers: &mut HeaderMap, keep_upgrade: bool) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        if keep_upgrade && (name == "connection" || name == "upgrade") {
            continue;
        }
        headers.remove(name);
    }
}
