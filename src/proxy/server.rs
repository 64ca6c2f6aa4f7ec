//! Proxy Server (C6): HTTP listener, host-based router, reverse-proxy
//! forwarding, and the background service health checker.

use crate::proxy::service::Service;
use crate::proxy::websocket;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

type ProxyClient = Client<HttpConnector, Body>;

/// The host-routed reverse-proxy server: owns the live [`Service`] set and
/// the shared outbound HTTP client used to forward non-upgrade requests.
pub struct ProxyServer {
    services: RwLock<HashMap<String, Arc<Service>>>,
    client: ProxyClient,
    health_client: reqwest::Client,
    health_cancel: CancellationToken,
    ready: AtomicBool,
}

impl ProxyServer {
    /// Construct an empty proxy server. Services are added via
    /// [`ProxyServer::add_service`], normally by the Supervisor from
    /// config at startup.
    pub fn new() -> Arc<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(60))
            .build(connector);

        let health_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .expect("failed to build health-check HTTP client");

        Arc::new(Self {
            services: RwLock::new(HashMap::new()),
            client,
            health_client,
            health_cancel: CancellationToken::new(),
            ready: AtomicBool::new(false),
        })
    }

    /// Build the axum router: a single host-routed fallback handler.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(get(dispatch).post(dispatch).put(dispatch).delete(dispatch).patch(dispatch))
            .with_state(self.clone())
    }

    /// Mark the proxy ready (the listener is bound and serving).
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// True once the listener is up.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Add (or, logging a warning, replace) a service. O(1) under the
    /// write lock; route serving uses the read lock and never blocks on
    /// this longer than the map insert itself.
    pub async fn add_service(&self, service: Service) {
        let key = service.name.to_lowercase();
        let mut services = self.services.write().await;
        if services.contains_key(&key) {
            warn!(service = %service.name, "replacing existing service entry");
        }
        services.insert(key, Arc::new(service));
    }

    /// Remove a service by name.
    pub async fn remove_service(&self, name: &str) -> bool {
        self.services.write().await.remove(&name.to_lowercase()).is_some()
    }

    /// Fetch a service by name.
    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().await.get(&name.to_lowercase()).cloned()
    }

    /// Snapshot every configured service.
    pub async fn list_services(&self) -> Vec<Arc<Service>> {
        self.services.read().await.values().cloned().collect()
    }

    async fn route(&self, host: &str) -> Option<Arc<Service>> {
        let host = host.to_lowercase();
        let services = self.services.read().await;
        if let Some(svc) = services.values().find(|s| s.matches_host(&host)) {
            return Some(svc.clone());
        }
        services.values().find(|s| s.default).cloned()
    }

    /// Start the 30s health-check loop.
    pub fn start_health_loop(self: &Arc<Self>) {
        let server = self.clone();
        let cancel = self.health_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                server.health_tick().await;
            }
        });
    }

    /// Stop the health-check loop.
    pub fn stop_health_loop(&self) {
        self.health_cancel.cancel();
    }

    async fn health_tick(&self) {
        let services = self.list_services().await;
        for service in services {
            let url = format!("{}://{}/", service.upstream.scheme_str().unwrap_or("http"), service.upstream_authority());
            let result = self.health_client.get(&url).send().await;

            match result {
                Ok(resp) if resp.status().as_u16() < 500 => {
                    if service.record_health(true, None) {
                        info!(service = %service.name, "service recovered");
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    let recovered = service.record_health(false, Some(format!("status {}", status)));
                    debug_assert!(!recovered);
                    if service.health().consecutive_failures >= 3 {
                        error!(service = %service.name, %status, "service health check failing");
                    }
                }
                Err(e) => {
                    service.record_health(false, Some(e.to_string()));
                    if service.health().consecutive_failures >= 3 {
                        error!(service = %service.name, error = %e, "service health check failing");
                    }
                }
            }
        }
    }
}

fn extract_host(req: &Request<Body>) -> String {
    let raw = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    raw.split(':').next().unwrap_or(raw).to_string()
}

fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    req.headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn dispatch(
    State(server): State<Arc<ProxyServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, handle(server, peer, req)).await {
        Ok(resp) => resp,
        Err(_) => error_response(StatusCode::REQUEST_TIMEOUT, "timeout"),
    }
}

async fn handle(server: Arc<ProxyServer>, peer: SocketAddr, req: Request<Body>) -> Response {
    let host = extract_host(&req);
    let Some(service) = server.route(&host).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if service.websocket && is_websocket_upgrade(&req) {
        return match websocket::proxy_upgrade(req, service.upstream_authority(), service.upstream_host().to_string())
            .await
        {
            Ok(resp) => resp,
            Err(status) => error_response(status, "websocket upgrade failed"),
        };
    }

    forward(&server, &service, peer, req).await
}

async fn forward(server: &Arc<ProxyServer>, service: &Arc<Service>, peer: SocketAddr, req: Request<Body>) -> Response {
    let (mut parts, body) = req.into_parts();

    let inbound_host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let scheme = service.upstream.scheme_str().unwrap_or("http");
    let target: Uri = match format!("{}://{}{}", scheme, service.upstream_authority(), path_and_query).parse() {
        Ok(uri) => uri,
        Err(e) => {
            error!(service = %service.name, error = %e, "failed to build upstream URI");
            return error_response(StatusCode::BAD_GATEWAY, "proxy_error");
        }
    };
    parts.uri = target;

    if let Ok(host_value) = HeaderValue::from_str(service.upstream_host()) {
        parts.headers.insert(axum::http::header::HOST, host_value);
    }

    let existing_xff = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let real_ip = existing_xff
        .as_deref()
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .unwrap_or(&peer.ip().to_string())
        .to_string();

    let new_xff = match &existing_xff {
        Some(existing) => format!("{}, {}", existing, peer.ip()),
        None => peer.ip().to_string(),
    };

    set_header(&mut parts.headers, "X-Real-IP", &real_ip);
    set_header(&mut parts.headers, "X-Forwarded-For", &new_xff);
    set_header(&mut parts.headers, "X-Forwarded-Proto", "http");
    set_header(&mut parts.headers, "X-Forwarded-Host", &inbound_host);

    let proxy_req = Request::from_parts(parts, body);

    match tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, server.client.request(proxy_req)).await {
        Ok(Ok(resp)) => finalize_response(resp),
        Ok(Err(e)) => {
            let (status, kind) = classify_client_error(&e);
            warn!(service = %service.name, error = %e, kind, "proxy request failed");
            error_response(status, kind)
        }
        Err(_) => {
            warn!(service = %service.name, "upstream response header timeout");
            error_response(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
        }
    }
}

fn set_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}

fn finalize_response(resp: Response<hyper::body::Incoming>) -> Response {
    let (mut parts, body) = resp.into_parts();
    parts.headers.remove(axum::http::header::SERVER);
    parts
        .headers
        .insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    parts
        .headers
        .insert("X-Frame-Options", HeaderValue::from_static("SAMEORIGIN"));
    Response::from_parts(parts, Body::new(body))
}

fn classify_client_error(e: &hyper_util::client::legacy::Error) -> (StatusCode, &'static str) {
    let msg = e.to_string().to_lowercase();
    if msg.contains("connection refused") {
        (StatusCode::BAD_GATEWAY, "connection_refused")
    } else if msg.contains("dns") || msg.contains("lookup") || msg.contains("name resolution") {
        (StatusCode::BAD_GATEWAY, "dns_failure")
    } else if msg.contains("timed out") || msg.contains("timeout") {
        (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout")
    } else {
        (StatusCode::BAD_GATEWAY, "proxy_error")
    }
}

fn error_response(status: StatusCode, kind: &str) -> Response {
    let body = format!("Service temporarily unavailable ({})", kind);
    (status, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    fn cfg(name: &str, upstream: &str, default: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            upstream: upstream.to_string(),
            websocket: false,
            default,
            publish_mdns: false,
            jellyfin: false,
            tunnel: None,
        }
    }

    #[tokio::test]
    async fn routes_exact_name_and_local_suffix() {
        let server = ProxyServer::new();
        server.add_service(Service::from_config(&cfg("media", "http://10.0.0.5:8096", false)).unwrap()).await;

        assert!(server.route("media").await.is_some());
        assert!(server.route("media.local").await.is_some());
        assert!(server.route("unknown").await.is_none());
    }

    #[tokio::test]
    async fn falls_back_to_default_service() {
        let server = ProxyServer::new();
        server.add_service(Service::from_config(&cfg("home", "http://10.0.0.6", true)).unwrap()).await;

        let routed = server.route("unknown.local").await.unwrap();
        assert_eq!(routed.name, "home");
    }

    #[tokio::test]
    async fn host_routing_is_case_insensitive() {
        let server = ProxyServer::new();
        server.add_service(Service::from_config(&cfg("media", "http://10.0.0.5:8096", false)).unwrap()).await;

        assert!(server.route("MEDIA.LOCAL").await.is_some());
        assert!(server.route("Media").await.is_some());
    }

    #[tokio::test]
    async fn no_default_and_unknown_host_is_404() {
        let server = ProxyServer::new();
        server.add_service(Service::from_config(&cfg("media", "http://10.0.0.5:8096", false)).unwrap()).await;
        assert!(server.route("unknown.local").await.is_none());
    }

    #[tokio::test]
    async fn remove_service_clears_routing() {
        let server = ProxyServer::new();
        server.add_service(Service::from_config(&cfg("media", "http://10.0.0.5:8096", false)).unwrap()).await;
        assert!(server.remove_service("media").await);
        assert!(server.route("media").await.is_none());
    }
}
