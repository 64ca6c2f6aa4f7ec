//! Token-authenticated management REST API (part of C9): service and
//! tunnel CRUD, tunnel restart, system restart/shutdown, status, logs,
//! health and readiness probes.

use crate::config::{ServiceConfig, TunnelConfig};
use crate::error::FinGuardError;
use crate::supervisor::{ServiceStatusView, Supervisor, TunnelStatusView};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Build the full API + probe router over a started [`Supervisor`].
pub fn router(supervisor: Arc<Supervisor>) -> Router {
    let protected = Router::new()
        .route("/api/v1/services", get(list_services).post(create_service))
        .route("/api/v1/services/:name", get(get_service).delete(delete_service))
        .route("/api/v1/tunnels", get(list_tunnels).post(create_tunnel))
        .route("/api/v1/tunnels/:name", get(get_tunnel).delete(delete_tunnel))
        .route("/api/v1/tunnels/restart/:name", post(restart_tunnel))
        .route("/api/v1/system/restart", post(system_restart))
        .route("/api/v1/system/shutdown", post(system_shutdown))
        .route("/api/v1/status", get(status))
        .route("/api/v1/logs", get(logs))
        .layer(middleware::from_fn_with_state(supervisor.clone(), auth_middleware));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(protected)
        .with_state(supervisor)
}

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        success: true,
        message: None,
        data: Some(data),
        error: None,
    })
    .into_response()
}

fn ok_null() -> Response {
    Json(Envelope::<()> {
        success: true,
        message: None,
        data: None,
        error: None,
    })
    .into_response()
}

fn envelope_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(Envelope::<()> {
            success: false,
            message: None,
            data: None,
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

fn error_response(e: FinGuardError) -> Response {
    let status = e.status_code();
    envelope_error(status, &e.to_string())
}

/// Bearer-token auth: `Authorization: Bearer <token>` or `?token=<token>`.
async fn auth_middleware(State(supervisor): State<Arc<Supervisor>>, request: Request, next: Next) -> Response {
    let expected = supervisor.admin_token().await;
    let provided = bearer_header(&request).or_else(|| query_token(&request));

    match provided {
        Some(token) if constant_time_eq(&token, &expected) => next.run(request).await,
        _ => envelope_error(StatusCode::UNAUTHORIZED, "invalid or missing admin token"),
    }
}

/// Compares two strings without short-circuiting on the first mismatched
/// byte, so response latency doesn't leak how much of a guessed token is
/// correct.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn bearer_header(request: &Request) -> Option<String> {
    request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next()? == "token" {
            return Some(parts.next().unwrap_or("").to_string());
        }
    }
    None
}

async fn healthz() -> &'static str {
    "alive"
}

async fn readyz(State(supervisor): State<Arc<Supervisor>>) -> Response {
    if supervisor.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn list_services(State(supervisor): State<Arc<Supervisor>>) -> Response {
    let views: Vec<ServiceStatusView> = supervisor.list_services().await.into_iter().map(ServiceStatusView::from).collect();
    ok_response(views)
}

async fn create_service(State(supervisor): State<Arc<Supervisor>>, Json(body): Json<ServiceConfig>) -> Response {
    match supervisor.add_service(body).await {
        Ok(service) => ok_response(ServiceStatusView::from(service)),
        Err(e) => error_response(e),
    }
}

async fn get_service(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Response {
    match supervisor.get_service(&name).await {
        Some(service) => ok_response(ServiceStatusView::from(service)),
        None => envelope_error(StatusCode::NOT_FOUND, &format!("service '{}' not found", name)),
    }
}

async fn delete_service(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Response {
    match supervisor.remove_service(&name).await {
        Ok(()) => ok_null(),
        Err(e) => error_response(e),
    }
}

async fn list_tunnels(State(supervisor): State<Arc<Supervisor>>) -> Response {
    let views: Vec<TunnelStatusView> = supervisor.list_tunnels().await.into_iter().map(TunnelStatusView::from).collect();
    ok_response(views)
}

async fn create_tunnel(State(supervisor): State<Arc<Supervisor>>, Json(body): Json<TunnelConfig>) -> Response {
    match supervisor.add_tunnel(body).await {
        Ok(stats) => ok_response(TunnelStatusView::from(stats)),
        Err(e) => error_response(e),
    }
}

async fn get_tunnel(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Response {
    match supervisor.get_tunnel(&name).await {
        Ok(stats) => ok_response(TunnelStatusView::from(stats)),
        Err(e) => error_response(e),
    }
}

async fn delete_tunnel(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Response {
    match supervisor.remove_tunnel(&name).await {
        Ok(()) => ok_null(),
        Err(e) => error_response(e),
    }
}

async fn restart_tunnel(State(supervisor): State<Arc<Supervisor>>, Path(name): Path<String>) -> Response {
    match supervisor.restart_tunnel(&name).await {
        Ok(stats) => ok_response(TunnelStatusView::from(stats)),
        Err(e) => error_response(e),
    }
}

async fn system_restart(State(supervisor): State<Arc<Supervisor>>) -> Response {
    info!("system restart requested via management API");
    supervisor.request_restart();
    ok_null()
}

async fn system_shutdown(State(supervisor): State<Arc<Supervisor>>) -> Response {
    info!("system shutdown requested via management API");
    supervisor.request_shutdown();
    ok_null()
}

async fn status(State(supervisor): State<Arc<Supervisor>>) -> Response {
    ok_response(supervisor.status().await)
}

/// In-memory log buffering for the web UI is out of scope; this endpoint
/// keeps the documented response shape with an always-empty result.
#[derive(Serialize)]
struct LogResponse {
    logs: Vec<String>,
    total: usize,
}

async fn logs() -> Response {
    ok_response(LogResponse { logs: vec![], total: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_identical_strings() {
        assert!(constant_time_eq("secret-token", "secret-token"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq("secret", "secret-token"));
    }

    #[test]
    fn constant_time_eq_rejects_same_length_mismatch() {
        assert!(!constant_time_eq("secret-token", "secret-tokeX"));
    }
}
