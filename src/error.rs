//! Error types for FinGuard
//!
//! This module defines the error types used throughout the application.
//! We use `thiserror` for ergonomic error definitions; `anyhow` is used only
//! at the CLI boundary in `main.rs` for ad hoc context.

use thiserror::Error;

/// Main error type for FinGuard operations
#[derive(Error, Debug)]
pub enum FinGuardError {
    /// Configuration is invalid or missing; fails startup or rejects a CRUD call
    #[error("configuration error: {0}")]
    Config(String),

    /// Platform-specific errors (TUN device, routing, netlink/ifconfig shell-outs)
    #[error("platform error: {0}")]
    Platform(String),

    /// WireGuard protocol errors (boringtun, Tunn construction/encapsulation)
    #[error("wireguard error: {0}")]
    WireGuard(String),

    /// TUN device errors
    #[error("tun device error: {0}")]
    TunDevice(String),

    /// WireGuard UAPI parse/format errors
    #[error("uapi error: {0}")]
    Uapi(String),

    /// A create call targeted a name that already exists; never retried by the system
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// DNS timeout, connection refused while resolving or dialing; retried by callers
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Upstream returned 5xx/refused/timed out; classified and surfaced as an HTTP status
    #[error("upstream fault: {0}")]
    UpstreamFault(String),

    /// A subsystem (tunnel, proxy, discovery) stopped unexpectedly
    #[error("subsystem degraded: {0}")]
    SubsystemDegraded(String),

    /// Cannot bind a listener, cannot open the management port, admin token unset
    #[error("fatal startup error: {0}")]
    Fatal(String),

    /// I/O errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Permission errors (key file modes, privilege checks)
    #[error("permission denied: {0}")]
    Permission(String),

    /// Not found errors
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid state errors (e.g. tunnel state machine transitions)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Timeout errors
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Input validation errors
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type alias using FinGuardError
pub type Result<T> = std::result::Result<T, FinGuardError>;

impl FinGuardError {
    /// Map this error to the HTTP status code the management API should return.
    ///
    /// Only the `api` module boundary should call this; internal code propagates
    /// typed errors all the way up.
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            FinGuardError::Config(_) | FinGuardError::Validation(_) => StatusCode::BAD_REQUEST,
            FinGuardError::Permission(_) => StatusCode::UNAUTHORIZED,
            FinGuardError::NotFound(_) => StatusCode::NOT_FOUND,
            FinGuardError::ResourceBusy(_) => StatusCode::CONFLICT,
            FinGuardError::UpstreamFault(_) => StatusCode::BAD_GATEWAY,
            FinGuardError::SubsystemDegraded(_) => StatusCode::SERVICE_UNAVAILABLE,
            FinGuardError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            FinGuardError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<serde_json::Error> for FinGuardError {
    fn from(err: serde_json::Error) -> Self {
        FinGuardError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FinGuardError {
    fn from(err: serde_yaml::Error) -> Self {
        FinGuardError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_mapping() {
        assert_eq!(
            FinGuardError::NotFound("x".into()).status_code(),
            http::StatusCode::NOT_FOUND
        );
        assert_eq!(
            FinGuardError::ResourceBusy("x".into()).status_code(),
            http::StatusCode::CONFLICT
        );
        assert_eq!(
            FinGuardError::UpstreamFault("x".into()).status_code(),
            http::StatusCode::BAD_GATEWAY
        );
    }
}
