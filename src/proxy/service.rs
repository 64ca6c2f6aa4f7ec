//! A [`Service`] (C5): one reverse-proxy entry, its parsed upstream, and the
//! health state the background checker maintains for it.

use crate::config::ServiceConfig;
use crate::error::{FinGuardError, Result};
use http::Uri;
use std::sync::RwLock;
use std::time::SystemTime;

/// Live health state for a service, refreshed by the proxy server's 30s
/// health-check loop. Three consecutive failures are logged at `error`; the
/// first success after a run of failures logs a recovery line exactly once.
#[derive(Debug, Clone)]
pub struct ServiceHealth {
    /// Whether the most recent check succeeded.
    pub healthy: bool,
    /// When the most recent check ran.
    pub last_check: Option<SystemTime>,
    /// Error text from the most recent failed check, if any.
    pub last_error: Option<String>,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// A named reverse-proxy entry. Constructed from [`ServiceConfig`] and owned
/// exclusively by the proxy server's service registry; the config store
/// keeps only the serializable form.
pub struct Service {
    /// Case-preserved name; matching against it is always case-insensitive.
    pub name: String,
    /// Parsed absolute upstream URI.
    pub upstream: Uri,
    /// Original upstream string, for status responses and mDNS TXT records.
    pub upstream_raw: String,
    /// Permit WebSocket upgrade passthrough.
    pub websocket: bool,
    /// Selected when no `Host` header matches any other service.
    pub default: bool,
    /// Advertise via mDNS.
    pub publish_mdns: bool,
    /// Register with the Jellyfin discovery responder.
    pub jellyfin: bool,
    /// Name of the tunnel this service's upstream is reachable through, if any.
    pub tunnel: Option<String>,
    health: RwLock<ServiceHealth>,
}

impl Service {
    /// Build a `Service` from its validated config form.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let upstream: Uri = config
            .upstream
            .parse()
            .map_err(|e| FinGuardError::Config(format!("invalid upstream URL '{}': {}", config.upstream, e)))?;

        if upstream.authority().is_none() {
            return Err(FinGuardError::Config(format!(
                "upstream URL '{}' has no host",
                config.upstream
            )));
        }

        Ok(Self {
            name: config.name.clone(),
            upstream,
            upstream_raw: config.upstream.clone(),
            websocket: config.websocket,
            default: config.default,
            publish_mdns: config.publish_mdns,
            jellyfin: config.jellyfin,
            tunnel: config.tunnel.clone(),
            health: RwLock::new(ServiceHealth::default()),
        })
    }

    /// Upstream host, stripped of any port, for `Host` header rewriting.
    pub fn upstream_host(&self) -> &str {
        self.upstream.host().unwrap_or_default()
    }

    /// Upstream authority (`host[:port]`) as sent over the wire.
    pub fn upstream_authority(&self) -> String {
        self.upstream
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    /// Current health snapshot.
    pub fn health(&self) -> ServiceHealth {
        self.health.read().expect("service health lock poisoned").clone()
    }

    /// Record the outcome of a health check. Returns `true` exactly when
    /// this check represents a recovery (first success after >=1 failure).
    pub fn record_health(&self, healthy: bool, error: Option<String>) -> bool {
        let mut state = self.health.write().expect("service health lock poisoned");
        let was_unhealthy = state.consecutive_failures > 0 || !state.healthy;
        state.last_check = Some(SystemTime::now());

        if healthy {
            state.healthy = true;
            state.last_error = None;
            let recovered = was_unhealthy;
            state.consecutive_failures = 0;
            recovered
        } else {
            state.consecutive_failures += 1;
            state.healthy = false;
            state.last_error = error;
            false
        }
    }

    /// Whether `host` (already stripped of port, lower-cased by the caller)
    /// names this service: either `<name>.local` or bare `<name>`.
    pub fn matches_host(&self, host: &str) -> bool {
        let name_lower = self.name.to_lowercase();
        host == name_lower || host == format!("{}.local", name_lower)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("upstream", &self.upstream_raw)
            .field("websocket", &self.websocket)
            .field("default", &self.default)
            .field("tunnel", &self.tunnel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn host_matching_is_case_insensitive_via_lowercased_input() {
        let svc = Service::from_config(&cfg("media", "http://10.0.0.5:8096", false)).unwrap();
        assert!(svc.matches_host("media"));
        assert!(svc.matches_host("media.local"));
        assert!(!svc.matches_host("other"));
    }

    #[test]
    fn rejects_upstream_without_host() {
        assert!(Service::from_config(&cfg("bad", "not-a-url", false)).is_err());
    }

    #[test]
    fn three_failures_then_recovery() {
        let svc = Service::from_config(&cfg("api", "http://10.0.0.6", false)).unwrap();
        assert!(!svc.record_health(false, Some("refused".into())));
        assert!(!svc.record_health(false, Some("refused".into())));
        assert!(!svc.record_health(false, Some("refused".into())));
        assert_eq!(svc.health().consecutive_failures, 3);
        assert!(svc.record_health(true, None));
        assert_eq!(svc.health().consecutive_failures, 0);
    }
}
