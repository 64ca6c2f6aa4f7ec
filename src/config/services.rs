//! `services.yaml` schema: reverse-proxy service definitions.

use crate::config::validation;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Top level of `services.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Declared services, in document order.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// One reverse-proxy service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (case-insensitive unique); also the virtual host.
    pub name: String,

    /// Absolute upstream URL.
    pub upstream: String,

    /// Permit WebSocket upgrade passthrough.
    #[serde(default)]
    pub websocket: bool,

    /// Selected when no `Host` header matches any other service.
    #[serde(default)]
    pub default: bool,

    /// Advertise this service via mDNS.
    #[serde(default)]
    pub publish_mdns: bool,

    /// Register this service with the Jellyfin discovery responder.
    #[serde(default)]
    pub jellyfin: bool,

    /// Optional name of a Tunnel this service's upstream is reachable through.
    #[serde(default)]
    pub tunnel: Option<String>,
}

impl ServiceConfig {
    /// Validate a single service entry in isolation (name/upstream shape only;
    /// cross-service invariants like "at most one default" and "tunnel exists"
    /// are enforced by `ServicesConfig::validate`).
    pub fn validate(&self) -> Result<()> {
        use crate::error::FinGuardError;

        if self.name.trim().is_empty() {
            return Err(FinGuardError::Config(
                "service name cannot be empty".to_string(),
            ));
        }

        validation::validate_upstream_url(&self.upstream)?;

        Ok(())
    }
}

impl ServicesConfig {
    /// Validate the full service list: per-entry shape, then the "last
    /// default wins" rule the spec requires when more than one service is
    /// marked `default=true`.
    pub fn validate(&mut self) -> Result<()> {
        for svc in &self.services {
            svc.validate()?;
        }

        let default_indices: Vec<usize> = self
            .services
            .iter()
            .enumerate()
            .filter(|(_, s)| s.default)
            .map(|(i, _)| i)
            .collect();

        if default_indices.len() > 1 {
            for &idx in &default_indices[..default_indices.len() - 1] {
                self.services[idx].default = false;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str, default: bool) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            upstream: "http://10.0.0.5:8096".to_string(),
            websocket: false,
            default,
            publish_mdns: false,
            jellyfin: false,
            tunnel: None,
        }
    }

    #[test]
    fn last_default_wins() {
        let mut cfg = ServicesConfig {
            services: vec![svc("a", true), svc("b", true), svc("c", false)],
        };
        cfg.validate().unwrap();
        assert!(!cfg.services[0].default);
        assert!(cfg.services[1].default);
        assert!(!cfg.services[2].default);
    }

    #[test]
    fn rejects_empty_name() {
        let cfg = svc("", false);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_upstream() {
        let mut cfg = svc("media", false);
        cfg.upstream = "not-a-url".to_string();
        assert!(cfg.validate().is_err());
    }
}
