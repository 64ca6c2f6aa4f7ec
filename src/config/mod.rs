//! Configuration management
//!
//! FinGuard's configuration is split across three YAML documents, following
//! the layout in the external interfaces section: `config.yaml` (server,
//! discovery, logging, updater-stub), `wireguard.yaml` (tunnels/peers) and
//! `services.yaml` (reverse-proxy services). Each document deserializes with
//! `serde`/`serde_yaml` and is validated independently before the Supervisor
//! wires subsystems together.

mod services;
mod validation;
mod wireguard;

pub use services::{ServiceConfig, ServicesConfig};
pub use wireguard::{PeerConfig, TunnelConfig, WireGuardConfig};

use crate::error::{FinGuardError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_proxy_addr() -> String {
    "0.0.0.0:80".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// `server{}` block of `config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the token-authenticated management API.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// Bind address for the HTTP(S) reverse-proxy listener.
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: String,

    /// Bearer token required on every `/api/*` route. A missing token is a
    /// fatal startup error.
    pub admin_token: String,

    /// Root directory for the (out-of-core) web UI's static assets.
    #[serde(default)]
    pub web_root: Option<String>,
}

/// `discovery{}` block of `config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Master switch for both discovery subsystems.
    #[serde(default)]
    pub enable: bool,

    /// mDNS-specific sub-block.
    #[serde(default)]
    pub mdns: MdnsConfig,
}

/// `discovery.mdns{}` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MdnsConfig {
    /// Enable the mDNS publisher.
    #[serde(default)]
    pub enabled: bool,
}

/// `log{}` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing`/`EnvFilter` directive, e.g. "info" or "finguard=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// `update{}` block. Out of core per the spec; kept only so existing config
/// files round-trip without error, never consulted at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Whether the (unimplemented) self-updater is enabled.
    #[serde(default)]
    pub enabled: bool,
    /// Cron-style schedule string for the (unimplemented) self-updater.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Whether a downloaded update is applied automatically.
    #[serde(default)]
    pub auto_apply: bool,
    /// Directory the (unimplemented) self-updater would write backups to.
    #[serde(default)]
    pub backup_dir: Option<String>,
}

/// Top-level `config.yaml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// `server{}` block.
    pub server: ServerConfig,
    /// `discovery{}` block.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// `log{}` block.
    #[serde(default)]
    pub log: LogConfig,
    /// `update{}` block (out of core).
    #[serde(default)]
    pub update: UpdateConfig,
}

/// The full, validated configuration loaded from a config directory: the
/// root document plus `wireguard.yaml` and `services.yaml` sitting beside it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Parsed `config.yaml`.
    pub root: RootConfig,
    /// Parsed `wireguard.yaml`.
    pub wireguard: WireGuardConfig,
    /// Parsed `services.yaml`.
    pub services: ServicesConfig,
    /// Directory the three documents were loaded from, for persistence.
    dir: PathBuf,
    /// Full path to `config.yaml` itself, so a later reload re-reads the
    /// same file rather than guessing a filename inside `dir`.
    path: PathBuf,
}

impl Config {
    /// Load `config.yaml` at `path`, then `wireguard.yaml` and
    /// `services.yaml` from the same directory. Missing sibling files are
    /// treated as empty documents via `#[serde(default)]`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let root_text = std::fs::read_to_string(path).map_err(|e| {
            FinGuardError::Config(format!("failed to read config file {:?}: {}", path, e))
        })?;
        let root: RootConfig = serde_yaml::from_str(&root_text)?;

        if root.server.admin_token.trim().is_empty() {
            return Err(FinGuardError::Fatal(
                "server.admin_token must be set".to_string(),
            ));
        }

        let wireguard = Self::load_sibling::<WireGuardConfig>(&dir, "wireguard.yaml")?;
        let services = Self::load_sibling::<ServicesConfig>(&dir, "services.yaml")?;

        let mut config = Self {
            root,
            wireguard,
            services,
            dir,
            path: path.to_path_buf(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Full path to the `config.yaml` this document was loaded from, for a
    /// later `SIGHUP` reload.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_sibling<T>(dir: &Path, name: &str) -> Result<T>
    where
        T: Default + for<'de> Deserialize<'de>,
    {
        let sibling = dir.join(name);
        if !sibling.exists() {
            return Ok(T::default());
        }
        let text = std::fs::read_to_string(&sibling).map_err(|e| {
            FinGuardError::Config(format!("failed to read {:?}: {}", sibling, e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Validate every section, including cross-references between services
    /// and tunnels (a service's `tunnel` must name an existing tunnel).
    pub fn validate(&mut self) -> Result<()> {
        for tunnel in &mut self.wireguard.tunnels {
            tunnel.validate()?;
        }

        let tunnel_names: std::collections::HashSet<String> = self
            .wireguard
            .tunnels
            .iter()
            .map(|t| t.name.to_lowercase())
            .collect();

        self.services.validate()?;

        for svc in &self.services.services {
            if let Some(tunnel) = &svc.tunnel {
                if !tunnel_names.contains(&tunnel.to_lowercase()) {
                    return Err(FinGuardError::Config(format!(
                        "service '{}' references unknown tunnel '{}'",
                        svc.name, tunnel
                    )));
                }
            }
        }

        Ok(())
    }

    /// Persist `wireguard.yaml` back to disk. Called by the Supervisor after
    /// a route is added/removed on a running tunnel, or after tunnel/service
    /// CRUD via the management API. This is the in-process config store's
    /// own minimal write-back, not a UI-driven editing surface.
    pub fn persist_wireguard(&self) -> Result<()> {
        let text = serde_yaml::to_string(&self.wireguard)?;
        std::fs::write(self.dir.join("wireguard.yaml"), text)
            .map_err(|e| FinGuardError::Config(format!("failed to persist wireguard.yaml: {}", e)))
    }

    /// Persist `services.yaml` back to disk.
    pub fn persist_services(&self) -> Result<()> {
        let text = serde_yaml::to_string(&self.services)?;
        std::fs::write(self.dir.join("services.yaml"), text)
            .map_err(|e| FinGuardError::Config(format!("failed to persist services.yaml: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, admin_token: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "server:\n  http_addr: 0.0.0.0:8080\n  proxy_addr: 0.0.0.0:80\n  admin_token: {}\n",
            admin_token
        )
        .unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_empty_siblings() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "secret-token");
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.root.server.admin_token, "secret-token");
        assert!(config.wireguard.tunnels.is_empty());
        assert!(config.services.services.is_empty());
    }

    #[test]
    fn rejects_missing_admin_token() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "");
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn rejects_service_referencing_unknown_tunnel() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "secret-token");

        let services_path = dir.path().join("services.yaml");
        std::fs::write(
            &services_path,
            "services:\n  - name: media\n    upstream: http://10.0.0.5:8096\n    tunnel: wg0\n",
        )
        .unwrap();

        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn persists_wireguard_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "secret-token");
        let mut config = Config::from_file(&path).unwrap();
        config.wireguard.tunnels.push(TunnelConfig {
            name: "wg0".to_string(),
            listen_port: 0,
            private_key: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
            mtu: 1420,
            addresses: vec![],
            routes: vec!["10.8.0.9/32".to_string()],
            peers: vec![],
            monitor_interval_secs: 30,
            stale_connection_timeout_secs: 300,
            reconnection_retries: 3,
        });
        config.persist_wireguard().unwrap();

        let reloaded = Config::load_sibling::<WireGuardConfig>(dir.path(), "wireguard.yaml").unwrap();
        assert_eq!(reloaded.tunnels.len(), 1);
        assert_eq!(reloaded.tunnels[0].routes, vec!["10.8.0.9/32".to_string()]);
    }
}
