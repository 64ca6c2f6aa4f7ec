//! Peer configuration and runtime state.
//!
//! A [`Peer`] is the in-memory counterpart of [`crate::config::PeerConfig`]:
//! the validated, byte-decoded form the device and connectivity monitor
//! actually operate on, plus the handshake/endpoint state that changes over
//! the tunnel's lifetime without ever being written back to the config
//! store (see the monitor's endpoint-recovery algorithm in `tunnel.rs`).

use crate::config::PeerConfig as ConfigPeer;
use crate::error::{FinGuardError, Result};
use crate::wireguard::PublicKey;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// Per-peer counters, exposed through the management API's tunnel status.
#[derive(Debug, Clone, Default)]
pub struct PeerStats {
    /// Total bytes transmitted to this peer.
    pub tx_bytes: u64,
    /// Total bytes received from this peer.
    pub rx_bytes: u64,
    /// Most recent handshake observed by the connectivity monitor.
    pub last_handshake: Option<SystemTime>,
}

impl PeerStats {
    /// A handshake observed in the last 180s is considered live.
    pub fn has_recent_handshake(&self) -> bool {
        self.last_handshake
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|elapsed| elapsed < Duration::from_secs(180))
    }
}

/// A validated peer definition, ready to hand to the device layer.
///
/// `endpoint_host` preserves the original `host:port` string (which may name
/// a hostname) so the connectivity monitor knows whether re-resolution ever
/// applies to this peer; `endpoint` is the last address actually installed.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer name, used in logs and status output only.
    pub name: String,
    /// Peer's x25519 public key.
    pub public_key: PublicKey,
    /// Configured endpoint, verbatim (`host:port`); `None` if unset.
    pub endpoint_host: Option<String>,
    /// Allowed IP CIDRs, used for kernel routing only — boringtun's `Tunn`
    /// has no notion of allowed-IPs in this crate's architecture.
    pub allowed_ips: Vec<String>,
    /// Persistent keepalive, 0 disables it.
    pub persistent_keepalive_secs: u16,
    /// Decoded preshared key, if configured.
    pub preshared_key: Option<[u8; 32]>,
}

impl PeerConfig {
    /// Decode and validate a config-layer peer definition.
    pub fn from_config(config: &ConfigPeer) -> Result<Self> {
        let public_key = PublicKey::from_base64(&config.public_key)?;

        let preshared_key = match &config.preshared_key {
            Some(psk) => {
                use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
                let decoded = BASE64
                    .decode(psk.trim())
                    .map_err(|e| FinGuardError::Config(format!("invalid preshared_key: {}", e)))?;
                let mut bytes = [0u8; 32];
                if decoded.len() != 32 {
                    return Err(FinGuardError::Config(
                        "preshared_key must decode to 32 bytes".to_string(),
                    ));
                }
                bytes.copy_from_slice(&decoded);
                Some(bytes)
            }
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            public_key,
            endpoint_host: config.endpoint.clone(),
            allowed_ips: config.allowed_ips.clone(),
            persistent_keepalive_secs: config.persistent_keepalive_secs,
            preshared_key,
        })
    }

    /// Whether the configured endpoint names a hostname rather than a
    /// literal IP — only these are candidates for re-resolution.
    pub fn endpoint_is_hostname(&self) -> bool {
        match &self.endpoint_host {
            Some(host) => parse_host_port(host)
                .map(|(h, _)| h.parse::<std::net::IpAddr>().is_err())
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Split a `host:port` endpoint string, tolerating IPv6 literals.
pub fn parse_host_port(endpoint: &str) -> Option<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    Some((host.trim_start_matches('[').trim_end_matches(']').to_string(), port))
}

/// Active peer state tracked by a running [`crate::wireguard::WgDevice`].
#[derive(Debug)]
pub struct Peer {
    /// Static configuration.
    pub config: PeerConfig,
    /// Live counters.
    pub stats: PeerStats,
}

impl Peer {
    /// Build the runtime peer from its config, without activating it.
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            stats: PeerStats::default(),
        }
    }

    /// Record a handshake observed at `when`.
    pub fn record_handshake(&mut self, when: SystemTime) {
        self.stats.last_handshake = Some(when);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::PrivateKey;

    fn sample_config_peer(endpoint: Option<&str>) -> ConfigPeer {
        let public_key = PrivateKey::generate().public_key().to_base64();
        ConfigPeer {
            name: "peer1".to_string(),
            public_key,
            endpoint: endpoint.map(str::to_string),
            allowed_ips: vec!["10.8.0.2/32".to_string()],
            preshared_key: None,
            persistent_keepalive_secs: 25,
        }
    }

    #[test]
    fn literal_ip_endpoint_is_not_a_hostname() {
        let cfg = PeerConfig::from_config(&sample_config_peer(Some("203.0.113.10:51820"))).unwrap();
        assert!(!cfg.endpoint_is_hostname());
    }

    #[test]
    fn dns_name_endpoint_is_a_hostname() {
        let cfg = PeerConfig::from_config(&sample_config_peer(Some("vpn.example.com:51820"))).unwrap();
        assert!(cfg.endpoint_is_hostname());
    }

    #[test]
    fn peer_with_no_endpoint_is_never_a_hostname() {
        let cfg = PeerConfig::from_config(&sample_config_peer(None)).unwrap();
        assert!(!cfg.endpoint_is_hostname());
    }

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_host_port("vpn.example.com:51820"),
            Some(("vpn.example.com".to_string(), 51820))
        );
        assert_eq!(parse_host_port("no-port"), None);
    }

    #[test]
    fn recent_handshake_is_healthy() {
        let cfg = PeerConfig::from_config(&sample_config_peer(None)).unwrap();
        let mut peer = Peer::new(cfg);
        assert!(!peer.stats.has_recent_handshake());
        peer.record_handshake(SystemTime::now());
        assert!(peer.stats.has_recent_handshake());
    }
}
