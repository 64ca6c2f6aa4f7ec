//! `wireguard.yaml` schema: tunnel and peer definitions.

use crate::config::validation;
use crate::error::Result;
use serde::{Deserialize, Serialize};

fn default_mtu() -> u16 {
    1420
}
fn default_keepalive() -> u16 {
    25
}
fn default_monitor_interval() -> u64 {
    30
}
fn default_stale_timeout() -> u64 {
    300
}
fn default_reconnection_retries() -> u32 {
    3
}

/// Top level of `wireguard.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireGuardConfig {
    /// Configured tunnels, keyed by name in the document order they were declared.
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// One WireGuard tunnel definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel name (unique, case-insensitive); also the TUN interface name.
    pub name: String,

    /// UDP listen port; 0 selects an ephemeral port.
    #[serde(default)]
    pub listen_port: u16,

    /// Base64-encoded x25519 private key (32 bytes decoded).
    pub private_key: String,

    /// Maximum transmission unit for the TUN device.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// CIDR addresses assigned to the TUN interface.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// CIDR routes installed pointing at the TUN interface.
    #[serde(default)]
    pub routes: Vec<String>,

    /// Configured peers.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Connectivity monitor tick interval, in seconds.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Handshake age, in seconds, past which a peer is considered stale.
    #[serde(default = "default_stale_timeout")]
    pub stale_connection_timeout_secs: u64,

    /// Maximum endpoint-recovery attempts per peer before giving up until a handshake succeeds.
    #[serde(default = "default_reconnection_retries")]
    pub reconnection_retries: u32,
}

/// One WireGuard peer definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer name (for identification in logs/status only).
    pub name: String,

    /// Base64-encoded x25519 public key (32 bytes decoded).
    pub public_key: String,

    /// Peer endpoint, `host:port`; host may be a hostname requiring resolution.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Allowed IP CIDRs for this peer.
    #[serde(default)]
    pub allowed_ips: Vec<String>,

    /// Optional base64-encoded preshared key.
    #[serde(default)]
    pub preshared_key: Option<String>,

    /// Persistent keepalive interval, seconds; 0 disables it.
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive_secs: u16,
}

impl TunnelConfig {
    /// Validate the tunnel configuration, clamping an out-of-range MTU to
    /// 1420 rather than rejecting the document outright.
    pub fn validate(&mut self) -> Result<()> {
        validation::validate_interface_name(&self.name)?;
        validation::validate_key(&self.private_key, "private_key")?;
        self.mtu = validation::clamp_mtu(self.mtu);

        for addr in &self.addresses {
            validation::validate_cidr(addr)?;
        }
        for route in &self.routes {
            validation::validate_cidr(route)?;
        }
        for peer in &mut self.peers {
            peer.validate()?;
        }

        Ok(())
    }
}

impl PeerConfig {
    /// Validate the peer configuration.
    pub fn validate(&mut self) -> Result<()> {
        validation::validate_key(&self.public_key, "public_key")?;

        if let Some(endpoint) = &self.endpoint {
            validation::validate_endpoint(endpoint)?;
        }

        for allowed_ip in &self.allowed_ips {
            validation::validate_cidr(allowed_ip)?;
        }

        if let Some(psk) = &self.preshared_key {
            validation::validate_key(psk, "preshared_key")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tunnel() -> TunnelConfig {
        TunnelConfig {
            name: "wg0".to_string(),
            listen_port: 0,
            private_key: "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=".to_string(),
            mtu: 1420,
            addresses: vec!["10.8.0.1/24".to_string()],
            routes: vec![],
            peers: vec![],
            monitor_interval_secs: 30,
            stale_connection_timeout_secs: 300,
            reconnection_retries: 3,
        }
    }

    #[test]
    fn mtu_clamped_not_rejected() {
        let mut cfg = sample_tunnel();
        cfg.mtu = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.mtu, 1420);
    }

    #[test]
    fn ephemeral_listen_port_accepted() {
        let mut cfg = sample_tunnel();
        cfg.listen_port = 0;
        assert!(cfg.validate().is_ok());
    }
}
