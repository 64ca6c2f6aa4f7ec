//! Tunnel lifecycle: TUN creation, device bring-up, and the connectivity
//! monitor that repairs endpoints behind moving NATs and dynamic DNS.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `Stopped` doubles as the error-recovery state: a tunnel that failed to
//! start, or whose device detected a fatal fault, lands back in `Stopped`
//! with `last_error` set, and [`crate::tunnel_manager`]'s health loop is
//! the only thing that calls `start` on it again.

use crate::config::wireguard::TunnelConfig as ConfigTunnel;
use crate::error::{FinGuardError, Result};
use crate::platform::{get_platform, TunHandle};
use crate::resolver::Resolver;
use crate::wireguard::device::{DeviceConfig, WgDevice};
use crate::wireguard::peer::{parse_host_port, PeerConfig};
use crate::wireguard::KeyPair;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current lifecycle state of a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not running. Also the landing state after a failed start or a fatal
    /// device fault.
    Stopped,
    /// TUN/device/monitor bring-up in progress.
    Starting,
    /// Fully up: device active, monitor running.
    Running,
    /// Teardown in progress.
    Stopping,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelState::Stopped => "stopped",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time tunnel status for the management API.
#[derive(Debug, Clone)]
pub struct TunnelStats {
    /// Tunnel name.
    pub name: String,
    /// Current state.
    pub state: TunnelState,
    /// Interface name as actually assigned by the OS.
    pub interface: Option<String>,
    /// Total configured peers.
    pub total_peers: usize,
    /// Peers with a handshake in the last 180s.
    pub healthy_peers: usize,
    /// Total bytes transmitted.
    pub tx_bytes: u64,
    /// Total bytes received.
    pub rx_bytes: u64,
    /// Most recent error, if the tunnel is Stopped because of one.
    pub last_error: Option<String>,
}

struct Running {
    tun: Arc<Mutex<Box<dyn TunHandle>>>,
    device: Arc<WgDevice>,
    monitor_cancel: CancellationToken,
    monitor_handle: JoinHandle<()>,
}

/// A single WireGuard tunnel: one TUN interface, one UDP-bound device, and
/// a background connectivity monitor.
pub struct Tunnel {
    name: String,
    config: RwLock<ConfigTunnel>,
    peers: RwLock<Vec<PeerConfig>>,
    state: RwLock<TunnelState>,
    running: RwLock<Option<Running>>,
    last_error: RwLock<Option<String>>,
}

impl Tunnel {
    /// Construct a tunnel in the `Stopped` state. Does not touch the OS.
    pub fn new(mut config: ConfigTunnel) -> Result<Self> {
        config.validate()?;
        let peers = config
            .peers
            .iter()
            .map(PeerConfig::from_config)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            config: RwLock::new(config),
            peers: RwLock::new(peers),
            state: RwLock::new(TunnelState::Stopped),
            running: RwLock::new(None),
            last_error: RwLock::new(None),
        })
    }

    /// Tunnel name (also the interface name requested from the platform).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TunnelState {
        *self.state.read().await
    }

    /// Bring the tunnel up: create TUN, add addresses, bring up the
    /// device, add routes, launch the monitor. Any failure unwinds
    /// everything created so far and leaves the tunnel `Stopped`.
    pub async fn start(&self, resolver: Resolver) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != TunnelState::Stopped {
                return Err(FinGuardError::InvalidState(format!(
                    "cannot start tunnel '{}' from state {}",
                    self.name, state
                )));
            }
            *state = TunnelState::Starting;
        }

        match self.start_inner(&resolver).await {
            Ok(running) => {
                *self.running.write().await = Some(running);
                *self.last_error.write().await = None;
                *self.state.write().await = TunnelState::Running;
                info!(tunnel = %self.name, "tunnel started");
                Ok(())
            }
            Err(e) => {
                warn!(tunnel = %self.name, error = %e, "tunnel failed to start");
                *self.last_error.write().await = Some(e.to_string());
                *self.state.write().await = TunnelState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self, resolver: &Resolver) -> Result<Running> {
        let config = self.config.read().await.clone();
        let platform = get_platform();

        if let Ok(missing) = platform.check_capabilities() {
            if !missing.is_empty() {
                return Err(FinGuardError::Platform(format!(
                    "missing required capabilities: {}",
                    missing.join(", ")
                )));
            }
        }

        let tun = platform.create_tun(&config.name, config.mtu)?;
        let tun = Arc::new(Mutex::new(tun));

        if let Err(e) = self.configure_addresses(&tun, &config.addresses).await {
            let _ = tun.lock().await.close();
            return Err(e);
        }

        let peers = self.peers.read().await.clone();
        let resolved_peers = self.resolve_peers(resolver, &peers).await;

        let keypair = KeyPair::from_private(crate::wireguard::PrivateKey::from_base64(&config.private_key)?);
        let device_config = DeviceConfig {
            keypair,
            listen_port: config.listen_port,
            peers: resolved_peers,
        };

        let device = match WgDevice::new(device_config, tun.clone()).await {
            Ok(d) => Arc::new(d),
            Err(e) => {
                let _ = tun.lock().await.close();
                return Err(e);
            }
        };

        if let Err(e) = self.configure_routes(&tun, &config.routes).await {
            let _ = tun.lock().await.close();
            return Err(e);
        }

        let monitor_cancel = CancellationToken::new();
        let monitor_handle = tokio::spawn(run_monitor(
            self.name.clone(),
            device.clone(),
            peers,
            config.monitor_interval_secs,
            config.stale_connection_timeout_secs,
            config.reconnection_retries,
            resolver.clone(),
            monitor_cancel.clone(),
        ));

        Ok(Running {
            tun,
            device,
            monitor_cancel,
            monitor_handle,
        })
    }

    async fn configure_addresses(&self, tun: &Arc<Mutex<Box<dyn TunHandle>>>, addresses: &[String]) -> Result<()> {
        let guard = tun.lock().await;
        for cidr in addresses {
            guard.add_address(cidr)?;
        }
        Ok(())
    }

    async fn configure_routes(&self, tun: &Arc<Mutex<Box<dyn TunHandle>>>, routes: &[String]) -> Result<()> {
        let guard = tun.lock().await;
        for cidr in routes {
            guard.add_route(cidr)?;
        }
        Ok(())
    }

    /// Resolve each peer's configured endpoint to a literal address. A
    /// hostname that fails to resolve at start time leaves the peer
    /// endpoint-less; the monitor retries it on the next tick.
    async fn resolve_peers(
        &self,
        resolver: &Resolver,
        peers: &[PeerConfig],
    ) -> Vec<(PeerConfig, Option<SocketAddr>)> {
        let mut resolved = Vec::with_capacity(peers.len());
        for peer in peers {
            let endpoint = match &peer.endpoint_host {
                Some(host_port) => match parse_host_port(host_port) {
                    Some((host, port)) => match resolver.resolve(&host).await {
                        Ok(ip) => Some(SocketAddr::new(ip, port)),
                        Err(e) => {
                            warn!(peer = %peer.name, error = %e, "initial endpoint resolution failed");
                            None
                        }
                    },
                    None => {
                        warn!(peer = %peer.name, endpoint = %host_port, "malformed endpoint, ignoring");
                        None
                    }
                },
                None => None,
            };
            resolved.push((peer.clone(), endpoint));
        }
        resolved
    }

    /// Apply a new configuration. Refuses a name change. While `Running`,
    /// applies the new peer set and route list to the live device/TUN in
    /// place — no UAPI reset, no TUN recreation — following §4.3's
    /// "UAPI update in place" policy; on failure the previous configuration
    /// is reapplied (rollback). A listen-port change can't be represented
    /// as an in-place UAPI set (it requires rebinding the UDP socket), so
    /// it falls back to a full stop/start, which is the restart path the
    /// spec allows as a fallback. A no-op stored-config update when the
    /// tunnel is `Stopped`.
    pub async fn update(&self, mut new_config: ConfigTunnel, resolver: Resolver) -> Result<()> {
        if new_config.name != self.name {
            return Err(FinGuardError::Validation(format!(
                "cannot rename tunnel '{}' to '{}' via update",
                self.name, new_config.name
            )));
        }
        new_config.validate()?;
        let new_peers = new_config
            .peers
            .iter()
            .map(PeerConfig::from_config)
            .collect::<Result<Vec<_>>>()?;

        if *self.state.read().await != TunnelState::Running {
            *self.config.write().await = new_config;
            *self.peers.write().await = new_peers;
            return Ok(());
        }

        let old_config = self.config.read().await.clone();

        if new_config.listen_port != old_config.listen_port {
            *self.config.write().await = new_config.clone();
            *self.peers.write().await = new_peers;
            self.stop().await?;
            if let Err(e) = self.start(resolver.clone()).await {
                warn!(tunnel = %self.name, error = %e, "listen-port change failed to apply, rolling back");
                *self.config.write().await = old_config.clone();
                *self.peers.write().await = old_config
                    .peers
                    .iter()
                    .map(PeerConfig::from_config)
                    .collect::<Result<Vec<_>>>()?;
                self.start(resolver).await?;
                return Err(e);
            }
            return Ok(());
        }

        if let Err(e) = self.apply_running_update(&new_config, &new_peers, &resolver).await {
            warn!(tunnel = %self.name, error = %e, "uapi update failed, rolling back to previous configuration");
            let old_peers = old_config
                .peers
                .iter()
                .map(PeerConfig::from_config)
                .collect::<Result<Vec<_>>>()?;
            if let Err(rollback_err) = self.apply_running_update(&old_config, &old_peers, &resolver).await {
                warn!(tunnel = %self.name, error = %rollback_err, "rollback to previous uapi configuration also failed");
            }
            return Err(e);
        }

        *self.config.write().await = new_config;
        *self.peers.write().await = new_peers;
        Ok(())
    }

    /// Push a peer-set replace and reconcile the route list against the
    /// live device/TUN, without touching the stored config. Used by
    /// `update` both to apply the new configuration and, on failure, to
    /// roll back to the old one.
    async fn apply_running_update(
        &self,
        config: &ConfigTunnel,
        peers: &[PeerConfig],
        resolver: &Resolver,
    ) -> Result<()> {
        let running = self.running.read().await;
        let running = running
            .as_ref()
            .ok_or_else(|| FinGuardError::InvalidState(format!("tunnel '{}' is not running", self.name)))?;

        let resolved = self.resolve_peers(resolver, peers).await;
        running.device.apply_peer_set(&resolved).await?;

        let current = self.config.read().await;
        let tun = running.tun.lock().await;
        for route in &config.routes {
            if !current.routes.contains(route) {
                tun.add_route(route)?;
            }
        }
        for route in &current.routes {
            if !config.routes.contains(route) {
                let _ = tun.remove_route(route);
            }
        }

        Ok(())
    }

    /// Tear the tunnel down: cancel the monitor, remove routes, stop the
    /// device, close the TUN handle.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, TunnelState::Running | TunnelState::Starting) {
                return Ok(());
            }
            *state = TunnelState::Stopping;
        }

        if let Some(running) = self.running.write().await.take() {
            running.monitor_cancel.cancel();
            running.monitor_handle.abort();

            let config = self.config.read().await;
            let tun = running.tun.lock().await;
            for cidr in &config.routes {
                if let Err(e) = tun.remove_route(cidr) {
                    warn!(tunnel = %self.name, error = %e, "failed to remove route during stop");
                }
            }
            drop(tun);
            drop(config);

            match Arc::try_unwrap(running.device) {
                Ok(device) => {
                    if let Err(e) = device.stop().await {
                        warn!(tunnel = %self.name, error = %e, "failed to stop wireguard device");
                    }
                }
                Err(_) => {
                    warn!(tunnel = %self.name, "device still referenced elsewhere at stop, leaking tasks");
                }
            }

            let mut tun_guard = running.tun.lock().await;
            if let Err(e) = tun_guard.close() {
                warn!(tunnel = %self.name, error = %e, "failed to close tun device");
            }
        }

        *self.state.write().await = TunnelState::Stopped;
        info!(tunnel = %self.name, "tunnel stopped");
        Ok(())
    }

    /// Current aggregate status, suitable for the management API.
    pub async fn stats(&self) -> TunnelStats {
        let state = *self.state.read().await;
        let peers = self.peers.read().await;
        let last_error = self.last_error.read().await.clone();

        let running = self.running.read().await;
        let (interface, tx_bytes, rx_bytes, healthy_peers) = match running.as_ref() {
            Some(r) => {
                let device_stats = r.device.stats().await;
                let mut healthy = 0;
                for peer in peers.iter() {
                    if r.device.last_handshake(&peer.public_key).await.is_some() {
                        healthy += 1;
                    }
                }
                (
                    Some(r.tun.lock().await.name().to_string()),
                    device_stats.tx_bytes,
                    device_stats.rx_bytes,
                    healthy,
                )
            }
            None => (None, 0, 0, 0),
        };

        TunnelStats {
            name: self.name.clone(),
            state,
            interface,
            total_peers: peers.len(),
            healthy_peers,
            tx_bytes,
            rx_bytes,
            last_error,
        }
    }
}

/// Per-peer state the monitor keeps between ticks. Never persisted.
#[derive(Default)]
struct MonitorPeerState {
    last_handshake: Option<Instant>,
    reconnect_count: u32,
}

#[allow(clippy::too_many_arguments)]
async fn run_monitor(
    tunnel_name: String,
    device: Arc<WgDevice>,
    peers: Vec<PeerConfig>,
    interval_secs: u64,
    stale_timeout_secs: u64,
    reconnection_retries: u32,
    resolver: Resolver,
    cancel: CancellationToken,
) {
    let mut state: HashMap<String, MonitorPeerState> = HashMap::new();
    let by_name: HashMap<String, &PeerConfig> = peers.iter().map(|p| (p.public_key.to_hex(), p)).collect();
    let interval = Duration::from_secs(interval_secs.max(1));
    let stale_timeout = Duration::from_secs(stale_timeout_secs);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(tunnel = %tunnel_name, "connectivity monitor cancelled");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let snapshot = device.uapi_get().await;
        let now = Instant::now();
        let mut active = std::collections::HashSet::new();

        for peer_fields in &snapshot.peers {
            let Some(public_key_hex) = peer_fields.get("public_key").and_then(|v| v.first()) else {
                continue;
            };
            let handshake_sec: u64 = peer_fields
                .get("last_handshake_time_sec")
                .and_then(|v| v.first())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);

            let entry = state.entry(public_key_hex.clone()).or_default();

            if handshake_sec != 0 {
                entry.last_handshake = Some(now);
                entry.reconnect_count = 0;
                active.insert(public_key_hex.clone());
                continue;
            }

            let never_or_stale = match entry.last_handshake {
                None => true,
                Some(t) => now.duration_since(t) > Duration::from_secs(120),
            };
            if never_or_stale {
                if let Some(peer) = by_name.get(public_key_hex) {
                    recover_endpoint(&tunnel_name, &device, peer, &resolver).await;
                }
            }
        }

        for (public_key_hex, entry) in state.iter_mut() {
            if active.contains(public_key_hex) {
                continue;
            }
            let is_stale = match entry.last_handshake {
                None => true,
                Some(t) => now.duration_since(t) > stale_timeout,
            };
            if !is_stale {
                continue;
            }

            entry.reconnect_count += 1;
            if entry.reconnect_count <= reconnection_retries {
                if let Some(peer) = by_name.get(public_key_hex) {
                    recover_endpoint(&tunnel_name, &device, peer, &resolver).await;
                }
            } else {
                warn!(
                    tunnel = %tunnel_name,
                    peer_key = %public_key_hex,
                    attempts = entry.reconnect_count,
                    "peer endpoint recovery exhausted, giving up until a handshake succeeds"
                );
            }
        }
    }
}

async fn recover_endpoint(tunnel_name: &str, device: &WgDevice, peer: &PeerConfig, resolver: &Resolver) {
    if !peer.endpoint_is_hostname() {
        return;
    }
    let Some(host_port) = &peer.endpoint_host else { return };
    let Some((host, port)) = parse_host_port(host_port) else {
        return;
    };

    match resolver.resolve(&host).await {
        Ok(ip) => {
            let new_addr = SocketAddr::new(ip, port);
            if let Err(e) = device.update_peer_endpoint(&peer.public_key, new_addr).await {
                warn!(tunnel = %tunnel_name, peer = %peer.name, error = %e, "failed to apply recovered endpoint");
            } else {
                debug!(tunnel = %tunnel_name, peer = %peer.name, endpoint = %new_addr, "endpoint recovery applied");
            }
        }
        Err(e) => {
            debug!(tunnel = %tunnel_name, peer = %peer.name, error = %e, "endpoint recovery resolution failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConfigTunnel {
        let private_key = crate::wireguard::PrivateKey::generate().to_base64();
        ConfigTunnel {
            name: "wg0".to_string(),
            listen_port: 0,
            private_key,
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
    fn new_tunnel_starts_stopped() {
        let tunnel = Tunnel::new(sample_config()).unwrap();
        assert_eq!(tunnel.name(), "wg0");
    }

    #[tokio::test]
    async fn fresh_tunnel_reports_stopped_state() {
        let tunnel = Tunnel::new(sample_config()).unwrap();
        assert_eq!(tunnel.state().await, TunnelState::Stopped);
    }

    #[tokio::test]
    async fn stats_on_stopped_tunnel_has_no_interface() {
        let tunnel = Tunnel::new(sample_config()).unwrap();
        let stats = tunnel.stats().await;
        assert!(stats.interface.is_none());
        assert_eq!(stats.total_peers, 0);
    }

    #[tokio::test]
    async fn stopping_an_already_stopped_tunnel_is_a_no_op() {
        let tunnel = Tunnel::new(sample_config()).unwrap();
        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.state().await, TunnelState::Stopped);
    }
}
