//! WireGuard device: per-peer `boringtun::Tunn` instances bound to one TUN
//! handle and one UDP socket, plus the outbound/inbound/timer tasks that
//! move packets between them.
//!
//! This is the in-process analogue of a real WireGuard implementation's
//! UAPI-configured kernel device: [`WgDevice::uapi_get`] and
//! [`WgDevice::update_peer_endpoint`] let the connectivity monitor in
//! `tunnel.rs` read handshake state and push a targeted endpoint change the
//! same way `wg(8)` would, without resending allowed-ips or rebuilding the
//! per-peer `Tunn`.

use crate::error::{FinGuardError, Result};
use crate::platform::TunHandle;
use crate::wireguard::uapi::DeviceGet;
use crate::wireguard::{keys, KeyPair, PeerConfig, PublicKey};
use boringtun::noise::{Tunn, TunnResult};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

const MAX_PACKET_SIZE: usize = 65535;
const TUN_BUFFER_SIZE: usize = 2048;
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Aggregate device counters, exposed through tunnel status.
#[derive(Debug, Clone, Default)]
pub struct DeviceStats {
    /// Total bytes transmitted across all peers.
    pub tx_bytes: u64,
    /// Total bytes received across all peers.
    pub rx_bytes: u64,
    /// Total encapsulation/decapsulation/io errors.
    pub errors: u64,
}

/// Everything needed to bring up a device: the local keypair and the
/// already-validated peer set. Endpoints are already resolved to literal
/// addresses by the caller (`Tunnel` owns resolution policy; the device
/// only deals in sockets).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Local keypair.
    pub keypair: KeyPair,
    /// UDP listen port; 0 selects an ephemeral port.
    pub listen_port: u16,
    /// Peers, with endpoints already resolved.
    pub peers: Vec<(PeerConfig, Option<SocketAddr>)>,
}

enum DeviceCommand {
    Stop,
}

/// Per-peer runtime state shared between the packet-processing tasks and
/// the connectivity monitor. `endpoint` is the one field the monitor is
/// allowed to mutate in place — see [`WgDevice::update_peer_endpoint`].
struct PeerRuntime {
    name: String,
    public_key: X25519PublicKey,
    tunn: Mutex<Tunn>,
    endpoint: RwLock<Option<SocketAddr>>,
    last_handshake: RwLock<Option<SystemTime>>,
    allowed_ips: Vec<String>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
}

impl PeerRuntime {
    fn new(
        local_private: StaticSecret,
        peer: &PeerConfig,
        endpoint: Option<SocketAddr>,
        index: u32,
    ) -> Result<Self> {
        let public_key = X25519PublicKey::from(*peer.public_key.as_bytes());
        let tunn = Tunn::new(
            local_private,
            public_key,
            peer.preshared_key,
            if peer.persistent_keepalive_secs > 0 {
                Some(peer.persistent_keepalive_secs)
            } else {
                None
            },
            index,
            None,
        )
        .map_err(|e| {
            FinGuardError::WireGuard(format!(
                "failed to create tunnel state for peer '{}': {}",
                peer.name, e
            ))
        })?;

        Ok(Self {
            name: peer.name.clone(),
            public_key,
            tunn: Mutex::new(tunn),
            endpoint: RwLock::new(endpoint),
            last_handshake: RwLock::new(None),
            allowed_ips: peer.allowed_ips.clone(),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
        })
    }
}

/// A running WireGuard device: one UDP socket, one TUN handle, and one
/// `Tunn` state machine per peer.
pub struct WgDevice {
    tun: Arc<Mutex<Box<dyn TunHandle>>>,
    udp_socket: Arc<TokioUdpSocket>,
    peers: Arc<RwLock<HashMap<X25519PublicKey, PeerRuntime>>>,
    endpoint_index: Arc<RwLock<HashMap<SocketAddr, X25519PublicKey>>>,
    stats: Arc<RwLock<DeviceStats>>,
    cmd_tx: mpsc::UnboundedSender<DeviceCommand>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    local_private: StaticSecret,
}

impl WgDevice {
    /// Bring up a device on an already-created, already-addressed TUN
    /// handle, shared with the caller so `Tunnel` can still issue
    /// `add_route`/`remove_route` calls against it directly. `Tunnel` owns
    /// TUN creation, addressing and closing; this owns packet I/O and
    /// per-peer crypto state only.
    pub async fn new(config: DeviceConfig, tun: Arc<Mutex<Box<dyn TunHandle>>>) -> Result<Self> {
        let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.listen_port)
            .parse()
            .map_err(|e| FinGuardError::Config(format!("invalid listen port: {}", e)))?;

        let std_socket = UdpSocket::bind(listen_addr).map_err(|e| {
            FinGuardError::Platform(format!("failed to bind UDP socket to {}: {}", listen_addr, e))
        })?;
        std_socket.set_nonblocking(true).map_err(|e| {
            FinGuardError::Platform(format!("failed to set UDP socket non-blocking: {}", e))
        })?;
        let udp_socket = Arc::new(TokioUdpSocket::from_std(std_socket).map_err(|e| {
            FinGuardError::Platform(format!("failed to adopt UDP socket into tokio: {}", e))
        })?);

        let actual_port = udp_socket
            .local_addr()
            .map_err(|e| FinGuardError::Platform(format!("failed to read UDP local addr: {}", e)))?
            .port();
        info!(port = actual_port, requested = config.listen_port, "wireguard UDP socket bound");

        let local_private = StaticSecret::from(*config.keypair.private.as_bytes());

        let mut peers = HashMap::new();
        let mut endpoint_index = HashMap::new();
        for (index, (peer_config, endpoint)) in config.peers.iter().enumerate() {
            let runtime = PeerRuntime::new(local_private.clone(), peer_config, *endpoint, index as u32)?;
            if let Some(addr) = endpoint {
                endpoint_index.insert(*addr, runtime.public_key);
            }
            peers.insert(runtime.public_key, runtime);
        }

        let peers = Arc::new(RwLock::new(peers));
        let endpoint_index = Arc::new(RwLock::new(endpoint_index));
        let stats = Arc::new(RwLock::new(DeviceStats::default()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let device = Self {
            tun,
            udp_socket,
            peers,
            endpoint_index,
            stats,
            cmd_tx,
            task_handles: Mutex::new(Vec::new()),
            local_private,
        };
        device.spawn_tasks(cmd_rx).await;
        Ok(device)
    }

    async fn spawn_tasks(&self, cmd_rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        let outbound = tokio::spawn(Self::outbound_task(
            self.tun.clone(),
            self.udp_socket.clone(),
            self.peers.clone(),
            self.stats.clone(),
        ));
        let inbound = tokio::spawn(Self::inbound_task(
            self.tun.clone(),
            self.udp_socket.clone(),
            self.peers.clone(),
            self.endpoint_index.clone(),
            self.stats.clone(),
        ));
        let timer = tokio::spawn(Self::timer_task(
            self.udp_socket.clone(),
            self.peers.clone(),
            self.stats.clone(),
        ));
        let commands = tokio::spawn(Self::command_task(cmd_rx));

        self.task_handles
            .lock()
            .await
            .extend([outbound, inbound, timer, commands]);
    }

    async fn outbound_task(
        tun: Arc<Mutex<Box<dyn TunHandle>>>,
        udp: Arc<TokioUdpSocket>,
        peers: Arc<RwLock<HashMap<X25519PublicKey, PeerRuntime>>>,
        stats: Arc<RwLock<DeviceStats>>,
    ) {
        let mut tun_buf = vec![0u8; TUN_BUFFER_SIZE];
        let mut wg_buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let n = {
                let mut guard = tun.lock().await;
                match guard.device_mut().read(&mut tun_buf) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        drop(guard);
                        time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                    Err(e) => {
                        error!("tun read error: {}", e);
                        stats.write().await.errors += 1;
                        continue;
                    }
                }
            };
            if n == 0 {
                continue;
            }

            // Single default peer per tunnel: we encapsulate against
            // whichever peer currently has a live endpoint. Per-peer
            // allowed-ips based routing is out of scope for this device.
            let peers_guard = peers.read().await;
            for peer in peers_guard.values() {
                let endpoint = *peer.endpoint.read().await;
                let Some(endpoint) = endpoint else { continue };
                let result = peer.tunn.lock().await.encapsulate(&tun_buf[..n], &mut wg_buf);
                match result {
                    TunnResult::Done => {}
                    TunnResult::Err(e) => debug!(peer = %peer.name, "encapsulation error: {:?}", e),
                    TunnResult::WriteToNetwork(data) => match udp.send_to(data, endpoint).await {
                        Ok(sent) => {
                            peer.tx_bytes.fetch_add(sent as u64, Ordering::Relaxed);
                            stats.write().await.tx_bytes += sent as u64;
                        }
                        Err(e) => warn!(peer = %peer.name, "udp send error: {}", e),
                    },
                    _ => {}
                }
                break;
            }
        }
    }

    async fn inbound_task(
        tun: Arc<Mutex<Box<dyn TunHandle>>>,
        udp: Arc<TokioUdpSocket>,
        peers: Arc<RwLock<HashMap<X25519PublicKey, PeerRuntime>>>,
        endpoint_index: Arc<RwLock<HashMap<SocketAddr, X25519PublicKey>>>,
        stats: Arc<RwLock<DeviceStats>>,
    ) {
        let mut udp_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut tun_buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (n, src) = match udp.recv_from(&mut udp_buf).await {
                Ok(v) => v,
                Err(e) => {
                    error!("udp recv error: {}", e);
                    stats.write().await.errors += 1;
                    time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let peer_key = endpoint_index.read().await.get(&src).copied();
            let Some(peer_key) = peer_key else {
                debug!(from = %src, "packet from unrecognized endpoint");
                continue;
            };

            let peers_guard = peers.read().await;
            let Some(peer) = peers_guard.get(&peer_key) else { continue };

            let result = peer
                .tunn
                .lock()
                .await
                .decapsulate(Some(src.ip()), &udp_buf[..n], &mut tun_buf);

            match result {
                TunnResult::Done => {
                    *peer.last_handshake.write().await = Some(SystemTime::now());
                }
                TunnResult::Err(e) => {
                    warn!(peer = %peer.name, from = %src, "decapsulation error: {:?}", e);
                    stats.write().await.errors += 1;
                }
                TunnResult::WriteToNetwork(data) => {
                    *peer.last_handshake.write().await = Some(SystemTime::now());
                    if let Err(e) = udp.send_to(data, src).await {
                        warn!(peer = %peer.name, "udp send error: {}", e);
                    }
                }
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    peer.rx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                    *peer.last_handshake.write().await = Some(SystemTime::now());
                    drop(peers_guard);

                    let mut tun_guard = tun.lock().await;
                    match tun_guard.device_mut().write(data) {
                        Ok(written) => stats.write().await.rx_bytes += written as u64,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            error!("tun write error: {}", e);
                            stats.write().await.errors += 1;
                        }
                    }
                }
            }
        }
    }

    async fn timer_task(
        udp: Arc<TokioUdpSocket>,
        peers: Arc<RwLock<HashMap<X25519PublicKey, PeerRuntime>>>,
        stats: Arc<RwLock<DeviceStats>>,
    ) {
        let mut ticker = time::interval(TIMER_TICK_INTERVAL);
        let mut wg_buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            ticker.tick().await;
            let peers_guard = peers.read().await;
            for peer in peers_guard.values() {
                let endpoint = *peer.endpoint.read().await;
                let result = peer.tunn.lock().await.update_timers(&mut wg_buf);
                if let TunnResult::WriteToNetwork(data) = result {
                    if let Some(endpoint) = endpoint {
                        match udp.send_to(data, endpoint).await {
                            Ok(sent) => stats.write().await.tx_bytes += sent as u64,
                            Err(e) => warn!(peer = %peer.name, "timer udp send error: {}", e),
                        }
                    }
                }
            }
        }
    }

    async fn command_task(mut cmd_rx: mpsc::UnboundedReceiver<DeviceCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                DeviceCommand::Stop => break,
            }
        }
    }

    /// Current aggregate counters.
    pub async fn stats(&self) -> DeviceStats {
        self.stats.read().await.clone()
    }

    /// Snapshot every peer's current handshake and endpoint state, in the
    /// same shape a `get=1` UAPI query would return.
    pub async fn uapi_get(&self) -> DeviceGet {
        let mut get = DeviceGet::default();
        let peers = self.peers.read().await;
        for peer in peers.values() {
            let mut fields = HashMap::new();
            fields.insert("public_key".to_string(), vec![keys::to_hex(peer.public_key.as_bytes())]);
            if let Some(endpoint) = *peer.endpoint.read().await {
                fields.insert("endpoint".to_string(), vec![endpoint.to_string()]);
            }
            let handshake_secs = peer
                .last_handshake
                .read()
                .await
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            fields.insert("last_handshake_time_sec".to_string(), vec![handshake_secs.to_string()]);
            fields.insert("allowed_ip".to_string(), peer.allowed_ips.clone());
            get.peers.push(fields);
        }
        get
    }

    /// Whether any peer has a handshake within the last 180s.
    pub async fn has_recent_handshake(&self) -> bool {
        let peers = self.peers.read().await;
        for peer in peers.values() {
            if let Some(t) = *peer.last_handshake.read().await {
                if t.elapsed().map(|e| e < Duration::from_secs(180)).unwrap_or(false) {
                    return true;
                }
            }
        }
        false
    }

    /// Last handshake time for a given peer, if any.
    pub async fn last_handshake(&self, public_key: &PublicKey) -> Option<SystemTime> {
        let x25519_key = X25519PublicKey::from(*public_key.as_bytes());
        let peers = self.peers.read().await;
        let peer = peers.get(&x25519_key)?;
        *peer.last_handshake.read().await
    }

    /// Push a targeted endpoint change for one peer — the UAPI-equivalent
    /// of a `public_key=…\nendpoint=…\n` set with no allowed-ips or session
    /// reset. A no-op if `new_endpoint` already matches what's installed.
    pub async fn update_peer_endpoint(&self, public_key: &PublicKey, new_endpoint: SocketAddr) -> Result<()> {
        let x25519_key = X25519PublicKey::from(*public_key.as_bytes());
        let peers = self.peers.read().await;
        let Some(peer) = peers.get(&x25519_key) else {
            return Err(FinGuardError::NotFound(format!(
                "peer {} not present on device",
                public_key
            )));
        };

        let mut endpoint_guard = peer.endpoint.write().await;
        if *endpoint_guard == Some(new_endpoint) {
            return Ok(());
        }
        let old = endpoint_guard.replace(new_endpoint);
        drop(endpoint_guard);

        let mut index = self.endpoint_index.write().await;
        if let Some(old) = old {
            index.remove(&old);
        }
        index.insert(new_endpoint, x25519_key);
        info!(peer = %peer.name, endpoint = %new_endpoint, "peer endpoint updated");
        Ok(())
    }

    /// Replace the device's peer set in place: the UAPI-equivalent of a
    /// complete `set` with `replace_peers=true`, except that a peer present
    /// both before and after keeps its live `Tunn` session state — only its
    /// endpoint is touched, and only if it actually changed. New peers get a
    /// fresh `Tunn`; peers absent from `desired` are dropped. Never rebinds
    /// the UDP socket, so a listen-port change is not representable here —
    /// callers that need one must tear the device down and recreate it.
    pub async fn apply_peer_set(&self, desired: &[(PeerConfig, Option<SocketAddr>)]) -> Result<()> {
        let desired_keys: HashMap<X25519PublicKey, &(PeerConfig, Option<SocketAddr>)> = desired
            .iter()
            .map(|entry| (X25519PublicKey::from(*entry.0.public_key.as_bytes()), entry))
            .collect();

        let mut peers_guard = self.peers.write().await;
        let mut endpoint_guard = self.endpoint_index.write().await;

        let stale: Vec<X25519PublicKey> = peers_guard
            .keys()
            .filter(|key| !desired_keys.contains_key(*key))
            .copied()
            .collect();
        for key in stale {
            if let Some(removed) = peers_guard.remove(&key) {
                if let Some(old_endpoint) = *removed.endpoint.read().await {
                    endpoint_guard.remove(&old_endpoint);
                }
                info!(peer = %removed.name, "peer removed by in-place uapi update");
            }
        }

        for (public_key, (peer_config, endpoint)) in desired_keys {
            match peers_guard.get(&public_key) {
                Some(existing) => {
                    let mut endpoint_slot = existing.endpoint.write().await;
                    if *endpoint_slot != *endpoint {
                        if let Some(old) = endpoint_slot.take() {
                            endpoint_guard.remove(&old);
                        }
                        *endpoint_slot = *endpoint;
                        if let Some(new_endpoint) = endpoint {
                            endpoint_guard.insert(*new_endpoint, public_key);
                        }
                        info!(peer = %existing.name, endpoint = ?endpoint, "peer endpoint updated by in-place uapi update");
                    }
                }
                None => {
                    let index = peers_guard.len() as u32;
                    let runtime = PeerRuntime::new(self.local_private.clone(), peer_config, *endpoint, index)?;
                    if let Some(addr) = endpoint {
                        endpoint_guard.insert(*addr, public_key);
                    }
                    info!(peer = %runtime.name, "peer added by in-place uapi update");
                    peers_guard.insert(public_key, runtime);
                }
            }
        }

        Ok(())
    }

    /// Stop all packet-processing tasks. Does not close the TUN handle —
    /// that handle is shared with `Tunnel`, which closes it after.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.cmd_tx.send(DeviceCommand::Stop);
        for handle in self.task_handles.get_mut().drain(..) {
            handle.abort();
        }
        Ok(())
    }
}
