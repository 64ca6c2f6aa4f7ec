//! Supervisor (C9): startup/shutdown orchestration, signal handling, and
//! the orchestration-level operations (service/tunnel CRUD with the
//! tunnel-route side effects) that the management API calls into.

use crate::config::{Config, ServiceConfig, TunnelConfig};
use crate::discovery::{JellyfinResponder, MdnsPublisher};
use crate::error::{FinGuardError, Result};
use crate::proxy::{ProxyServer, Service};
use crate::resolver::Resolver;
use crate::tunnel_manager::TunnelManager;
use crate::wireguard::TunnelStats;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Aggregate status for `GET /api/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    /// Whether the proxy listener is up.
    pub proxy: bool,
    /// One entry per configured tunnel.
    pub tunnels: Vec<TunnelStatusView>,
    /// One entry per configured service.
    pub services: Vec<ServiceStatusView>,
    /// Seconds since the supervisor started.
    pub uptime_secs: u64,
    /// Discovered LAN IPv4, if any.
    pub ipv4: Option<String>,
    /// Discovered LAN IPv6, if any.
    pub ipv6: Option<String>,
    /// Interface names of every tunnel that is currently up.
    pub interfaces: Vec<String>,
}

/// JSON-facing tunnel status, independent of the internal [`TunnelStats`] type.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatusView {
    /// Tunnel name.
    pub name: String,
    /// `stopped` / `starting` / `running` / `stopping`.
    pub state: String,
    /// OS-assigned interface name, if up.
    pub interface: Option<String>,
    /// Number of configured peers.
    pub total_peers: usize,
    /// Peers with a handshake inside the freshness window.
    pub healthy_peers: usize,
    /// Cumulative bytes transmitted.
    pub tx_bytes: u64,
    /// Cumulative bytes received.
    pub rx_bytes: u64,
    /// Most recent error, if stopped because of one.
    pub last_error: Option<String>,
}

impl From<TunnelStats> for TunnelStatusView {
    fn from(stats: TunnelStats) -> Self {
        Self {
            name: stats.name,
            state: stats.state.to_string(),
            interface: stats.interface,
            total_peers: stats.total_peers,
            healthy_peers: stats.healthy_peers,
            tx_bytes: stats.tx_bytes,
            rx_bytes: stats.rx_bytes,
            last_error: stats.last_error,
        }
    }
}

/// JSON-facing service status.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusView {
    /// Service name.
    pub name: String,
    /// Upstream URL as configured.
    pub upstream: String,
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// Bound tunnel, if any.
    pub tunnel: Option<String>,
    /// WebSocket passthrough permitted.
    pub websocket: bool,
    /// Selected when no `Host` matches any other service.
    pub default: bool,
    /// Advertised via mDNS.
    pub publish_mdns: bool,
}

impl From<Arc<Service>> for ServiceStatusView {
    fn from(service: Arc<Service>) -> Self {
        let health = service.health();
        Self {
            name: service.name.clone(),
            upstream: service.upstream_raw.clone(),
            status: if health.healthy { "healthy" } else { "unhealthy" }.to_string(),
            tunnel: service.tunnel.clone(),
            websocket: service.websocket,
            default: service.default,
            publish_mdns: service.publish_mdns,
        }
    }
}

/// Owns every subsystem and coordinates startup order, shutdown, config
/// reload on `SIGHUP`, and the CRUD operations the management API exposes.
pub struct Supervisor {
    config: RwLock<Config>,
    resolver: Resolver,
    tunnel_manager: Arc<TunnelManager>,
    proxy_server: Arc<ProxyServer>,
    mdns: RwLock<Option<Arc<MdnsPublisher>>>,
    jellyfin: RwLock<Option<Arc<JellyfinResponder>>>,
    cancel: CancellationToken,
    restart_requested: AtomicBool,
    start_time: Instant,
}

impl Supervisor {
    /// Construct the supervisor and every subsystem it owns, without
    /// starting anything yet.
    pub fn new(config: Config) -> Arc<Self> {
        let resolver = Resolver::spawn();
        Arc::new(Self {
            config: RwLock::new(config),
            resolver: resolver.clone(),
            tunnel_manager: TunnelManager::new(resolver),
            proxy_server: ProxyServer::new(),
            mdns: RwLock::new(None),
            jellyfin: RwLock::new(None),
            cancel: CancellationToken::new(),
            restart_requested: AtomicBool::new(false),
            start_time: Instant::now(),
        })
    }

    /// Admin token required on every `/api/*` route.
    pub async fn admin_token(&self) -> String {
        self.config.read().await.root.server.admin_token.clone()
    }

    /// Bind address for the management API.
    pub async fn http_addr(&self) -> String {
        self.config.read().await.root.server.http_addr.clone()
    }

    /// Bind address for the reverse-proxy listener.
    pub async fn proxy_addr(&self) -> String {
        self.config.read().await.root.server.proxy_addr.clone()
    }

    /// The tunnel manager, for direct status queries.
    pub fn tunnel_manager(&self) -> &Arc<TunnelManager> {
        &self.tunnel_manager
    }

    /// The proxy server, for direct status queries.
    pub fn proxy_server(&self) -> &Arc<ProxyServer> {
        &self.proxy_server
    }

    /// True iff every required subsystem reports ready.
    pub async fn is_ready(&self) -> bool {
        let mdns_ready = match self.mdns.read().await.as_ref() {
            Some(m) => m.is_ready(),
            None => true,
        };
        self.tunnel_manager.is_ready() && self.proxy_server.is_ready() && mdns_ready
    }

    /// Bring up every subsystem in dependency order, serve until a shutdown
    /// signal arrives, then tear down. Returns `true` if a restart was
    /// requested (via `SIGHUP`-triggered reload failing to suffice, or the
    /// `system/restart` API call) rather than a plain shutdown.
    pub async fn run(self: Arc<Self>) -> Result<bool> {
        self.tunnel_manager.start();

        let mdns_enabled = {
            let config = self.config.read().await;
            config.root.discovery.enable && config.root.discovery.mdns.enabled
        };
        if mdns_enabled {
            match MdnsPublisher::start() {
                Ok(publisher) => *self.mdns.write().await = Some(publisher),
                Err(e) => warn!(error = %e, "mdns publisher failed to start, continuing without it"),
            }
        }

        let local_ipv4 = discover_local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let jellyfin = JellyfinResponder::new(local_ipv4);
        if let Err(e) = jellyfin.start(self.proxy_server.clone()).await {
            warn!(error = %e, "jellyfin responder failed to bind UDP/7359, continuing without it");
        } else {
            *self.jellyfin.write().await = Some(jellyfin);
        }

        let tunnels: Vec<TunnelConfig> = self.config.read().await.wireguard.tunnels.clone();
        for tunnel_cfg in tunnels {
            let name = tunnel_cfg.name.clone();
            if let Err(e) = self.tunnel_manager.create_tunnel(tunnel_cfg).await {
                error!(tunnel = %name, error = %e, "tunnel failed to start at startup, will retry via health loop");
            }
        }

        let services: Vec<ServiceConfig> = self.config.read().await.services.services.clone();
        for service_cfg in services {
            let proxy_port = self.proxy_port().await;
            if let Err(e) = self.install_service(&service_cfg, proxy_port).await {
                error!(service = %service_cfg.name, error = %e, "service failed to install at startup");
            }
        }

        self.proxy_server.start_health_loop();
        self.proxy_server.mark_ready();

        let proxy_addr = self.proxy_addr().await;
        let http_addr = self.http_addr().await;

        let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
            .await
            .map_err(|e| FinGuardError::Fatal(format!("failed to bind proxy listener on {}: {}", proxy_addr, e)))?;
        let api_listener = tokio::net::TcpListener::bind(&http_addr)
            .await
            .map_err(|e| FinGuardError::Fatal(format!("failed to bind management API on {}: {}", http_addr, e)))?;

        info!(proxy_addr = %proxy_addr, api_addr = %http_addr, "finguard subsystems started");

        let proxy_router = self
            .proxy_server
            .router()
            .into_make_service_with_connect_info::<std::net::SocketAddr>();
        let api_router = crate::api::router(self.clone());

        let proxy_cancel = self.cancel.clone();
        let proxy_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(proxy_listener, proxy_router)
                .with_graceful_shutdown(async move { proxy_cancel.cancelled().await })
                .await
            {
                error!(error = %e, "proxy listener exited with an error");
            }
        });

        let api_cancel = self.cancel.clone();
        let api_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api_router)
                .with_graceful_shutdown(async move { api_cancel.cancelled().await })
                .await
            {
                error!(error = %e, "management API listener exited with an error");
            }
        });

        self.signal_loop().await;

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = proxy_task.await;
            let _ = api_task.await;
        })
        .await;

        self.shutdown_subsystems().await;

        Ok(self.restart_requested.load(Ordering::SeqCst))
    }

    async fn proxy_port(&self) -> u16 {
        self.proxy_addr()
            .await
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(80)
    }

    async fn signal_loop(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = sigint.recv() => {
                        info!("received SIGINT, shutting down");
                        self.cancel.cancel();
                        return;
                    }
                    _ = sigterm.recv() => {
                        info!("received SIGTERM, shutting down");
                        self.cancel.cancel();
                        return;
                    }
                    _ = sighup.recv() => {
                        info!("received SIGHUP, reloading configuration");
                        if let Err(e) = self.reload().await {
                            error!(error = %e, "config reload failed, continuing with previous configuration");
                        }
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            self.cancel.cancel();
        }
    }

    /// Reload `config.yaml`/`services.yaml`/`wireguard.yaml` from disk and
    /// add any service present in the new document but missing from the
    /// live proxy, republishing mDNS for it.
    pub async fn reload(&self) -> Result<()> {
        let config_path = self.config.read().await.path().to_path_buf();
        let new_config = Config::from_file(&config_path)?;

        let services_before: std::collections::HashSet<String> = self
            .proxy_server
            .list_services()
            .await
            .into_iter()
            .map(|s| s.name.to_lowercase())
            .collect();

        let new_services = new_config.services.services.clone();
        *self.config.write().await = new_config;

        let proxy_port = self.proxy_port().await;

        for service_cfg in new_services {
            if !services_before.contains(&service_cfg.name.to_lowercase()) {
                if let Err(e) = self.install_service(&service_cfg, proxy_port).await {
                    error!(service = %service_cfg.name, error = %e, "failed to add service discovered on reload");
                }
            }
        }

        Ok(())
    }

    async fn shutdown_subsystems(&self) {
        self.proxy_server.stop_health_loop();
        self.tunnel_manager.stop_health_loop();
        if let Some(jellyfin) = self.jellyfin.write().await.take() {
            jellyfin.stop();
        }
        if let Some(mdns) = self.mdns.write().await.take() {
            mdns.shutdown();
        }

        let names: Vec<String> = self
            .tunnel_manager
            .list_tunnels()
            .await
            .into_iter()
            .map(|t| t.name)
            .collect();
        for name in names {
            if let Err(e) = self.tunnel_manager.delete_tunnel(&name).await {
                warn!(tunnel = %name, error = %e, "failed to stop tunnel during shutdown");
            }
        }

        self.resolver.close();
    }

    /// Signal a graceful shutdown.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Signal a graceful restart: subsystems tear down exactly as on
    /// shutdown, but `run()` returns `true` so the caller (main) reloads
    /// config and calls `run()` again.
    pub fn request_restart(&self) {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn install_service(&self, cfg: &ServiceConfig, proxy_port: u16) -> Result<Arc<Service>> {
        let service = Service::from_config(cfg)?;
        self.proxy_server.add_service(service).await;
        let installed = self
            .proxy_server
            .get_service(&cfg.name)
            .await
            .ok_or_else(|| FinGuardError::Fatal("service vanished immediately after insertion".to_string()))?;

        if let Some(tunnel) = &installed.tunnel {
            self.ensure_tunnel_route(tunnel, installed.upstream_host()).await;
        }

        if let Some(mdns) = self.mdns.read().await.as_ref() {
            if installed.publish_mdns {
                if let Err(e) = mdns
                    .publish_service(
                        &installed.name,
                        &installed.upstream_raw,
                        proxy_port,
                        installed.websocket,
                        installed.default,
                        installed.tunnel.as_deref(),
                    )
                    .await
                {
                    warn!(service = %installed.name, error = %e, "failed to publish mdns record");
                }
            }
        }

        Ok(installed)
    }

    /// Add a service at runtime (management API `POST /api/v1/services`).
    /// Rejects a duplicate name with [`FinGuardError::ResourceBusy`].
    pub async fn add_service(&self, cfg: ServiceConfig) -> Result<Arc<Service>> {
        if self.proxy_server.get_service(&cfg.name).await.is_some() {
            return Err(FinGuardError::ResourceBusy(format!("service '{}' already exists", cfg.name)));
        }

        let proxy_port = self.proxy_port().await;
        let service = self.install_service(&cfg, proxy_port).await?;

        let mut config = self.config.write().await;
        config.services.services.push(cfg);
        if let Err(e) = config.persist_services() {
            warn!(error = %e, "failed to persist services.yaml after add_service");
        }

        Ok(service)
    }

    /// Remove a service at runtime (management API `DELETE`).
    pub async fn remove_service(&self, name: &str) -> Result<()> {
        let existing = self
            .proxy_server
            .get_service(name)
            .await
            .ok_or_else(|| FinGuardError::NotFound(format!("service '{}' not found", name)))?;

        if let Some(tunnel) = &existing.tunnel {
            self.remove_tunnel_route(tunnel, existing.upstream_host()).await;
        }

        self.proxy_server.remove_service(name).await;

        if let Some(mdns) = self.mdns.read().await.as_ref() {
            if let Err(e) = mdns.unpublish_service(name).await {
                warn!(service = %name, error = %e, "failed to unpublish mdns record");
            }
        }

        let mut config = self.config.write().await;
        config.services.services.retain(|s| !s.name.eq_ignore_ascii_case(name));
        if let Err(e) = config.persist_services() {
            warn!(error = %e, "failed to persist services.yaml after remove_service");
        }

        Ok(())
    }

    /// All currently live services.
    pub async fn list_services(&self) -> Vec<Arc<Service>> {
        self.proxy_server.list_services().await
    }

    /// One live service by name.
    pub async fn get_service(&self, name: &str) -> Option<Arc<Service>> {
        self.proxy_server.get_service(name).await
    }

    /// Add and start a tunnel at runtime, persisting it to `wireguard.yaml`.
    pub async fn add_tunnel(&self, cfg: TunnelConfig) -> Result<TunnelStats> {
        let tunnel = self.tunnel_manager.create_tunnel(cfg.clone()).await?;

        let mut config = self.config.write().await;
        config.wireguard.tunnels.push(cfg);
        if let Err(e) = config.persist_wireguard() {
            warn!(error = %e, "failed to persist wireguard.yaml after add_tunnel");
        }

        Ok(tunnel.stats().await)
    }

    /// Remove and stop a tunnel at runtime.
    pub async fn remove_tunnel(&self, name: &str) -> Result<()> {
        self.tunnel_manager.delete_tunnel(name).await?;

        let mut config = self.config.write().await;
        config.wireguard.tunnels.retain(|t| !t.name.eq_ignore_ascii_case(name));
        if let Err(e) = config.persist_wireguard() {
            warn!(error = %e, "failed to persist wireguard.yaml after remove_tunnel");
        }

        Ok(())
    }

    /// Stop then start a tunnel.
    pub async fn restart_tunnel(&self, name: &str) -> Result<TunnelStats> {
        self.tunnel_manager.restart_tunnel(name).await?;
        self.tunnel_manager.status(name).await
    }

    /// Status for every configured tunnel.
    pub async fn list_tunnels(&self) -> Vec<TunnelStats> {
        self.tunnel_manager.list_tunnels().await
    }

    /// Status for one tunnel.
    pub async fn get_tunnel(&self, name: &str) -> Result<TunnelStats> {
        self.tunnel_manager.status(name).await
    }

    /// Aggregate status snapshot for `GET /api/v1/status`.
    pub async fn status(&self) -> SystemStatus {
        let tunnels = self.list_tunnels().await;
        let interfaces = tunnels.iter().filter_map(|t| t.interface.clone()).collect();
        let services = self.list_services().await;
        let (ipv4, ipv6) = discover_local_addrs();

        SystemStatus {
            proxy: self.proxy_server.is_ready(),
            tunnels: tunnels.into_iter().map(TunnelStatusView::from).collect(),
            services: services.into_iter().map(ServiceStatusView::from).collect(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            ipv4: ipv4.map(|ip| ip.to_string()),
            ipv6: ipv6.map(|ip| ip.to_string()),
            interfaces,
        }
    }

    async fn ensure_tunnel_route(&self, tunnel_name: &str, upstream_host: &str) {
        let ip = match self.resolver.resolve(upstream_host).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!(tunnel = %tunnel_name, host = %upstream_host, error = %e, "failed to resolve upstream for tunnel route");
                return;
            }
        };
        let cidr = host_cidr(ip);

        let updated = {
            let mut config = self.config.write().await;
            let idx = match config
                .wireguard
                .tunnels
                .iter()
                .position(|t| t.name.eq_ignore_ascii_case(tunnel_name))
            {
                Some(i) => i,
                None => return,
            };
            if config.wireguard.tunnels[idx].routes.iter().any(|r| r == &cidr) {
                return;
            }
            config.wireguard.tunnels[idx].routes.push(cidr);
            let updated = config.wireguard.tunnels[idx].clone();
            if let Err(e) = config.persist_wireguard() {
                warn!(error = %e, "failed to persist wireguard.yaml after route sync");
            }
            updated
        };

        if let Err(e) = self.tunnel_manager.update_tunnel(updated).await {
            warn!(tunnel = %tunnel_name, error = %e, "failed to push route update to running tunnel");
        }
    }

    async fn remove_tunnel_route(&self, tunnel_name: &str, upstream_host: &str) {
        let ip = match self.resolver.resolve(upstream_host).await {
            Ok(ip) => ip,
            Err(_) => return,
        };
        let cidr = host_cidr(ip);

        let updated = {
            let mut config = self.config.write().await;
            let idx = match config
                .wireguard
                .tunnels
                .iter()
                .position(|t| t.name.eq_ignore_ascii_case(tunnel_name))
            {
                Some(i) => i,
                None => return,
            };
            let before = config.wireguard.tunnels[idx].routes.len();
            config.wireguard.tunnels[idx].routes.retain(|r| r != &cidr);
            if config.wireguard.tunnels[idx].routes.len() == before {
                return;
            }
            let updated = config.wireguard.tunnels[idx].clone();
            if let Err(e) = config.persist_wireguard() {
                warn!(error = %e, "failed to persist wireguard.yaml after route removal");
            }
            updated
        };

        if let Err(e) = self.tunnel_manager.update_tunnel(updated).await {
            warn!(tunnel = %tunnel_name, error = %e, "failed to push route removal to running tunnel");
        }
    }
}

fn host_cidr(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{}/32", v4),
        IpAddr::V6(v6) => format!("{}/128", v6),
    }
}

fn discover_local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some(v4),
        _ => None,
    }
}

fn discover_local_addrs() -> (Option<Ipv4Addr>, Option<std::net::Ipv6Addr>) {
    let v4 = discover_local_ipv4();
    let v6 = std::net::UdpSocket::bind("[::]:0")
        .ok()
        .and_then(|s| s.connect("[2001:4860:4860::8888]:80").ok().map(|_| s))
        .and_then(|s| s.local_addr().ok())
        .and_then(|addr| match addr.ip() {
            IpAddr::V6(v6) if !v6.is_loopback() => Some(v6),
            _ => None,
        });
    (v4, v6)
}
