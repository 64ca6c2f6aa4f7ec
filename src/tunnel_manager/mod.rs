//! Tunnel Manager (C4): a name-keyed map of [`Tunnel`]s plus the periodic
//! health loop that notices a `Stopped` tunnel and tries to bring it back.
//!
//! Ordering: operations on a single tunnel serialize via that tunnel's own
//! internal locks (see `wireguard::tunnel`); the map's `RwLock` is held only
//! long enough to look up or mutate the key set, never across a `Tunnel`
//! operation such as `start`/`stop`.

use crate::config::TunnelConfig;
use crate::error::{FinGuardError, Result};
use crate::resolver::Resolver;
use crate::wireguard::{Tunnel, TunnelState, TunnelStats};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CREATE_RETRIES: u32 = 3;
const CREATE_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const DELETE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_LOOP_INTERVAL: Duration = Duration::from_secs(15);
const MAX_GLOBAL_RETRY_ATTEMPTS: u32 = 3;

/// A name-keyed collection of tunnels with retrying create/delete and a
/// background recovery loop.
pub struct TunnelManager {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
    resolver: Resolver,
    running: AtomicBool,
    global_retry_attempts: AtomicU32,
    last_error: RwLock<Option<String>>,
    health_cancel: CancellationToken,
}

impl TunnelManager {
    /// Construct a manager around an existing resolver handle (shared with
    /// the rest of the process) without starting its health loop yet.
    pub fn new(resolver: Resolver) -> Arc<Self> {
        Arc::new(Self {
            tunnels: RwLock::new(HashMap::new()),
            resolver,
            running: AtomicBool::new(false),
            global_retry_attempts: AtomicU32::new(0),
            last_error: RwLock::new(None),
            health_cancel: CancellationToken::new(),
        })
    }

    /// Begin the 15s health loop and mark the manager running.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let manager = self.clone();
        let cancel = self.health_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_LOOP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("tunnel manager health loop cancelled");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                manager.health_tick().await;
            }
        });
    }

    /// Stop the health loop. Does not stop individual tunnels.
    pub fn stop_health_loop(&self) {
        self.health_cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    async fn health_tick(self: &Arc<Self>) {
        let stopped: Vec<String> = {
            let tunnels = self.tunnels.read().await;
            let mut names = Vec::new();
            for (name, tunnel) in tunnels.iter() {
                if tunnel.state().await == TunnelState::Stopped {
                    names.push(name.clone());
                }
            }
            names
        };

        if stopped.is_empty() {
            return;
        }

        let attempts = self.global_retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > MAX_GLOBAL_RETRY_ATTEMPTS {
            warn!(
                stopped = ?stopped,
                "tunnel manager exhausted global recovery attempts, manual intervention required"
            );
            return;
        }

        info!(attempt = attempts, stopped = ?stopped, "attempting tunnel recovery");
        self.recover().await;
    }

    /// Start every `Stopped` tunnel. Resets the global retry counter if
    /// every attempted tunnel comes back up.
    pub async fn recover(self: &Arc<Self>) {
        let tunnels: Vec<Arc<Tunnel>> = self.tunnels.read().await.values().cloned().collect();
        let mut all_ok = true;

        for tunnel in tunnels {
            if tunnel.state().await != TunnelState::Stopped {
                continue;
            }
            match tunnel.start(self.resolver.clone()).await {
                Ok(()) => info!(tunnel = %tunnel.name(), "tunnel recovered"),
                Err(e) => {
                    all_ok = false;
                    warn!(tunnel = %tunnel.name(), error = %e, "tunnel recovery attempt failed");
                    *self.last_error.write().await = Some(e.to_string());
                }
            }
        }

        if all_ok {
            self.global_retry_attempts.store(0, Ordering::SeqCst);
        }
    }

    /// Ready iff the health loop is running and the manager hasn't
    /// exhausted its global recovery budget.
    pub fn is_ready(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.global_retry_attempts.load(Ordering::SeqCst) < MAX_GLOBAL_RETRY_ATTEMPTS
    }

    /// Create and start a new tunnel, retrying up to 3 times with linear
    /// backoff (2s * attempt) on start failure. On final failure the
    /// partially constructed tunnel is stopped and discarded; the map is
    /// left unchanged.
    pub async fn create_tunnel(self: &Arc<Self>, config: TunnelConfig) -> Result<Arc<Tunnel>> {
        let key = config.name.to_lowercase();
        {
            let tunnels = self.tunnels.read().await;
            if tunnels.contains_key(&key) {
                return Err(FinGuardError::ResourceBusy(format!(
                    "tunnel '{}' already exists",
                    config.name
                )));
            }
        }

        let tunnel = Arc::new(Tunnel::new(config)?);

        let mut last_err = None;
        for attempt in 1..=CREATE_RETRIES {
            match tunnel.start(self.resolver.clone()).await {
                Ok(()) => {
                    self.tunnels.write().await.insert(key, tunnel.clone());
                    return Ok(tunnel);
                }
                Err(e) => {
                    warn!(
                        tunnel = %tunnel.name(),
                        attempt,
                        error = %e,
                        "tunnel start attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < CREATE_RETRIES {
                        tokio::time::sleep(CREATE_RETRY_BASE_DELAY * attempt).await;
                    }
                }
            }
        }

        let _ = tunnel.stop().await;
        Err(last_err.unwrap_or_else(|| {
            FinGuardError::TransientNetwork("tunnel start failed with no recorded error".to_string())
        }))
    }

    /// Apply a new configuration to an existing tunnel, delegating to
    /// [`Tunnel::update`]'s rollback semantics.
    pub async fn update_tunnel(&self, config: TunnelConfig) -> Result<()> {
        let key = config.name.to_lowercase();
        let tunnel = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .get(&key)
                .cloned()
                .ok_or_else(|| FinGuardError::NotFound(format!("tunnel '{}' not found", config.name)))?
        };
        tunnel.update(config, self.resolver.clone()).await
    }

    /// Remove `name` from the map, then stop it with a 30s timeout. The map
    /// mutation happens before `stop` so a concurrent `list_tunnels` never
    /// observes a stopping tunnel under its old name.
    pub async fn delete_tunnel(&self, name: &str) -> Result<()> {
        let key = name.to_lowercase();
        let tunnel = {
            let mut tunnels = self.tunnels.write().await;
            tunnels
                .remove(&key)
                .ok_or_else(|| FinGuardError::NotFound(format!("tunnel '{}' not found", name)))?
        };

        match tokio::time::timeout(DELETE_TIMEOUT, tunnel.stop()).await {
            Ok(result) => result,
            Err(_) => Err(FinGuardError::Timeout(format!(
                "tunnel '{}' did not stop within {:?}",
                name, DELETE_TIMEOUT
            ))),
        }
    }

    /// Point-in-time status for one tunnel, decorated with the manager's
    /// `last_error` if it's reported `Stopped`.
    pub async fn status(&self, name: &str) -> Result<TunnelStats> {
        let tunnel = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .get(&name.to_lowercase())
                .cloned()
                .ok_or_else(|| FinGuardError::NotFound(format!("tunnel '{}' not found", name)))?
        };
        let mut stats = tunnel.stats().await;
        if stats.state == TunnelState::Stopped && stats.last_error.is_none() {
            stats.last_error = self.last_error.read().await.clone();
        }
        Ok(stats)
    }

    /// Snapshot status for every tunnel, in no particular order.
    pub async fn list_tunnels(&self) -> Vec<TunnelStats> {
        let tunnels = self.tunnels.read().await;
        let mut out = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels.values() {
            out.push(tunnel.stats().await);
        }
        out
    }

    /// Look up a tunnel by name, for callers (e.g. the Supervisor) that
    /// need to push a route update directly.
    pub async fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().await.get(&name.to_lowercase()).cloned()
    }

    /// Restart a tunnel: stop then start, without removing it from the map.
    pub async fn restart_tunnel(&self, name: &str) -> Result<()> {
        let tunnel = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .get(&name.to_lowercase())
                .cloned()
                .ok_or_else(|| FinGuardError::NotFound(format!("tunnel '{}' not found", name)))?
        };
        tunnel.stop().await?;
        tunnel.start(self.resolver.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config(name: &str) -> TunnelConfig {
        TunnelConfig {
            name: name.to_string(),
            listen_port: 0,
            private_key: crate::wireguard::PrivateKey::generate().to_base64(),
            mtu: 1420,
            addresses: vec![],
            routes: vec![],
            peers: vec![],
            monitor_interval_secs: 30,
            stale_connection_timeout_secs: 300,
            reconnection_retries: 3,
        }
    }

    #[tokio::test]
    async fn delete_missing_tunnel_is_not_found() {
        let manager = TunnelManager::new(Resolver::spawn());
        let err = manager.delete_tunnel("nope").await.unwrap_err();
        assert!(matches!(err, FinGuardError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_missing_tunnel_is_not_found() {
        let manager = TunnelManager::new(Resolver::spawn());
        let err = manager.update_tunnel(sample_config("wg0")).await.unwrap_err();
        assert!(matches!(err, FinGuardError::NotFound(_)));
    }

    #[tokio::test]
    async fn fresh_manager_is_not_ready_until_started() {
        let manager = TunnelManager::new(Resolver::spawn());
        assert!(!manager.is_ready());
        manager.start();
        assert!(manager.is_ready());
        manager.stop_health_loop();
    }

    #[tokio::test]
    async fn list_tunnels_empty_on_fresh_manager() {
        let manager = TunnelManager::new(Resolver::spawn());
        assert!(manager.list_tunnels().await.is_empty());
    }
}
