//! Bounded-concurrency hostname resolution with TTL caching.
//!
//! WireGuard peer endpoints and reverse-proxy upstreams may name a hostname
//! rather than a literal IP. Resolving those on every dial would make every
//! caller pay DNS latency and would let a slow or hung resolver exhaust file
//! descriptors; this module gives the rest of the crate a single bounded
//! front door onto `tokio::net::lookup_host`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{FinGuardError, Result};

const WORKER_COUNT: usize = 4;
const QUEUE_CAPACITY: usize = 256;
const MAX_IN_FLIGHT: usize = 32;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_TTL: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const MAX_EVICTIONS_PER_SWEEP: usize = 1000;

/// Lock-free resolver counters, suitable for exposing via the management API.
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Lookups served from a live cache entry.
    pub hits: AtomicU64,
    /// Lookups that required a fresh resolution.
    pub misses: AtomicU64,
    /// Lookups that failed (including rejections for being over capacity).
    pub errors: AtomicU64,
    /// Lookups that exceeded the per-lookup timeout.
    pub timeouts: AtomicU64,
}

impl ResolverStats {
    /// Snapshot the four counters.
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
            self.timeouts.load(Ordering::Relaxed),
        )
    }
}

struct CacheEntry {
    addr: IpAddr,
    expires_at: Instant,
}

struct Request {
    host: String,
    reply: oneshot::Sender<Result<IpAddr>>,
}

/// Handle to the resolver's worker pool. Cheaply cloneable.
#[derive(Clone)]
pub struct Resolver {
    tx: mpsc::Sender<Request>,
    stats: Arc<ResolverStats>,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
    cancel: CancellationToken,
}

impl Resolver {
    /// Spawn the fixed worker pool, shared cache and periodic sweeper.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cache: Arc<Mutex<HashMap<String, CacheEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(ResolverStats::default());
        let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let cancel = CancellationToken::new();

        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..WORKER_COUNT {
            let rx = rx.clone();
            let cache = cache.clone();
            let stats = stats.clone();
            let in_flight = in_flight.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let request = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(worker_id, "resolver worker cancelled");
                            break;
                        }
                        request = async {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        } => request,
                    };
                    let Some(request) = request else {
                        debug!(worker_id, "resolver worker shutting down, channel closed");
                        break;
                    };
                    handle_request(request, &cache, &stats, &in_flight).await;
                }
            });
        }

        {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("resolver sweeper cancelled");
                            break;
                        }
                        _ = ticker.tick() => {}
                    }
                    sweep(&cache).await;
                }
            });
        }

        Self {
            tx,
            stats,
            cache,
            cancel,
        }
    }

    /// Resolve `host` to an IP address, preferring the first IPv4 result and
    /// falling back to the first IPv6 result. Literal IP addresses resolve
    /// immediately without touching the worker pool or cache.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Ok(addr);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = Request {
            host: host.to_string(),
            reply: reply_tx,
        };

        self.tx.try_send(request).map_err(|_| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            FinGuardError::TransientNetwork(format!(
                "resolver queue full, rejecting lookup for '{}'",
                host
            ))
        })?;

        reply_rx.await.map_err(|_| {
            FinGuardError::TransientNetwork("resolver worker dropped reply channel".to_string())
        })?
    }

    /// Current (hits, misses, errors, timeouts) counters.
    pub fn stats(&self) -> (u64, u64, u64, u64) {
        self.stats.snapshot()
    }

    /// Synchronous fast path: returns `(host, true)` immediately for a
    /// literal IP address or a still-live cache entry, without touching the
    /// worker pool. Returns `(host, false)` when neither applies — the
    /// cache is consulted with a non-blocking `try_lock`, so a momentarily
    /// contended cache also falls back to `false` rather than waiting.
    /// Callers needing a resolution in that case must fall back to
    /// [`Resolver::resolve`].
    pub fn resolve_fast(&self, host: &str) -> (String, bool) {
        if host.parse::<IpAddr>().is_ok() {
            return (host.to_string(), true);
        }

        let Ok(guard) = self.cache.try_lock() else {
            return (host.to_string(), false);
        };

        match guard.get(host) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                (entry.addr.to_string(), true)
            }
            _ => (host.to_string(), false),
        }
    }

    /// Drain the worker pool and stop the periodic sweeper. Idempotent;
    /// safe to call from any clone of the handle.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

async fn handle_request(
    request: Request,
    cache: &Arc<Mutex<HashMap<String, CacheEntry>>>,
    stats: &Arc<ResolverStats>,
    in_flight: &Arc<Semaphore>,
) {
    let Request { host, reply } = request;

    {
        let guard = cache.lock().await;
        if let Some(entry) = guard.get(&host) {
            if entry.expires_at > Instant::now() {
                stats.hits.fetch_add(1, Ordering::Relaxed);
                let _ = reply.send(Ok(entry.addr));
                return;
            }
        }
    }

    let Ok(permit) = in_flight.clone().try_acquire_owned() else {
        stats.errors.fetch_add(1, Ordering::Relaxed);
        let _ = reply.send(Err(FinGuardError::TransientNetwork(format!(
            "resolver at capacity, rejecting lookup for '{}'",
            host
        ))));
        return;
    };

    stats.misses.fetch_add(1, Ordering::Relaxed);

    let lookup_host = format!("{}:0", host);
    let result = tokio::time::timeout(LOOKUP_TIMEOUT, tokio::net::lookup_host(lookup_host)).await;
    drop(permit);

    let resolved = match result {
        Ok(Ok(addrs)) => {
            let addrs: Vec<IpAddr> = addrs.map(|s| s.ip()).collect();
            let chosen = addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .copied();
            match chosen {
                Some(addr) => Ok(addr),
                None => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    Err(FinGuardError::TransientNetwork(format!(
                        "no addresses returned for '{}'",
                        host
                    )))
                }
            }
        }
        Ok(Err(e)) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            Err(FinGuardError::TransientNetwork(format!(
                "failed to resolve '{}': {}",
                host, e
            )))
        }
        Err(_) => {
            stats.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(host = %host, "hostname resolution timed out");
            Err(FinGuardError::Timeout(format!(
                "resolution of '{}' timed out after {:?}",
                host, LOOKUP_TIMEOUT
            )))
        }
    };

    if let Ok(addr) = &resolved {
        let mut guard = cache.lock().await;
        guard.insert(
            host.clone(),
            CacheEntry {
                addr: *addr,
                expires_at: Instant::now() + CACHE_TTL,
            },
        );
    }

    let _ = reply.send(resolved);
}

async fn sweep(cache: &Arc<Mutex<HashMap<String, CacheEntry>>>) {
    let now = Instant::now();
    let mut guard = cache.lock().await;
    let expired: Vec<String> = guard
        .iter()
        .filter(|(_, e)| e.expires_at <= now)
        .take(MAX_EVICTIONS_PER_SWEEP)
        .map(|(k, _)| k.clone())
        .collect();
    for key in expired {
        guard.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_ip_without_worker_pool() {
        let resolver = Resolver::spawn();
        let addr = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());
        let (hits, misses, errors, timeouts) = resolver.stats();
        assert_eq!((hits, misses, errors, timeouts), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn resolves_localhost_via_worker_pool_and_caches() {
        let resolver = Resolver::spawn();
        let first = resolver.resolve("localhost").await.unwrap();
        assert!(first.is_ipv4() || first.is_ipv6());

        let second = resolver.resolve("localhost").await.unwrap();
        assert_eq!(first, second);

        let (hits, misses, _, _) = resolver.stats();
        assert_eq!(misses, 1);
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let cache: Arc<Mutex<HashMap<String, CacheEntry>>> = Arc::new(Mutex::new(HashMap::new()));
        {
            let mut guard = cache.lock().await;
            guard.insert(
                "stale.example".to_string(),
                CacheEntry {
                    addr: "10.0.0.1".parse().unwrap(),
                    expires_at: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        sweep(&cache).await;
        assert!(cache.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resolve_fast_succeeds_immediately_for_a_literal_ip() {
        let resolver = Resolver::spawn();
        let (host, ok) = resolver.resolve_fast("127.0.0.1");
        assert!(ok);
        assert_eq!(host, "127.0.0.1");
    }

    #[tokio::test]
    async fn resolve_fast_misses_until_resolve_populates_the_cache() {
        let resolver = Resolver::spawn();

        let (_, ok) = resolver.resolve_fast("localhost");
        assert!(!ok, "nothing cached yet, fast path must not block");

        let resolved = resolver.resolve("localhost").await.unwrap();

        let (host, ok) = resolver.resolve_fast("localhost");
        assert!(ok);
        assert_eq!(host.parse::<IpAddr>().unwrap(), resolved);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_from_any_clone() {
        let resolver = Resolver::spawn();
        let other = resolver.clone();
        resolver.close();
        other.close();
    }
}
