//! Jellyfin Responder (C8): emulates Jellyfin's UDP/7359 LAN auto-discovery
//! protocol on behalf of any service flagged `jellyfin`.

use crate::error::FinGuardError;
use crate::proxy::{ProxyServer, Service};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const PROBE: &str = "Who is JellyfinServer?";
const LISTEN_PORT: u16 = 7359;
const INFO_CACHE_TTL: Duration = Duration::from_secs(300);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);
const DATAGRAM_SPACING: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
struct SystemInfoPublic {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "ServerName")]
    server_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JellyfinAnnounce {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "EndpointAddress")]
    endpoint_address: Option<String>,
}

#[derive(Clone)]
struct CachedInfo {
    info: SystemInfoPublic,
    fetched_at: Instant,
}

/// Exclusive owner of the UDP/7359 socket.
pub struct JellyfinResponder {
    local_ip: Ipv4Addr,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CachedInfo>>,
    cancel: CancellationToken,
}

impl JellyfinResponder {
    /// Construct the responder around the host's discovered LAN address.
    pub fn new(local_ip: Ipv4Addr) -> Arc<Self> {
        Arc::new(Self {
            local_ip,
            client: reqwest::Client::builder()
                .timeout(INFO_TIMEOUT)
                .build()
                .expect("failed to build jellyfin discovery http client"),
            cache: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Bind UDP/7359 and start the receive loop against the live service
    /// registry. The socket is exclusively owned by this task.
    pub async fn start(self: &Arc<Self>, services: Arc<ProxyServer>) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", LISTEN_PORT))
            .await
            .map_err(FinGuardError::Io)?;
        let responder = self.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = socket.recv_from(&mut buf) => r,
                };
                match received {
                    Ok((n, src)) => {
                        if is_probe(&buf[..n]) {
                            responder.handle_probe(&socket, src, &services).await;
                        }
                    }
                    Err(e) => warn!(error = %e, "jellyfin udp recv failed"),
                }
            }
        });

        Ok(())
    }

    /// Stop the receive loop, releasing UDP/7359.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn handle_probe(&self, socket: &UdpSocket, src: SocketAddr, services: &Arc<ProxyServer>) {
        for service in services.list_services().await {
            if !service.jellyfin {
                continue;
            }

            let Some(info) = self.system_info(&service).await else {
                continue;
            };

            let first = JellyfinAnnounce {
                address: self.local_ip.to_string(),
                id: info.id.clone(),
                name: info.server_name.clone(),
                endpoint_address: None,
            };
            let second = JellyfinAnnounce {
                address: format!("{}.finguard.local", service.name),
                id: format!("{}-svc", info.id),
                name: info.server_name.clone(),
                endpoint_address: None,
            };

            if let Ok(body) = serde_json::to_vec(&first) {
                let _ = socket.send_to(&body, src).await;
            }
            tokio::time::sleep(DATAGRAM_SPACING).await;
            if let Ok(body) = serde_json::to_vec(&second) {
                let _ = socket.send_to(&body, src).await;
            }
        }
    }

    async fn system_info(&self, service: &Service) -> Option<SystemInfoPublic> {
        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&service.name) {
                if cached.fetched_at.elapsed() < INFO_CACHE_TTL {
                    return Some(cached.info.clone());
                }
            }
        }

        let url = format!("{}/System/Info/Public", service.upstream_raw.trim_end_matches('/'));
        let response = match self.client.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(service = %service.name, status = %r.status(), "jellyfin system info returned non-success");
                return None;
            }
            Err(e) => {
                debug!(service = %service.name, error = %e, "jellyfin system info request failed");
                return None;
            }
        };

        let info: SystemInfoPublic = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                debug!(service = %service.name, error = %e, "jellyfin system info decode failed");
                return None;
            }
        };

        self.cache.lock().await.insert(
            service.name.clone(),
            CachedInfo {
                info: info.clone(),
                fetched_at: Instant::now(),
            },
        );
        Some(info)
    }
}

fn is_probe(buf: &[u8]) -> bool {
    std::str::from_utf8(buf)
        .map(|s| s.eq_ignore_ascii_case(PROBE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::proxy::Service;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn probe_match_is_case_insensitive() {
        assert!(is_probe(b"Who is JellyfinServer?"));
        assert!(is_probe(b"WHO IS JELLYFINSERVER?"));
        assert!(!is_probe(b"something else"));
    }

    /// A one-shot HTTP stub standing in for a Jellyfin upstream's
    /// `/System/Info/Public`: accepts one connection, replies with the given
    /// JSON body, then exits.
    async fn spawn_system_info_stub(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn probe_yields_two_spaced_datagrams_for_a_jellyfin_service() {
        let port = spawn_system_info_stub(r#"{"Id":"abc","ServerName":"Home"}"#).await;

        let cfg = ServiceConfig {
            name: "media".to_string(),
            upstream: format!("http://127.0.0.1:{}", port),
            websocket: false,
            default: false,
            publish_mdns: false,
            jellyfin: true,
            tunnel: None,
        };
        let service = Service::from_config(&cfg).unwrap();
        let proxy = ProxyServer::new();
        proxy.add_service(service).await;

        let responder = JellyfinResponder::new(Ipv4Addr::new(192, 168, 1, 10));
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        client_socket.send_to(PROBE.as_bytes(), server_addr).await.unwrap();
        let mut probe_buf = [0u8; 64];
        let (n, src) = server_socket.recv_from(&mut probe_buf).await.unwrap();
        assert!(is_probe(&probe_buf[..n]));

        responder.handle_probe(&server_socket, src, &proxy).await;

        let mut buf = [0u8; 512];
        let (n1, _) = client_socket.recv_from(&mut buf).await.unwrap();
        let first: JellyfinAnnounce = serde_json::from_slice(&buf[..n1]).unwrap();
        assert_eq!(first.address, "192.168.1.10");
        assert_eq!(first.id, "abc");
        assert_eq!(first.name, "Home");
        assert!(first.endpoint_address.is_none());

        let (n2, _) = client_socket.recv_from(&mut buf).await.unwrap();
        let second: JellyfinAnnounce = serde_json::from_slice(&buf[..n2]).unwrap();
        assert_eq!(second.address, "media.finguard.local");
        assert_eq!(second.id, "abc-svc");
        assert_eq!(second.name, "Home");
    }

    /// Binds the real fixed UDP/7359 port, so it must never run concurrently
    /// with another test doing the same (e.g. a future mDNS-publisher test
    /// binding a fixed port of its own).
    #[tokio::test]
    #[serial_test::serial]
    async fn start_binds_udp_7359_and_stop_releases_it() {
        let proxy = ProxyServer::new();
        let responder = JellyfinResponder::new(Ipv4Addr::new(127, 0, 0, 1));
        responder.start(proxy).await.unwrap();
        responder.stop();

        // The port is released asynchronously as the receive task observes
        // cancellation; give it a moment before asserting it's free again.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rebound = UdpSocket::bind(("0.0.0.0", LISTEN_PORT)).await;
        assert!(rebound.is_ok(), "port 7359 should be free after stop()");
    }

    #[tokio::test]
    async fn probe_sends_nothing_when_no_jellyfin_service_is_configured() {
        let proxy = ProxyServer::new();
        let responder = JellyfinResponder::new(Ipv4Addr::new(192, 168, 1, 10));
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_socket.local_addr().unwrap();

        responder.handle_probe(&server_socket, client_addr, &proxy).await;

        let mut buf = [0u8; 64];
        let result = tokio::time::timeout(Duration::from_millis(200), client_socket.recv_from(&mut buf)).await;
        assert!(result.is_err(), "no service configured should yield no datagrams");
    }
}
