//! Cross-module integration tests: config loading/validation tied together
//! with the proxy service registry and tunnel construction.

use finguard::config::{Config, PeerConfig, ServiceConfig, TunnelConfig, WireGuardConfig};
use finguard::proxy::{ProxyServer, Service};
use finguard::wireguard::{KeyPair, Tunnel, TunnelState};
use std::io::Write;
use tempfile::TempDir;

fn write_config_tree(dir: &TempDir, admin_token: &str) -> std::path::PathBuf {
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
fn config_rejects_service_referencing_unknown_tunnel_end_to_end() {
    let dir = TempDir::new().unwrap();
    let path = write_config_tree(&dir, "secret-token");
    std::fs::write(
        dir.path().join("services.yaml"),
        "services:\n  - name: media\n    upstream: http://10.0.0.5:8096\n    tunnel: wg0\n",
    )
    .unwrap();

    assert!(Config::from_file(&path).is_err());
}

#[test]
fn config_accepts_service_referencing_declared_tunnel() {
    let dir = TempDir::new().unwrap();
    let path = write_config_tree(&dir, "secret-token");

    let keypair = KeyPair::generate();
    let wireguard = TunnelConfig {
        name: "wg0".to_string(),
        listen_port: 0,
        private_key: keypair.private.to_base64(),
        mtu: 1420,
        addresses: vec!["10.8.0.1/24".to_string()],
        routes: vec![],
        peers: vec![],
        monitor_interval_secs: 30,
        stale_connection_timeout_secs: 300,
        reconnection_retries: 3,
    };
    let wireguard_doc = WireGuardConfig { tunnels: vec![wireguard] };
    std::fs::write(
        dir.path().join("wireguard.yaml"),
        serde_yaml::to_string(&wireguard_doc).unwrap(),
    )
    .unwrap();

    std::fs::write(
        dir.path().join("services.yaml"),
        "services:\n  - name: media\n    upstream: http://10.0.0.5:8096\n    tunnel: wg0\n",
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.wireguard.tunnels.len(), 1);
    assert_eq!(config.services.services.len(), 1);
    assert_eq!(config.services.services[0].tunnel.as_deref(), Some("wg0"));
}

#[tokio::test]
async fn proxy_service_registry_add_get_remove_round_trip() {
    let proxy = ProxyServer::new();

    let cfg = ServiceConfig {
        name: "media".to_string(),
        upstream: "http://10.0.0.5:8096".to_string(),
        websocket: false,
        default: false,
        publish_mdns: false,
        jellyfin: false,
        tunnel: None,
    };
    let service = Service::from_config(&cfg).unwrap();
    proxy.add_service(service).await;

    assert!(proxy.get_service("media").await.is_some());
    assert_eq!(proxy.list_services().await.len(), 1);

    assert!(proxy.remove_service("media").await);
    assert!(proxy.get_service("media").await.is_none());
    assert!(proxy.list_services().await.is_empty());
}

#[tokio::test]
async fn tunnel_constructed_from_loaded_config_is_stopped_with_matching_peers() {
    let keypair = KeyPair::generate();
    let peer_keypair = KeyPair::generate();

    let config = TunnelConfig {
        name: "wg-it".to_string(),
        listen_port: 0,
        private_key: keypair.private.to_base64(),
        mtu: 1420,
        addresses: vec!["10.8.0.1/24".to_string()],
        routes: vec![],
        peers: vec![PeerConfig {
            name: "peer-a".to_string(),
            public_key: peer_keypair.public.to_base64(),
            endpoint: Some("198.51.100.1:51820".to_string()),
            allowed_ips: vec!["10.8.0.2/32".to_string()],
            preshared_key: None,
            persistent_keepalive_secs: 25,
        }],
        monitor_interval_secs: 30,
        stale_connection_timeout_secs: 300,
        reconnection_retries: 3,
    };

    let tunnel = Tunnel::new(config).unwrap();
    assert_eq!(tunnel.state().await, TunnelState::Stopped);
    assert_eq!(tunnel.stats().await.total_peers, 1);
}
