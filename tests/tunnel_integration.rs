//! Integration tests for [`finguard::wireguard::Tunnel`] that don't require
//! creating a real TUN device: construction, config validation, state-machine
//! guards, and stats before start.
//!
//! Tests that bring a tunnel to `Running` need a TUN device and are out of
//! scope for an unprivileged test run; they aren't included here.

use finguard::config::{PeerConfig, TunnelConfig};
use finguard::wireguard::{KeyPair, Tunnel, TunnelState};

fn sample_tunnel_config() -> TunnelConfig {
    let keypair = KeyPair::generate();
    TunnelConfig {
        name: "wg-test".to_string(),
        listen_port: 0,
        private_key: keypair.private.to_base64(),
        mtu: 1420,
        addresses: vec!["10.8.0.1/24".to_string()],
        routes: vec![],
        peers: vec![],
        monitor_interval_secs: 30,
        stale_connection_timeout_secs: 300,
        reconnection_retries: 3,
    }
}

fn sample_peer_config() -> PeerConfig {
    let peer_keypair = KeyPair::generate();
    PeerConfig {
        name: "test-peer".to_string(),
        public_key: peer_keypair.public.to_base64(),
        endpoint: Some("127.0.0.1:51820".to_string()),
        allowed_ips: vec!["10.0.0.0/24".to_string()],
        preshared_key: None,
        persistent_keepalive_secs: 25,
    }
}

#[tokio::test]
async fn new_tunnel_is_stopped_and_untouched_by_the_os() {
    let tunnel = Tunnel::new(sample_tunnel_config()).unwrap();
    assert_eq!(tunnel.state().await, TunnelState::Stopped);
    assert_eq!(tunnel.name(), "wg-test");
}

#[tokio::test]
async fn tunnel_with_peer_constructs_and_reports_stopped() {
    let mut config = sample_tunnel_config();
    config.peers.push(sample_peer_config());
    let tunnel = Tunnel::new(config).unwrap();
    assert_eq!(tunnel.state().await, TunnelState::Stopped);
}

#[test]
fn invalid_interface_name_fails_validation() {
    let mut config = sample_tunnel_config();
    config.name = "".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn out_of_range_mtu_is_clamped_not_rejected() {
    let mut config = sample_tunnel_config();
    config.mtu = 40;
    config.validate().unwrap();
    assert_eq!(config.mtu, 1420);
}

#[test]
fn bad_private_key_fails_validation() {
    let mut config = sample_tunnel_config();
    config.private_key = "not-base64!!".to_string();
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn stopping_a_stopped_tunnel_is_a_no_op_not_an_error() {
    let tunnel = Tunnel::new(sample_tunnel_config()).unwrap();
    assert!(tunnel.stop().await.is_ok());
    assert_eq!(tunnel.state().await, TunnelState::Stopped);
}

#[tokio::test]
async fn stats_before_start_report_stopped_with_no_interface() {
    let mut config = sample_tunnel_config();
    config.peers.push(sample_peer_config());
    let tunnel = Tunnel::new(config).unwrap();

    let stats = tunnel.stats().await;
    assert_eq!(stats.state, TunnelState::Stopped);
    assert_eq!(stats.tx_bytes, 0);
    assert_eq!(stats.rx_bytes, 0);
    assert!(stats.interface.is_none());
}

#[test]
fn peer_with_invalid_allowed_ip_fails_validation() {
    let mut peer = sample_peer_config();
    peer.allowed_ips = vec!["10.0.0.0".to_string()];
    assert!(peer.validate().is_err());

    let mut peer = sample_peer_config();
    peer.allowed_ips = vec!["10.0.0.0/33".to_string()];
    assert!(peer.validate().is_err());
}

#[test]
fn peer_accepts_ipv6_cidr() {
    let mut peer = sample_peer_config();
    peer.allowed_ips = vec!["fd42::/48".to_string()];
    assert!(peer.validate().is_ok());
}

#[tokio::test]
async fn concurrent_tunnel_construction_is_independent() {
    let handles: Vec<_> = (0..5)
        .map(|_| {
            tokio::spawn(async move {
                let tunnel = Tunnel::new(sample_tunnel_config()).unwrap();
                assert_eq!(tunnel.state().await, TunnelState::Stopped);
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("task should complete");
    }
}
