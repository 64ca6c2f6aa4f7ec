//! Manual WireGuard device smoke test.
//!
//! Creates a real TUN device and a single boringtun-backed peer, then runs
//! the device's packet-processing tasks for a few seconds. Requires root (or
//! `CAP_NET_ADMIN`) to create the interface. Not built by `cargo test`; run
//! directly with `cargo run --bin test_device` after wiring it into
//! `Cargo.toml`, or via `rustc --edition 2021 -L target/debug/deps ...`.

use finguard::config::PeerConfig as ConfigPeerConfig;
use finguard::platform::get_platform;
use finguard::wireguard::{DeviceConfig, KeyPair, PeerConfig, WgDevice};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    println!("WireGuard device test");

    println!("generating local keypair...");
    let local_keypair = KeyPair::generate();
    println!("  local public key: {}", local_keypair.public);

    println!("generating peer keypair...");
    let peer_keypair = KeyPair::generate();
    println!("  peer public key: {}", peer_keypair.public);

    let peer_config = PeerConfig::from_config(&ConfigPeerConfig {
        name: "test-peer".to_string(),
        public_key: peer_keypair.public.to_base64(),
        endpoint: Some("127.0.0.1:51820".to_string()),
        allowed_ips: vec!["10.0.0.0/24".to_string()],
        preshared_key: None,
        persistent_keepalive_secs: 25,
    })?;
    println!("  peer: {} -> {:?}", peer_config.name, peer_config.endpoint_host);

    let interface_name = if cfg!(target_os = "macos") {
        "utun".to_string()
    } else {
        "wg-test".to_string()
    };

    println!("detecting platform...");
    let platform = get_platform();
    println!("  platform: {:?}", platform.info().os);

    match platform.check_capabilities() {
        Ok(missing) if missing.is_empty() => println!("  all capabilities available"),
        Ok(missing) => {
            println!("  missing capabilities: {:?}", missing);
            println!("  try: sudo -E cargo run --bin test_device");
            return Ok(());
        }
        Err(e) => {
            println!("  failed to check capabilities: {}", e);
            return Err(e.into());
        }
    }

    println!("creating tun device '{}'...", interface_name);
    let tun = platform.create_tun(&interface_name, 1420)?;
    tun.add_address("10.0.0.2/24")?;
    let tun = Arc::new(Mutex::new(tun));

    let peer_addr = "127.0.0.1:51820".parse()?;
    let device_config = DeviceConfig {
        keypair: local_keypair,
        listen_port: 0,
        peers: vec![(peer_config, Some(peer_addr))],
    };

    println!("creating wireguard device...");
    let device = WgDevice::new(device_config, tun).await?;
    println!("  device created");

    let stats = device.stats().await;
    println!("initial stats: tx={} rx={} errors={}", stats.tx_bytes, stats.rx_bytes, stats.errors);

    println!("running for 5 seconds to verify packet processing tasks...");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let stats = device.stats().await;
    println!("after 5s: tx={} rx={} errors={}", stats.tx_bytes, stats.rx_bytes, stats.errors);

    println!("stopping device...");
    device.stop().await?;
    println!("device stopped");

    Ok(())
}
