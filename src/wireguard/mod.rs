//! WireGuard protocol and tunnel management
//!
//! This module handles the WireGuard protocol implementation: key
//! management, the UAPI line-protocol codec, the boringtun-backed device,
//! and the tunnel lifecycle/connectivity monitor built on top of it.

mod device;
pub mod keys;
mod peer;
mod tunnel;
pub mod uapi;

pub use device::{DeviceConfig, DeviceStats, WgDevice};
pub use keys::{KeyPair, PrivateKey, PublicKey};
pub use peer::{Peer, PeerConfig, PeerStats};
pub use tunnel::{Tunnel, TunnelState, TunnelStats};
