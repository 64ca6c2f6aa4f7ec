//! LAN discovery: mDNS advertisement (C7) and the Jellyfin auto-discovery
//! responder (C8).

mod jellyfin;
mod mdns;

pub use jellyfin::JellyfinResponder;
pub use mdns::MdnsPublisher;
