//! mDNS Publisher (C7): advertises each published service as an
//! `_http._tcp.local` record so `<service>.local` resolves on the LAN.

use crate::error::{FinGuardError, Result};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SERVICE_TYPE: &str = "_http._tcp.local.";

/// Embedded multicast-DNS responder. Runs in-process rather than shelling
/// out to Avahi, so the publishing contract holds identically on every
/// platform we support.
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    hostname: String,
    local_ip: Ipv4Addr,
    registered: Mutex<HashMap<String, Vec<String>>>,
    ready: AtomicBool,
}

impl MdnsPublisher {
    /// Discover a local IPv4 and hostname, and open the mDNS channel.
    pub fn start() -> Result<Arc<Self>> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| FinGuardError::Platform(format!("failed to start mdns daemon: {}", e)))?;
        let local_ip = discover_local_ipv4()?;
        let hostname = sanitize_label(&hostname_from_os(), 63, "finguard");

        info!(hostname = %hostname, ip = %local_ip, "mdns publisher started");

        Ok(Arc::new(Self {
            daemon,
            hostname,
            local_ip,
            registered: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(true),
        }))
    }

    /// Whether the mDNS channel is open and ready to publish.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Advertise `name` on `proxy_port`, plus a `<name>.<host>.local` alias
    /// pointed at this host.
    pub async fn publish_service(
        &self,
        name: &str,
        upstream: &str,
        proxy_port: u16,
        websocket: bool,
        default: bool,
        tunnel: Option<&str>,
    ) -> Result<()> {
        let sanitized = sanitize_label(name, 50, "service");

        let mut props = HashMap::new();
        props.insert("service".to_string(), name.to_string());
        props.insert("upstream".to_string(), upstream.to_string());
        props.insert("path".to_string(), "/".to_string());
        if websocket {
            props.insert("websocket".to_string(), "true".to_string());
        }
        if default {
            props.insert("default".to_string(), "true".to_string());
        }
        if let Some(tunnel) = tunnel {
            props.insert("tunnel".to_string(), tunnel.to_string());
        }

        let host_fqdn = format!("{}.local.", self.hostname);
        let primary = ServiceInfo::new(SERVICE_TYPE, &sanitized, &host_fqdn, self.local_ip, proxy_port, props)
            .map_err(|e| FinGuardError::Platform(format!("invalid mdns service info for '{}': {}", name, e)))?;
        let primary_fullname = primary.get_fullname().to_string();
        self.daemon
            .register(primary)
            .map_err(|e| FinGuardError::Platform(format!("failed to register mdns service '{}': {}", name, e)))?;

        // mdns-sd has no raw CNAME API, so the `<name>.<host>.local -> <host>.local`
        // alias is approximated with its own A record at the alias name, which
        // resolves to the same place a CNAME chase would land.
        let alias_instance = format!("{}-alias", sanitized);
        let alias_host = format!("{}.{}.local.", sanitized, self.hostname);
        let alias = ServiceInfo::new(
            SERVICE_TYPE,
            &alias_instance,
            &alias_host,
            self.local_ip,
            proxy_port,
            HashMap::new(),
        )
        .map_err(|e| FinGuardError::Platform(format!("invalid mdns alias info for '{}': {}", name, e)))?;
        let alias_fullname = alias.get_fullname().to_string();
        self.daemon
            .register(alias)
            .map_err(|e| FinGuardError::Platform(format!("failed to register mdns alias for '{}': {}", name, e)))?;

        self.registered
            .lock()
            .await
            .insert(name.to_lowercase(), vec![primary_fullname, alias_fullname]);
        Ok(())
    }

    /// Withdraw a previously published service and its alias.
    pub async fn unpublish_service(&self, name: &str) -> Result<()> {
        if let Some(fullnames) = self.registered.lock().await.remove(&name.to_lowercase()) {
            for fullname in fullnames {
                if let Err(e) = self.daemon.unregister(&fullname) {
                    warn!(service = %name, error = %e, "failed to unregister mdns record");
                }
            }
        }
        Ok(())
    }

    /// Names of every currently-published service.
    pub async fn list_services(&self) -> Vec<String> {
        self.registered.lock().await.keys().cloned().collect()
    }

    /// Close the mDNS channel.
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        if let Err(e) = self.daemon.shutdown() {
            warn!(error = %e, "mdns daemon shutdown reported an error");
        }
    }
}

fn discover_local_ipv4() -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").map_err(FinGuardError::Io)?;
    socket
        .connect("8.8.8.8:80")
        .map_err(FinGuardError::Io)?;
    match socket.local_addr().map_err(FinGuardError::Io)?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Ok(v4),
        other => Err(FinGuardError::Platform(format!(
            "no usable non-loopback IPv4 address found (got {:?})",
            other
        ))),
    }
}

fn hostname_from_os() -> String {
    let mut buf = vec![0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "finguard".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

/// Lower-case, keep `[a-z0-9-]`, collapse everything else to `-`, trim
/// leading/trailing `-`, truncate to `max_len`, and fall back to `fallback`
/// if the result is empty.
fn sanitize_label(input: &str, max_len: usize, fallback: &str) -> String {
    let mapped: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches('-');
    let truncated: String = trimmed.chars().take(max_len).collect();
    let truncated = truncated.trim_matches('-');
    if truncated.is_empty() {
        fallback.to_string()
    } else {
        truncated.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_to_lowercase_alnum_dash() {
        assert_eq!(sanitize_label("My Service!!", 50, "service"), "my-service");
    }

    #[test]
    fn trims_leading_and_trailing_dashes() {
        assert_eq!(sanitize_label("--edge--", 50, "service"), "edge");
    }

    #[test]
    fn falls_back_when_empty_after_sanitizing() {
        assert_eq!(sanitize_label("!!!", 50, "service"), "service");
    }

    #[test]
    fn truncates_to_max_len() {
        let long = "a".repeat(80);
        assert_eq!(sanitize_label(&long, 50, "service").len(), 50);
    }
}
