//! Configuration validation functions
//!
//! Small, independently testable validators for interface names, IP
//! addresses, CIDRs, endpoints, keys and timing parameters. Composed by the
//! `*Config::validate` methods in the sibling modules.

use crate::error::{FinGuardError, Result};
use std::net::IpAddr;

/// Validate interface name (alphanumeric, max 15 chars — the kernel's IFNAMSIZ limit)
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(FinGuardError::Config(
            "interface name cannot be empty".to_string(),
        ));
    }

    if name.len() > 15 {
        return Err(FinGuardError::Config(format!(
            "interface name '{}' exceeds maximum length of 15 characters",
            name
        )));
    }

    if !name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(FinGuardError::Config(format!(
            "interface name '{}' contains invalid characters (only alphanumeric, '_', and '-' allowed)",
            name
        )));
    }

    Ok(())
}

/// Clamp an MTU value to the `[68, 65536]` range, defaulting to 1420 when
/// the input falls below the floor rather than rejecting it outright.
pub fn clamp_mtu(mtu: u16) -> u16 {
    if mtu < 68 {
        1420
    } else {
        mtu
    }
}

/// Validate IP address
pub fn validate_ip_address(ip: &str) -> Result<()> {
    ip.parse::<IpAddr>()
        .map_err(|_| FinGuardError::Config(format!("invalid IP address: {}", ip)))?;
    Ok(())
}

/// Validate CIDR notation (IP/prefix)
pub fn validate_cidr(cidr: &str) -> Result<()> {
    let parts: Vec<&str> = cidr.split('/').collect();

    if parts.len() != 2 {
        return Err(FinGuardError::Config(format!(
            "invalid CIDR notation: {} (expected format: IP/prefix)",
            cidr
        )));
    }

    validate_ip_address(parts[0])?;

    let prefix: u8 = parts[1]
        .parse()
        .map_err(|_| FinGuardError::Config(format!("invalid prefix length in CIDR: {}", cidr)))?;

    let ip: IpAddr = parts[0].parse().unwrap();
    let max_prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };

    if prefix > max_prefix {
        return Err(FinGuardError::Config(format!(
            "prefix length {} exceeds maximum {} for IP address {}",
            prefix, max_prefix, parts[0]
        )));
    }

    Ok(())
}

/// Validate endpoint format (host:port); host may be a hostname or a literal IP.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    let parts: Vec<&str> = endpoint.rsplitn(2, ':').collect();

    if parts.len() != 2 {
        return Err(FinGuardError::Config(format!(
            "invalid endpoint format: {} (expected format: host:port)",
            endpoint
        )));
    }

    let port: u16 = parts[0]
        .parse()
        .map_err(|_| FinGuardError::Config(format!("invalid port in endpoint: {}", endpoint)))?;

    if port == 0 {
        return Err(FinGuardError::Config("port number cannot be 0".to_string()));
    }

    let host = parts[1];
    if host.is_empty() {
        return Err(FinGuardError::Config(
            "host cannot be empty in endpoint".to_string(),
        ));
    }

    Ok(())
}

/// Validate a base64-encoded WireGuard key (private, public or preshared):
/// must decode to exactly 32 bytes.
pub fn validate_key(key: &str, field: &str) -> Result<()> {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    let decoded = BASE64
        .decode(key.trim())
        .map_err(|e| FinGuardError::Config(format!("invalid base64 {}: {}", field, e)))?;

    if decoded.len() != 32 {
        return Err(FinGuardError::Config(format!(
            "invalid {} length: expected 32 bytes, got {}",
            field,
            decoded.len()
        )));
    }

    Ok(())
}

/// Validate a parseable, absolute upstream URL (scheme + host present).
pub fn validate_upstream_url(url: &str) -> Result<()> {
    if !url.contains("://") {
        return Err(FinGuardError::Config(format!(
            "upstream URL '{}' is not absolute (missing scheme)",
            url
        )));
    }

    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or("");
    let host_part = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");

    if host_part.is_empty() {
        return Err(FinGuardError::Config(format!(
            "upstream URL '{}' has no host",
            url
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_validate_interface_name() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg-test").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wg@test").is_err());
        assert!(validate_interface_name("toolonginterfacename").is_err());
    }

    #[test]
    fn test_clamp_mtu() {
        assert_eq!(clamp_mtu(1420), 1420);
        assert_eq!(clamp_mtu(9000), 9000);
        assert_eq!(clamp_mtu(0), 1420);
        assert_eq!(clamp_mtu(67), 1420);
        assert_eq!(clamp_mtu(68), 68);
    }

    #[test]
    fn test_validate_cidr() {
        assert!(validate_cidr("192.168.1.0/24").is_ok());
        assert!(validate_cidr("fe80::/64").is_ok());
        assert!(validate_cidr("192.168.1.1").is_err());
        assert!(validate_cidr("192.168.1.0/33").is_err());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("example.com:51820").is_ok());
        assert!(validate_endpoint("192.168.1.1:51820").is_ok());
        assert!(validate_endpoint("invalid").is_err());
        assert!(validate_endpoint("example.com:0").is_err());
    }

    #[test]
    fn test_validate_key() {
        let valid = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8=";
        assert!(validate_key(valid, "public_key").is_ok());
        assert!(validate_key("tooshort", "public_key").is_err());
    }

    #[test]
    fn test_validate_upstream_url() {
        assert!(validate_upstream_url("http://10.0.0.5:8096").is_ok());
        assert!(validate_upstream_url("not a url").is_err());
    }

    proptest! {
        /// Any IPv4 CIDR with a prefix in `0..=32` validates.
        #[test]
        fn accepts_any_well_formed_ipv4_cidr(
            a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255,
            prefix in 0u8..=32,
        ) {
            let cidr = format!("{}.{}.{}.{}/{}", a, b, c, d, prefix);
            prop_assert!(validate_cidr(&cidr).is_ok());
        }

        /// A prefix past the address family's width is always rejected.
        #[test]
        fn rejects_ipv4_prefix_past_32(
            a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255,
            prefix in 33u16..=255,
        ) {
            let cidr = format!("{}.{}.{}.{}/{}", a, b, c, d, prefix);
            prop_assert!(validate_cidr(&cidr).is_err());
        }

        /// Any non-empty host with a nonzero port validates as an endpoint.
        #[test]
        fn accepts_any_host_with_nonzero_port(
            host in "[a-zA-Z0-9.-]{1,40}",
            port in 1u16..=65535,
        ) {
            let endpoint = format!("{}:{}", host, port);
            prop_assert!(validate_endpoint(&endpoint).is_ok());
        }

        /// Port 0 is never a valid endpoint, regardless of host.
        #[test]
        fn rejects_zero_port_endpoint(host in "[a-zA-Z0-9.-]{1,40}") {
            let endpoint = format!("{}:0", host);
            prop_assert!(validate_endpoint(&endpoint).is_err());
        }
    }
}
