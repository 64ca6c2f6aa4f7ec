//! macOS platform implementation: `ifconfig`/`route` shell-outs over utun.

use crate::error::{FinGuardError, Result};
use crate::platform::{self, detection, Platform, PlatformInfo, TunHandle};
use std::process::Command;
use tracing::{debug, info, warn};
use tun::Device as TunDevice;

fn run_command(program: &str, args: &[&str]) -> Result<String> {
    debug!("executing: {} {:?}", program, args);

    let output = Command::new(program).args(args).output().map_err(|e| {
        FinGuardError::Platform(format!("failed to execute {} {}: {}", program, args.join(" "), e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FinGuardError::Platform(format!(
            "command failed: {} {}: {}",
            program,
            args.join(" "),
            stderr
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn route_error_is_idempotent(stderr: &str) -> bool {
    stderr.contains("File exists") || stderr.contains("not in table")
}

/// macOS utun handle backed by `ifconfig`/`route`.
pub struct MacOsTunHandle {
    name: String,
    device: tun::platform::Device,
}

impl TunHandle for MacOsTunHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_address(&self, cidr: &str) -> Result<()> {
        let parts: Vec<&str> = cidr.split('/').collect();
        if parts.len() != 2 {
            return Err(FinGuardError::Config(format!(
                "invalid address '{}' (expected CIDR notation)",
                cidr
            )));
        }
        let ip = parts[0];
        let ip_parts: Vec<&str> = ip.split('.').collect();
        if ip_parts.len() != 4 {
            return Err(FinGuardError::Config(format!("invalid IPv4 address: {}", ip)));
        }
        let dest = format!("{}.{}.{}.1", ip_parts[0], ip_parts[1], ip_parts[2]);
        let prefix: u8 = parts[1]
            .parse()
            .map_err(|_| FinGuardError::Config(format!("invalid prefix length: {}", parts[1])))?;
        let netmask = match prefix {
            32 => "255.255.255.255",
            24 => "255.255.255.0",
            16 => "255.255.0.0",
            8 => "255.0.0.0",
            _ => {
                return Err(FinGuardError::Config(format!(
                    "unsupported prefix length for macOS utun: {}",
                    prefix
                )))
            }
        };

        run_command("ifconfig", &[&self.name, ip, &dest, "netmask", netmask])?;
        Ok(())
    }

    fn add_route(&self, cidr: &str) -> Result<()> {
        match run_command("route", &["add", "-net", cidr, "-interface", &self.name]) {
            Ok(_) => Ok(()),
            Err(FinGuardError::Platform(msg)) if route_error_is_idempotent(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_route(&self, cidr: &str) -> Result<()> {
        match run_command("route", &["delete", "-net", cidr]) {
            Ok(_) => Ok(()),
            Err(FinGuardError::Platform(msg)) if route_error_is_idempotent(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> Result<()> {
        let _ = run_command("ifconfig", &[&self.name, "down"]);
        Ok(())
    }

    fn device_mut(&mut self) -> &mut tun::platform::Device {
        &mut self.device
    }
}

/// macOS platform implementation
pub struct MacOsPlatform {
    info: PlatformInfo,
}

impl MacOsPlatform {
    /// Create a new macOS platform instance
    pub fn new() -> Self {
        Self {
            info: detection::detect_environment(),
        }
    }
}

impl Default for MacOsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MacOsPlatform {
    fn info(&self) -> &PlatformInfo {
        &self.info
    }

    fn create_tun(&self, name: &str, mtu: u16) -> Result<Box<dyn TunHandle>> {
        let mtu = platform::clamp_mtu(mtu);
        platform::retry_create(name, || {
            info!(requested = name, mtu, "creating utun device");

            // macOS auto-assigns the utun number; the tun crate ignores a
            // requested name here.
            let mut config = tun::Configuration::default();
            config.mtu(mtu as i32).up();

            let device = tun::create(&config).map_err(|e| {
                FinGuardError::TunDevice(format!("failed to create utun device: {}", e))
            })?;

            device.set_nonblock().map_err(|e| {
                FinGuardError::TunDevice(format!("failed to set utun non-blocking: {}", e))
            })?;

            let actual_name = device.name().map_err(|e| {
                FinGuardError::TunDevice(format!("failed to read utun device name: {}", e))
            })?;

            Ok(Box::new(MacOsTunHandle {
                name: actual_name,
                device,
            }) as Box<dyn TunHandle>)
        })
    }

    fn check_capabilities(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();

        if !self.info.is_privileged {
            missing.push("root privileges required for utun management".to_string());
        }

        for cmd in &["ifconfig", "route"] {
            if Command::new("which").arg(cmd).status().is_err() {
                missing.push(format!("required command not found: {}", cmd));
            }
        }

        if !missing.is_empty() {
            warn!(?missing, "macos platform capability check found gaps");
        }

        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_info_reports_macos() {
        let platform = MacOsPlatform::new();
        assert_eq!(platform.info().os, "macos");
    }

    #[test]
    fn route_error_classification() {
        assert!(route_error_is_idempotent("route: writing to routing socket: File exists"));
        assert!(route_error_is_idempotent("route: not in table"));
        assert!(!route_error_is_idempotent("route: permission denied"));
    }
}
