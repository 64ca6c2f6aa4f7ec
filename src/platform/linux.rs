//! Linux platform implementation: `ip` netlink shell-outs.

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
    stderr.contains("File exists") || stderr.contains("No such process")
}

/// Linux TUN handle backed by the `ip` command.
pub struct LinuxTunHandle {
    name: String,
    device: tun::platform::Device,
}

impl TunHandle for LinuxTunHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_address(&self, cidr: &str) -> Result<()> {
        run_command("ip", &["address", "add", cidr, "dev", &self.name])?;
        Ok(())
    }

    fn add_route(&self, cidr: &str) -> Result<()> {
        match run_command("ip", &["route", "add", cidr, "dev", &self.name]) {
            Ok(_) => Ok(()),
            Err(FinGuardError::Platform(msg)) if route_error_is_idempotent(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_route(&self, cidr: &str) -> Result<()> {
        match run_command("ip", &["route", "del", cidr, "dev", &self.name]) {
            Ok(_) => Ok(()),
            Err(FinGuardError::Platform(msg)) if route_error_is_idempotent(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn close(&mut self) -> Result<()> {
        let _ = run_command("ip", &["link", "set", &self.name, "down"]);
        Ok(())
    }

    fn device_mut(&mut self) -> &mut tun::platform::Device {
        &mut self.device
    }
}

/// Linux platform implementation
pub struct LinuxPlatform {
    info: PlatformInfo,
}

impl LinuxPlatform {
    /// Create a new Linux platform instance
    pub fn new() -> Self {
        Self {
            info: detection::detect_environment(),
        }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    fn info(&self) -> &PlatformInfo {
        &self.info
    }

    fn create_tun(&self, name: &str, mtu: u16) -> Result<Box<dyn TunHandle>> {
        let mtu = platform::clamp_mtu(mtu);
        platform::retry_create(name, || {
            info!(interface = name, mtu, "creating TUN device");

            let mut config = tun::Configuration::default();
            config.name(name).mtu(mtu as i32).up();
            config.platform(|config| {
                config.packet_information(false);
            });

            let device = tun::create(&config).map_err(|e| {
                FinGuardError::TunDevice(format!("failed to create TUN device '{}': {}", name, e))
            })?;

            device.set_nonblock().map_err(|e| {
                FinGuardError::TunDevice(format!("failed to set '{}' non-blocking: {}", name, e))
            })?;

            let actual_name = device.name().map_err(|e| {
                FinGuardError::TunDevice(format!("failed to read device name: {}", e))
            })?;

            Ok(Box::new(LinuxTunHandle {
                name: actual_name,
                device,
            }) as Box<dyn TunHandle>)
        })
    }

    fn check_capabilities(&self) -> Result<Vec<String>> {
        let mut missing = Vec::new();

        if !self.info.is_privileged {
            missing.push("NET_ADMIN capability required (run as root or with CAP_NET_ADMIN)".to_string());
        }

        for cmd in &["ip"] {
            if Command::new("which").arg(cmd).status().is_err() {
                missing.push(format!("required command not found: {}", cmd));
            }
        }

        if !missing.is_empty() {
            warn!(?missing, "linux platform capability check found gaps");
        }

        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_info_reports_linux() {
        let platform = LinuxPlatform::new();
        assert_eq!(platform.info().os, "linux");
    }

    #[test]
    fn route_error_classification() {
        assert!(route_error_is_idempotent("RTNETLINK answers: File exists"));
        assert!(route_error_is_idempotent("RTNETLINK answers: No such process"));
        assert!(!route_error_is_idempotent("RTNETLINK answers: Permission denied"));
    }
}
