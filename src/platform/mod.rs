//! Platform-specific TUN device and routing backends.
//!
//! Generalizes the per-OS "create a TUN device, assign it addresses, and
//! steer traffic at it" dance behind one object-safe trait so the WireGuard
//! device and tunnel layers never match on `cfg(target_os)`.

use crate::error::Result;
use std::time::Duration;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

mod detection;

pub use detection::{detect_environment, ContainerEnvironment, PlatformInfo};

const CREATE_RETRIES: u32 = 3;
const CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Clamp an MTU to `[68, 65536]`, defaulting to 1420 when out of range.
pub fn clamp_mtu(mtu: u16) -> u16 {
    if mtu < 68 {
        1420
    } else {
        mtu
    }
}

/// A live TUN interface: packet I/O plus the handful of routing operations a
/// tunnel needs over its lifetime. Every mutating operation is idempotent —
/// adding a route that already exists, or removing one that's already gone,
/// both succeed.
pub trait TunHandle: Send + Sync {
    /// Interface name actually assigned by the kernel (may differ from the
    /// requested name, e.g. macOS utun auto-numbering).
    fn name(&self) -> &str;

    /// Assign a CIDR address to the interface.
    fn add_address(&self, cidr: &str) -> Result<()>;

    /// Install a route pointing at this interface.
    fn add_route(&self, cidr: &str) -> Result<()>;

    /// Remove a route pointing at this interface.
    fn remove_route(&self, cidr: &str) -> Result<()>;

    /// Tear down the interface.
    fn close(&mut self) -> Result<()>;

    /// Borrow the underlying device for packet I/O.
    fn device_mut(&mut self) -> &mut tun::platform::Device;
}

/// Platform abstraction for interface lifecycle and capability checks.
pub trait Platform: Send + Sync {
    /// Static information about the host OS/environment.
    fn info(&self) -> &PlatformInfo;

    /// Create and bring up a TUN device named `name`, retrying per
    /// [`retry_create`] on failure.
    fn create_tun(&self, name: &str, mtu: u16) -> Result<Box<dyn TunHandle>>;

    /// Report any missing capabilities/commands required to operate.
    fn check_capabilities(&self) -> Result<Vec<String>>;
}

/// Get the platform implementation for the current OS.
pub fn get_platform() -> Box<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxPlatform::new())
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacOsPlatform::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        panic!("finguard supports linux and macos only")
    }
}

/// Retry a fallible device-creation closure 3 times, 2s apart. A device torn
/// down moments ago may still be settling in the kernel.
pub(crate) fn retry_create<F>(name: &str, mut f: F) -> Result<Box<dyn TunHandle>>
where
    F: FnMut() -> Result<Box<dyn TunHandle>>,
{
    use tracing::warn;

    let mut last_err = None;
    for attempt in 1..=CREATE_RETRIES {
        match f() {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                warn!(interface = name, attempt, error = %e, "tun device creation attempt failed");
                last_err = Some(e);
                if attempt < CREATE_RETRIES {
                    std::thread::sleep(CREATE_RETRY_DELAY);
                }
            }
        }
    }
    Err(last_err.unwrap())
}
