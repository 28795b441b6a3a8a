//! Device model shared between the protocol and device collaborators.

use serde::{Deserialize, Serialize};

/// Hardware families the protocol can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Iphone,
    Ipad,
    AppleTv,
    AppleWatch,
    Unknown,
}

/// Operating system name used for developer disk lookups.
///
/// Returns `None` for device families without published developer disks.
pub fn os_name(device_type: DeviceType) -> Option<&'static str> {
    match device_type {
        DeviceType::Iphone | DeviceType::Ipad => Some("iOS"),
        DeviceType::AppleTv => Some("tvOS"),
        DeviceType::AppleWatch | DeviceType::Unknown => None,
    }
}

/// A `major.minor.patch` operating system version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl OsVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Copy of this version with the patch component zeroed.
    ///
    /// Patch versions are irrelevant for developer disk compatibility.
    pub fn without_patch(self) -> Self {
        Self { patch: 0, ..self }
    }
}

impl std::fmt::Display for OsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.patch == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

/// A connected device, owned by the device-discovery collaborator.
///
/// Immutable for the lifetime of a connection; referenced by value elsewhere.
#[derive(Debug, Clone)]
pub struct Device {
    pub udid: String,
    pub name: String,
    pub device_type: DeviceType,
    pub os_version: OsVersion,
}

impl Device {
    pub fn new(
        udid: impl Into<String>,
        name: impl Into<String>,
        device_type: DeviceType,
        os_version: OsVersion,
    ) -> Self {
        Self {
            udid: udid.into(),
            name: name.into(),
            device_type,
            os_version,
        }
    }
}

/// Hot-plug events delivered by the device directory.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached(Device),
    Detached(Device),
}
