// Jackson Coxson
// Shared pieces for the appinstalld binaries

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use appinstalld::provider::SettingsStore;
use appinstalld::{DeviceType, OsVersion};

const FLAGS_FILE_NAME: &str = "flags.json";

/// Settings store backed by a JSON file under the cache directory.
pub struct FileSettingsStore {
    root: PathBuf,
    flags: Mutex<HashMap<String, bool>>,
}

impl FileSettingsStore {
    pub fn open(root: PathBuf) -> Self {
        let flags = std::fs::read(root.join(FLAGS_FILE_NAME))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            root,
            flags: Mutex::new(flags),
        }
    }

    fn persist(&self, flags: &HashMap<String, bool>) {
        let path = self.root.join(FLAGS_FILE_NAME);
        let write = std::fs::create_dir_all(&self.root).and_then(|_| {
            serde_json::to_vec_pretty(flags)
                .map_err(std::io::Error::other)
                .and_then(|bytes| std::fs::write(&path, bytes))
        });
        if let Err(e) = write {
            log::warn!("Failed to persist settings to {}: {e}", path.display());
        }
    }
}

impl SettingsStore for FileSettingsStore {
    fn bool_for_key(&self, key: &str) -> bool {
        match self.flags.lock() {
            Ok(flags) => flags.get(key).copied().unwrap_or(false),
            Err(_) => false,
        }
    }

    fn set_bool_for_key(&self, key: &str, value: bool) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.insert(key.to_string(), value);
            self.persist(&flags);
        }
    }

    fn cache_directory(&self) -> PathBuf {
        self.root.clone()
    }
}

/// Parses a `major.minor[.patch]` version string.
pub fn parse_version(version: &str) -> Option<OsVersion> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = match parts.next() {
        Some(patch) => patch.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(OsVersion::new(major, minor, patch))
}

/// Parses a device family name as given on the command line.
pub fn parse_device_type(name: &str) -> Option<DeviceType> {
    match name.to_ascii_lowercase().as_str() {
        "iphone" => Some(DeviceType::Iphone),
        "ipad" => Some(DeviceType::Ipad),
        "appletv" | "apple-tv" | "tv" => Some(DeviceType::AppleTv),
        "applewatch" | "apple-watch" | "watch" => Some(DeviceType::AppleWatch),
        _ => None,
    }
}

pub fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".appinstalld")
}
