// Jackson Coxson
// App-installation server daemon

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appinstalld::provider::{
    AnisetteData, AnisetteProvider, Connection, DebugSession, DeviceDirectory, DeviceOperations,
    NotificationConnection, ProgressHandler, ProvisioningProfile, ReqwestClient,
};
use appinstalld::{
    ConnectionManager, Device, DeviceEvent, DeveloperDiskManager, ServerError,
};
use async_trait::async_trait;
use clap::{Arg, Command};
use tokio::sync::mpsc;

mod common;

/// Device backend for hosts without a device transport. Every operation
/// reports the device unreachable, but debug preparation still exercises the
/// developer disk cache so the daemon can be used to warm it.
struct StubDeviceBackend {
    disk_manager: DeveloperDiskManager,
}

impl DeviceDirectory for StubDeviceBackend {
    fn available_devices(&self) -> Vec<Device> {
        Vec::new()
    }

    fn subscribe(&self) -> mpsc::Receiver<DeviceEvent> {
        mpsc::channel(1).1
    }
}

#[async_trait]
impl DeviceOperations for StubDeviceBackend {
    async fn install_app(
        &self,
        _package_path: &Path,
        udid: &str,
        _active_profiles: Option<HashSet<String>>,
        _progress: ProgressHandler,
    ) -> Result<(), ServerError> {
        log::warn!("No device transport available for install to {udid}");
        Err(ServerError::DeviceNotFound)
    }

    async fn install_provisioning_profiles(
        &self,
        _profiles: Vec<ProvisioningProfile>,
        _udid: &str,
        _active_profiles: Option<HashSet<String>>,
    ) -> Result<(), ServerError> {
        Err(ServerError::DeviceNotFound)
    }

    async fn remove_provisioning_profiles(
        &self,
        _bundle_identifiers: HashSet<String>,
        _udid: &str,
    ) -> Result<(), ServerError> {
        Err(ServerError::DeviceNotFound)
    }

    async fn remove_app(&self, _bundle_identifier: &str, _udid: &str) -> Result<(), ServerError> {
        Err(ServerError::DeviceNotFound)
    }

    async fn start_notification_connection(
        &self,
        _device: &Device,
    ) -> Result<Box<dyn NotificationConnection>, ServerError> {
        Err(ServerError::ConnectionFailed)
    }

    async fn start_wired_connection(
        &self,
        _device: &Device,
    ) -> Result<Box<dyn Connection>, ServerError> {
        Err(ServerError::ConnectionFailed)
    }

    async fn prepare_debug_bridge(&self, device: &Device) -> Result<(), ServerError> {
        let pair = self.disk_manager.fetch_disk(device).await?;
        log::info!(
            "Developer disk ready at {}, but no device transport is available",
            pair.disk.display()
        );
        Err(ServerError::ConnectionFailed)
    }

    async fn start_debug_session(
        &self,
        _device: &Device,
    ) -> Result<Box<dyn DebugSession>, ServerError> {
        Err(ServerError::ConnectionFailed)
    }
}

struct NoAnisette;

#[async_trait]
impl AnisetteProvider for NoAnisette {
    async fn fetch_anisette_data(&self) -> Option<AnisetteData> {
        None
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("appinstalld")
        .about("App-installation server daemon")
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .value_name("DIR")
                .help("Directory for the developer disk cache and settings"),
        )
        .arg(
            Arg::new("server_id")
                .long("server-id")
                .value_name("ID")
                .help("Fixed server identifier (default: generated)"),
        )
        .arg(
            Arg::new("manifest_url")
                .long("manifest-url")
                .value_name("URL")
                .help("Developer disk manifest URL"),
        )
        .get_matches();

    let cache_dir = matches
        .get_one::<String>("cache_dir")
        .map(PathBuf::from)
        .unwrap_or_else(common::default_cache_dir);

    let http = match ReqwestClient::new() {
        Ok(http) => Arc::new(http),
        Err(e) => {
            eprintln!("Failed to build HTTP client: {e}");
            return;
        }
    };
    let store = Arc::new(common::FileSettingsStore::open(cache_dir));
    let disk_manager = match matches.get_one::<String>("manifest_url") {
        Some(url) => DeveloperDiskManager::with_manifest_url(http, store, url.clone()),
        None => DeveloperDiskManager::new(http, store),
    };

    let backend = Arc::new(StubDeviceBackend { disk_manager });
    let mut manager =
        ConnectionManager::new(backend.clone(), backend, Arc::new(NoAnisette));
    if let Some(server_id) = matches.get_one::<String>("server_id") {
        manager = manager.with_server_id(server_id.clone());
    }

    if let Err(e) = manager.start().await {
        eprintln!("Failed to start server: {e}");
        return;
    }
    if let Some(port) = manager.local_port().await {
        println!("Listening on port {port} (server {})", manager.server_id());
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Failed to wait for shutdown signal: {e}");
    }
    println!("Shutting down...");
    manager.stop().await;
}
