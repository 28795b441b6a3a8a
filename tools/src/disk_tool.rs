// Jackson Coxson
// Fetch developer disks into the local cache

use std::path::PathBuf;
use std::sync::Arc;

use appinstalld::provider::ReqwestClient;
use appinstalld::{Device, DeveloperDiskManager};
use clap::{Arg, Command};

mod common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("disk_tool")
        .about("Fetch the developer disk for a device family and OS version")
        .arg(
            Arg::new("device_type")
                .long("device-type")
                .value_name("TYPE")
                .help("Device family: iphone, ipad, appletv or applewatch")
                .default_value("iphone"),
        )
        .arg(
            Arg::new("version")
                .value_name("VERSION")
                .help("OS version, e.g. 16.4 or 16.4.1")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .value_name("DIR")
                .help("Cache directory"),
        )
        .arg(
            Arg::new("manifest_url")
                .long("manifest-url")
                .value_name("URL")
                .help("Developer disk manifest URL"),
        )
        .get_matches();

    let device_type = matches.get_one::<String>("device_type").unwrap();
    let device_type = match common::parse_device_type(device_type) {
        Some(device_type) => device_type,
        None => {
            eprintln!("Unknown device type: {device_type}");
            return;
        }
    };
    let version = matches.get_one::<String>("version").unwrap();
    let version = match common::parse_version(version) {
        Some(version) => version,
        None => {
            eprintln!("Invalid OS version: {version}");
            return;
        }
    };
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
    let manager = match matches.get_one::<String>("manifest_url") {
        Some(url) => DeveloperDiskManager::with_manifest_url(http, store, url.clone()),
        None => DeveloperDiskManager::new(http, store),
    };

    let device = Device::new("disk-tool", "disk-tool", device_type, version);
    match manager.fetch_disk(&device).await {
        Ok(pair) => {
            println!("Disk:      {}", pair.disk.display());
            println!("Signature: {}", pair.signature.display());
        }
        Err(e) => eprintln!("Failed to fetch developer disk: {e}"),
    }
}
