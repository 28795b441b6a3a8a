//! Developer disk cache manager.
//!
//! Downloads versioned (disk image, signature) pairs, keeps them in a
//! per-OS/version cache tree and promotes fresh pairs atomically so a
//! compatibility check never observes a half-updated pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use uuid::Uuid;

use crate::archive;
use crate::devices::{os_name, Device};
use crate::error::DeveloperDiskError;
use crate::provider::{HttpClient, SettingsStore};

const DISK_FILE_NAME: &str = "DeveloperDiskImage.dmg";
const SIGNATURE_FILE_NAME: &str = "DeveloperDiskImage.dmg.signature";
const COMPATIBILITY_KEY_PREFIX: &str = "DeveloperDiskCompatible";

pub const DEFAULT_MANIFEST_URL: &str =
    "https://cdn.altstore.io/file/altstore/altserver/developerdisks.json";

/// A cached (disk image, signature) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeveloperDiskPair {
    pub disk: PathBuf,
    pub signature: PathBuf,
}

/// Download URL shapes a manifest may expose for one OS version.
enum DiskUrls {
    Archive(String),
    Direct { disk: String, signature: String },
}

/// Long-lived service object owning the disk cache.
pub struct DeveloperDiskManager {
    http: Arc<dyn HttpClient>,
    store: Arc<dyn SettingsStore>,
    manifest_url: String,
}

impl DeveloperDiskManager {
    pub fn new(http: Arc<dyn HttpClient>, store: Arc<dyn SettingsStore>) -> Self {
        Self::with_manifest_url(http, store, DEFAULT_MANIFEST_URL)
    }

    pub fn with_manifest_url(
        http: Arc<dyn HttpClient>,
        store: Arc<dyn SettingsStore>,
        manifest_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            manifest_url: manifest_url.into(),
        }
    }

    /// Returns the cached pair for `device`, downloading it first if the
    /// cache is missing or not yet confirmed compatible.
    pub async fn fetch_disk(
        &self,
        device: &Device,
    ) -> Result<DeveloperDiskPair, DeveloperDiskError> {
        let os_name =
            os_name(device.device_type).ok_or(DeveloperDiskError::UnsupportedOperatingSystem)?;
        let os_version = device.os_version.without_patch();

        let disk_directory = self
            .store
            .cache_directory()
            .join(os_name)
            .join(os_version.to_string());
        tokio::fs::create_dir_all(&disk_directory).await?;

        let disk_path = disk_directory.join(DISK_FILE_NAME);
        let signature_path = disk_directory.join(SIGNATURE_FILE_NAME);

        if self.is_disk_compatible(device) && disk_path.exists() && signature_path.exists() {
            // Cached and confirmed working; no network access.
            return Ok(DeveloperDiskPair {
                disk: disk_path,
                signature: signature_path,
            });
        }

        let urls = self
            .lookup_download_urls(os_name, &os_version.to_string())
            .await?;

        let staged = match urls {
            DiskUrls::Archive(url) => self.download_disk_archive(&url).await?,
            DiskUrls::Direct { disk, signature } => self.download_disk(&disk, &signature).await?,
        };

        promote_pair(&staged, &disk_path, &signature_path).await?;

        info!(
            "Cached developer disk for {os_name} {os_version} at {}",
            disk_directory.display()
        );

        Ok(DeveloperDiskPair {
            disk: disk_path,
            signature: signature_path,
        })
    }

    /// Whether the cached disk for `device` has been confirmed to work.
    pub fn is_disk_compatible(&self, device: &Device) -> bool {
        match self.compatibility_id(device) {
            Some(id) => self.store.bool_for_key(&id),
            None => false,
        }
    }

    /// Records whether the cached disk for `device` works. No-op when the
    /// device type has no developer disks.
    pub fn set_disk_compatible(&self, compatible: bool, device: &Device) {
        if let Some(id) = self.compatibility_id(device) {
            self.store.set_bool_for_key(&id, compatible);
        }
    }

    fn compatibility_id(&self, device: &Device) -> Option<String> {
        let os_name = os_name(device.device_type)?;
        let os_version = device.os_version.without_patch();
        Some(format!("{COMPATIBILITY_KEY_PREFIX}_{os_name}_{os_version}"))
    }

    async fn lookup_download_urls(
        &self,
        os_name: &str,
        os_version: &str,
    ) -> Result<DiskUrls, DeveloperDiskError> {
        let response = self.http.get(&self.manifest_url).await?;
        if !response.is_success() {
            return Err(DeveloperDiskError::Http(format!(
                "manifest request returned status {}",
                response.status
            )));
        }

        let manifest: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|e| DeveloperDiskError::Http(format!("invalid manifest: {e}")))?;

        let urls = manifest
            .get("disks")
            .and_then(|disks| disks.get(os_name))
            .and_then(|versions| versions.get(os_version))
            .ok_or(DeveloperDiskError::UnknownDownloadURL)?;

        if let Some(url) = urls.get("archive").and_then(|v| v.as_str()) {
            return Ok(DiskUrls::Archive(url.to_string()));
        }

        match (
            urls.get("disk").and_then(|v| v.as_str()),
            urls.get("signature").and_then(|v| v.as_str()),
        ) {
            (Some(disk), Some(signature)) => Ok(DiskUrls::Direct {
                disk: disk.to_string(),
                signature: signature.to_string(),
            }),
            _ => Err(DeveloperDiskError::UnknownDownloadURL),
        }
    }

    async fn download_file(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<(), DeveloperDiskError> {
        let response = self.http.get(url).await?;
        if !response.is_success() {
            return Err(DeveloperDiskError::Http(format!(
                "download of {url} returned status {}",
                response.status
            )));
        }
        tokio::fs::write(destination, &response.body).await?;
        Ok(())
    }

    /// Downloads an archive, extracts it and stages the first `.dmg` and
    /// `.signature` entries found in traversal order.
    async fn download_disk_archive(
        &self,
        archive_url: &str,
    ) -> Result<DeveloperDiskPair, DeveloperDiskError> {
        let extraction_dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&extraction_dir).await?;

        let result = self
            .download_and_stage_archive(archive_url, &extraction_dir)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&extraction_dir).await {
            warn!(
                "Failed to remove temporary extraction directory {}: {e}",
                extraction_dir.display()
            );
        }

        result
    }

    async fn download_and_stage_archive(
        &self,
        archive_url: &str,
        extraction_dir: &Path,
    ) -> Result<DeveloperDiskPair, DeveloperDiskError> {
        let archive_path = extraction_dir.join("archive.zip");
        self.download_file(archive_url, &archive_path).await?;

        archive::extract(&archive_path, extraction_dir)?;

        let mut disk = None;
        let mut signature = None;
        find_disk_entries(extraction_dir, &mut disk, &mut signature)?;

        let (disk, signature) = match (disk, signature) {
            (Some(disk), Some(signature)) => (disk, signature),
            _ => return Err(DeveloperDiskError::DownloadedDiskNotFound),
        };

        // Stage outside the extraction directory so it can be deleted.
        let staged_disk = std::env::temp_dir().join(Uuid::new_v4().to_string());
        let staged_signature = std::env::temp_dir().join(Uuid::new_v4().to_string());

        let renamed = async {
            tokio::fs::rename(&disk, &staged_disk).await?;
            tokio::fs::rename(&signature, &staged_signature).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = renamed {
            let _ = tokio::fs::remove_file(&staged_disk).await;
            let _ = tokio::fs::remove_file(&staged_signature).await;
            return Err(e.into());
        }

        Ok(DeveloperDiskPair {
            disk: staged_disk,
            signature: staged_signature,
        })
    }

    /// Downloads the two files sequentially into a fresh temporary directory.
    async fn download_disk(
        &self,
        disk_url: &str,
        signature_url: &str,
    ) -> Result<DeveloperDiskPair, DeveloperDiskError> {
        let temporary_dir = std::env::temp_dir().join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&temporary_dir).await?;

        let disk = temporary_dir.join(DISK_FILE_NAME);
        let signature = temporary_dir.join(SIGNATURE_FILE_NAME);

        let downloaded = async {
            self.download_file(disk_url, &disk).await?;
            self.download_file(signature_url, &signature).await?;
            Ok::<(), DeveloperDiskError>(())
        }
        .await;

        if let Err(e) = downloaded {
            let _ = tokio::fs::remove_dir_all(&temporary_dir).await;
            return Err(e);
        }

        Ok(DeveloperDiskPair { disk, signature })
    }
}

/// Depth-first search for the first `.dmg` and first `.signature` entries.
fn find_disk_entries(
    directory: &Path,
    disk: &mut Option<PathBuf>,
    signature: &mut Option<PathBuf>,
) -> Result<(), DeveloperDiskError> {
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            find_disk_entries(&path, disk, signature)?;
            continue;
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if extension == "dmg" && disk.is_none() {
            *disk = Some(path);
        } else if extension == "signature" && signature.is_none() {
            *signature = Some(path);
        }

        if disk.is_some() && signature.is_some() {
            return Ok(());
        }
    }

    Ok(())
}

/// Replaces the cached pair as a unit: the cache is never left holding one
/// fresh file paired with one stale or missing file.
async fn promote_pair(
    staged: &DeveloperDiskPair,
    disk_path: &Path,
    signature_path: &Path,
) -> Result<(), DeveloperDiskError> {
    if disk_path.exists() {
        tokio::fs::remove_file(disk_path).await?;
    }
    if signature_path.exists() {
        tokio::fs::remove_file(signature_path).await?;
    }

    let renamed = async {
        tokio::fs::rename(&staged.disk, disk_path).await?;
        tokio::fs::rename(&staged.signature, signature_path).await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(e) = renamed {
        let _ = tokio::fs::remove_file(disk_path).await;
        let _ = tokio::fs::remove_file(signature_path).await;
        let _ = tokio::fs::remove_file(&staged.disk).await;
        let _ = tokio::fs::remove_file(&staged.signature).await;
        return Err(e.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceType, OsVersion};
    use crate::provider::HttpResponse;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MockHttpClient {
        responses: HashMap<String, Vec<u8>>,
        calls: AtomicUsize,
    }

    impl MockHttpClient {
        fn new(responses: HashMap<String, Vec<u8>>) -> Self {
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get(&self, url: &str) -> Result<HttpResponse, DeveloperDiskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.responses.get(url) {
                Some(body) => Ok(HttpResponse {
                    status: 200,
                    body: body.clone(),
                }),
                None => Ok(HttpResponse {
                    status: 404,
                    body: Vec::new(),
                }),
            }
        }
    }

    struct MemoryStore {
        flags: Mutex<HashMap<String, bool>>,
        root: PathBuf,
    }

    impl MemoryStore {
        fn new(root: PathBuf) -> Self {
            Self {
                flags: Mutex::new(HashMap::new()),
                root,
            }
        }
    }

    impl SettingsStore for MemoryStore {
        fn bool_for_key(&self, key: &str) -> bool {
            *self.flags.lock().unwrap().get(key).unwrap_or(&false)
        }

        fn set_bool_for_key(&self, key: &str, value: bool) {
            self.flags.lock().unwrap().insert(key.to_string(), value);
        }

        fn cache_directory(&self) -> PathBuf {
            self.root.clone()
        }
    }

    fn test_device() -> Device {
        Device::new(
            "00008110-000000000000001E",
            "Test iPhone",
            DeviceType::Iphone,
            OsVersion::new(16, 4, 1),
        )
    }

    fn manifest_with(version_value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "disks": { "iOS": { "16.4": version_value } }
        }))
        .unwrap()
    }

    fn manager(
        responses: HashMap<String, Vec<u8>>,
        root: PathBuf,
    ) -> (DeveloperDiskManager, Arc<MockHttpClient>, Arc<MemoryStore>) {
        let http = Arc::new(MockHttpClient::new(responses));
        let store = Arc::new(MemoryStore::new(root));
        let manager = DeveloperDiskManager::with_manifest_url(
            http.clone(),
            store.clone(),
            "https://disks.test/manifest.json",
        );
        (manager, http, store)
    }

    #[tokio::test]
    async fn compatible_cached_pair_is_returned_without_network() {
        let root = tempdir().unwrap();
        let disk_dir = root.path().join("iOS").join("16.4");
        std::fs::create_dir_all(&disk_dir).unwrap();
        std::fs::write(disk_dir.join(DISK_FILE_NAME), b"disk").unwrap();
        std::fs::write(disk_dir.join(SIGNATURE_FILE_NAME), b"sig").unwrap();

        let (manager, http, _store) = manager(HashMap::new(), root.path().to_path_buf());
        let device = test_device();
        manager.set_disk_compatible(true, &device);

        let pair = manager.fetch_disk(&device).await.unwrap();
        assert_eq!(pair.disk, disk_dir.join(DISK_FILE_NAME));
        assert_eq!(pair.signature, disk_dir.join(SIGNATURE_FILE_NAME));
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn direct_urls_replace_stale_pair_atomically() {
        let root = tempdir().unwrap();
        let disk_dir = root.path().join("iOS").join("16.4");
        std::fs::create_dir_all(&disk_dir).unwrap();
        std::fs::write(disk_dir.join(DISK_FILE_NAME), b"old disk").unwrap();
        std::fs::write(disk_dir.join(SIGNATURE_FILE_NAME), b"old sig").unwrap();

        let mut responses = HashMap::new();
        responses.insert(
            "https://disks.test/manifest.json".to_string(),
            manifest_with(serde_json::json!({
                "disk": "https://disks.test/16.4.dmg",
                "signature": "https://disks.test/16.4.signature",
            })),
        );
        responses.insert(
            "https://disks.test/16.4.dmg".to_string(),
            b"new disk".to_vec(),
        );
        responses.insert(
            "https://disks.test/16.4.signature".to_string(),
            b"new sig".to_vec(),
        );

        let (manager, _http, _store) = manager(responses, root.path().to_path_buf());
        let pair = manager.fetch_disk(&test_device()).await.unwrap();

        assert_eq!(std::fs::read(&pair.disk).unwrap(), b"new disk");
        assert_eq!(std::fs::read(&pair.signature).unwrap(), b"new sig");

        let names: Vec<_> = std::fs::read_dir(&disk_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&DISK_FILE_NAME.to_string()));
        assert!(names.contains(&SIGNATURE_FILE_NAME.to_string()));
    }

    fn disk_archive_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, bytes) in entries {
                writer.start_file(name.to_string(), options).unwrap();
                writer.write_all(bytes).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn archive_url_stages_first_disk_and_signature() {
        let root = tempdir().unwrap();

        let archive = disk_archive_bytes(&[
            ("DeveloperDiskImage/readme.txt", b"notes"),
            ("DeveloperDiskImage/DeveloperDiskImage.dmg", b"dmg bytes"),
            (
                "DeveloperDiskImage/DeveloperDiskImage.dmg.signature",
                b"sig bytes",
            ),
        ]);

        let mut responses = HashMap::new();
        responses.insert(
            "https://disks.test/manifest.json".to_string(),
            manifest_with(serde_json::json!({
                "archive": "https://disks.test/16.4.zip",
            })),
        );
        responses.insert("https://disks.test/16.4.zip".to_string(), archive);

        let (manager, _http, _store) = manager(responses, root.path().to_path_buf());
        let pair = manager.fetch_disk(&test_device()).await.unwrap();

        assert_eq!(std::fs::read(&pair.disk).unwrap(), b"dmg bytes");
        assert_eq!(std::fs::read(&pair.signature).unwrap(), b"sig bytes");
    }

    #[tokio::test]
    async fn archive_without_disk_is_download_not_found() {
        let root = tempdir().unwrap();
        let archive = disk_archive_bytes(&[("readme.txt", b"no disks here")]);

        let mut responses = HashMap::new();
        responses.insert(
            "https://disks.test/manifest.json".to_string(),
            manifest_with(serde_json::json!({
                "archive": "https://disks.test/16.4.zip",
            })),
        );
        responses.insert("https://disks.test/16.4.zip".to_string(), archive);

        let (manager, _http, _store) = manager(responses, root.path().to_path_buf());
        let result = manager.fetch_disk(&test_device()).await;
        assert!(matches!(
            result,
            Err(DeveloperDiskError::DownloadedDiskNotFound)
        ));
    }

    #[tokio::test]
    async fn missing_version_is_unknown_download_url() {
        let root = tempdir().unwrap();
        let mut responses = HashMap::new();
        responses.insert(
            "https://disks.test/manifest.json".to_string(),
            serde_json::to_vec(&serde_json::json!({ "disks": { "iOS": {} } })).unwrap(),
        );

        let (manager, _http, _store) = manager(responses, root.path().to_path_buf());
        let result = manager.fetch_disk(&test_device()).await;
        assert!(matches!(
            result,
            Err(DeveloperDiskError::UnknownDownloadURL)
        ));
    }

    #[tokio::test]
    async fn unsupported_device_type_fails_without_network() {
        let root = tempdir().unwrap();
        let (manager, http, _store) = manager(HashMap::new(), root.path().to_path_buf());

        let device = Device::new(
            "watch-udid",
            "Watch",
            DeviceType::AppleWatch,
            OsVersion::new(10, 0, 0),
        );
        let result = manager.fetch_disk(&device).await;
        assert!(matches!(
            result,
            Err(DeveloperDiskError::UnsupportedOperatingSystem)
        ));
        assert_eq!(http.call_count(), 0);
    }

    #[tokio::test]
    async fn compatibility_flag_round_trips_and_ignores_unsupported() {
        let root = tempdir().unwrap();
        let (manager, _http, store) = manager(HashMap::new(), root.path().to_path_buf());

        let device = test_device();
        assert!(!manager.is_disk_compatible(&device));
        manager.set_disk_compatible(true, &device);
        assert!(manager.is_disk_compatible(&device));
        assert!(store.bool_for_key("DeveloperDiskCompatible_iOS_16.4"));

        let watch = Device::new(
            "watch-udid",
            "Watch",
            DeviceType::AppleWatch,
            OsVersion::new(10, 0, 0),
        );
        manager.set_disk_compatible(true, &watch);
        assert!(!manager.is_disk_compatible(&watch));
    }
}
