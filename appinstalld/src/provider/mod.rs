//! Collaborator interfaces consumed by the server.
//!
//! Device discovery, device operations, anisette data, persisted settings and
//! HTTP access are external concerns; the server consumes them through the
//! narrow traits in this module. All traits are object safe so they can be
//! passed around as `Arc<dyn ...>` handles.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::devices::{Device, DeviceEvent};
use crate::error::{DeveloperDiskError, ServerError};

/// An abstract bidirectional byte channel to a client.
///
/// The framed protocol is transport agnostic; concrete channels are the
/// wireless TCP transport below or a wired channel supplied by the device
/// collaborator.
#[async_trait]
pub trait Connection: Send {
    async fn send(&mut self, data: &[u8]) -> Result<(), std::io::Error>;

    /// Receives exactly `len` bytes.
    async fn receive(&mut self, len: usize) -> Result<Vec<u8>, std::io::Error>;

    async fn disconnect(&mut self);
}

/// The wireless transport: a plain TCP stream accepted by the listener.
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        self.stream.write_all(data).await
    }

    async fn receive(&mut self, len: usize) -> Result<Vec<u8>, std::io::Error> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn disconnect(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Enumerates available devices and delivers hot-plug events.
pub trait DeviceDirectory: Send + Sync {
    fn available_devices(&self) -> Vec<Device>;

    /// Subscribes to attach/detach events. Events arrive on an independent
    /// execution context and may race with listener work.
    fn subscribe(&self) -> mpsc::Receiver<DeviceEvent>;
}

/// Install progress callback, invoked with values in `0.0..=1.0`.
pub type ProgressHandler = Box<dyn Fn(f64) + Send + Sync>;

/// Target of an unsigned-code-execution request; exactly one is given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessTarget {
    Pid(u64),
    Name(String),
}

/// Side-effecting operations against a connected device.
#[async_trait]
pub trait DeviceOperations: Send + Sync {
    async fn install_app(
        &self,
        package_path: &Path,
        udid: &str,
        active_profiles: Option<HashSet<String>>,
        progress: ProgressHandler,
    ) -> Result<(), ServerError>;

    async fn install_provisioning_profiles(
        &self,
        profiles: Vec<ProvisioningProfile>,
        udid: &str,
        active_profiles: Option<HashSet<String>>,
    ) -> Result<(), ServerError>;

    async fn remove_provisioning_profiles(
        &self,
        bundle_identifiers: HashSet<String>,
        udid: &str,
    ) -> Result<(), ServerError>;

    async fn remove_app(&self, bundle_identifier: &str, udid: &str) -> Result<(), ServerError>;

    async fn start_notification_connection(
        &self,
        device: &Device,
    ) -> Result<Box<dyn NotificationConnection>, ServerError>;

    async fn start_wired_connection(
        &self,
        device: &Device,
    ) -> Result<Box<dyn Connection>, ServerError>;

    /// Provisions the device for debugging (developer disk mounted etc.).
    async fn prepare_debug_bridge(&self, device: &Device) -> Result<(), ServerError>;

    async fn start_debug_session(
        &self,
        device: &Device,
    ) -> Result<Box<dyn DebugSession>, ServerError>;
}

/// A persistent per-device push channel, independent of the request/response
/// protocol.
#[async_trait]
pub trait NotificationConnection: Send {
    async fn start_listening(&mut self, notifications: &[String]) -> Result<(), ServerError>;

    async fn post(&mut self, notification: &str) -> Result<(), ServerError>;

    /// Next received notification, or `None` once the channel has failed.
    async fn recv(&mut self) -> Option<String>;

    async fn disconnect(&mut self);

    fn device(&self) -> &Device;
}

/// An active debug session able to enable unsigned code execution.
#[async_trait]
pub trait DebugSession: Send {
    async fn enable_unsigned_code_execution(
        &mut self,
        target: &ProcessTarget,
    ) -> Result<(), ServerError>;

    async fn disconnect(&mut self);
}

/// Anisette machine data forwarded to clients verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnisetteData {
    #[serde(rename = "machineID")]
    pub machine_id: String,
    #[serde(rename = "oneTimePassword")]
    pub one_time_password: String,
    #[serde(rename = "localUserID")]
    pub local_user_id: String,
    #[serde(rename = "routingInfo")]
    pub routing_info: String,
    #[serde(rename = "deviceUniqueIdentifier")]
    pub device_unique_identifier: String,
    #[serde(rename = "deviceSerialNumber")]
    pub device_serial_number: String,
    #[serde(rename = "deviceDescription")]
    pub device_description: String,
    pub date: String,
    pub locale: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

/// Provides current anisette data, or reports it unavailable.
#[async_trait]
pub trait AnisetteProvider: Send + Sync {
    async fn fetch_anisette_data(&self) -> Option<AnisetteData>;
}

/// Raw provisioning profile bytes; parsing and signing are external concerns.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    data: Vec<u8>,
}

impl ProvisioningProfile {
    /// Decodes a base64-encoded profile. Returns `None` for undecodable or
    /// empty payloads so callers can skip them without aborting a batch.
    pub fn from_encoded(encoded: &str) -> Option<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        if data.is_empty() {
            return None;
        }
        Some(Self { data })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Persisted boolean flags plus the filesystem root for caches.
pub trait SettingsStore: Send + Sync {
    fn bool_for_key(&self, key: &str) -> bool;

    fn set_bool_for_key(&self, key: &str, value: bool);

    fn cache_directory(&self) -> PathBuf;
}

/// Status and body of an HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Minimal HTTP client seam so tests can run without a network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, DeveloperDiskError>;
}

/// Production HTTP client backed by reqwest.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Result<Self, DeveloperDiskError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .map_err(|e| DeveloperDiskError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, DeveloperDiskError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DeveloperDiskError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| DeveloperDiskError::Http(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_profile_decodes_base64() {
        let profile = ProvisioningProfile::from_encoded("cHJvZmlsZQ==").unwrap();
        assert_eq!(profile.data(), b"profile");
    }

    #[test]
    fn undecodable_profile_is_skipped() {
        assert!(ProvisioningProfile::from_encoded("%%%not base64%%%").is_none());
        assert!(ProvisioningProfile::from_encoded("").is_none());
    }
}
