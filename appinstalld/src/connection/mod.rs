//! Client connection protocol state machine.
//!
//! One `ClientConnection` exists per accepted transport. Requests are
//! strictly sequential; the remote client always receives either a success
//! response or a well-formed error response for every request, except on raw
//! transport failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::ServerError;
use crate::protocol::{self, PrepareAppRequest, Request};
use crate::provider::{
    AnisetteProvider, Connection, DeviceDirectory, DeviceOperations, ProcessTarget,
    ProgressHandler, ProvisioningProfile,
};

const RECEIVE_CHUNK_SIZE: u64 = 64 * 1024;

pub struct ClientConnection {
    connection: Box<dyn Connection>,
    directory: Arc<dyn DeviceDirectory>,
    operations: Arc<dyn DeviceOperations>,
    anisette: Arc<dyn AnisetteProvider>,
    scratch_dir: PathBuf,
}

impl ClientConnection {
    pub fn new(
        connection: Box<dyn Connection>,
        directory: Arc<dyn DeviceDirectory>,
        operations: Arc<dyn DeviceOperations>,
        anisette: Arc<dyn AnisetteProvider>,
    ) -> Self {
        Self {
            connection,
            directory,
            operations,
            anisette,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Uses `dir` instead of the system temp directory for received packages.
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = dir;
        self
    }

    /// Processes one request to completion.
    ///
    /// Any dispatch failure is translated into an error response before it
    /// propagates; a failure to send that response is logged and the original
    /// failure remains the terminal outcome. A raw transport failure
    /// terminates the connection with no response.
    pub async fn process(&mut self) -> Result<(), ServerError> {
        let result = self.dispatch().await;

        if let Err(e) = &result {
            if matches!(e, ServerError::LostConnection | ServerError::ConnectionFailed) {
                return result;
            }

            let response = protocol::error_response(e);
            if let Err(send_error) = self.send_response(&response).await {
                warn!("Failed to send error response: {send_error}");
            }
        }

        result
    }

    pub async fn disconnect(&mut self) {
        self.connection.disconnect().await;
    }

    async fn dispatch(&mut self) -> Result<(), ServerError> {
        match self.receive_request().await? {
            Request::PrepareApp(request) => self.process_prepare_app(request).await,
            Request::AnisetteData => self.process_anisette_data().await,
            Request::InstallProvisioningProfiles(request) => {
                let profiles: Vec<ProvisioningProfile> = request
                    .provisioning_profiles
                    .iter()
                    .filter_map(|encoded| {
                        let profile = ProvisioningProfile::from_encoded(encoded);
                        if profile.is_none() {
                            debug!("Skipping undecodable provisioning profile");
                        }
                        profile
                    })
                    .collect();
                let active = request.active_profiles.map(HashSet::from_iter);

                self.operations
                    .install_provisioning_profiles(profiles, &request.udid, active)
                    .await?;
                self.send_response(&protocol::install_provisioning_profiles_response())
                    .await
            }
            Request::RemoveProvisioningProfiles(request) => {
                let bundle_identifiers: HashSet<String> =
                    request.bundle_identifiers.into_iter().collect();

                self.operations
                    .remove_provisioning_profiles(bundle_identifiers, &request.udid)
                    .await?;
                self.send_response(&protocol::remove_provisioning_profiles_response())
                    .await
            }
            Request::RemoveApp(request) => {
                self.operations
                    .remove_app(&request.bundle_identifier, &request.udid)
                    .await?;
                self.send_response(&protocol::remove_app_response()).await
            }
            Request::EnableUnsignedCodeExecution(request) => {
                let device = self
                    .directory
                    .available_devices()
                    .into_iter()
                    .find(|d| d.udid == request.udid)
                    .ok_or(ServerError::DeviceNotFound)?;

                let target = match (request.process_id, request.process_name) {
                    (Some(pid), _) => ProcessTarget::Pid(pid),
                    (None, Some(name)) => ProcessTarget::Name(name),
                    (None, None) => return Err(ServerError::InvalidRequest),
                };

                self.operations.prepare_debug_bridge(&device).await?;
                let mut session = self.operations.start_debug_session(&device).await?;
                let result = session.enable_unsigned_code_execution(&target).await;
                session.disconnect().await;
                result?;

                self.send_response(&protocol::enable_unsigned_code_execution_response())
                    .await
            }
            // BeginInstallation only occurs inside the PrepareApp workflow.
            Request::BeginInstallation(_) => Err(ServerError::InvalidRequest),
        }
    }

    /// The install workflow: package payload, begin request, install with
    /// throttled progress, terminal response.
    async fn process_prepare_app(&mut self, request: PrepareAppRequest) -> Result<(), ServerError> {
        info!(
            "Receiving app for {} ({} bytes)...",
            request.udid, request.content_size
        );

        let package_path = self.receive_app(request.content_size).await?;

        let begin = match self.receive_request().await {
            Ok(Request::BeginInstallation(begin)) => begin,
            Ok(_) => {
                remove_package(&package_path).await;
                return Err(ServerError::InvalidRequest);
            }
            Err(e) => {
                remove_package(&package_path).await;
                return Err(e);
            }
        };

        let active = begin.active_profiles.map(HashSet::from_iter);
        let result = self
            .install_app(&package_path, &begin.udid, active)
            .await;

        remove_package(&package_path).await;
        result?;

        info!("Installed app for {}", begin.udid);
        self.send_response(&protocol::installation_progress_response(1.0))
            .await
    }

    /// Receives `content_size` raw bytes into a temporary package file.
    ///
    /// An aborted transfer never leaves a partial package behind.
    async fn receive_app(&mut self, content_size: u64) -> Result<PathBuf, ServerError> {
        let package_path = self.scratch_dir.join(format!("{}.ipa", Uuid::new_v4()));

        if let Err(e) = self.receive_app_into(&package_path, content_size).await {
            remove_package(&package_path).await;
            return Err(e);
        }

        Ok(package_path)
    }

    async fn receive_app_into(
        &mut self,
        package_path: &Path,
        content_size: u64,
    ) -> Result<(), ServerError> {
        let mut file = tokio::fs::File::create(package_path).await?;

        let mut remaining = content_size;
        while remaining > 0 {
            let chunk = remaining.min(RECEIVE_CHUNK_SIZE) as usize;
            let data = self.connection.receive(chunk).await?;
            file.write_all(&data).await?;
            remaining -= data.len() as u64;
        }
        file.flush().await?;
        Ok(())
    }

    /// Runs the install while forwarding progress.
    ///
    /// Progress callbacks land in a single-capacity channel: while a progress
    /// send is in flight further callbacks are dropped, not queued. The
    /// terminal response is the caller's responsibility and is attempted
    /// exactly once.
    async fn install_app(
        &mut self,
        package_path: &Path,
        udid: &str,
        active_profiles: Option<HashSet<String>>,
    ) -> Result<(), ServerError> {
        let (tx, mut rx) = mpsc::channel::<f64>(1);
        let progress: ProgressHandler = Box::new(move |value| {
            let _ = tx.try_send(value);
        });

        let operations = self.operations.clone();
        let install = operations.install_app(package_path, udid, active_profiles, progress);
        tokio::pin!(install);

        let mut progress_closed = false;
        loop {
            tokio::select! {
                result = &mut install => return result,
                received = rx.recv(), if !progress_closed => match received {
                    Some(value) => {
                        if let Err(e) = self
                            .send_response(&protocol::installation_progress_response(value))
                            .await
                        {
                            error!("Error sending installation progress: {e}");
                        }
                    }
                    None => progress_closed = true,
                },
            }
        }
    }

    async fn process_anisette_data(&mut self) -> Result<(), ServerError> {
        let data = self
            .anisette
            .fetch_anisette_data()
            .await
            .ok_or(ServerError::InvalidAnisetteData)?;

        let response = protocol::anisette_data_response(&data)?;
        self.send_response(&response).await
    }

    async fn receive_request(&mut self) -> Result<Request, ServerError> {
        debug!("Receiving request size...");
        let prefix = self.connection.receive(4).await?;
        let prefix: [u8; 4] = prefix
            .try_into()
            .map_err(|_| ServerError::InvalidRequest)?;
        let size = i32::from_le_bytes(prefix);
        if size < 0 {
            return Err(ServerError::InvalidRequest);
        }

        debug!("Receiving {size} bytes...");
        let body = self.connection.receive(size as usize).await?;
        Request::from_slice(&body)
    }

    /// Length prefix and body go out as two sequential sends.
    async fn send_response(&mut self, response: &serde_json::Value) -> Result<(), ServerError> {
        let body = serde_json::to_vec(response).map_err(|_| ServerError::InvalidResponse)?;
        let size = (body.len() as i32).to_le_bytes();

        self.connection.send(&size).await?;
        self.connection.send(&body).await?;
        Ok(())
    }
}

async fn remove_package(package_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(package_path).await {
        warn!(
            "Failed to remove received package {}: {e}",
            package_path.display()
        );
    }
}
