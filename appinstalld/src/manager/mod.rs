//! Connection and notification lifecycle.
//!
//! The manager owns the wireless listener, the mDNS advertisement, the
//! registry of in-flight client connections and the per-device notification
//! channels that bootstrap wired connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use uuid::Uuid;

use crate::connection::ClientConnection;
use crate::error::ServerError;
use crate::provider::{
    AnisetteProvider, Connection, DeviceDirectory, DeviceOperations, NotificationConnection,
    TcpConnection,
};

/// mDNS service type clients browse for.
const SERVICE_TYPE: &str = "_appinstalld._tcp.local.";

/// Posted by a device that wants a wired connection and is asking whether a
/// server is listening.
const WIRED_CONNECTION_AVAILABLE_REQUEST: &str =
    "io.altstore.Request.WiredServerConnectionAvailable";
/// Our answer to the availability probe.
const WIRED_CONNECTION_AVAILABLE_RESPONSE: &str =
    "io.altstore.Response.WiredServerConnectionAvailable";
/// Posted by a device to ask for a wired connection now.
const WIRED_CONNECTION_START_REQUEST: &str = "io.altstore.Request.WiredServerConnectionStart";

/// How often the accept loop wakes to check for shutdown.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period after the final response before tearing the socket down, so
/// the last frame drains to the client.
const DISCONNECT_DELAY: Duration = Duration::from_secs(1);

struct NotificationHandle {
    stop: oneshot::Sender<()>,
    // Distinguishes this registration from any replacement for the same
    // device, so a dying channel can only deregister itself.
    generation: u64,
}

struct ManagerState {
    connections: Mutex<HashMap<u64, String>>,
    notification_connections: Mutex<HashMap<String, NotificationHandle>>,
    next_connection_id: AtomicU64,
    next_notification_generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    mdns: Mutex<Option<ServiceDaemon>>,
    port: Mutex<Option<u16>>,
}

/// Accepts wireless clients, advertises the service and reacts to device
/// hot-plug by maintaining one notification channel per attached device.
#[derive(Clone)]
pub struct ConnectionManager {
    directory: Arc<dyn DeviceDirectory>,
    operations: Arc<dyn DeviceOperations>,
    anisette: Arc<dyn AnisetteProvider>,
    server_id: String,
    state: Arc<ManagerState>,
}

impl ConnectionManager {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        operations: Arc<dyn DeviceOperations>,
        anisette: Arc<dyn AnisetteProvider>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            directory,
            operations,
            anisette,
            server_id: Uuid::new_v4().to_string(),
            state: Arc::new(ManagerState {
                connections: Mutex::new(HashMap::new()),
                notification_connections: Mutex::new(HashMap::new()),
                next_connection_id: AtomicU64::new(0),
                next_notification_generation: AtomicU64::new(0),
                shutdown,
                mdns: Mutex::new(None),
                port: Mutex::new(None),
            }),
        }
    }

    /// Uses a fixed server identifier instead of a generated one, so a
    /// restarted server keeps its pairing with clients.
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Identifier carried in the mDNS TXT record; clients use it to pair a
    /// discovered service with a stored server.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Port of the wireless listener once [`start`](Self::start) has run.
    pub async fn local_port(&self) -> Option<u16> {
        *self.state.port.lock().await
    }

    /// Binds the listener, advertises the service and starts the accept and
    /// device-event loops. A failed advertisement is logged and wireless
    /// discovery is simply unavailable; everything else still runs.
    pub async fn start(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        *self.state.port.lock().await = Some(port);
        info!("Listening on port {port} (server {})", self.server_id);

        match self.advertise(port) {
            Ok(daemon) => *self.state.mdns.lock().await = Some(daemon),
            Err(e) => warn!("Failed to advertise service: {e}"),
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.accept_loop(listener).await });

        for device in self.directory.available_devices() {
            self.start_notification_connection(&device.udid).await;
        }

        let manager = self.clone();
        tokio::spawn(async move { manager.device_event_loop().await });

        Ok(())
    }

    /// Stops the listener loops, withdraws the advertisement and closes all
    /// notification channels. In-flight client connections finish on their
    /// own.
    pub async fn stop(&self) {
        let _ = self.state.shutdown.send(true);

        if let Some(daemon) = self.state.mdns.lock().await.take() {
            let _ = daemon.shutdown();
        }

        let handles: Vec<NotificationHandle> = self
            .state
            .notification_connections
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            let _ = handle.stop.send(());
        }
    }

    fn advertise(&self, port: u16) -> Result<ServiceDaemon, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        let properties = [("serverID", self.server_id.as_str())];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &format!("appinstalld-{port}"),
            &format!("appinstalld-{port}.local."),
            "",
            port,
            &properties[..],
        )?
        .enable_addr_auto();
        daemon.register(service)?;
        Ok(daemon)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let mut shutdown = self.state.shutdown.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    self.spawn_connection(
                        Box::new(TcpConnection::new(stream)),
                        format!("wireless {peer}"),
                    )
                    .await;
                }
                Ok(Err(e)) => warn!("Failed to accept connection: {e}"),
                Err(_) => {}
            }
        }
        debug!("Accept loop stopped");
    }

    async fn device_event_loop(&self) {
        let mut shutdown = self.state.shutdown.subscribe();
        let mut events = self.directory.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(crate::devices::DeviceEvent::Attached(device)) => {
                        info!("Device attached: {} ({})", device.name, device.udid);
                        self.start_notification_connection(&device.udid).await;
                    }
                    Some(crate::devices::DeviceEvent::Detached(device)) => {
                        info!("Device detached: {} ({})", device.name, device.udid);
                        self.stop_notification_connection(&device.udid).await;
                    }
                    None => break,
                },
            }
        }
        debug!("Device event loop stopped");
    }

    /// Opens the notification channel for one device and subscribes to the
    /// wired-connection handshake. At most one channel exists per udid; a
    /// replacement stops its predecessor first.
    async fn start_notification_connection(&self, udid: &str) {
        let device = match self
            .directory
            .available_devices()
            .into_iter()
            .find(|d| d.udid == udid)
        {
            Some(device) => device,
            None => {
                debug!("Skipping notification connection for unknown device {udid}");
                return;
            }
        };

        let mut connection = match self.operations.start_notification_connection(&device).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Failed to open notification connection to {udid}: {e}");
                return;
            }
        };

        let subscriptions = [
            WIRED_CONNECTION_AVAILABLE_REQUEST.to_string(),
            WIRED_CONNECTION_START_REQUEST.to_string(),
        ];
        if let Err(e) = connection.start_listening(&subscriptions).await {
            warn!("Failed to subscribe to notifications on {udid}: {e}");
            connection.disconnect().await;
            return;
        }

        let (stop, stop_rx) = oneshot::channel();
        let generation = self
            .state
            .next_notification_generation
            .fetch_add(1, Ordering::Relaxed);
        let previous = self
            .state
            .notification_connections
            .lock()
            .await
            .insert(udid.to_string(), NotificationHandle { stop, generation });
        if let Some(previous) = previous {
            let _ = previous.stop.send(());
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.notification_loop(connection, stop_rx, generation).await;
        });
    }

    async fn stop_notification_connection(&self, udid: &str) {
        if let Some(handle) = self
            .state
            .notification_connections
            .lock()
            .await
            .remove(udid)
        {
            let _ = handle.stop.send(());
        }
    }

    async fn notification_loop(
        &self,
        mut connection: Box<dyn NotificationConnection>,
        mut stop: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let udid = connection.device().udid.clone();
        loop {
            tokio::select! {
                _ = &mut stop => {
                    connection.disconnect().await;
                    return;
                }
                received = connection.recv() => match received {
                    Some(name) => self.handle_notification(&mut connection, &name).await,
                    None => {
                        debug!("Notification channel to {udid} closed");
                        break;
                    }
                },
            }
        }
        connection.disconnect().await;

        // The channel failed on its own. Deregister only while the registry
        // still holds this loop's own registration; a replacement for the
        // same device carries a newer generation and must survive.
        let mut registry = self.state.notification_connections.lock().await;
        if registry.get(&udid).map(|h| h.generation) == Some(generation) {
            registry.remove(&udid);
        }
    }

    async fn handle_notification(
        &self,
        connection: &mut Box<dyn NotificationConnection>,
        name: &str,
    ) {
        let device = connection.device().clone();
        match name {
            WIRED_CONNECTION_AVAILABLE_REQUEST => {
                debug!("Wired connection probe from {}", device.udid);
                if let Err(e) = connection.post(WIRED_CONNECTION_AVAILABLE_RESPONSE).await {
                    warn!("Failed to answer wired connection probe: {e}");
                }
            }
            WIRED_CONNECTION_START_REQUEST => {
                info!("Starting wired connection to {}", device.udid);
                match self.operations.start_wired_connection(&device).await {
                    Ok(wired) => {
                        self.spawn_connection(wired, format!("wired {}", device.udid))
                            .await;
                    }
                    Err(e) => warn!("Failed to start wired connection to {}: {e}", device.udid),
                }
            }
            other => debug!("Ignoring notification {other} from {}", device.udid),
        }
    }

    /// Registers a connection and drives it on its own task. The registry
    /// entry is removed exactly once, after the drain delay and teardown.
    async fn spawn_connection(&self, connection: Box<dyn Connection>, label: String) {
        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .connections
            .lock()
            .await
            .insert(id, label.clone());
        info!("Client connected ({label})");

        let mut client = ClientConnection::new(
            connection,
            self.directory.clone(),
            self.operations.clone(),
            self.anisette.clone(),
        );
        let state = self.state.clone();
        tokio::spawn(async move {
            match client.process().await {
                Ok(()) => info!("Finished request ({label})"),
                Err(e) => warn!("Connection failed ({label}): {e}"),
            }

            tokio::time::sleep(DISCONNECT_DELAY).await;
            client.disconnect().await;
            state.connections.lock().await.remove(&id);
            debug!("Client disconnected ({label})");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::{DuplexConnection, NoAnisette};
    use crate::devices::{Device, DeviceEvent, DeviceType, OsVersion};
    use crate::provider::{DebugSession, ProgressHandler, ProvisioningProfile};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    struct ChannelDirectory {
        devices: StdMutex<Vec<Device>>,
        events: StdMutex<Option<mpsc::Receiver<DeviceEvent>>>,
    }

    impl ChannelDirectory {
        fn new(devices: Vec<Device>) -> (Arc<Self>, mpsc::Sender<DeviceEvent>) {
            let (tx, rx) = mpsc::channel(8);
            let directory = Arc::new(Self {
                devices: StdMutex::new(devices),
                events: StdMutex::new(Some(rx)),
            });
            (directory, tx)
        }

        fn attach(&self, device: Device) {
            self.devices.lock().unwrap().push(device);
        }
    }

    impl DeviceDirectory for ChannelDirectory {
        fn available_devices(&self) -> Vec<Device> {
            self.devices.lock().unwrap().clone()
        }

        fn subscribe(&self) -> mpsc::Receiver<DeviceEvent> {
            self.events
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| mpsc::channel(1).1)
        }
    }

    /// Notification channel fed from a test-side script.
    struct ScriptedNotificationConnection {
        device: Device,
        incoming: mpsc::Receiver<String>,
        posted: Arc<StdMutex<Vec<String>>>,
        listening: Arc<StdMutex<Vec<String>>>,
        disconnected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl NotificationConnection for ScriptedNotificationConnection {
        async fn start_listening(&mut self, notifications: &[String]) -> Result<(), ServerError> {
            self.listening.lock().unwrap().extend_from_slice(notifications);
            Ok(())
        }

        async fn post(&mut self, notification: &str) -> Result<(), ServerError> {
            self.posted.lock().unwrap().push(notification.to_string());
            Ok(())
        }

        async fn recv(&mut self) -> Option<String> {
            self.incoming.recv().await
        }

        async fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    struct NotificationScript {
        incoming: mpsc::Sender<String>,
        posted: Arc<StdMutex<Vec<String>>>,
        listening: Arc<StdMutex<Vec<String>>>,
        disconnected: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct WiredOperations {
        scripts: StdMutex<Vec<NotificationScript>>,
        wired_streams: StdMutex<Vec<DuplexStream>>,
        removed_apps: StdMutex<Vec<String>>,
    }

    impl WiredOperations {
        fn push_wired(&self) -> DuplexStream {
            let (device_side, test_side) = tokio::io::duplex(1 << 16);
            self.wired_streams.lock().unwrap().push(device_side);
            test_side
        }
    }

    #[async_trait]
    impl DeviceOperations for WiredOperations {
        async fn install_app(
            &self,
            _package_path: &Path,
            _udid: &str,
            _active_profiles: Option<HashSet<String>>,
            _progress: ProgressHandler,
        ) -> Result<(), ServerError> {
            Ok(())
        }

        async fn install_provisioning_profiles(
            &self,
            _profiles: Vec<ProvisioningProfile>,
            _udid: &str,
            _active_profiles: Option<HashSet<String>>,
        ) -> Result<(), ServerError> {
            Ok(())
        }

        async fn remove_provisioning_profiles(
            &self,
            _bundle_identifiers: HashSet<String>,
            _udid: &str,
        ) -> Result<(), ServerError> {
            Ok(())
        }

        async fn remove_app(
            &self,
            bundle_identifier: &str,
            _udid: &str,
        ) -> Result<(), ServerError> {
            self.removed_apps
                .lock()
                .unwrap()
                .push(bundle_identifier.to_string());
            Ok(())
        }

        async fn start_notification_connection(
            &self,
            device: &Device,
        ) -> Result<Box<dyn NotificationConnection>, ServerError> {
            let (tx, rx) = mpsc::channel(8);
            let posted = Arc::new(StdMutex::new(Vec::new()));
            let listening = Arc::new(StdMutex::new(Vec::new()));
            let disconnected = Arc::new(AtomicBool::new(false));
            self.scripts.lock().unwrap().push(NotificationScript {
                incoming: tx,
                posted: posted.clone(),
                listening: listening.clone(),
                disconnected: disconnected.clone(),
            });
            Ok(Box::new(ScriptedNotificationConnection {
                device: device.clone(),
                incoming: rx,
                posted,
                listening,
                disconnected,
            }))
        }

        async fn start_wired_connection(
            &self,
            _device: &Device,
        ) -> Result<Box<dyn Connection>, ServerError> {
            let stream = self
                .wired_streams
                .lock()
                .unwrap()
                .pop()
                .ok_or(ServerError::ConnectionFailed)?;
            Ok(Box::new(DuplexConnection::new(stream)))
        }

        async fn prepare_debug_bridge(&self, _device: &Device) -> Result<(), ServerError> {
            Ok(())
        }

        async fn start_debug_session(
            &self,
            _device: &Device,
        ) -> Result<Box<dyn DebugSession>, ServerError> {
            Err(ServerError::ConnectionFailed)
        }
    }

    fn test_device(udid: &str) -> Device {
        Device::new(udid, "Test iPhone", DeviceType::Iphone, OsVersion::new(17, 0, 0))
    }

    async fn write_frame(stream: &mut (impl AsyncWriteExt + Unpin), value: &serde_json::Value) {
        let frame = crate::protocol::encode_frame(value).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    async fn read_frame(stream: &mut (impl AsyncReadExt + Unpin)) -> serde_json::Value {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; i32::from_le_bytes(prefix) as usize];
        stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn wireless_client_round_trip() {
        let (directory, _events) = ChannelDirectory::new(vec![]);
        let operations = Arc::new(WiredOperations::default());
        let manager =
            ConnectionManager::new(directory, operations.clone(), Arc::new(NoAnisette));

        manager.start().await.unwrap();
        let port = manager.local_port().await.unwrap();

        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        write_frame(
            &mut client,
            &serde_json::json!({
                "identifier": "RemoveAppRequest",
                "udid": "ABCD",
                "bundleIdentifier": "com.example.app",
            }),
        )
        .await;

        let response = read_frame(&mut client).await;
        assert_eq!(response["identifier"], "RemoveAppResponse");
        assert_eq!(
            operations.removed_apps.lock().unwrap().as_slice(),
            &["com.example.app"]
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn attached_device_gets_wired_handshake() {
        let (directory, events) = ChannelDirectory::new(vec![]);
        let operations = Arc::new(WiredOperations::default());
        let manager = ConnectionManager::new(
            directory.clone(),
            operations.clone(),
            Arc::new(NoAnisette),
        );
        manager.start().await.unwrap();

        let device = test_device("ABCD");
        directory.attach(device.clone());
        events
            .send(DeviceEvent::Attached(device))
            .await
            .unwrap();

        wait_until(|| !operations.scripts.lock().unwrap().is_empty()).await;
        let (incoming, posted, listening) = {
            let scripts = operations.scripts.lock().unwrap();
            let script = &scripts[0];
            (
                script.incoming.clone(),
                script.posted.clone(),
                script.listening.clone(),
            )
        };

        assert_eq!(
            listening.lock().unwrap().as_slice(),
            &[
                WIRED_CONNECTION_AVAILABLE_REQUEST.to_string(),
                WIRED_CONNECTION_START_REQUEST.to_string(),
            ]
        );

        incoming
            .send(WIRED_CONNECTION_AVAILABLE_REQUEST.to_string())
            .await
            .unwrap();
        wait_until(|| !posted.lock().unwrap().is_empty()).await;
        assert_eq!(
            posted.lock().unwrap().as_slice(),
            &[WIRED_CONNECTION_AVAILABLE_RESPONSE.to_string()]
        );

        let mut wired = operations.push_wired();
        incoming
            .send(WIRED_CONNECTION_START_REQUEST.to_string())
            .await
            .unwrap();

        write_frame(
            &mut wired,
            &serde_json::json!({
                "identifier": "RemoveAppRequest",
                "udid": "ABCD",
                "bundleIdentifier": "com.example.wired",
            }),
        )
        .await;
        let response = read_frame(&mut wired).await;
        assert_eq!(response["identifier"], "RemoveAppResponse");

        manager.stop().await;
    }

    #[tokio::test]
    async fn detach_closes_notification_connection() {
        let device = test_device("ABCD");
        let (directory, events) = ChannelDirectory::new(vec![device.clone()]);
        let operations = Arc::new(WiredOperations::default());
        let manager =
            ConnectionManager::new(directory, operations.clone(), Arc::new(NoAnisette));

        // The device is present at startup; the channel opens immediately.
        manager.start().await.unwrap();
        wait_until(|| !operations.scripts.lock().unwrap().is_empty()).await;
        let disconnected = operations.scripts.lock().unwrap()[0].disconnected.clone();

        events
            .send(DeviceEvent::Detached(device))
            .await
            .unwrap();

        wait_until(|| disconnected.load(Ordering::SeqCst)).await;
        assert!(manager
            .state
            .notification_connections
            .lock()
            .await
            .is_empty());

        manager.stop().await;
    }

    #[tokio::test]
    async fn reattach_replaces_notification_connection() {
        let device = test_device("ABCD");
        let (directory, events) = ChannelDirectory::new(vec![device.clone()]);
        let operations = Arc::new(WiredOperations::default());
        let manager =
            ConnectionManager::new(directory, operations.clone(), Arc::new(NoAnisette));
        manager.start().await.unwrap();
        wait_until(|| !operations.scripts.lock().unwrap().is_empty()).await;

        events
            .send(DeviceEvent::Attached(device))
            .await
            .unwrap();
        wait_until(|| operations.scripts.lock().unwrap().len() == 2).await;

        // The first channel was stopped when its replacement registered.
        let first_disconnected = operations.scripts.lock().unwrap()[0].disconnected.clone();
        wait_until(|| first_disconnected.load(Ordering::SeqCst)).await;
        assert_eq!(
            manager.state.notification_connections.lock().await.len(),
            1
        );

        manager.stop().await;
    }

    #[tokio::test]
    async fn channel_failure_does_not_remove_replacement() {
        let device = test_device("ABCD");
        let (directory, events) = ChannelDirectory::new(vec![device.clone()]);
        let operations = Arc::new(WiredOperations::default());
        let manager =
            ConnectionManager::new(directory, operations.clone(), Arc::new(NoAnisette));
        manager.start().await.unwrap();
        wait_until(|| !operations.scripts.lock().unwrap().is_empty()).await;

        // Register a replacement and fail the old channel at the same time,
        // so the old loop may observe the closed channel before its stop.
        events
            .send(DeviceEvent::Attached(device))
            .await
            .unwrap();
        {
            let mut scripts = operations.scripts.lock().unwrap();
            scripts[0].incoming = mpsc::channel(1).0;
        }
        wait_until(|| operations.scripts.lock().unwrap().len() == 2).await;

        let first_disconnected = operations.scripts.lock().unwrap()[0].disconnected.clone();
        wait_until(|| first_disconnected.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The replacement's registration survives the old channel's teardown.
        let second_disconnected = operations.scripts.lock().unwrap()[1].disconnected.clone();
        assert!(!second_disconnected.load(Ordering::SeqCst));
        assert_eq!(
            manager.state.notification_connections.lock().await.len(),
            1
        );

        manager.stop().await;
    }
}
