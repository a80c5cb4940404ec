//! Connection manager: the single owner of the live peripheral link.
//!
//! Drives scan lifecycle, connect/disconnect, heart-rate monitoring, and
//! connection-loss detection over an abstract [`BleStack`]. All other
//! components query connection state through this manager instead of
//! caching their own reference to the link.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use super::gatt::{HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use super::platform::{AdapterState, BleLink, BleStack, DisconnectReason, PermissionGate};
use super::BleError;
use crate::history::DeviceHistory;
use crate::hr;
use crate::types::heartrate::HeartRateSample;
use crate::types::{ConnectionStatus, DiscoveredDevice, PeripheralId};

/// Ceiling on waiting for the first adapter-state report.
pub const ADAPTER_READY_TIMEOUT: Duration = Duration::from_secs(3);
pub const ADAPTER_READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ceiling on GATT service discovery after connect.
pub const SERVICE_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_SCAN_DURATION: Duration = Duration::from_secs(10);

/// Connection state as a tagged variant rather than a nullable handle.
enum LinkState {
    Disconnected,
    Connecting,
    Connected(Arc<dyn BleLink>),
}

/// Push-style notifications to subscribers: validated samples plus
/// unsolicited disconnects. Explicit disconnects are not announced here;
/// the caller that asked for them already knows.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Sample(HeartRateSample),
    Disconnected {
        id: PeripheralId,
        reason: DisconnectReason,
    },
}

pub struct ConnectionManager {
    stack: Arc<dyn BleStack>,
    permissions: Arc<dyn PermissionGate>,
    history: Arc<DeviceHistory>,
    link: Arc<Mutex<LinkState>>,
    events_tx: broadcast::Sender<MonitorEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        stack: Arc<dyn BleStack>,
        permissions: Arc<dyn PermissionGate>,
        history: Arc<DeviceHistory>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            stack,
            permissions,
            history,
            link: Arc::new(Mutex::new(LinkState::Disconnected)),
            events_tx,
            scan_task: Mutex::new(None),
            watcher_task: Mutex::new(None),
            monitor_task: Mutex::new(None),
        }
    }

    /// Subscribe to samples and unsolicited-disconnect notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events_tx.subscribe()
    }

    pub async fn request_permissions(&self) -> bool {
        self.permissions.request().await
    }

    pub async fn is_adapter_enabled(&self) -> bool {
        self.stack.adapter_state().await == AdapterState::PoweredOn
    }

    /// Wait for the stack to report a definite adapter state. Fails fast
    /// with `AdapterTimeout` instead of hanging when the platform never
    /// initializes.
    pub async fn wait_until_ready(&self) -> Result<AdapterState, BleError> {
        let deadline = tokio::time::Instant::now() + ADAPTER_READY_TIMEOUT;
        loop {
            let state = self.stack.adapter_state().await;
            if state != AdapterState::Unknown {
                return Ok(state);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BleError::AdapterTimeout);
            }
            tokio::time::sleep(ADAPTER_READY_POLL_INTERVAL).await;
        }
    }

    /// Scan for named peripherals for `duration`, delivering discoveries
    /// on the returned channel. The scan stops itself at expiry and can be
    /// stopped early via [`stop_scan`](Self::stop_scan).
    pub async fn start_scan(
        &self,
        duration: Duration,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, BleError> {
        if !self.permissions.request().await {
            return Err(BleError::PermissionDenied);
        }
        if self.wait_until_ready().await? == AdapterState::PoweredOff {
            return Err(BleError::AdapterDisabled);
        }

        // Restarting a scan supersedes any previous one.
        self.stop_scan().await?;

        let mut discoveries = self.stack.discoveries();
        self.stack.start_scan().await?;
        info!("Started BLE scan ({} s)", duration.as_secs());

        let (tx, rx) = mpsc::channel(64);
        let stack = Arc::clone(&self.stack);
        let handle = tokio::spawn(async move {
            let expiry = tokio::time::sleep(duration);
            tokio::pin!(expiry);
            loop {
                tokio::select! {
                    _ = &mut expiry => {
                        debug!("Scan duration elapsed");
                        break;
                    }
                    found = discoveries.recv() => match found {
                        Ok(device) => {
                            // Unnamed advertisements give the user nothing
                            // to pick from.
                            if device.name.is_none() {
                                continue;
                            }
                            debug!("Found device: {:?} ({})", device.name, device.id);
                            if tx.send(device).await.is_err() {
                                break; // consumer went away
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Scan consumer lagged; {} advertisements dropped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            if let Err(e) = stack.stop_scan().await {
                warn!("Failed to stop scan at expiry: {}", e);
            }
        });
        *self.scan_task.lock().await = Some(handle);
        Ok(rx)
    }

    /// Stop a running scan. Safe to call when no scan is in progress.
    pub async fn stop_scan(&self) -> Result<(), BleError> {
        if let Some(handle) = self.scan_task.lock().await.take() {
            handle.abort();
            debug!("Scan stopped by request");
        }
        self.stack.stop_scan().await
    }

    /// Connect to a peripheral. On success the manager holds the link as
    /// the single source of truth, records the device in history, and
    /// watches for unsolicited disconnects.
    pub async fn connect(&self, id: &PeripheralId) -> Result<(), BleError> {
        if self.wait_until_ready().await? == AdapterState::PoweredOff {
            return Err(BleError::AdapterDisabled);
        }

        {
            let mut state = self.link.lock().await;
            if let LinkState::Connected(existing) = &*state {
                if existing.is_connected().await {
                    return Err(BleError::ConnectionFailed(format!(
                        "Already connected to {}",
                        existing.id()
                    )));
                }
            }
            *state = LinkState::Connecting;
        }

        match self.stack.connect(id).await {
            Ok(boxed) => {
                let link: Arc<dyn BleLink> = Arc::from(boxed);
                let name = link.name().unwrap_or_else(|| "Unknown device".to_string());

                // History bookkeeping must never fail the connection.
                if let Err(e) = self.history.upsert(id, &name, None) {
                    warn!("Failed to record {} in device history: {}", id, e);
                }

                self.install_disconnect_watcher(Arc::clone(&link)).await;
                *self.link.lock().await = LinkState::Connected(link);
                info!("Connected to {} ({})", name, id);
                Ok(())
            }
            Err(e) => {
                *self.link.lock().await = LinkState::Disconnected;
                error!("Connection to {} failed: {}", id, e);
                Err(e)
            }
        }
    }

    /// Explicit user disconnect. Idempotent: a no-op when not connected.
    pub async fn disconnect(&self) -> Result<(), BleError> {
        // Tear down the watcher first so an explicit disconnect never
        // surfaces to subscribers as an unsolicited drop.
        if let Some(watcher) = self.watcher_task.lock().await.take() {
            watcher.abort();
        }
        self.stop_monitoring().await;

        let previous = {
            let mut state = self.link.lock().await;
            std::mem::replace(&mut *state, LinkState::Disconnected)
        };
        match previous {
            LinkState::Connected(link) => {
                link.disconnect().await?;
                info!("Disconnected from {}", link.id());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Current status, re-verified against the platform. A stale
    /// "connected" belief self-corrects here. Never triggers scans or
    /// connection attempts.
    pub async fn status(&self) -> ConnectionStatus {
        let adapter_enabled = self.stack.adapter_state().await == AdapterState::PoweredOn;
        let mut state = self.link.lock().await;
        let (is_connected, device_name) = match &*state {
            LinkState::Connected(link) => {
                if link.is_connected().await {
                    (true, link.name())
                } else {
                    debug!("Dropping stale link to {}", link.id());
                    *state = LinkState::Disconnected;
                    (false, None)
                }
            }
            _ => (false, None),
        };
        ConnectionStatus {
            is_connected,
            device_name,
            adapter_enabled,
        }
    }

    /// Identity of the currently held peripheral, if any.
    pub async fn current_peripheral(&self) -> Option<(PeripheralId, Option<String>)> {
        match &*self.link.lock().await {
            LinkState::Connected(link) => Some((link.id().clone(), link.name())),
            _ => None,
        }
    }

    /// Discover services and subscribe to the Heart Rate Measurement
    /// characteristic, decoding each notification into a validated sample
    /// pushed to subscribers. A malformed packet is logged and dropped;
    /// it never terminates the subscription.
    pub async fn start_monitoring(&self) -> Result<(), BleError> {
        let link = match &*self.link.lock().await {
            LinkState::Connected(link) => Arc::clone(link),
            _ => return Err(BleError::NotConnected),
        };

        tokio::time::timeout(SERVICE_DISCOVERY_TIMEOUT, link.discover_services())
            .await
            .map_err(|_| BleError::Timeout)??;

        let mut payloads = link
            .monitor_characteristic(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .await?;

        if let Some(old) = self.monitor_task.lock().await.take() {
            old.abort();
        }
        let events_tx = self.events_tx.clone();
        let device_id = link.id().clone();
        let handle = tokio::spawn(async move {
            while let Some(payload) = payloads.recv().await {
                match hr::decode(&payload, &device_id) {
                    Ok(sample) => {
                        let _ = events_tx.send(MonitorEvent::Sample(sample));
                    }
                    Err(e) => {
                        warn!("Dropped heart-rate packet from {}: {}", device_id, e);
                    }
                }
            }
            debug!("Heart-rate notification stream for {} ended", device_id);
        });
        *self.monitor_task.lock().await = Some(handle);
        info!("Started heart-rate monitoring");
        Ok(())
    }

    /// Stop forwarding samples. Safe to call when not monitoring.
    pub async fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor_task.lock().await.take() {
            handle.abort();
            info!("Stopped heart-rate monitoring");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor_task.lock().await.is_some()
    }

    async fn install_disconnect_watcher(&self, link: Arc<dyn BleLink>) {
        if let Some(old) = self.watcher_task.lock().await.take() {
            old.abort();
        }
        let mut events = link.disconnect_events();
        let events_tx = self.events_tx.clone();
        let link_state = Arc::clone(&self.link);
        let id = link.id().clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DisconnectReason::ConnectionLost) => {
                        warn!("Peripheral {} disconnected unexpectedly", id);
                        *link_state.lock().await = LinkState::Disconnected;
                        let _ = events_tx.send(MonitorEvent::Disconnected {
                            id: id.clone(),
                            reason: DisconnectReason::ConnectionLost,
                        });
                        break;
                    }
                    // The explicit-disconnect path tears this task down
                    // before the platform reports; a Requested event seen
                    // here is already handled.
                    Ok(DisconnectReason::Requested) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.watcher_task.lock().await = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::platform::{AlwaysDenied, AlwaysGranted};
    use crate::ble::simulated::SimStack;
    use crate::storage::MemoryStore;

    fn manager_with(stack: Arc<SimStack>) -> ConnectionManager {
        let history = Arc::new(DeviceHistory::new(Arc::new(MemoryStore::new()) as _));
        ConnectionManager::new(stack, Arc::new(AlwaysGranted), history)
    }

    #[tokio::test]
    async fn test_scan_requires_permission() {
        let stack = SimStack::new();
        let history = Arc::new(DeviceHistory::new(Arc::new(MemoryStore::new()) as _));
        let manager = ConnectionManager::new(stack, Arc::new(AlwaysDenied), history);
        let result = manager.start_scan(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BleError::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_scan_requires_adapter_on() {
        let stack = SimStack::with_adapter(AdapterState::PoweredOff);
        let manager = manager_with(stack);
        let result = manager.start_scan(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(BleError::AdapterDisabled)));
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out_on_unknown_adapter() {
        tokio::time::pause();
        let stack = SimStack::with_adapter(AdapterState::Unknown);
        let manager = manager_with(stack);
        let result = manager.wait_until_ready().await;
        assert!(matches!(result, Err(BleError::AdapterTimeout)));
    }

    #[tokio::test]
    async fn test_scan_skips_unnamed_advertisements() {
        let stack = SimStack::new();
        stack.add_sensor("noname", None, Some(-70), None).await;
        let named = stack
            .add_sensor("ABC123", Some("Polar H10"), Some(-55), None)
            .await;
        let _ = named;

        let manager = manager_with(Arc::clone(&stack));
        let mut rx = manager.start_scan(Duration::from_millis(200)).await.unwrap();

        let found = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, PeripheralId::new("ABC123"));
        // The unnamed device never comes through; the channel just closes
        // at scan expiry.
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_stop_scan_is_idempotent() {
        let stack = SimStack::new();
        let manager = manager_with(stack);
        manager.stop_scan().await.unwrap();
        manager.stop_scan().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_records_history_and_reports_status() {
        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let history = Arc::new(DeviceHistory::new(Arc::new(MemoryStore::new()) as _));
        let manager = ConnectionManager::new(
            Arc::clone(&stack) as _,
            Arc::new(AlwaysGranted),
            Arc::clone(&history),
        );

        manager.connect(sensor.id()).await.unwrap();

        let status = manager.status().await;
        assert!(status.is_connected);
        assert_eq!(status.device_name.as_deref(), Some("Polar H10"));
        assert!(status.adapter_enabled);

        let devices = history.devices().unwrap();
        assert_eq!(devices[0].id, PeripheralId::new("ABC123"));

        let (id, name) = manager.current_peripheral().await.unwrap();
        assert_eq!(id, PeripheralId::new("ABC123"));
        assert_eq!(name.as_deref(), Some("Polar H10"));
    }

    #[tokio::test]
    async fn test_connect_unknown_peripheral_fails_cleanly() {
        let stack = SimStack::new();
        let manager = manager_with(stack);
        let result = manager.connect(&PeripheralId::new("ghost")).await;
        assert!(matches!(result, Err(BleError::ConnectionFailed(_))));
        assert!(!manager.status().await.is_connected);
    }

    #[tokio::test]
    async fn test_status_self_heals_stale_link() {
        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let manager = manager_with(Arc::clone(&stack));
        manager.connect(sensor.id()).await.unwrap();

        // Kill the link behind the manager's back.
        sensor.drop_link();

        let status = manager.status().await;
        assert!(!status.is_connected);
        assert_eq!(status.device_name, None);
        // And it stays healed.
        assert!(!manager.status().await.is_connected);
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_is_pushed_to_subscribers() {
        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let manager = manager_with(Arc::clone(&stack));
        let mut events = manager.subscribe();

        manager.connect(sensor.id()).await.unwrap();
        sensor.drop_link();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            MonitorEvent::Disconnected { id, reason } => {
                assert_eq!(id, PeripheralId::new("ABC123"));
                assert_eq!(reason, DisconnectReason::ConnectionLost);
            }
            other => panic!("expected disconnect event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_explicit_disconnect_emits_no_event_and_is_idempotent() {
        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let manager = manager_with(Arc::clone(&stack));
        let mut events = manager.subscribe();

        manager.connect(sensor.id()).await.unwrap();
        manager.disconnect().await.unwrap();
        assert!(!manager.status().await.is_connected);

        // No unsolicited-disconnect event for an explicit disconnect.
        let outcome =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(outcome.is_err());

        // Disconnecting again is a no-op.
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_monitoring_decodes_and_survives_bad_packets() {
        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let manager = manager_with(Arc::clone(&stack));
        let mut events = manager.subscribe();

        manager.connect(sensor.id()).await.unwrap();
        manager.start_monitoring().await.unwrap();
        assert!(manager.is_monitoring().await);

        sensor.emit_hrm(&[0x00, 72]);
        // Malformed and out-of-range packets must not kill the stream.
        sensor.emit_hrm(&[0x00]);
        sensor.emit_hrm(&[0x00, 5]);
        sensor.emit_hrm(&[0x06, 80, 0x00, 0x04]);

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            MonitorEvent::Sample(sample) => assert_eq!(sample.bpm, 72),
            other => panic!("expected sample, got {:?}", other),
        }
        let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match second {
            MonitorEvent::Sample(sample) => {
                assert_eq!(sample.bpm, 80);
                assert_eq!(sample.sensor_contact, Some(true));
                assert_eq!(sample.rr_intervals_ms, vec![1000.0]);
            }
            other => panic!("expected sample, got {:?}", other),
        }

        manager.stop_monitoring().await;
        assert!(!manager.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_monitoring_requires_connection() {
        let stack = SimStack::new();
        let manager = manager_with(stack);
        assert!(matches!(
            manager.start_monitoring().await,
            Err(BleError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_history_failure_does_not_fail_connection() {
        // A store that rejects every write.
        struct BrokenStore;
        impl crate::storage::KeyValueStore for BrokenStore {
            fn get(&self, _: &str) -> Result<Option<String>, crate::storage::StorageError> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "broken").into())
            }
            fn set(&self, _: &str, _: &str) -> Result<(), crate::storage::StorageError> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "broken").into())
            }
            fn remove(&self, _: &str) -> Result<(), crate::storage::StorageError> {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "broken").into())
            }
        }

        let stack = SimStack::new();
        let sensor = stack
            .add_sensor("ABC123", Some("Polar H10"), None, None)
            .await;
        let history = Arc::new(DeviceHistory::new(Arc::new(BrokenStore) as _));
        let manager =
            ConnectionManager::new(Arc::clone(&stack) as _, Arc::new(AlwaysGranted), history);

        manager.connect(sensor.id()).await.unwrap();
        assert!(manager.status().await.is_connected);
    }
}
