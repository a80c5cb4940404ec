//! In-process BLE simulator.
//!
//! A simulated stack where test code registers heart-rate sensors, flips
//! adapter power, emits raw measurement payloads, and force-drops links.
//! Used for integration testing and CLI demos without BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use uuid::Uuid;

use super::gatt::{HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use super::platform::{AdapterState, BleLink, BleStack, DisconnectReason};
use super::BleError;
use crate::types::{DiscoveredDevice, PeripheralId};

/// The simulated platform stack: one radio, any number of sensors.
pub struct SimStack {
    adapter: RwLock<AdapterState>,
    adapter_tx: broadcast::Sender<AdapterState>,
    discovery_tx: broadcast::Sender<DiscoveredDevice>,
    scanning: AtomicBool,
    sensors: Mutex<HashMap<PeripheralId, Arc<SensorInner>>>,
}

struct SensorInner {
    id: PeripheralId,
    name: Option<String>,
    rssi: Option<i16>,
    manufacturer_data: Option<Vec<u8>>,
    connected: AtomicBool,
    payload_tx: broadcast::Sender<Vec<u8>>,
    disconnect_tx: broadcast::Sender<DisconnectReason>,
}

impl SensorInner {
    fn advertisement(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            id: self.id.clone(),
            name: self.name.clone(),
            rssi: self.rssi,
            manufacturer_data: self.manufacturer_data.clone(),
        }
    }
}

/// Test-side handle to a simulated sensor.
#[derive(Clone)]
pub struct SimSensor {
    inner: Arc<SensorInner>,
    stack: Arc<SimStack>,
}

impl SimSensor {
    pub fn id(&self) -> &PeripheralId {
        &self.inner.id
    }

    /// Broadcast this sensor's advertisement, as a nearby device would
    /// keep doing while a scan runs.
    pub fn advertise(&self) {
        if self.stack.scanning.load(Ordering::SeqCst) {
            let _ = self.stack.discovery_tx.send(self.inner.advertisement());
        }
    }

    /// Push one raw Heart Rate Measurement payload to subscribers.
    pub fn emit_hrm(&self, payload: &[u8]) {
        let _ = self.inner.payload_tx.send(payload.to_vec());
    }

    /// Drop the link from the sensor side: out of range, battery died.
    /// Surfaces as an unsolicited disconnect.
    pub fn drop_link(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self
            .inner
            .disconnect_tx
            .send(DisconnectReason::ConnectionLost);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

impl SimStack {
    /// Create a simulated stack with the adapter already powered on.
    pub fn new() -> Arc<Self> {
        Self::with_adapter(AdapterState::PoweredOn)
    }

    pub fn with_adapter(state: AdapterState) -> Arc<Self> {
        let (adapter_tx, _) = broadcast::channel(16);
        let (discovery_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            adapter: RwLock::new(state),
            adapter_tx,
            discovery_tx,
            scanning: AtomicBool::new(false),
            sensors: Mutex::new(HashMap::new()),
        })
    }

    /// Flip the simulated radio and notify subscribers.
    pub async fn set_adapter_state(&self, state: AdapterState) {
        *self.adapter.write().await = state;
        let _ = self.adapter_tx.send(state);
    }

    /// Register a simulated heart-rate sensor and return its handle.
    pub async fn add_sensor(
        self: &Arc<Self>,
        id: impl Into<String>,
        name: Option<&str>,
        rssi: Option<i16>,
        manufacturer_data: Option<Vec<u8>>,
    ) -> SimSensor {
        let (payload_tx, _) = broadcast::channel(64);
        let (disconnect_tx, _) = broadcast::channel(16);
        let inner = Arc::new(SensorInner {
            id: PeripheralId::new(id),
            name: name.map(str::to_string),
            rssi,
            manufacturer_data,
            connected: AtomicBool::new(false),
            payload_tx,
            disconnect_tx,
        });
        self.sensors
            .lock()
            .await
            .insert(inner.id.clone(), Arc::clone(&inner));
        SimSensor {
            inner,
            stack: Arc::clone(self),
        }
    }
}

#[async_trait]
impl BleStack for SimStack {
    async fn adapter_state(&self) -> AdapterState {
        *self.adapter.read().await
    }

    fn adapter_events(&self) -> broadcast::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        if *self.adapter.read().await != AdapterState::PoweredOn {
            return Err(BleError::AdapterDisabled);
        }
        self.scanning.store(true, Ordering::SeqCst);
        // Every registered sensor advertises as soon as the scan starts.
        for sensor in self.sensors.lock().await.values() {
            let _ = self.discovery_tx.send(sensor.advertisement());
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovery_tx.subscribe()
    }

    async fn connect(&self, id: &PeripheralId) -> Result<Box<dyn BleLink>, BleError> {
        if *self.adapter.read().await != AdapterState::PoweredOn {
            return Err(BleError::AdapterDisabled);
        }
        let sensors = self.sensors.lock().await;
        let sensor = sensors
            .get(id)
            .ok_or_else(|| BleError::ConnectionFailed(format!("No peripheral {id}")))?;
        sensor.connected.store(true, Ordering::SeqCst);
        Ok(Box::new(SimLink {
            inner: Arc::clone(sensor),
        }))
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError> {
        if let Some(sensor) = self.sensors.lock().await.get(id) {
            sensor.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Simulated link: payloads and disconnects flow over tokio channels.
struct SimLink {
    inner: Arc<SensorInner>,
}

#[async_trait]
impl BleLink for SimLink {
    fn id(&self) -> &PeripheralId {
        &self.inner.id
    }

    fn name(&self) -> Option<String> {
        self.inner.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        Ok(())
    }

    async fn monitor_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        if service != HEART_RATE_SERVICE_UUID || characteristic != HEART_RATE_MEASUREMENT_UUID {
            return Err(BleError::ConnectionFailed(format!(
                "Characteristic {characteristic} not offered by simulated sensor"
            )));
        }
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }

        let mut payloads = self.inner.payload_tx.subscribe();
        let connected = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(payload) = payloads.recv().await {
                if !connected.connected.load(Ordering::SeqCst) {
                    break;
                }
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn disconnect_events(&self) -> broadcast::Receiver<DisconnectReason> {
        self.inner.disconnect_tx.subscribe()
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        let _ = self.inner.disconnect_tx.send(DisconnectReason::Requested);
        Ok(())
    }
}
