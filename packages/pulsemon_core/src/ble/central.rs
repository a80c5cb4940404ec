//! btleplug-backed BLE stack (real hardware).
//!
//! Adapts the platform central (BlueZ/CoreBluetooth/WinRT via btleplug)
//! to the [`BleStack`]/[`BleLink`] traits. One pump task translates the
//! central event stream into the discovery and disconnect channels.

use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::platform::{AdapterState, BleLink, BleStack, DisconnectReason};
use super::BleError;
use crate::types::{DiscoveredDevice, PeripheralId};

fn ble_err(e: btleplug::Error) -> BleError {
    BleError::ConnectionFailed(e.to_string())
}

pub struct BtleplugStack {
    adapter: Adapter,
    adapter_tx: broadcast::Sender<AdapterState>,
    discovery_tx: broadcast::Sender<DiscoveredDevice>,
    /// Shared unsolicited-disconnect feed; links filter by their own id.
    drop_tx: broadcast::Sender<PeripheralId>,
}

impl BtleplugStack {
    /// Bind to the first available platform adapter and start pumping
    /// central events.
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new().await.map_err(ble_err)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_err)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterDisabled)?;

        let (adapter_tx, _) = broadcast::channel(16);
        let (discovery_tx, _) = broadcast::channel(256);
        let (drop_tx, _) = broadcast::channel(64);

        let stack = Arc::new(Self {
            adapter,
            adapter_tx,
            discovery_tx,
            drop_tx,
        });
        stack.spawn_event_pump().await?;
        Ok(stack)
    }

    async fn spawn_event_pump(self: &Arc<Self>) -> Result<(), BleError> {
        let mut events = self.adapter.events().await.map_err(ble_err)?;
        let adapter = self.adapter.clone();
        let discovery_tx = self.discovery_tx.clone();
        let drop_tx = self.drop_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(pid) | CentralEvent::DeviceUpdated(pid) => {
                        let peripheral = match adapter.peripheral(&pid).await {
                            Ok(p) => p,
                            Err(e) => {
                                debug!("Discovered peripheral vanished: {}", e);
                                continue;
                            }
                        };
                        if let Ok(Some(props)) = peripheral.properties().await {
                            let manufacturer_data =
                                props.manufacturer_data.values().next().cloned();
                            let _ = discovery_tx.send(DiscoveredDevice {
                                id: PeripheralId::new(pid.to_string()),
                                name: props.local_name,
                                rssi: props.rssi,
                                manufacturer_data,
                            });
                        }
                    }
                    CentralEvent::DeviceDisconnected(pid) => {
                        let _ = drop_tx.send(PeripheralId::new(pid.to_string()));
                    }
                    _ => {}
                }
            }
            warn!("Central event stream ended");
        });
        Ok(())
    }

    async fn find_peripheral(&self, id: &PeripheralId) -> Result<Peripheral, BleError> {
        let peripherals = self.adapter.peripherals().await.map_err(ble_err)?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id.as_str())
            .ok_or_else(|| BleError::ConnectionFailed(format!("No peripheral {id}")))
    }
}

#[async_trait]
impl BleStack for BtleplugStack {
    async fn adapter_state(&self) -> AdapterState {
        // btleplug exposes no portable power-state query; a responsive
        // adapter is treated as powered on.
        match self.adapter.adapter_info().await {
            Ok(_) => AdapterState::PoweredOn,
            Err(_) => AdapterState::PoweredOff,
        }
    }

    fn adapter_events(&self) -> broadcast::Receiver<AdapterState> {
        self.adapter_tx.subscribe()
    }

    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanFailed(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanFailed(e.to_string()))
    }

    fn discoveries(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.discovery_tx.subscribe()
    }

    async fn connect(&self, id: &PeripheralId) -> Result<Box<dyn BleLink>, BleError> {
        let peripheral = self.find_peripheral(id).await?;
        peripheral.connect().await.map_err(ble_err)?;

        // Cache the name now; the link trait reports it synchronously.
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);

        Ok(Box::new(BtleplugLink {
            id: id.clone(),
            name,
            peripheral,
            drop_tx: self.drop_tx.clone(),
        }))
    }

    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError> {
        let peripheral = self.find_peripheral(id).await?;
        peripheral.disconnect().await.map_err(ble_err)
    }
}

struct BtleplugLink {
    id: PeripheralId,
    name: Option<String>,
    peripheral: Peripheral,
    drop_tx: broadcast::Sender<PeripheralId>,
}

#[async_trait]
impl BleLink for BtleplugLink {
    fn id(&self) -> &PeripheralId {
        &self.id
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn discover_services(&self) -> Result<(), BleError> {
        self.peripheral.discover_services().await.map_err(ble_err)
    }

    async fn monitor_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| {
                BleError::ConnectionFailed(format!(
                    "Peripheral {} does not expose characteristic {}",
                    self.id, characteristic
                ))
            })?;
        self.peripheral.subscribe(&target).await.map_err(ble_err)?;

        let mut notifications = self.peripheral.notifications().await.map_err(ble_err)?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    fn disconnect_events(&self) -> broadcast::Receiver<DisconnectReason> {
        // Filter the shared platform feed down to this peripheral.
        let (tx, rx) = broadcast::channel(16);
        let mut drops = self.drop_tx.subscribe();
        let id = self.id.clone();
        tokio::spawn(async move {
            while let Ok(dropped) = drops.recv().await {
                if dropped == id {
                    let _ = tx.send(DisconnectReason::ConnectionLost);
                    break;
                }
            }
        });
        rx
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await.map_err(ble_err)
    }
}
