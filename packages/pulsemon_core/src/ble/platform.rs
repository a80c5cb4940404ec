//! Platform BLE stack capability traits.
//!
//! Defines the abstract interface that both the simulated stack and the
//! btleplug-backed stack conform to. The platform delivers scan results
//! and disconnect notifications on its own scheduling; everything
//! asynchronous is surfaced as a tokio channel rather than a callback.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::BleError;
use crate::types::{DiscoveredDevice, PeripheralId};

/// Power state of the local Bluetooth radio.
///
/// `Unknown` is the pre-initialization state: the stack has not yet
/// reported anything, and callers must wait (bounded) before using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    PoweredOn,
    PoweredOff,
}

/// Why a link ended. `Requested` is a caller-initiated disconnect;
/// `ConnectionLost` is the platform reporting an unsolicited drop
/// (sensor out of range, powered off).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    ConnectionLost,
}

/// BLE central role: adapter state, scanning, and connecting.
#[async_trait]
pub trait BleStack: Send + Sync {
    /// Current adapter power state. Cheap; safe to poll.
    async fn adapter_state(&self) -> AdapterState;

    /// Subscribe to adapter power-state transitions.
    fn adapter_events(&self) -> broadcast::Receiver<AdapterState>;

    /// Start delivering advertisements on the discovery channel.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning. Idempotent: a no-op when no scan is running.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Subscribe to discovered peripherals.
    fn discoveries(&self) -> broadcast::Receiver<DiscoveredDevice>;

    /// Connect to a peripheral and return the live link.
    async fn connect(&self, id: &PeripheralId) -> Result<Box<dyn BleLink>, BleError>;

    /// Abort an in-flight or established connection without going through
    /// a link handle.
    async fn cancel_connection(&self, id: &PeripheralId) -> Result<(), BleError>;
}

/// An established connection to one peripheral.
#[async_trait]
pub trait BleLink: Send + Sync {
    fn id(&self) -> &PeripheralId;

    /// Peripheral name as known at connection time.
    fn name(&self) -> Option<String>;

    /// Re-verify liveness with the platform, not a cached belief.
    async fn is_connected(&self) -> bool;

    async fn discover_services(&self) -> Result<(), BleError>;

    /// Subscribe to notifications for one characteristic; raw payloads
    /// arrive on the returned channel until the link drops.
    async fn monitor_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    /// Subscribe to this link's disconnect notifications.
    fn disconnect_events(&self) -> broadcast::Receiver<DisconnectReason>;

    async fn disconnect(&self) -> Result<(), BleError>;
}

/// OS permission prompt layer: a black box answering granted/denied for
/// the Bluetooth/location permissions scanning requires.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request(&self) -> bool;
}

/// Permission layer that always grants. Desktop platforms handle BLE
/// permissions out-of-band; also used by tests.
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn request(&self) -> bool {
        true
    }
}

/// Permission layer that always denies, for exercising the denied path.
pub struct AlwaysDenied;

#[async_trait]
impl PermissionGate for AlwaysDenied {
    async fn request(&self) -> bool {
        false
    }
}
