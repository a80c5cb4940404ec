//! BLE connection layer.
//!
//! Provides the platform-stack capability traits, an in-process simulated
//! stack for tests and demos, the connection manager that owns the live
//! peripheral link, and GATT identifiers for the Heart Rate profile.

pub mod gatt;
pub mod manager;
pub mod platform;
pub mod simulated;

#[cfg(feature = "ble-central")]
pub mod central;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    #[error("Bluetooth adapter is disabled")]
    AdapterDisabled,

    #[error("Timed out waiting for the Bluetooth adapter to report a state")]
    AdapterTimeout,

    #[error("Scan error: {0}")]
    ScanFailed(String),

    #[error("Connection error: {0}")]
    ConnectionFailed(String),

    #[error("No peripheral is connected")]
    NotConnected,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
