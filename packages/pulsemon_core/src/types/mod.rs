//! Shared data model for the telemetry subsystem.

pub mod heartrate;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, platform-assigned identifier for a physical peripheral.
///
/// Stable across app runs for the same device; this is the uniqueness key
/// for history records and session records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub id: PeripheralId,
    /// Advertised local name. Unnamed advertisements are dropped before
    /// they reach scan consumers.
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub manufacturer_data: Option<Vec<u8>>,
}

/// Connection status as reported to UI-facing consumers.
///
/// Derived, never persisted. `is_connected` is true only while a live link
/// is held AND the platform still confirms it; a stale link self-corrects
/// to disconnected the next time status is queried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub device_name: Option<String>,
    pub adapter_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_equality_and_display() {
        let a = PeripheralId::new("AA:BB:CC");
        let b = PeripheralId::from("AA:BB:CC");
        let c = PeripheralId::new("11:22:33");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "AA:BB:CC");
    }

    #[test]
    fn test_peripheral_id_serializes_as_plain_string() {
        let id = PeripheralId::new("ABC123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ABC123\"");
        let restored: PeripheralId = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, id);
    }
}
