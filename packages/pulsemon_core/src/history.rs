//! Device history store.
//!
//! Persists the identity and metadata of every peripheral that has been
//! connected, so the UI can offer reconnection without a fresh scan. One
//! JSON document under a single key; capacity-bounded at fifty entries.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{KeyValueStore, StorageError};
use crate::types::PeripheralId;

pub const DEVICE_HISTORY_KEY: &str = "device_history";

/// Cap on stored devices; the least-recently-connected entry is evicted
/// beyond this after every insert (never on read).
pub const MAX_DEVICES: usize = 50;

/// A previously connected peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDevice {
    pub id: PeripheralId,
    pub name: String,
    pub last_connected: DateTime<Utc>,
    /// Hex-encoded advertisement manufacturer data, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer_data: Option<String>,
}

pub struct DeviceHistory {
    store: Arc<dyn KeyValueStore>,
}

impl DeviceHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Insert or refresh a device record, keyed on `id`.
    ///
    /// An existing record moves to the most-recent position with a fresh
    /// `last_connected`. Passing `None` for `manufacturer_data` keeps any
    /// previously stored blob; a connect without a fresh advertisement in
    /// hand should not erase what an earlier scan captured.
    pub fn upsert(
        &self,
        id: &PeripheralId,
        name: &str,
        manufacturer_data: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let mut devices = self.load()?;

        let previous_blob = match devices.iter().position(|d| d.id == *id) {
            Some(pos) => {
                debug!("Refreshing {} in device history", id);
                devices.remove(pos).manufacturer_data
            }
            None => {
                info!("Adding {} ({}) to device history", name, id);
                None
            }
        };

        devices.insert(
            0,
            StoredDevice {
                id: id.clone(),
                name: name.to_string(),
                last_connected: Utc::now(),
                manufacturer_data: manufacturer_data.map(hex::encode).or(previous_blob),
            },
        );
        devices.truncate(MAX_DEVICES);
        self.save(&devices)
    }

    /// All stored devices, most recently connected first.
    pub fn devices(&self) -> Result<Vec<StoredDevice>, StorageError> {
        let mut devices = self.load()?;
        devices.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        Ok(devices)
    }

    pub fn get(&self, id: &PeripheralId) -> Result<Option<StoredDevice>, StorageError> {
        Ok(self.load()?.into_iter().find(|d| d.id == *id))
    }

    pub fn remove(&self, id: &PeripheralId) -> Result<(), StorageError> {
        let mut devices = self.load()?;
        devices.retain(|d| d.id != *id);
        info!("Removed {} from device history", id);
        self.save(&devices)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        info!("Cleared device history");
        self.store.remove(DEVICE_HISTORY_KEY)
    }

    fn load(&self) -> Result<Vec<StoredDevice>, StorageError> {
        match self.store.get(DEVICE_HISTORY_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, devices: &[StoredDevice]) -> Result<(), StorageError> {
        self.store
            .set(DEVICE_HISTORY_KEY, &serde_json::to_string(devices)?)
    }
}

/// Render an elapsed interval for display: "Just now", then floor-divided
/// minute/hour/day buckets with no upper bound.
pub fn format_relative_time(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed_ms = (now - then).num_milliseconds().max(0);
    let minutes = elapsed_ms / 60_000;
    let hours = elapsed_ms / 3_600_000;
    let days = elapsed_ms / 86_400_000;

    if days > 0 {
        format!("{} day{} ago", days, if days > 1 { "s" } else { "" })
    } else if hours > 0 {
        format!("{} hour{} ago", hours, if hours > 1 { "s" } else { "" })
    } else if minutes > 0 {
        format!("{} minute{} ago", minutes, if minutes > 1 { "s" } else { "" })
    } else {
        "Just now".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use chrono::Duration;

    fn history() -> (DeviceHistory, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DeviceHistory::new(Arc::clone(&store) as _), store)
    }

    #[test]
    fn test_upsert_then_list() {
        let (history, _) = history();
        history
            .upsert(&PeripheralId::new("ABC123"), "Polar H10", None)
            .unwrap();
        let devices = history.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, PeripheralId::new("ABC123"));
        assert_eq!(devices[0].name, "Polar H10");
    }

    #[test]
    fn test_upsert_same_id_updates_without_duplicating() {
        let (history, _) = history();
        let id = PeripheralId::new("ABC123");
        history.upsert(&id, "Polar H10", None).unwrap();
        let first = history.get(&id).unwrap().unwrap();

        history
            .upsert(&PeripheralId::new("other"), "Garmin HRM", None)
            .unwrap();
        history.upsert(&id, "Polar H10 v2", None).unwrap();

        let devices = history.devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, id);
        assert_eq!(devices[0].name, "Polar H10 v2");
        assert!(devices[0].last_connected >= first.last_connected);
    }

    #[test]
    fn test_fifty_first_device_evicts_least_recent() {
        let (history, _) = history();
        for n in 0..MAX_DEVICES {
            history
                .upsert(&PeripheralId::new(format!("dev-{n}")), "Sensor", None)
                .unwrap();
        }
        assert_eq!(history.devices().unwrap().len(), MAX_DEVICES);

        history
            .upsert(&PeripheralId::new("dev-new"), "Sensor", None)
            .unwrap();
        let devices = history.devices().unwrap();
        assert_eq!(devices.len(), MAX_DEVICES);
        assert_eq!(devices[0].id, PeripheralId::new("dev-new"));
        // dev-0 was the least recently connected and is gone.
        assert!(history.get(&PeripheralId::new("dev-0")).unwrap().is_none());
        assert!(history.get(&PeripheralId::new("dev-1")).unwrap().is_some());
    }

    #[test]
    fn test_remove_and_clear() {
        let (history, _) = history();
        let id = PeripheralId::new("ABC123");
        history.upsert(&id, "Polar H10", None).unwrap();
        history.remove(&id).unwrap();
        assert!(history.devices().unwrap().is_empty());
        // Removing again is a no-op.
        history.remove(&id).unwrap();

        history.upsert(&id, "Polar H10", None).unwrap();
        history.clear().unwrap();
        assert!(history.devices().unwrap().is_empty());
    }

    #[test]
    fn test_manufacturer_data_kept_unless_refreshed() {
        let (history, _) = history();
        let id = PeripheralId::new("ABC123");
        history
            .upsert(&id, "Polar H10", Some(&[0x6B, 0x00]))
            .unwrap();
        history.upsert(&id, "Polar H10", None).unwrap();
        let device = history.get(&id).unwrap().unwrap();
        assert_eq!(device.manufacturer_data.as_deref(), Some("6b00"));

        history.upsert(&id, "Polar H10", Some(&[0xFF])).unwrap();
        let device = history.get(&id).unwrap().unwrap();
        assert_eq!(device.manufacturer_data.as_deref(), Some("ff"));
    }

    #[test]
    fn test_old_payload_without_optional_fields_still_loads() {
        let (history, store) = history();
        store
            .set(
                DEVICE_HISTORY_KEY,
                r#"[{"id":"ABC123","name":"Polar H10","last_connected":"2025-01-01T00:00:00Z"}]"#,
            )
            .unwrap();
        let devices = history.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].manufacturer_data, None);
    }

    #[test]
    fn test_format_relative_time_buckets() {
        let now = Utc::now();
        assert_eq!(format_relative_time(now, now), "Just now");
        assert_eq!(
            format_relative_time(now - Duration::seconds(59), now),
            "Just now"
        );
        assert_eq!(
            format_relative_time(now - Duration::minutes(1), now),
            "1 minute ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::minutes(45), now),
            "45 minutes ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::hours(1), now),
            "1 hour ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::hours(23), now),
            "23 hours ago"
        );
        assert_eq!(
            format_relative_time(now - Duration::days(1), now),
            "1 day ago"
        );
        // No upper bound: weeks still report in days.
        assert_eq!(
            format_relative_time(now - Duration::days(9), now),
            "9 days ago"
        );
    }
}
