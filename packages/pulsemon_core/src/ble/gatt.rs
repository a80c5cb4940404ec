//! GATT identifiers for the Heart Rate and Device Information profiles.

use uuid::Uuid;

pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

pub const HEART_RATE_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x00002a39_0000_1000_8000_00805f9b34fb);

pub const DEVICE_INFORMATION_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

pub const DEVICE_NAME_UUID: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

pub const MANUFACTURER_NAME_UUID: Uuid =
    Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);
