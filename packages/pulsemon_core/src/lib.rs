//! Pulsemon — BLE heart-rate telemetry and training-session subsystem.
//!
//! Connects to a wearable heart-rate sensor over BLE, decodes the Heart
//! Rate Measurement characteristic, remembers which peripherals have been
//! seen before, and records user-initiated training sessions.
//!
//! The platform BLE stack is consumed through the capability traits in
//! [`ble::platform`]; an in-process simulator ([`ble::simulated`]) backs
//! tests and demos, and a btleplug-backed stack is available behind the
//! `ble-central` feature.

pub mod ble;
pub mod history;
pub mod hr;
pub mod session;
pub mod storage;
pub mod types;
