//! Heart Rate Measurement characteristic decoder.
//!
//! Pure, deterministic parsing of the GATT Heart Rate Measurement payload
//! (characteristic 0x2A37) into a validated [`HeartRateSample`]. No I/O,
//! no state: identical bytes always yield an identical result.

use chrono::Utc;
use thiserror::Error;

use crate::types::heartrate::HeartRateSample;
use crate::types::PeripheralId;

pub const MIN_VALID_BPM: u16 = 30;
pub const MAX_VALID_BPM: u16 = 250;
/// RR intervals arrive in units of 1/1024 second.
pub const RR_CONVERSION_FACTOR: f64 = 1024.0;
pub const MAX_RR_INTERVALS_PER_SAMPLE: usize = 10;
pub const MIN_RR_INTERVAL_MS: f64 = 200.0;
pub const MAX_RR_INTERVAL_MS: f64 = 2000.0;

const FLAG_BPM_16BIT: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The buffer is structurally invalid for its declared format.
    #[error("Malformed heart-rate measurement: {0}")]
    Malformed(String),
    /// Structurally valid, but a decoded value fails validation. The sample
    /// is rejected whole; nothing is clamped or truncated.
    #[error("Out-of-range heart-rate measurement: {0}")]
    OutOfRange(String),
}

/// Decode one raw Heart Rate Measurement payload.
///
/// Layout, per the flags byte at offset 0:
/// - bit 0: BPM width (0 = u8, 1 = little-endian u16)
/// - bit 2: sensor-contact feature supported; bit 1: contact detected
///   (only meaningful when bit 2 is set — unsupported decodes to `None`)
/// - remaining bytes: little-endian u16 RR intervals in 1/1024 s. A final
///   odd byte is dropped rather than flagged; no partial-interval decode.
pub fn decode(data: &[u8], device_id: &PeripheralId) -> Result<HeartRateSample, DecodeError> {
    if data.len() < 2 {
        return Err(DecodeError::Malformed(format!(
            "payload is {} byte(s), need at least 2",
            data.len()
        )));
    }

    let flags = data[0];
    let (bpm, mut offset) = if flags & FLAG_BPM_16BIT != 0 {
        if data.len() < 3 {
            return Err(DecodeError::Malformed(
                "16-bit BPM declared but payload holds only one value byte".to_string(),
            ));
        }
        (u16::from_le_bytes([data[1], data[2]]), 3)
    } else {
        (data[1] as u16, 2)
    };

    let sensor_contact = if flags & FLAG_CONTACT_SUPPORTED != 0 {
        Some(flags & FLAG_CONTACT_DETECTED != 0)
    } else {
        None
    };

    let mut rr_intervals_ms = Vec::new();
    while offset + 2 <= data.len() {
        let raw = u16::from_le_bytes([data[offset], data[offset + 1]]);
        rr_intervals_ms.push(round2(raw as f64 / RR_CONVERSION_FACTOR * 1000.0));
        offset += 2;
    }

    if !(MIN_VALID_BPM..=MAX_VALID_BPM).contains(&bpm) {
        return Err(DecodeError::OutOfRange(format!(
            "{} bpm outside {}..={}",
            bpm, MIN_VALID_BPM, MAX_VALID_BPM
        )));
    }
    if rr_intervals_ms.len() > MAX_RR_INTERVALS_PER_SAMPLE {
        return Err(DecodeError::OutOfRange(format!(
            "{} RR intervals, at most {} per sample",
            rr_intervals_ms.len(),
            MAX_RR_INTERVALS_PER_SAMPLE
        )));
    }
    for &rr in &rr_intervals_ms {
        if !(MIN_RR_INTERVAL_MS..=MAX_RR_INTERVAL_MS).contains(&rr) {
            return Err(DecodeError::OutOfRange(format!(
                "RR interval {} ms outside {}..{} ms",
                rr, MIN_RR_INTERVAL_MS, MAX_RR_INTERVAL_MS
            )));
        }
    }

    Ok(HeartRateSample {
        timestamp: Utc::now(),
        bpm,
        rr_intervals_ms,
        device_id: device_id.clone(),
        sensor_contact,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
