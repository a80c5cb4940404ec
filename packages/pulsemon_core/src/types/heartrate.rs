//! Heart-rate sample types and the bounded display window.
//!
//! Samples are ephemeral: the subsystem forwards them to consumers and
//! never persists them. Consumers that want history keep a `SampleWindow`,
//! a sliding window capped at the last twenty samples.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::PeripheralId;

/// Maximum number of samples a display consumer retains.
pub const MAX_STORED_SAMPLES: usize = 20;

/// A validated heart-rate measurement decoded from one GATT notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateSample {
    pub timestamp: DateTime<Utc>,
    pub bpm: u16,
    /// RR intervals in milliseconds, in wire order. At most ten per sample.
    pub rr_intervals_ms: Vec<f64>,
    pub device_id: PeripheralId,
    /// `None` when the sensor does not support contact detection,
    /// as opposed to `Some(false)` for "supported but no contact".
    pub sensor_contact: Option<bool>,
}

/// Aggregate statistics over a window of samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleStats {
    pub average: u16,
    pub min: u16,
    pub max: u16,
    pub count: usize,
    /// RMSSD over successive RR-interval differences, rounded to whole
    /// milliseconds. `None` when fewer than two RR intervals are available.
    pub rmssd_ms: Option<f64>,
}

/// Bounded sliding window of recent samples for display consumers.
#[derive(Debug, Default)]
pub struct SampleWindow {
    samples: VecDeque<HeartRateSample>,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: HeartRateSample) {
        if self.samples.len() == MAX_STORED_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&HeartRateSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeartRateSample> {
        self.samples.iter()
    }

    /// Compute aggregate statistics over the window.
    pub fn stats(&self) -> SampleStats {
        if self.samples.is_empty() {
            return SampleStats::default();
        }

        let sum: u32 = self.samples.iter().map(|s| s.bpm as u32).sum();
        let average = (sum as f64 / self.samples.len() as f64).round() as u16;
        let min = self.samples.iter().map(|s| s.bpm).min().unwrap_or(0);
        let max = self.samples.iter().map(|s| s.bpm).max().unwrap_or(0);

        let rr: Vec<f64> = self
            .samples
            .iter()
            .flat_map(|s| s.rr_intervals_ms.iter().copied())
            .collect();
        let rmssd_ms = if rr.len() > 1 {
            let mean_sq = rr
                .windows(2)
                .map(|pair| (pair[1] - pair[0]).powi(2))
                .sum::<f64>()
                / (rr.len() - 1) as f64;
            Some(mean_sq.sqrt().round())
        } else {
            None
        };

        SampleStats {
            average,
            min,
            max,
            count: self.samples.len(),
            rmssd_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bpm: u16, rr: Vec<f64>) -> HeartRateSample {
        HeartRateSample {
            timestamp: Utc::now(),
            bpm,
            rr_intervals_ms: rr,
            device_id: PeripheralId::new("test"),
            sensor_contact: None,
        }
    }

    #[test]
    fn test_window_caps_at_twenty() {
        let mut window = SampleWindow::new();
        for bpm in 0..30u16 {
            window.push(sample(60 + bpm, vec![]));
        }
        assert_eq!(window.len(), MAX_STORED_SAMPLES);
        // Oldest evicted: the first surviving sample is the eleventh pushed.
        assert_eq!(window.iter().next().unwrap().bpm, 70);
        assert_eq!(window.latest().unwrap().bpm, 89);
    }

    #[test]
    fn test_stats_empty_window() {
        let window = SampleWindow::new();
        assert_eq!(window.stats(), SampleStats::default());
    }

    #[test]
    fn test_stats_average_min_max() {
        let mut window = SampleWindow::new();
        window.push(sample(60, vec![]));
        window.push(sample(70, vec![]));
        window.push(sample(81, vec![]));
        let stats = window.stats();
        assert_eq!(stats.average, 70); // 211 / 3 = 70.33 rounds down
        assert_eq!(stats.min, 60);
        assert_eq!(stats.max, 81);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.rmssd_ms, None);
    }

    #[test]
    fn test_stats_rmssd_over_rr_intervals() {
        let mut window = SampleWindow::new();
        window.push(sample(60, vec![1000.0, 1010.0]));
        window.push(sample(61, vec![990.0]));
        // Diffs: 10, -20 -> mean square = (100 + 400) / 2 = 250 -> sqrt ~ 15.81
        let stats = window.stats();
        assert_eq!(stats.rmssd_ms, Some(16.0));
    }
}
