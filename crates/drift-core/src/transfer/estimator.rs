//! Transfer speed and ETA estimation.
//!
//! A pure function of (timestamp, bytes-so-far) samples; presentation is a
//! separate concern. Instantaneous speed is a recency-and-duration-weighted
//! average over consecutive sample pairs in a short sliding window, and the
//! projected remaining time is smoothed over its own trailing window so the
//! displayed ETA does not jitter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window the speed samples span
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(2);

/// Minimum samples retained even when older than the window
pub const MIN_SAMPLES: usize = 4;

/// Trailing ETA projections kept for smoothing
const ETA_WINDOW: usize = 5;

/// Discount applied per step going back through the ETA window
const ETA_DISCOUNT: f64 = 0.6;

/// Speed/ETA estimator for one transfer
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    samples: VecDeque<(Instant, u64)>,
    eta_window: VecDeque<f64>,
}

impl SpeedEstimator {
    /// Create an empty estimator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress sample
    ///
    /// `bytes_so_far` is the transfer's cumulative byte count at `at`.
    pub fn record(&mut self, at: Instant, bytes_so_far: u64) {
        self.samples.push_back((at, bytes_so_far));
        while self.samples.len() > MIN_SAMPLES {
            let Some(&(oldest, _)) = self.samples.front() else {
                break;
            };
            if at.duration_since(oldest) <= SAMPLE_WINDOW {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Instantaneous speed in bytes per second
    ///
    /// Consecutive sample pairs are weighted by their duration and by
    /// recency, so a short recent burst dominates a long stale interval.
    #[must_use]
    pub fn speed(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (index, pair) in self.samples.iter().zip(self.samples.iter().skip(1)).enumerate() {
            let ((t0, b0), (t1, b1)) = pair;
            let dt = t1.duration_since(*t0).as_secs_f64();
            if dt <= 0.0 {
                continue;
            }
            let rate = b1.saturating_sub(*b0) as f64 / dt;
            let weight = dt * (index + 1) as f64;
            numerator += rate * weight;
            denominator += weight;
        }

        (denominator > 0.0).then(|| numerator / denominator)
    }

    /// Projected seconds until `remaining_bytes` finish at the current speed
    ///
    /// The projection itself is smoothed over the trailing ETA window with
    /// exponential discounting of older values.
    pub fn estimate_remaining(&mut self, remaining_bytes: u64) -> Option<f64> {
        let speed = self.speed()?;
        if speed <= f64::EPSILON {
            return None;
        }

        let raw = remaining_bytes as f64 / speed;
        self.eta_window.push_back(raw);
        if self.eta_window.len() > ETA_WINDOW {
            self.eta_window.pop_front();
        }

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        let mut weight = 1.0;
        for value in self.eta_window.iter().rev() {
            numerator += value * weight;
            denominator += weight;
            weight *= ETA_DISCOUNT;
        }
        Some(numerator / denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_constant_rate(estimator: &mut SpeedEstimator, start: Instant, bps: u64, steps: u32) {
        for step in 0..=steps {
            let at = start + Duration::from_millis(u64::from(step) * 100);
            estimator.record(at, bps * u64::from(step) / 10);
        }
    }

    #[test]
    fn no_speed_without_two_samples() {
        let mut estimator = SpeedEstimator::new();
        assert!(estimator.speed().is_none());
        estimator.record(Instant::now(), 0);
        assert!(estimator.speed().is_none());
    }

    #[test]
    fn steady_rate_recovered() {
        let mut estimator = SpeedEstimator::new();
        feed_constant_rate(&mut estimator, Instant::now(), 1_000_000, 20);
        let speed = estimator.speed().unwrap();
        assert!((speed - 1_000_000.0).abs() < 1_000.0, "speed = {speed}");
    }

    #[test]
    fn recent_burst_dominates() {
        let mut estimator = SpeedEstimator::new();
        let start = Instant::now();
        // 1 s at 100 B/s, then 1 s at 10_000 B/s.
        estimator.record(start, 0);
        estimator.record(start + Duration::from_secs(1), 100);
        estimator.record(start + Duration::from_secs(2), 10_100);
        let speed = estimator.speed().unwrap();
        assert!(speed > 5_050.0, "recency weighting should pull above the mean, got {speed}");
    }

    #[test]
    fn window_prunes_but_keeps_minimum() {
        let mut estimator = SpeedEstimator::new();
        let start = Instant::now();
        for step in 0..50u64 {
            estimator.record(start + Duration::from_secs(step), step * 10);
        }
        // Samples 1 s apart: the 2 s window covers 3 of them, but four are
        // always retained.
        assert_eq!(estimator.samples.len(), MIN_SAMPLES);
    }

    #[test]
    fn eta_projects_remaining_time() {
        let mut estimator = SpeedEstimator::new();
        feed_constant_rate(&mut estimator, Instant::now(), 1_000, 20);
        let eta = estimator.estimate_remaining(10_000).unwrap();
        assert!((eta - 10.0).abs() < 0.5, "eta = {eta}");
    }

    #[test]
    fn eta_smoothing_damps_jitter() {
        let mut estimator = SpeedEstimator::new();
        feed_constant_rate(&mut estimator, Instant::now(), 1_000, 20);

        let settled = estimator.estimate_remaining(10_000).unwrap();
        // A single wild projection moves the smoothed value by less than the
        // raw jump.
        let jittered = estimator.estimate_remaining(40_000).unwrap();
        assert!(jittered > settled);
        assert!(jittered < 40.0, "smoothing failed: {jittered}");
    }

    #[test]
    fn zero_progress_yields_no_eta() {
        let mut estimator = SpeedEstimator::new();
        let start = Instant::now();
        for step in 0..5u64 {
            estimator.record(start + Duration::from_millis(step * 100), 0);
        }
        assert!(estimator.estimate_remaining(1_000).is_none());
    }
}
