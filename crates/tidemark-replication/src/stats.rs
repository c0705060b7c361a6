//! Acknowledgment-latency statistics.
//!
//! Each per-peer sender maintains two [`DecayAverage`]s (receive ack, apply
//! ack); the replica manager aggregates them through [`StandardDeviation`]
//! to spot outliers. A peer is considered slow when its average exceeds
//! `mean + 2 * stddev` of the quorum's averages.

use std::time::{Duration, Instant};

/// Coefficients below this contribute nothing; restart the accumulator.
const MIN_COEFFICIENT: f64 = 0.001;

/// An exponentially decaying average of durations.
///
/// Samples are weighted by `decay_factor ^ (elapsed / decay_interval)`, so
/// the average forgets at a wall-clock rate rather than a sample rate. A
/// decay factor of 0 keeps only the most recent sample.
#[derive(Debug, Clone)]
pub struct DecayAverage {
    decay_factor: f64,
    decay_interval: Duration,
    last_updated: Option<Instant>,
    last_value_ms: f64,
    weighted_sum_ms: f64,
    weight_sum: f64,
}

impl DecayAverage {
    /// `decay_factor` must be in `[0, 1)`; validated by the settings.
    pub fn new(decay_factor: f64, decay_interval: Duration) -> Self {
        debug_assert!(
            (0.0..1.0).contains(&decay_factor),
            "invalid decay factor {decay_factor}"
        );
        Self {
            decay_factor,
            decay_interval,
            last_updated: None,
            last_value_ms: 0.0,
            weighted_sum_ms: 0.0,
            weight_sum: 0.0,
        }
    }

    /// Current average; zero before the first sample.
    pub fn value(&self) -> Duration {
        if self.decay_factor == 0.0 {
            return Duration::from_secs_f64(self.last_value_ms / 1000.0);
        }
        if self.weight_sum == 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((self.weighted_sum_ms / self.weight_sum) / 1000.0)
    }

    /// Folds in a new sample observed at `now`.
    pub fn update(&mut self, value: Duration, now: Instant) {
        let value_ms = value.as_secs_f64() * 1000.0;

        if self.decay_factor == 0.0 {
            self.weighted_sum_ms = value_ms;
            self.weight_sum = 1.0;
        } else {
            let elapsed = self
                .last_updated
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or(Duration::ZERO);
            let power = elapsed.as_secs_f64() / self.decay_interval.as_secs_f64();
            let coefficient = self.decay_factor.powf(power);

            if coefficient > MIN_COEFFICIENT && self.weighted_sum_ms.is_finite() {
                self.weighted_sum_ms = self.weighted_sum_ms * coefficient + value_ms;
                self.weight_sum = self.weight_sum * coefficient + 1.0;
            } else {
                // The history has fully decayed; start over from this sample.
                self.weighted_sum_ms = value_ms;
                self.weight_sum = 1.0;
            }
        }

        self.last_value_ms = value_ms;
        self.last_updated = Some(now);
    }

    /// Forgets all history. Used when a peer's role changes and its past
    /// latencies are no longer representative.
    pub fn reset(&mut self, now: Instant) {
        self.last_updated = Some(now);
        self.last_value_ms = 0.0;
        self.weighted_sum_ms = 0.0;
        self.weight_sum = 0.0;
    }
}

/// Running `{n, Σx, Σx²}` accumulator over durations.
#[derive(Debug, Clone, Default)]
pub struct StandardDeviation {
    count: u64,
    sum_ms: f64,
    sum_squared_ms: f64,
}

impl StandardDeviation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Duration) {
        let ms = value.as_secs_f64() * 1000.0;
        self.count += 1;
        self.sum_ms += ms;
        if (f64::MAX - self.sum_squared_ms) > ms * ms {
            self.sum_squared_ms += ms * ms;
        } else {
            self.sum_squared_ms = f64::MAX;
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((self.sum_ms / self.count as f64) / 1000.0)
    }

    pub fn std_dev(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let mean_ms = self.sum_ms / self.count as f64;
        let variance = (self.sum_squared_ms / self.count as f64) - mean_ms * mean_ms;
        if variance <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(variance.sqrt() / 1000.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_average_first_sample() {
        let mut avg = DecayAverage::new(0.95, Duration::from_secs(5));
        let now = Instant::now();
        avg.update(Duration::from_millis(100), now);
        let value = avg.value().as_millis();
        assert_eq!(value, 100);
    }

    #[test]
    fn decay_average_weights_recent_samples() {
        let mut avg = DecayAverage::new(0.5, Duration::from_secs(1));
        let t0 = Instant::now();
        avg.update(Duration::from_millis(100), t0);
        // Two intervals later the old sample's weight is a quarter.
        avg.update(Duration::from_millis(400), t0 + Duration::from_secs(2));
        let value_ms = avg.value().as_secs_f64() * 1000.0;
        // (100*0.25 + 400) / (0.25 + 1) = 340
        assert!((value_ms - 340.0).abs() < 1.0, "value was {value_ms}");
    }

    #[test]
    fn zero_decay_factor_keeps_last_sample() {
        let mut avg = DecayAverage::new(0.0, Duration::from_secs(5));
        let now = Instant::now();
        avg.update(Duration::from_millis(100), now);
        avg.update(Duration::from_millis(20), now);
        assert_eq!(avg.value().as_millis(), 20);
    }

    #[test]
    fn reset_forgets_history() {
        let mut avg = DecayAverage::new(0.95, Duration::from_secs(5));
        let now = Instant::now();
        avg.update(Duration::from_millis(500), now);
        avg.reset(now);
        assert_eq!(avg.value(), Duration::ZERO);
    }

    #[test]
    fn std_dev_of_identical_samples_is_zero() {
        let mut sd = StandardDeviation::new();
        for _ in 0..5 {
            sd.add(Duration::from_millis(50));
        }
        assert_eq!(sd.average().as_millis(), 50);
        assert_eq!(sd.std_dev(), Duration::ZERO);
    }

    #[test]
    fn std_dev_detects_spread() {
        let mut sd = StandardDeviation::new();
        sd.add(Duration::from_millis(40));
        sd.add(Duration::from_millis(60));
        assert_eq!(sd.average().as_millis(), 50);
        assert_eq!(sd.std_dev().as_millis(), 10);
    }

    #[test]
    fn empty_accumulator_is_zero() {
        let sd = StandardDeviation::new();
        assert_eq!(sd.average(), Duration::ZERO);
        assert_eq!(sd.std_dev(), Duration::ZERO);
    }
}
