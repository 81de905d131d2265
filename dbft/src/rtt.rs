//! Round-trip-time estimator.

use std::time::Duration;

/// Moving average over the last `capacity` observed round trips.
///
/// A new sample is clamped to twice the sample it replaces, so a single slow
/// response cannot blow up the average.
#[derive(Debug, Clone)]
pub struct RoundTripTimes {
    times: Vec<Duration>,
    index: usize,
    avg: Duration,
}

impl RoundTripTimes {
    /// Creates an estimator holding `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            times: vec![Duration::ZERO; capacity.max(1)],
            index: 0,
            avg: Duration::ZERO,
        }
    }

    pub fn add_time(&mut self, t: Duration) {
        let old = self.times[self.index];
        let t = if old.is_zero() { t } else { t.min(old.saturating_mul(2)) };

        let len = self.times.len() as i128;
        let delta = (t.as_nanos() as i128 - old.as_nanos() as i128) / len;
        let avg = (self.avg.as_nanos() as i128 + delta).max(0);
        self.avg = Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX));

        self.times[self.index] = t;
        self.index = (self.index + 1) % self.times.len();
    }

    pub fn average(&self) -> Duration {
        self.avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_average_of_fresh_samples() {
        let mut rtt = RoundTripTimes::new(4);
        rtt.add_time(MS * 40);
        assert_eq!(rtt.average(), MS * 10);
        rtt.add_time(MS * 40);
        assert_eq!(rtt.average(), MS * 20);
    }

    #[test]
    fn test_outlier_clamped_to_twice_replaced_value() {
        let mut rtt = RoundTripTimes::new(1);
        rtt.add_time(MS * 10);
        assert_eq!(rtt.average(), MS * 10);
        // Replaces 10ms, so it is clamped to 20ms.
        rtt.add_time(MS * 1000);
        assert_eq!(rtt.average(), MS * 20);
    }

    #[test]
    fn test_ring_wraps_and_average_decreases() {
        let mut rtt = RoundTripTimes::new(2);
        rtt.add_time(MS * 100);
        rtt.add_time(MS * 100);
        assert_eq!(rtt.average(), MS * 100);
        rtt.add_time(MS * 20);
        assert_eq!(rtt.average(), MS * 60);
        rtt.add_time(MS * 20);
        assert_eq!(rtt.average(), MS * 20);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut rtt = RoundTripTimes::new(0);
        rtt.add_time(MS * 5);
        assert_eq!(rtt.average(), MS * 5);
    }
}
