//! Exponential backoff shared by worker restarts and task retries.

use std::time::Duration;

/// `base * 2^attempt`, capped at `max`, plus optional additive jitter.
///
/// Jitter is drawn from `[0, base / 2)` and added after the cap. Because
/// consecutive uncapped delays differ by at least `base`, the jittered
/// sequence stays strictly increasing until the cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let raw = self.base.checked_mul(factor).unwrap_or(self.max);
        let capped = raw.min(self.max.max(self.base));
        if self.jitter {
            capped + self.base.mul_f64(0.5 * jitter_fraction())
        } else {
            capped
        }
    }
}

/// Cheap pseudo-random value in `[0, 1)` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 10_000) as f64 / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let delays: Vec<u64> = (0..5).map(|a| backoff.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn jittered_delays_strictly_increase_below_cap() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(3600)).with_jitter(true);
        for _ in 0..50 {
            let delays: Vec<Duration> = (0..6).map(|a| backoff.delay_for(a)).collect();
            assert!(delays.windows(2).all(|w| w[1] > w[0]), "{delays:?}");
            assert!(delays[0] >= Duration::from_secs(1));
            assert!(delays[0] < Duration::from_millis(1500));
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(backoff.delay_for(200), Duration::from_secs(3600));
    }
}
