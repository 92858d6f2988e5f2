//! Jittered exponential backoff for reconnect and fetch-error loops.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with ±`jitter` proportional randomization.
///
/// ```rust
/// use job_runtime::retry::Backoff;
/// use std::time::Duration;
///
/// let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5)).without_jitter();
/// assert_eq!(backoff.delay(0), Duration::from_millis(100));
/// assert_eq!(backoff.delay(3), Duration::from_millis(800));
/// assert_eq!(backoff.delay(20), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay to randomize, 0.0 to 1.0
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Delay before retry number `attempt` (0-based), capped at `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = if jitter > 0.0 && capped > 0.0 {
            let range = capped * jitter;
            (capped + rand::thread_rng().gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
