//! Jittered exponential backoff for retrying transient upstream failures.

use std::time::Duration;

use rand::prelude::*;

/// Exponential backoff with decorrelated jitter.
///
/// The n-th delay is drawn uniformly from `[init, prev * base]`, capped at
/// `max_backoff`. The default shape recovers quickly from a single 429 while
/// still spacing a burst of retries out to the half-minute range the NVD
/// service asks misbehaving clients to observe.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            base: 3.0,
        }
    }
}

/// Generates the backoff delay sequence for one retried operation.
#[derive(Debug)]
pub struct Backoff {
    init_secs: f64,
    next_secs: f64,
    max_secs: f64,
    base: f64,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let init_secs = config.init_backoff.as_secs_f64();
        Self {
            init_secs,
            next_secs: init_secs,
            max_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            rng: StdRng::from_entropy(),
        }
    }

    /// Next delay to sleep before the upcoming attempt.
    pub fn next(&mut self) -> Duration {
        let range = self.init_secs..=(self.next_secs * self.base);
        let jittered = self.rng.gen_range(range);
        self.next_secs = jittered.min(self.max_secs);
        Duration::from_secs_f64(self.next_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_stays_within_bounds() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            base: 2.0,
        };
        let mut backoff = Backoff::new(&config);

        for _ in 0..50 {
            let delay = backoff.next();
            assert!(delay >= config.init_backoff);
            assert!(delay <= config.max_backoff);
        }
    }

    #[test]
    fn backoff_cap_holds_under_aggressive_base() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(200),
            base: 10.0,
        };
        let mut backoff = Backoff::new(&config);

        // With base 10 the draw range quickly outgrows the cap; the emitted
        // delay must never do so.
        for _ in 0..20 {
            assert!(backoff.next() <= config.max_backoff);
        }
    }
}
