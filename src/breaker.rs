use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Consecutive-failure circuit breaker with a cool-down window.
///
/// Each key counts its own consecutive failures. Once the count reaches
/// `trip_after` the key is denied until `cooldown` has elapsed. The count is
/// only cleared by a success or an explicit [`reset`](Self::reset), so a key
/// that fails again right after its cool-down re-opens immediately.
///
/// The snapshot source uses this with a two minute window; the job tracker
/// uses it with a zero window purely as a bounded failure counter.
#[derive(Debug)]
pub struct CircuitBreaker<K> {
    trip_after: u32,
    cooldown: Duration,
    failures: HashMap<K, u32>,
    open_until: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> CircuitBreaker<K> {
    pub fn new(trip_after: u32, cooldown: Duration) -> Self {
        Self {
            trip_after: trip_after.max(1),
            cooldown,
            failures: HashMap::new(),
            open_until: HashMap::new(),
        }
    }

    /// True while `key` is inside its cool-down window. Expired entries are dropped.
    pub fn is_open(&mut self, key: &K) -> bool {
        match self.open_until.get(key) {
            Some(until) if Instant::now() < *until => true,
            Some(_) => {
                self.open_until.remove(key);
                false
            }
            None => false,
        }
    }

    /// Record a failure. Returns true when this failure trips the breaker.
    pub fn record_failure(&mut self, key: &K) -> bool {
        let count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        if *count >= self.trip_after {
            self.open_until
                .insert(key.clone(), Instant::now() + self.cooldown);
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self, key: &K) {
        self.reset(key);
    }

    pub fn reset(&mut self, key: &K) {
        self.failures.remove(key);
        self.open_until.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_threshold_and_cools_down() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(120));
        let url = "http://cam/snap".to_string();

        assert!(!breaker.record_failure(&url));
        assert!(!breaker.record_failure(&url));
        assert!(!breaker.is_open(&url));
        assert!(breaker.record_failure(&url));
        assert!(breaker.is_open(&url));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(breaker.is_open(&url));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!breaker.is_open(&url));

        // Still past the threshold, so the next failure re-opens at once.
        assert!(breaker.record_failure(&url));
        assert!(breaker.is_open(&url));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_failures() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        let key = "a";
        breaker.record_failure(&key);
        assert_eq!(breaker.failures(&key), 1);
        breaker.record_success(&key);
        assert_eq!(breaker.failures(&key), 0);
        assert!(!breaker.record_failure(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(10));
        assert!(breaker.record_failure(&"a"));
        assert!(breaker.is_open(&"a"));
        assert!(!breaker.is_open(&"b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cooldown_acts_as_counter() {
        let mut breaker = CircuitBreaker::new(3, Duration::ZERO);
        assert!(!breaker.record_failure(&()));
        assert!(!breaker.record_failure(&()));
        assert!(breaker.record_failure(&()));
        assert!(!breaker.is_open(&()));
        breaker.reset(&());
        assert_eq!(breaker.failures(&()), 0);
    }
}
