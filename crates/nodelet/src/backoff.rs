//! Exponential backoff.
//!
//! [`Backoff`] tracks per-key delays for container restarts and image pulls.
//! [`LoopBackoff`] throttles the sync loop while the runtime is unhealthy.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    backoff: Duration,
    last_update: Instant,
}

/// Per-key exponential backoff.
///
/// An entry that has not been touched for twice the maximum delay is treated
/// as expired and restarts from the initial delay.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    entries: Mutex<HashMap<String, BackoffEntry>>,
}

impl Backoff {
    /// Create a backoff with the given initial and maximum delay.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn has_expired(&self, entry: &BackoffEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_update) > self.max * 2
    }

    /// Record a failure for `id` at `event_time` and grow its delay.
    pub fn next(&self, id: &str, event_time: Instant) {
        let mut entries = self.entries.lock();
        let expired = entries
            .get(id)
            .is_some_and(|entry| self.has_expired(entry, event_time));

        match entries.get_mut(id) {
            Some(entry) if !expired => {
                entry.backoff = (entry.backoff * 2).min(self.max);
                entry.last_update = event_time;
            }
            _ => {
                entries.insert(
                    id.to_string(),
                    BackoffEntry {
                        backoff: self.initial,
                        last_update: event_time,
                    },
                );
            }
        }
    }

    /// Current delay for `id`, zero if none.
    #[must_use]
    pub fn get(&self, id: &str) -> Duration {
        self.entries
            .lock()
            .get(id)
            .map_or(Duration::ZERO, |entry| entry.backoff)
    }

    /// Whether `id` is still backing off from a failure at `event_time`.
    #[must_use]
    pub fn is_in_backoff_since(&self, id: &str, event_time: Instant) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock();
        let Some(entry) = entries.get(id) else {
            return false;
        };
        if self.has_expired(entry, now) {
            return false;
        }
        now.saturating_duration_since(event_time) < entry.backoff
    }

    /// Forget `id`.
    pub fn reset(&self, id: &str) {
        self.entries.lock().remove(id);
    }

    /// Drop every expired entry.
    pub fn gc(&self) {
        let now = Instant::now();
        self.entries
            .lock()
            .retain(|_, entry| !self.has_expired(entry, now));
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no key is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Sleep sequence for the sync loop while the runtime is unhealthy.
///
/// Starts at `base`, doubles on every call and is capped at `max`.
#[derive(Debug, Clone)]
pub struct LoopBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl LoopBackoff {
    /// Growth factor between consecutive delays.
    pub const FACTOR: u32 = 2;

    /// Create a loop backoff.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Return the delay to sleep now and grow the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * Self::FACTOR).min(self.max);
        delay
    }

    /// Return to the base delay.
    pub fn reset(&mut self) {
        self.current = self.base;
    }

    /// Delay the next failure would sleep for.
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(30));
        let now = Instant::now();

        backoff.next("c1", now);
        assert_eq!(backoff.get("c1"), Duration::from_secs(10));
        backoff.next("c1", now);
        assert_eq!(backoff.get("c1"), Duration::from_secs(20));
        backoff.next("c1", now);
        assert_eq!(backoff.get("c1"), Duration::from_secs(30));
        backoff.next("c1", now);
        assert_eq!(backoff.get("c1"), Duration::from_secs(30));
        assert_eq!(backoff.get("other"), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn in_backoff_window() {
        let backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(60));
        let failed_at = Instant::now();
        backoff.next("c1", failed_at);

        assert!(backoff.is_in_backoff_since("c1", failed_at));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!backoff.is_in_backoff_since("c1", failed_at));
        assert!(!backoff.is_in_backoff_since("unknown", failed_at));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_restart_and_gc() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        backoff.next("c1", Instant::now());
        backoff.next("c1", Instant::now());
        assert_eq!(backoff.get("c1"), Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(9)).await;
        backoff.next("c1", Instant::now());
        assert_eq!(backoff.get("c1"), Duration::from_secs(1));

        backoff.next("c2", Instant::now());
        tokio::time::advance(Duration::from_secs(9)).await;
        backoff.gc();
        assert!(backoff.is_empty());
    }

    #[test]
    fn loop_backoff_resets_to_base() {
        let mut backoff = LoopBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_millis(3200),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
    }
}
