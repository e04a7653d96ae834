//! Sliding request windows.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// A number of requests allowed within a trailing time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Limit {
    /// Maximum requests allowed in the window
    pub requests: u64,
    /// Length of the window in seconds
    pub window_secs: u64,
}

impl Limit {
    /// Create a new limit.
    pub const fn new(requests: u64, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    /// Get the window length as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Request timestamps observed for a single key.
///
/// Timestamps are kept in insertion order and are never decreasing. Entries
/// that fall out of the window are only dropped when the window is next
/// consulted.
#[derive(Debug, Clone, Default)]
pub struct RequestWindow {
    timestamps: VecDeque<Instant>,
}

impl RequestWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry older than `window` relative to `now`.
    pub fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Purge stale entries, then check whether `limit` has been reached.
    pub fn is_exceeded(&mut self, now: Instant, limit: &Limit) -> bool {
        self.purge(now, limit.window());
        self.timestamps.len() as u64 >= limit.requests
    }

    /// Record a request at `now`.
    pub fn record(&mut self, now: Instant) {
        // Callers racing on the same key may hand us a slightly older instant.
        let at = match self.timestamps.back() {
            Some(&last) if last > now => last,
            _ => now,
        };
        self.timestamps.push_back(at);
    }

    /// Count entries inside the window without purging anything.
    pub fn count_within(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .rev()
            .take_while(|&&t| now.saturating_duration_since(t) <= window)
            .count()
    }

    /// Time until the oldest entry leaves the window.
    pub fn reset_after(&self, now: Instant, window: Duration) -> Duration {
        match self.timestamps.front() {
            Some(&oldest) => window.saturating_sub(now.saturating_duration_since(oldest)),
            None => window,
        }
    }

    /// Number of entries currently held, stale ones included.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the window holds no entries.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_limit_window() {
        let limit = Limit::new(10, 60);
        assert_eq!(limit.window(), Duration::from_secs(60));
    }

    #[test]
    fn test_window_exceeded_at_limit() {
        let limit = Limit::new(3, 10);
        let t0 = Instant::now();
        let mut window = RequestWindow::new();

        for i in 0..3 {
            assert!(!window.is_exceeded(t0 + secs(i), &limit));
            window.record(t0 + secs(i));
        }

        assert!(window.is_exceeded(t0 + secs(3), &limit));
    }

    #[test]
    fn test_purge_drops_only_stale_entries() {
        let mut window = RequestWindow::new();
        let t0 = Instant::now();
        window.record(t0);
        window.record(t0 + secs(5));
        window.record(t0 + secs(9));

        // Exactly at the window edge the first entry is still counted
        window.purge(t0 + secs(10), secs(10));
        assert_eq!(window.len(), 3);

        window.purge(t0 + secs(11), secs(10));
        assert_eq!(window.len(), 2);

        window.purge(t0 + secs(30), secs(10));
        assert!(window.is_empty());
    }

    #[test]
    fn test_is_exceeded_purges_before_comparing() {
        let limit = Limit::new(2, 10);
        let t0 = Instant::now();
        let mut window = RequestWindow::new();
        window.record(t0);
        window.record(t0 + secs(1));

        assert!(window.is_exceeded(t0 + secs(5), &limit));
        assert!(!window.is_exceeded(t0 + secs(11), &limit));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_record_keeps_order() {
        let t0 = Instant::now();
        let mut window = RequestWindow::new();
        window.record(t0 + secs(5));
        window.record(t0);

        // The late arrival is clamped, so both entries share the newer instant
        assert_eq!(window.count_within(t0 + secs(5), secs(0)), 2);
    }

    #[test]
    fn test_count_within_is_read_only() {
        let t0 = Instant::now();
        let mut window = RequestWindow::new();
        window.record(t0);
        window.record(t0 + secs(20));

        assert_eq!(window.count_within(t0 + secs(25), secs(10)), 1);
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_reset_after() {
        let t0 = Instant::now();
        let mut window = RequestWindow::new();
        assert_eq!(window.reset_after(t0, secs(60)), secs(60));

        window.record(t0);
        assert_eq!(window.reset_after(t0 + secs(15), secs(60)), secs(45));
        assert_eq!(window.reset_after(t0 + secs(90), secs(60)), Duration::ZERO);
    }
}
