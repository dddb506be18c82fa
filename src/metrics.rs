//! Atomic counters for the hot path
//!
//! Lock-free counters that can be safely updated from any thread: one
//! struct, shared behind an `Arc` rather than kept as process-wide global
//! state, so tests can construct independent instances instead of fighting
//! over shared counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters plus the one saturating counter (`connections`).
pub struct Metrics {
    pub connections: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub reloads: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            connections: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero rather than wrapping, so an unbalanced open/close
    /// pairing bug degrades gracefully instead of producing a misleading
    /// near-`u64::MAX` gauge (see DESIGN.md).
    #[inline]
    pub fn connection_closed(&self) {
        self.connections.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        }).ok();
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_forwarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub reloads: u64,
    pub bytes_forwarded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_counter_balances_equal_inc_dec() {
        let m = Metrics::new();
        for _ in 0..5 {
            m.connection_opened();
        }
        for _ in 0..5 {
            m.connection_closed();
        }
        assert_eq!(m.snapshot().connections, 0);
    }

    #[test]
    fn connection_counter_saturates_at_zero() {
        let m = Metrics::new();
        m.connection_closed();
        assert_eq!(m.snapshot().connections, 0);
    }

    #[test]
    fn counters_are_monotonic_non_decreasing_under_single_writer() {
        let m = Metrics::new();
        let mut last = 0;
        for _ in 0..10 {
            m.reloads.fetch_add(1, Ordering::Relaxed);
            let now = m.snapshot().reloads;
            assert!(now >= last);
            last = now;
        }
    }
}
