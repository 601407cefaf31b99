//! Router counters.
//!
//! [`Counter`] is an atomic monotonic counter that serializes as its
//! current value, so a [`RouterStats`] clone is a consistent-enough snapshot
//! to print as JSON.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// A monotonically increasing counter backed by [`AtomicU64`].
///
/// All operations use [`Ordering::Relaxed`].
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self(AtomicU64::new(self.get()))
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get().serialize(serializer)
    }
}

/// Packet counters kept by the router.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    /// Handed to a locally bound port.
    pub delivered: Counter,
    /// Sent onward to a neighbor (each broadcast copy counts).
    pub forwarded: Counter,
    pub dropped_no_route: Counter,
    pub dropped_hop_limit: Counter,
    pub dropped_unbound_port: Counter,
    /// Local receive queue was full or closed.
    pub dropped_queue_full: Counter,
    /// Undecodable or oversized frames.
    pub dropped_malformed: Counter,
    /// The outgoing link failed.
    pub dropped_link_error: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_basics() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);
        assert_eq!(c.clone().get(), 5);
        assert_eq!(format!("{c:?}"), "Counter(5)");
    }

    #[test]
    fn stats_serialize_flat() {
        let stats = RouterStats::default();
        stats.delivered.inc();
        stats.dropped_hop_limit.inc_by(2);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["delivered"], 1);
        assert_eq!(json["dropped_hop_limit"], 2);
        assert_eq!(json["forwarded"], 0);
    }
}
