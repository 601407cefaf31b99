/// Per-neighbor link quality.
///
/// Pure state: smoothed round-trip time from ping samples, and liveness
/// from the last time anything arrived on the link.
/// Two-tier timeout: Stale (1x threshold) → Departed (2x threshold by default).
use std::time::Duration;

use serde::Serialize;
use vmesh_transport::now_ms;

/// How recently a neighbor was heard from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Liveness {
    Alive,
    Stale,
    Departed,
}

#[derive(Debug, Clone)]
pub struct LinkQuality {
    srtt: Option<Duration>,
    samples: u32,
    /// Last frame received (Unix ms).
    last_seen: u64,
}

impl LinkQuality {
    pub fn new() -> Self {
        Self::new_at(now_ms())
    }

    /// Start tracking with a specific timestamp (for testing).
    pub fn new_at(now: u64) -> Self {
        Self {
            srtt: None,
            samples: 0,
            last_seen: now,
        }
    }

    /// Fold one RTT sample into the estimate: `srtt += (sample - srtt) / 8`.
    pub fn record_rtt(&mut self, sample: Duration) -> Duration {
        let srtt = match self.srtt {
            None => sample,
            Some(prev) => (prev * 7 + sample) / 8,
        };
        self.srtt = Some(srtt);
        self.samples = self.samples.saturating_add(1);
        srtt
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn touch(&mut self) {
        self.touch_at(now_ms());
    }

    pub fn touch_at(&mut self, now: u64) {
        self.last_seen = self.last_seen.max(now);
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn liveness(&self, stale: Duration, departed: Duration) -> Liveness {
        self.liveness_at(now_ms(), stale, departed)
    }

    /// Check liveness at a specific time (for testing).
    pub fn liveness_at(&self, now: u64, stale: Duration, departed: Duration) -> Liveness {
        let elapsed = now.saturating_sub(self.last_seen);
        if elapsed >= departed.as_millis() as u64 {
            Liveness::Departed
        } else if elapsed >= stale.as_millis() as u64 {
            Liveness::Stale
        } else {
            Liveness::Alive
        }
    }
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self::new()
    }
}
