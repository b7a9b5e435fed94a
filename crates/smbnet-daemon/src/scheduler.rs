//! Scan rate limiting
//!
//! A scan may start once the minimum interval has elapsed since the last
//! completed scan and no other scan is in flight. Requests arriving while
//! a scan runs, or before the interval elapses, are dropped rather than
//! queued.

use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug)]
pub struct ScanScheduler {
    min_interval: Duration,
    last_scan: Option<Instant>,
    in_flight: bool,
}

impl ScanScheduler {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_scan: None,
            in_flight: false,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn last_scan(&self) -> Option<Instant> {
        self.last_scan
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// True if a scan could start at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        match self.last_scan {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        }
    }

    /// Claim the next scan; false if it is not due
    pub fn begin(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            trace!("scan not due");
            return false;
        }
        self.in_flight = true;
        true
    }

    /// Record a completed scan
    pub fn complete(&mut self, now: Instant) {
        self.in_flight = false;
        self.last_scan = Some(now);
    }

    /// Release a claimed scan without recording completion
    pub fn abandon(&mut self) {
        self.in_flight = false;
    }
}
