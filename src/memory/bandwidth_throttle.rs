/// Bandwidth Throttle
///
/// Simulates a maximum ingestion rate for streamed pages. Each cycle grants
/// a byte budget proportional to the elapsed time, which pending reads drain
/// in issue order before they are allowed to complete.

use std::time::{Duration, Instant};

/// Transfer totals observed by the throttle
#[derive(Debug, Default, Clone, Copy)]
pub struct ThrottleMetrics {
    /// Bytes granted since creation
    pub total_bytes: u64,

    /// Bytes granted during the last cycle
    pub last_cycle_bytes: u64,

    /// Effective rate over the last cycle in MB/s
    pub last_cycle_bandwidth_mbps: f64,
}

/// Byte budget for simulated bandwidth limits
#[derive(Debug)]
pub struct BandwidthThrottle {
    /// Bytes per second, `None` when unlimited
    limit_bytes_per_sec: Option<f64>,

    /// Bytes still available this cycle
    budget: u64,

    last_cycle_start: Option<Instant>,
    last_cycle_duration: Duration,
    metrics: ThrottleMetrics,
}

impl BandwidthThrottle {
    pub fn new(limit_bytes_per_sec: Option<f64>) -> Self {
        Self {
            limit_bytes_per_sec,
            budget: 0,
            last_cycle_start: None,
            last_cycle_duration: Duration::ZERO,
            metrics: ThrottleMetrics::default(),
        }
    }

    pub fn is_limited(&self) -> bool {
        self.limit_bytes_per_sec.is_some()
    }

    /// Start a cycle at `now`, granting budget for the time since the previous one
    pub fn begin_cycle_at(&mut self, now: Instant) {
        let elapsed = self
            .last_cycle_start
            .map(|previous| now.saturating_duration_since(previous))
            .unwrap_or(Duration::ZERO);
        self.last_cycle_start = Some(now);
        self.begin_cycle(elapsed);
    }

    /// Start a cycle covering `elapsed` of wall time
    pub fn begin_cycle(&mut self, elapsed: Duration) {
        self.metrics.last_cycle_bandwidth_mbps = if self.last_cycle_duration > Duration::ZERO {
            (self.metrics.last_cycle_bytes as f64 / 1_000_000.0) / self.last_cycle_duration.as_secs_f64()
        } else {
            0.0
        };
        self.metrics.last_cycle_bytes = 0;
        self.last_cycle_duration = elapsed;

        // Unused budget does not carry over between cycles
        self.budget = match self.limit_bytes_per_sec {
            Some(limit) => (elapsed.as_secs_f64() * limit) as u64,
            None => 0,
        };
    }

    /// Drain simulated bytes from a pending read. Returns true once nothing is left.
    pub fn consume(&mut self, bytes_left: &mut u32) -> bool {
        let granted = if self.is_limited() {
            let granted = (*bytes_left as u64).min(self.budget);
            self.budget -= granted;
            granted
        } else {
            *bytes_left as u64
        };

        *bytes_left -= granted as u32;
        self.metrics.total_bytes += granted;
        self.metrics.last_cycle_bytes += granted;
        *bytes_left == 0
    }

    pub fn remaining_budget(&self) -> Option<u64> {
        self.limit_bytes_per_sec.map(|_| self.budget)
    }

    pub fn metrics(&self) -> ThrottleMetrics {
        self.metrics
    }
}
