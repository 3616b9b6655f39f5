//! Clock alignment between the coordinator and each node.
//!
//! Coordinator time is microseconds since the process-local [`LocalClock`]
//! origin. Offsets are always "node clock minus coordinator clock", so a node
//! timestamp converts back with `coordinator_us = node_us - offset_us`.

mod estimator;
mod prober;

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

pub use estimator::{ClockEstimator, SampleOutcome, SampleRejection};
pub use prober::{ProbeReply, ProberConfig, spawn_prober};

/// Upper bound applied to drift estimates. Real oscillators sit well inside
/// this; anything larger is regression noise.
pub const MAX_DRIFT_PPM: f64 = 500.0;

/// Monotonic microsecond clock anchored at construction.
#[derive(Debug, Clone, Copy)]
pub struct LocalClock {
    origin: Instant,
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_us(&self) -> i64 {
        self.micros_at(Instant::now())
    }

    pub fn micros_at(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.origin).as_micros() as i64
    }

    /// Instant at which this clock reads `us`. Negative readings clamp to the origin.
    pub fn instant_at(&self, us: i64) -> Instant {
        self.origin + Duration::from_micros(us.max(0) as u64)
    }
}

/// One probe exchange. `t0`/`t3` are coordinator times, `t1`/`t2` node times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockSample {
    pub t0_us: i64,
    pub t1_us: i64,
    pub t2_us: i64,
    pub t3_us: i64,
}

impl ClockSample {
    /// Network round trip, excluding the node's processing time.
    pub fn delay_us(&self) -> i64 {
        (self.t3_us - self.t0_us) - (self.t2_us - self.t1_us)
    }

    pub fn offset_us(&self) -> i64 {
        ((self.t1_us - self.t0_us) + (self.t2_us - self.t3_us)) / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClockEstimate {
    /// Offset of the best (minimum-delay) sample in the window.
    pub offset_us: i64,
    pub uncertainty_us: i64,
    pub drift_ppm: f64,
    pub round_trip_us: i64,
    /// Coordinator time of the best sample; drift extrapolates from here.
    pub reference_us: i64,
    /// Coordinator time of the most recent accepted sample.
    pub updated_at_us: i64,
    pub samples: usize,
}

impl ClockEstimate {
    /// Drift-corrected offset at coordinator time `at_us`.
    pub fn offset_at(&self, at_us: i64) -> i64 {
        let elapsed = (at_us - self.reference_us) as f64;
        self.offset_us + (elapsed * self.drift_ppm / 1_000_000.0).round() as i64
    }

    pub fn to_node_time(&self, coordinator_us: i64) -> i64 {
        coordinator_us + self.offset_at(coordinator_us)
    }

    pub fn to_coordinator_time(&self, node_us: i64) -> i64 {
        // One fixed-point step is enough: drift moves the offset by well under
        // a microsecond across the offset itself.
        let approx = node_us - self.offset_us;
        node_us - self.offset_at(approx)
    }
}
