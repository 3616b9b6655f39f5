use std::collections::VecDeque;
use std::time::Duration;

use super::{ClockEstimate, ClockSample, MAX_DRIFT_PPM};

/// Number of lowest-delay samples whose offsets bound the uncertainty.
const SPREAD_SAMPLES: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Observation {
    sample: ClockSample,
    offset_us: i64,
    delay_us: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRejection {
    NegativeDelay { delay_us: i64 },
    /// Reply arrived "before" the probe left; the timestamps are corrupt.
    OutOfOrder,
}

impl SampleRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            SampleRejection::NegativeDelay { .. } => "negative_delay",
            SampleRejection::OutOfOrder => "out_of_order",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Accepted(ClockEstimate),
    /// The sample disagreed with the window by more than the reset threshold;
    /// the window now holds only this sample.
    Reset(ClockEstimate),
    Rejected(SampleRejection),
}

/// Minimum-delay offset filter with least-squares drift over a bounded window.
#[derive(Debug, Clone)]
pub struct ClockEstimator {
    window: VecDeque<Observation>,
    capacity: usize,
    reset_threshold_us: i64,
    resets: u64,
}

impl ClockEstimator {
    pub fn new(capacity: usize, reset_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            reset_threshold_us: reset_threshold.as_micros() as i64,
            resets: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }

    pub fn observe(&mut self, sample: ClockSample) -> SampleOutcome {
        if sample.t3_us < sample.t0_us {
            return SampleOutcome::Rejected(SampleRejection::OutOfOrder);
        }
        let delay_us = sample.delay_us();
        if delay_us < 0 {
            return SampleOutcome::Rejected(SampleRejection::NegativeDelay { delay_us });
        }
        let observation = Observation {
            sample,
            offset_us: sample.offset_us(),
            delay_us,
        };

        let mut reset = false;
        if let Some(current) = self.estimate() {
            let expected = current.offset_at(sample.t3_us);
            let deviation = (observation.offset_us - expected).abs();
            if deviation > self.reset_threshold_us + delay_us / 2 {
                self.window.clear();
                self.resets += 1;
                reset = true;
            }
        }

        self.window.push_back(observation);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }

        match self.estimate() {
            Some(estimate) if reset => SampleOutcome::Reset(estimate),
            Some(estimate) => SampleOutcome::Accepted(estimate),
            None => unreachable!("window holds the sample just pushed"),
        }
    }

    pub fn estimate(&self) -> Option<ClockEstimate> {
        let latest = self.window.back()?;
        let best = self
            .window
            .iter()
            .rev()
            .min_by_key(|obs| obs.delay_us)
            .copied()?;

        let mut by_delay: Vec<&Observation> = self.window.iter().collect();
        by_delay.sort_by_key(|obs| obs.delay_us);
        let (lo, hi) = by_delay
            .iter()
            .take(SPREAD_SAMPLES)
            .fold((i64::MAX, i64::MIN), |(lo, hi), obs| {
                (lo.min(obs.offset_us), hi.max(obs.offset_us))
            });
        let spread = hi - lo;

        Some(ClockEstimate {
            offset_us: best.offset_us,
            uncertainty_us: best.delay_us / 2 + spread / 2,
            drift_ppm: self.drift_ppm(),
            round_trip_us: best.delay_us,
            reference_us: best.sample.t3_us,
            updated_at_us: latest.sample.t3_us,
            samples: self.window.len(),
        })
    }

    /// Slope of offset against coordinator time in µs per second.
    fn drift_ppm(&self) -> f64 {
        let n = self.window.len();
        if n < 2 {
            return 0.0;
        }
        let base = self.window[0].sample.t3_us;
        let xs: Vec<f64> = self
            .window
            .iter()
            .map(|obs| (obs.sample.t3_us - base) as f64 / 1_000_000.0)
            .collect();
        let ys: Vec<f64> = self.window.iter().map(|obs| obs.offset_us as f64).collect();
        let mean_x = xs.iter().sum::<f64>() / n as f64;
        let mean_y = ys.iter().sum::<f64>() / n as f64;
        let mut covariance = 0.0;
        let mut variance = 0.0;
        for (x, y) in xs.iter().zip(&ys) {
            covariance += (x - mean_x) * (y - mean_y);
            variance += (x - mean_x) * (x - mean_x);
        }
        if variance <= f64::EPSILON {
            return 0.0;
        }
        (covariance / variance).clamp(-MAX_DRIFT_PPM, MAX_DRIFT_PPM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Builds the sample a node with `offset_us` would produce for a probe
    /// sent at `t0_us` with the given one-way delays and 50us processing.
    fn exchange(t0_us: i64, offset_us: i64, forward_us: i64, back_us: i64) -> ClockSample {
        let t1_us = t0_us + forward_us + offset_us;
        let t2_us = t1_us + 50;
        let t3_us = t2_us - offset_us + back_us;
        ClockSample {
            t0_us,
            t1_us,
            t2_us,
            t3_us,
        }
    }

    fn accepted(outcome: SampleOutcome) -> ClockEstimate {
        match outcome {
            SampleOutcome::Accepted(estimate) => estimate,
            other => panic!("expected accepted sample, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn offset_converges_under_symmetric_jitter() {
        const TRUE_OFFSET_US: i64 = 25_000;
        const BASE_DELAY_US: i64 = 2_000;
        const JITTER_US: i64 = 3_000;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        let mut estimate = None;
        for round in 0..32 {
            let forward = BASE_DELAY_US + rng.gen_range(0..=JITTER_US);
            let back = BASE_DELAY_US + rng.gen_range(0..=JITTER_US);
            let sample = exchange(round * 2_000_000, TRUE_OFFSET_US, forward, back);
            estimate = Some(accepted(estimator.observe(sample)));
        }

        let estimate = estimate.expect("estimate");
        let error = (estimate.offset_us - TRUE_OFFSET_US).abs();
        assert!(error <= JITTER_US / 2, "error {error}us exceeds jitter bound");
        assert!(
            error <= estimate.uncertainty_us,
            "error {error}us outside reported uncertainty {}us",
            estimate.uncertainty_us
        );
        assert_eq!(estimate.samples, 8);
        assert!(estimate.drift_ppm.abs() < MAX_DRIFT_PPM);
    }

    #[test_timeout::timeout]
    fn minimum_delay_sample_wins() {
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        estimator.observe(exchange(0, 1_000, 4_000, 1_000));
        estimator.observe(exchange(1_000_000, 1_000, 300, 300));
        let estimate = accepted(estimator.observe(exchange(2_000_000, 1_000, 900, 5_000)));
        assert_eq!(estimate.offset_us, 1_000);
        assert_eq!(estimate.round_trip_us, 600);
        assert_eq!(estimate.reference_us, exchange(1_000_000, 1_000, 300, 300).t3_us);
        assert_eq!(estimate.updated_at_us, exchange(2_000_000, 1_000, 900, 5_000).t3_us);
    }

    #[test_timeout::timeout]
    fn linear_drift_is_recovered() {
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        let mut estimate = None;
        for i in 0..8 {
            let t0 = i * 2_000_000;
            // 40ppm: the offset grows 80us every two seconds.
            let offset = 5_000 + i * 80;
            estimate = Some(accepted(estimator.observe(exchange(t0, offset, 500, 500))));
        }
        let drift = estimate.expect("estimate").drift_ppm;
        assert!((drift - 40.0).abs() < 1.0, "drift {drift}");
    }

    #[test_timeout::timeout]
    fn clock_step_resets_window() {
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        for i in 0..5 {
            accepted(estimator.observe(exchange(i * 1_000_000, 2_000, 400, 400)));
        }
        assert_eq!(estimator.len(), 5);

        match estimator.observe(exchange(6_000_000, 1_002_000, 400, 400)) {
            SampleOutcome::Reset(estimate) => {
                assert_eq!(estimate.offset_us, 1_002_000);
                assert_eq!(estimate.samples, 1);
            }
            other => panic!("expected reset, got {other:?}"),
        }
        assert_eq!(estimator.len(), 1);
        assert_eq!(estimator.resets(), 1);
    }

    #[test_timeout::timeout]
    fn small_wander_does_not_reset() {
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        accepted(estimator.observe(exchange(0, 2_000, 400, 400)));
        // 30ms off but within threshold plus half of a 40ms round trip.
        accepted(estimator.observe(exchange(1_000_000, 32_000, 20_000, 20_000)));
        assert_eq!(estimator.resets(), 0);
    }

    #[test_timeout::timeout]
    fn corrupt_samples_are_rejected() {
        let mut estimator = ClockEstimator::new(8, Duration::from_millis(50));
        let negative = ClockSample {
            t0_us: 0,
            t1_us: 100,
            t2_us: 900,
            t3_us: 200,
        };
        assert_eq!(
            estimator.observe(negative),
            SampleOutcome::Rejected(SampleRejection::NegativeDelay { delay_us: -600 })
        );
        let backwards = ClockSample {
            t0_us: 1_000,
            t1_us: 0,
            t2_us: 0,
            t3_us: 500,
        };
        assert_eq!(
            estimator.observe(backwards),
            SampleOutcome::Rejected(SampleRejection::OutOfOrder)
        );
        assert!(estimator.is_empty());
    }
}
