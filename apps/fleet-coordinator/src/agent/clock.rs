use crate::clock::LocalClock;

/// A node clock running `offset_us` ahead of `base`, gaining `drift_ppm`
/// microseconds per second of base time.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedClock {
    base: LocalClock,
    offset_us: i64,
    drift_ppm: f64,
}

impl SimulatedClock {
    pub fn new(base: LocalClock, offset_us: i64, drift_ppm: f64) -> Self {
        Self {
            base,
            offset_us,
            drift_ppm,
        }
    }

    /// A clock that agrees with `base`.
    pub fn exact(base: LocalClock) -> Self {
        Self::new(base, 0, 0.0)
    }

    pub fn now_us(&self) -> i64 {
        self.at(self.base.now_us())
    }

    /// Node reading when `base` reads `base_us`.
    pub fn at(&self, base_us: i64) -> i64 {
        base_us + self.offset_us + (base_us as f64 * self.drift_ppm / 1e6).round() as i64
    }

    /// Steps the clock, as an NTP correction on the node would.
    pub fn step(&mut self, delta_us: i64) {
        self.offset_us += delta_us;
    }

    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    pub fn drift_ppm(&self) -> f64 {
        self.drift_ppm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn drift_accumulates_with_base_time() {
        let clock = SimulatedClock::new(LocalClock::new(), 1_000, 100.0);
        assert_eq!(clock.at(0), 1_000);
        // 100ppm over ten seconds is one millisecond.
        assert_eq!(clock.at(10_000_000), 10_000_000 + 1_000 + 1_000);

        let mut stepped = clock;
        stepped.step(-500);
        assert_eq!(stepped.at(0), 500);
    }
}
