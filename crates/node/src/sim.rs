//! Stateful temperature/humidity simulator for development and as the
//! fallback when a real sensor read fails.
//!
//! Models a room rather than white noise:
//! - Temporal coherence via random walk with mean reversion
//! - Hard bands around the set points (±3 C, ±10 %RH)
//! - Readings rounded to two decimals like the real drivers

use crate::error::HardwareError;
use crate::sensor::{Sample, SampleSource};

pub const TEMP_CENTER: f64 = 20.0;
pub const TEMP_BAND: f64 = 3.0;
pub const HUMIDITY_CENTER: f64 = 50.0;
pub const HUMIDITY_BAND: f64 = 10.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Per-metric walk
// ---------------------------------------------------------------------------

struct Walk {
    value: f64,
    center: f64,
    band: f64,
    step_sigma: f64,
    mean_reversion: f64,
}

impl Walk {
    fn new(rng: &mut fastrand::Rng, center: f64, band: f64) -> Self {
        Self {
            value: center + (rng.f64() * 2.0 - 1.0) * band * 0.5,
            center,
            band,
            step_sigma: band * 0.05,
            mean_reversion: 0.05,
        }
    }

    fn step(&mut self, rng: &mut fastrand::Rng) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = self.step_sigma * approx_std_normal(rng);
        self.value = (self.value + pull + walk).clamp(self.center - self.band, self.center + self.band);
        self.value
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct ClimateSim {
    rng: fastrand::Rng,
    temperature: Walk,
    humidity: Walk,
}

impl ClimateSim {
    pub fn new() -> Self {
        Self::with_rng(fastrand::Rng::new())
    }

    /// Deterministic simulator for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(fastrand::Rng::with_seed(seed))
    }

    fn with_rng(mut rng: fastrand::Rng) -> Self {
        let temperature = Walk::new(&mut rng, TEMP_CENTER, TEMP_BAND);
        let humidity = Walk::new(&mut rng, HUMIDITY_CENTER, HUMIDITY_BAND);
        Self {
            rng,
            temperature,
            humidity,
        }
    }

    pub fn sample(&mut self) -> Sample {
        let t = self.temperature.step(&mut self.rng);
        let h = self.humidity.step(&mut self.rng);
        // Both walks are clamped to finite bands.
        Sample::from_raw(t, h).unwrap_or(Sample {
            temperature: Some(TEMP_CENTER),
            humidity: Some(HUMIDITY_CENTER),
        })
    }
}

impl Default for ClimateSim {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for ClimateSim {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn read_sample(&mut self) -> Result<Sample, HardwareError> {
        Ok(self.sample())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_stay_within_bands() {
        let mut sim = ClimateSim::with_seed(7);
        for _ in 0..1000 {
            let s = sim.sample();
            let t = s.temperature.unwrap();
            let h = s.humidity.unwrap();
            assert!((TEMP_CENTER - TEMP_BAND..=TEMP_CENTER + TEMP_BAND).contains(&t), "t={t}");
            assert!(
                (HUMIDITY_CENTER - HUMIDITY_BAND..=HUMIDITY_CENTER + HUMIDITY_BAND).contains(&h),
                "h={h}"
            );
        }
    }

    #[test]
    fn readings_are_rounded_to_two_decimals() {
        let mut sim = ClimateSim::with_seed(11);
        for _ in 0..100 {
            let t = sim.sample().temperature.unwrap();
            assert_eq!(t, (t * 100.0).round() / 100.0);
        }
    }

    #[test]
    fn temporal_coherence() {
        // Consecutive readings should be much closer than the full band.
        let mut sim = ClimateSim::with_seed(3);
        let temps: Vec<f64> = (0..200).map(|_| sim.sample().temperature.unwrap()).collect();
        let max_jump = temps
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_jump < TEMP_BAND, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = ClimateSim::with_seed(42);
        let mut b = ClimateSim::with_seed(42);
        for _ in 0..20 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let mut rng = fastrand::Rng::with_seed(1);
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal(&mut rng)).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "approx_std_normal mean should be near zero: {mean}");
    }
}
