//! Multiplier Curve
//!
//! `m(t) = e^(k·t)`, truncated to the fixed-point multiplier scale.
//! The curve knows nothing about the crash point; the round manager
//! compares the two.

use crate::core::clock::Millis;
use crate::core::fixed::{Multiplier, MULTIPLIER_SCALE};

/// Default growth rate per millisecond (2.00x after ~11.5 s).
pub const DEFAULT_GROWTH_PER_MS: f64 = 0.000_06;

/// Exponential multiplier curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiplierCurve {
    growth_per_ms: f64,
}

impl Default for MultiplierCurve {
    fn default() -> Self {
        Self::new(DEFAULT_GROWTH_PER_MS)
    }
}

impl MultiplierCurve {
    /// Create a curve with growth rate `k` per millisecond.
    pub fn new(growth_per_ms: f64) -> Self {
        Self { growth_per_ms }
    }

    /// Growth rate per millisecond.
    pub fn growth_per_ms(&self) -> f64 {
        self.growth_per_ms
    }

    /// Multiplier after `elapsed_ms` of running.
    pub fn at(&self, elapsed_ms: Millis) -> Multiplier {
        let scaled = (self.growth_per_ms * elapsed_ms as f64).exp() * MULTIPLIER_SCALE as f64;
        if !scaled.is_finite() || scaled >= u64::MAX as f64 {
            return Multiplier::MAX;
        }
        Multiplier::from_raw((scaled.floor() as u64).max(MULTIPLIER_SCALE))
    }

    /// First elapsed millisecond at which the curve reaches `target`.
    pub fn time_to_reach(&self, target: Multiplier) -> Millis {
        if target <= Multiplier::ONE {
            return 0;
        }
        let estimate = (target.to_f64().ln() / self.growth_per_ms).max(0.0) as Millis;

        // Float rounding can land a step either side; settle on the exact tick.
        let mut t = estimate;
        while t > 0 && self.at(t - 1) >= target {
            t -= 1;
        }
        while self.at(t) < target {
            t += 1;
        }
        t
    }

    /// Real (unfloored) raw-unit growth over the first `tick_ms`.
    ///
    /// The curve is convex, so every later tick grows by at least this much.
    pub fn first_step(&self, tick_ms: Millis) -> f64 {
        ((self.growth_per_ms * tick_ms as f64).exp() - 1.0) * MULTIPLIER_SCALE as f64
    }
}
