//! Fixed-Point Money and Multipliers
//!
//! All settlement arithmetic is integer-only. Floats appear only at the
//! wire boundary (client display values) and inside the growth curve.
//!
//! ## Formats
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Amount      u64 minor units          100 == 1.00           │
//! │  Multiplier  u64, scale 10_000     10_000 == 1.0000x        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  payout = amount * multiplier / 10_000   (rounded down)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Crash points are always whole hundredths. Live multipliers use the full
//! scale so that consecutive ticks stay strictly increasing even when the
//! curve is still flat.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Minor units per currency unit (cents).
pub const MINOR_UNITS: u64 = 100;

/// Raw multiplier units per 1.0x.
pub const MULTIPLIER_SCALE: u64 = 10_000;

/// Raw multiplier units per hundredth (0.01x).
pub const HUNDREDTH: u64 = MULTIPLIER_SCALE / 100;

// =============================================================================
// AMOUNT
// =============================================================================

/// A non-negative amount of money in minor units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Amount(pub u64);

impl Amount {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Create from minor units.
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Create from whole currency units.
    pub const fn from_units(units: u64) -> Self {
        Self(units * MINOR_UNITS)
    }

    /// Convert a wire decimal (e.g. `12.5`) to minor units.
    ///
    /// Returns `None` for negative, non-finite, or out-of-range input.
    /// Sub-cent digits are rounded to the nearest minor unit.
    pub fn from_decimal(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let minor = (value * MINOR_UNITS as f64).round();
        if minor >= u64::MAX as f64 {
            return None;
        }
        Some(Self(minor as u64))
    }

    /// Convert to a wire decimal for display.
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / MINOR_UNITS as f64
    }

    /// Raw minor units.
    #[inline]
    pub const fn minor(self) -> u64 {
        self.0
    }

    /// Is this zero?
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Checked addition.
    #[inline]
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    #[inline]
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / MINOR_UNITS, self.0 % MINOR_UNITS)
    }
}

// =============================================================================
// MULTIPLIER
// =============================================================================

/// A payout multiplier at scale [`MULTIPLIER_SCALE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Multiplier(pub u64);

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl Multiplier {
    /// 1.00x, the value at round start.
    pub const ONE: Self = Self(MULTIPLIER_SCALE);

    /// Largest representable multiplier.
    pub const MAX: Self = Self(u64::MAX);

    /// Create from raw scaled units.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create from hundredths (`250` == 2.50x).
    pub const fn from_hundredths(hundredths: u64) -> Self {
        Self(hundredths.saturating_mul(HUNDREDTH))
    }

    /// Raw scaled units.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whole hundredths, rounded down.
    #[inline]
    pub const fn hundredths(self) -> u64 {
        self.0 / HUNDREDTH
    }

    /// Truncate to 2-decimal precision.
    #[inline]
    pub const fn floor_to_hundredths(self) -> Self {
        Self(self.hundredths() * HUNDREDTH)
    }

    /// Convert a wire decimal (e.g. `2.5`) to a multiplier, rounded down to
    /// the nearest hundredth.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let hundredths = (value * 100.0 + 1e-9).floor();
        if hundredths >= (u64::MAX / HUNDREDTH) as f64 {
            return None;
        }
        Some(Self::from_hundredths(hundredths as u64))
    }

    /// Convert to float for display and the wire.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MULTIPLIER_SCALE as f64
    }

    /// Apply this multiplier to a stake: `amount * self`, rounded down.
    ///
    /// Returns `None` if the payout does not fit in an `Amount`.
    pub fn apply(self, amount: Amount) -> Option<Amount> {
        let payout = (amount.0 as u128 * self.0 as u128) / MULTIPLIER_SCALE as u128;
        u64::try_from(payout).ok().map(Amount)
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hundredths = self.hundredths();
        write!(f, "{}.{:02}x", hundredths / 100, hundredths % 100)
    }
}

// =============================================================================
// TESTS
// =============================================================================
