//! Engine Configuration
//!
//! Timing, economics and channel sizing for the round engine.
//! Every field can be overridden from a `CRASH_*` environment variable.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::fixed::{Amount, MINOR_UNITS};
use crate::game::curve::{MultiplierCurve, DEFAULT_GROWTH_PER_MS};
use crate::proof::sampler::BPS_ONE;

/// Longest accepted duration setting.
pub const MAX_PHASE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Round engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Clock tick interval.
    pub tick_interval: Duration,
    /// Countdown length before a round starts.
    pub countdown: Duration,
    /// Delay between a crash and the next countdown.
    pub settlement_delay: Duration,
    /// Curve growth rate per millisecond.
    pub growth_per_ms: f64,
    /// House edge in basis points.
    pub house_edge_bps: u32,
    /// Balance for newly opened accounts.
    pub starting_balance: Amount,
    /// How long after start bets are still accepted.
    pub late_join_window: Duration,
    /// Number of archived rounds kept.
    pub history_size: usize,
    /// Broadcast channel capacity.
    pub event_capacity: usize,
    /// Command queue capacity.
    pub command_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            countdown: Duration::from_secs(10),
            settlement_delay: Duration::from_secs(5),
            growth_per_ms: DEFAULT_GROWTH_PER_MS,
            house_edge_bps: 100,
            starting_balance: Amount::from_units(1000),
            late_join_window: Duration::ZERO,
            history_size: 50,
            event_capacity: 1024,
            command_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CRASH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "CRASH_TICK_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CRASH_COUNTDOWN_SECS")? {
            config.countdown = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CRASH_SETTLEMENT_SECS")? {
            config.settlement_delay = Duration::from_secs(secs);
        }
        if let Some(k) = parse_var::<f64>(&lookup, "CRASH_GROWTH_PER_MS")? {
            config.growth_per_ms = k;
        }
        if let Some(bps) = parse_var::<u32>(&lookup, "CRASH_HOUSE_EDGE_BPS")? {
            config.house_edge_bps = bps;
        }
        if let Some(units) = parse_var::<u64>(&lookup, "CRASH_STARTING_BALANCE")? {
            config.starting_balance = Amount(units.checked_mul(MINOR_UNITS).ok_or(ConfigError::OutOfRange {
                field: "starting_balance",
                reason: "too large",
            })?);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CRASH_LATE_JOIN_MS")? {
            config.late_join_window = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "CRASH_HISTORY_SIZE")? {
            config.history_size = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "CRASH_EVENT_CAPACITY")? {
            config.event_capacity = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "CRASH_COMMAND_CAPACITY")? {
            config.command_capacity = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::OutOfRange { field: "tick_interval", reason: "must be positive" });
        }
        for (field, duration) in [
            ("tick_interval", self.tick_interval),
            ("countdown", self.countdown),
            ("settlement_delay", self.settlement_delay),
            ("late_join_window", self.late_join_window),
        ] {
            if duration > MAX_PHASE_DURATION {
                return Err(ConfigError::OutOfRange { field, reason: "longer than 24 hours" });
            }
        }
        if !(self.growth_per_ms.is_finite() && self.growth_per_ms > 0.0) {
            return Err(ConfigError::OutOfRange { field: "growth_per_ms", reason: "must be positive" });
        }
        // The curve is convex: if the first tick advances by two raw units,
        // every later tick does too, even after flooring.
        if self.curve().first_step(self.tick_millis()) < 2.0 {
            return Err(ConfigError::OutOfRange {
                field: "growth_per_ms",
                reason: "too slow for the tick interval",
            });
        }
        if self.house_edge_bps >= BPS_ONE {
            return Err(ConfigError::OutOfRange { field: "house_edge_bps", reason: "must be below 10000" });
        }
        if self.history_size == 0 {
            return Err(ConfigError::OutOfRange { field: "history_size", reason: "must be positive" });
        }
        if self.event_capacity == 0 || self.command_capacity == 0 {
            return Err(ConfigError::OutOfRange { field: "capacity", reason: "must be positive" });
        }
        Ok(())
    }

    /// Curve for this configuration.
    pub fn curve(&self) -> MultiplierCurve {
        MultiplierCurve::new(self.growth_per_ms)
    }

    /// Tick interval in milliseconds.
    pub fn tick_millis(&self) -> u64 {
        duration_millis(self.tick_interval)
    }

    /// Countdown length in milliseconds.
    pub fn countdown_millis(&self) -> u64 {
        duration_millis(self.countdown)
    }

    /// Settlement delay in milliseconds.
    pub fn settlement_millis(&self) -> u64 {
        duration_millis(self.settlement_delay)
    }

    /// Late-join window in milliseconds.
    pub fn late_join_millis(&self) -> u64 {
        duration_millis(self.late_join_window)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parse an optional variable.
pub(crate) fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
    }
}
