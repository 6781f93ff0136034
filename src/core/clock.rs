//! Round Clock
//!
//! The engine never reads wall-clock time directly. Every timestamp comes
//! from a [`Clock`], so tests can step time explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Milliseconds since the clock's origin.
pub type Millis = u64;

/// Monotonic time source.
pub trait Clock: Send + Sync + 'static {
    /// Current time in milliseconds since the clock's origin.
    fn now(&self) -> Millis;
}

/// Clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused test time, so `#[tokio::test(start_paused = true)]`
/// drives it deterministically.
#[derive(Debug, Clone)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self { origin: tokio::time::Instant::now() }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by `ms` and return the new time.
    pub fn advance(&self, ms: Millis) -> Millis {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}
