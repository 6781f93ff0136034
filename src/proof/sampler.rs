//! Crash Point Sampling
//!
//! Each round's crash point is a pure function of a 32-byte seed and the
//! house edge. The seed comes from the operating system RNG and is drawn
//! when the round is created, before any bet can be placed on it.
//!
//! ## Derivation
//!
//! ```text
//! h     = first 8 bytes of SHA-256("CRASH_POINT_V1" || seed), LE, top 52 bits
//! u     = (h + 1) / 2^52                                  ∈ (0, 1]
//! crash = floor(100 * (1 - edge) / u) / 100,   clamped to [1.00, MAX_CRASH_POINT]
//! ```
//!
//! This gives `P(crash >= x) = (1 - edge) / x` for every `x >= 1.00`.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::core::fixed::Multiplier;
use crate::core::hash::{DomainHasher, HashOutput};
use crate::proof::commitment::commit_seed;

/// Domain separator for crash point derivation.
const CRASH_POINT_DOMAIN: &[u8] = b"CRASH_POINT_V1";

/// Basis points in 100%.
pub const BPS_ONE: u32 = 10_000;

/// Bits of hash output used for `u`.
const UNIFORM_BITS: u32 = 52;

/// Upper bound on any crash point (1,000,000.00x), in hundredths.
pub const MAX_CRASH_HUNDREDTHS: u64 = 100_000_000;

/// A round seed.
pub type Seed = [u8; 32];

/// Everything the engine needs from one fair draw.
#[derive(Clone, Debug)]
pub struct FairDraw {
    /// Secret seed, revealed after the crash.
    pub seed: Seed,
    /// Commitment published before betting opens.
    pub commitment: HashOutput,
    /// Crash point derived from the seed.
    pub crash_point: Multiplier,
    /// House edge the crash point was derived with.
    pub house_edge_bps: u32,
}

/// Source of fair draws.
///
/// [`CrashSampler`] is the production source. Tests substitute sources with
/// a known crash point.
pub trait CrashSource: Send + 'static {
    /// Draw the seed and crash point for a new round.
    fn draw(&mut self) -> FairDraw;
}

/// Samples crash points from OS entropy.
#[derive(Debug, Clone)]
pub struct CrashSampler {
    house_edge_bps: u32,
}

impl CrashSampler {
    /// Create a sampler. `house_edge_bps` must be below [`BPS_ONE`].
    pub fn new(house_edge_bps: u32) -> Self {
        Self { house_edge_bps: house_edge_bps.min(BPS_ONE - 1) }
    }

    /// House edge in basis points.
    pub fn house_edge_bps(&self) -> u32 {
        self.house_edge_bps
    }

    /// Build the draw for a given seed.
    pub fn draw_with_seed(&self, seed: Seed) -> FairDraw {
        FairDraw {
            seed,
            commitment: commit_seed(&seed),
            crash_point: crash_point_from_seed(&seed, self.house_edge_bps),
            house_edge_bps: self.house_edge_bps,
        }
    }
}

impl CrashSource for CrashSampler {
    fn draw(&mut self) -> FairDraw {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        self.draw_with_seed(seed)
    }
}

/// Derive the crash point for a seed.
pub fn crash_point_from_seed(seed: &Seed, house_edge_bps: u32) -> Multiplier {
    let mut hasher = DomainHasher::new(CRASH_POINT_DOMAIN);
    hasher.update_bytes(seed);
    let hash = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    let h = u64::from_le_bytes(head) >> (64 - UNIFORM_BITS);

    crash_point_from_uniform(h, house_edge_bps)
}

/// Map a 52-bit uniform draw to a crash point.
fn crash_point_from_uniform(h: u64, house_edge_bps: u32) -> Multiplier {
    let edge = house_edge_bps.min(BPS_ONE - 1);

    // 100 * (1 - edge) / u  ==  (BPS_ONE - edge) * 2^52 / (100 * (h + 1))
    let numerator = (BPS_ONE - edge) as u128 * (1u128 << UNIFORM_BITS);
    let denominator = 100 * (h as u128 + 1);
    let hundredths = (numerator / denominator).clamp(100, MAX_CRASH_HUNDREDTHS as u128);

    Multiplier::from_hundredths(hundredths as u64)
}
