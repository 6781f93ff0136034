//! Seed Commitment Protocol
//!
//! Commit to a round seed before betting opens.
//! Reveal and verify after the crash to prove the crash point was fixed
//! before any bet was accepted.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::fixed::Multiplier;
use crate::core::hash::{hash_with_domain, HashOutput};
use crate::proof::sampler::{crash_point_from_seed, Seed, BPS_ONE};

/// Domain separator for commitments.
const COMMITMENT_DOMAIN: &[u8] = b"CRASH_COMMIT_V1";

/// Commit to a seed.
pub fn commit_seed(seed: &Seed) -> HashOutput {
    hash_with_domain(COMMITMENT_DOMAIN, seed)
}

/// Data published after a round crashes.
///
/// Anyone holding this can recompute the crash point independently.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReveal {
    /// Commitment that was published with the round.
    pub commitment: HashOutput,
    /// Revealed seed.
    pub seed: Seed,
    /// House edge the round ran with.
    pub house_edge_bps: u32,
    /// Crash point the round ended at.
    pub crash_point: Multiplier,
}

impl SeedReveal {
    /// Verify the reveal against its own commitment.
    pub fn verify(&self) -> Result<(), FairnessError> {
        // 1. Seed must hash to the commitment
        if commit_seed(&self.seed) != self.commitment {
            return Err(FairnessError::CommitmentMismatch);
        }

        if self.house_edge_bps >= BPS_ONE {
            return Err(FairnessError::InvalidHouseEdge(self.house_edge_bps));
        }

        // 2. Seed must produce the claimed crash point
        let expected = crash_point_from_seed(&self.seed, self.house_edge_bps);
        if expected != self.crash_point {
            return Err(FairnessError::CrashPointMismatch {
                expected,
                got: self.crash_point,
            });
        }

        Ok(())
    }
}

/// Errors that can occur during reveal verification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FairnessError {
    /// Seed hash doesn't match the published commitment.
    #[error("seed does not match commitment")]
    CommitmentMismatch,

    /// Crash point doesn't match the one derived from the seed.
    #[error("crash point mismatch: derived {expected}, claimed {got}")]
    CrashPointMismatch {
        /// Crash point derived from the seed.
        expected: Multiplier,
        /// Crash point the round claimed.
        got: Multiplier,
    },

    /// House edge outside [0, 100%).
    #[error("invalid house edge: {0} bps")]
    InvalidHouseEdge(u32),
}
