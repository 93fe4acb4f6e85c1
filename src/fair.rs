//! Provably-fair round generation and verification.
//!
//! A round commits to its outcome before bets open: the server draws a
//! 256-bit seed, publishes SHA-256(seed), and derives the crash multiplier
//! deterministically from (seed, round number). After the crash the seed is
//! revealed so any client can recompute both the hash and the multiplier.

use crate::types::truncate_to_cents;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

pub const MIN_CRASH_POINT: f64 = 1.01;
pub const MAX_CRASH_POINT: f64 = 1000.0;

/// Tolerance when verifying a claimed crash point
const VERIFY_TOLERANCE: f64 = 0.01;

/// Committed material for one round
#[derive(Debug, Clone)]
pub struct FairRound {
    pub round_id: String,
    /// Hex-encoded 32 random bytes, secret until crash
    pub seed: String,
    /// SHA-256 of the hex seed string, published at creation
    pub hash: String,
    pub crash_point: f64,
}

/// Source of committed rounds. The engine only needs this one method, which
/// keeps the generator substitutable in tests.
pub trait ProofSource: Send + Sync {
    fn new_round(&self, round_number: u64) -> FairRound;
}

/// Deterministic crash-point generator with a configured house edge
#[derive(Debug, Clone)]
pub struct ProofGenerator {
    house_edge: f64,
}

impl ProofGenerator {
    pub fn new(house_edge: f64) -> Self {
        Self { house_edge }
    }

    /// Derive the crash multiplier from the seed and round number.
    ///
    /// H = SHA-256(seed || ascii(round_number)); x = the first 8 hex chars
    /// of H as a u32; with M = 2^32 - 1 and house edge e,
    /// r = (M - x) / (M - x*e), clamped to [1.01, 1000.00] and truncated
    /// toward zero at two fractional digits.
    pub fn crash_point(&self, seed: &str, round_number: u64) -> f64 {
        let digest = Sha256::digest(format!("{seed}{round_number}").as_bytes());
        let digest_hex = hex::encode(digest);
        // First 8 hex chars of a SHA-256 digest always parse as u32.
        let x = u32::from_str_radix(&digest_hex[..8], 16).unwrap_or(0) as f64;
        let m = u32::MAX as f64;

        let r = (m - x) / (m - x * self.house_edge);
        truncate_to_cents(r.clamp(MIN_CRASH_POINT, MAX_CRASH_POINT))
    }

    /// Verify a revealed round against its published commitment
    pub fn verify(
        &self,
        seed: &str,
        hash: &str,
        round_number: u64,
        claimed_crash_point: f64,
    ) -> Verification {
        let computed_hash = hash_seed(seed);
        if computed_hash != hash.to_ascii_lowercase() {
            return Verification::invalid(format!(
                "seed hash mismatch: expected {hash}, computed {computed_hash}"
            ));
        }

        let computed_point = self.crash_point(seed, round_number);
        if (computed_point - claimed_crash_point).abs() > VERIFY_TOLERANCE {
            return Verification::invalid(format!(
                "crash point mismatch: claimed {claimed_crash_point:.2}, computed {computed_point:.2}"
            ));
        }

        Verification { valid: true, reason: None }
    }
}

impl ProofSource for ProofGenerator {
    fn new_round(&self, round_number: u64) -> FairRound {
        let mut seed_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut seed_bytes);
        let seed = hex::encode(seed_bytes);
        let hash = hash_seed(&seed);
        let crash_point = self.crash_point(&seed, round_number);

        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        FairRound {
            round_id: format!("{epoch_ms}{round_number}"),
            seed,
            hash,
            crash_point,
        }
    }
}

/// Outcome of a fairness challenge
#[derive(Debug, Clone)]
pub struct Verification {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verification {
    fn invalid(reason: String) -> Self {
        Self { valid: false, reason: Some(reason) }
    }
}

/// SHA-256 over the hex seed string, hex-encoded. This is what a client
/// hashing the revealed seed obtains.
pub fn hash_seed(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}
