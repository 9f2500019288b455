//! Provably-fair crash points.
//!
//! Before a round opens the server draws a random `server_seed` and publishes only
//! `seed_hash = hex(sha256(server_seed))`. Once the round crashes the seed is revealed and
//! anyone can recompute the crash point with [crash_point]:
//!
//! 1. `h = sha256("{server_seed}:{client_seed}:{nonce}")`
//! 2. if `u32(h[0..4]) % 33 == 0` the round crashes instantly at 1.00x
//! 3. otherwise `x = u56(h[4..11]) >> 4` (52 bits) and `r = (x + 1) / 2^52`
//! 4. `crash = round(0.99 / r, 2 decimals)` clamped to `[1.00x, 10000.00x]`
//!
//! Step 4 is evaluated in integer hundredths, so every implementation that follows the
//! steps above gets the exact same answer.

use commonware_cryptography::{sha256::Sha256, Hasher};
use commonware_utils::hex;
use liftoff_types::{Multiplier, RoundRecord};
use rand::RngCore;
use thiserror::Error;

/// House edge factor (0.99) in basis points.
pub const HOUSE_EDGE_FACTOR_BPS: u128 = 9_900;

/// One in this many rounds crashes instantly.
pub const INSTANT_CRASH_MODULUS: u32 = 33;

/// Highest crash point the formula can produce.
pub const MAX_CRASH_POINT: Multiplier = Multiplier(1_000_000);

/// Bits of entropy used for the uniform fraction.
const FRACTION_BITS: u32 = 52;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("round {0} has not been revealed yet")]
    NotRevealed(u64),
    #[error("server seed does not match the published hash")]
    SeedMismatch,
    #[error("crash point mismatch: published {published}, recomputed {recomputed}")]
    CrashMismatch {
        published: Multiplier,
        recomputed: Multiplier,
    },
}

fn sha256(message: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(message);
    hasher.finalize().0
}

/// Draw a fresh 32-byte server seed, hex encoded.
pub fn generate_server_seed<R: RngCore>(rng: &mut R) -> String {
    let mut seed = [0u8; 32];
    rng.fill_bytes(&mut seed);
    hex(&seed)
}

/// Commitment published before the round opens.
pub fn seed_hash(server_seed: &str) -> String {
    hex(&sha256(server_seed.as_bytes()))
}

/// Deterministic crash point for a round.
pub fn crash_point(server_seed: &str, client_seed: &str, nonce: u64) -> Multiplier {
    let digest = sha256(format!("{server_seed}:{client_seed}:{nonce}").as_bytes());

    let instant = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    if instant % INSTANT_CRASH_MODULUS == 0 {
        return Multiplier::ONE;
    }

    let mut slice = [0u8; 8];
    slice[1..].copy_from_slice(&digest[4..11]);
    let fraction = (u64::from_be_bytes(slice) >> 4) as u128;

    // round(0.99 * 2^52 / (x + 1)) in hundredths
    let numerator = HOUSE_EDGE_FACTOR_BPS << FRACTION_BITS;
    let denominator = 100 * (fraction + 1);
    let hundredths = (numerator + denominator / 2) / denominator;
    let clamped = hundredths.clamp(
        Multiplier::ONE.hundredths() as u128,
        MAX_CRASH_POINT.hundredths() as u128,
    );
    Multiplier(clamped as u64)
}

/// Recompute a revealed round and check it against what was published.
pub fn verify(record: &RoundRecord) -> Result<Multiplier, VerifyError> {
    let (Some(server_seed), Some(published)) = (&record.server_seed, record.crash_point) else {
        return Err(VerifyError::NotRevealed(record.round_id));
    };
    if seed_hash(server_seed) != record.seed_hash {
        return Err(VerifyError::SeedMismatch);
    }
    let recomputed = crash_point(server_seed, &record.client_seed, record.nonce);
    if recomputed != published {
        return Err(VerifyError::CrashMismatch {
            published,
            recomputed,
        });
    }
    Ok(recomputed)
}
