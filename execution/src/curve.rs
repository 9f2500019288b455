//! Multiplier growth curve.
//!
//! `multiplier(t) = floor(100 * e^(0.00006 * t_ms))` in hundredths. The exponential is
//! evaluated in 1e-12 fixed point (range reduction by ln 2 plus a Taylor series) so
//! the value that ends up in a payout never passed through a float.

use liftoff_types::Multiplier;

const SCALE: u128 = 1_000_000_000_000;

/// ln(2) scaled by [SCALE].
const LN_2: u128 = 693_147_180_560;

/// 0.00006 per millisecond, scaled by [SCALE].
const GROWTH_PER_MS: u128 = 60_000_000;

const TAYLOR_TERMS: u128 = 30;

/// Beyond this the curve saturates at `u64::MAX` anyway.
const SEARCH_LIMIT_MS: u64 = 1_000_000_000;

/// Value of the curve `elapsed_ms` after the round started running.
pub fn multiplier_at(elapsed_ms: u64) -> Multiplier {
    let exponent = elapsed_ms as u128 * GROWTH_PER_MS;
    let doublings = exponent / LN_2;
    if doublings >= 64 {
        return Multiplier(u64::MAX);
    }
    let remainder = exponent % LN_2;

    let mut term = SCALE;
    let mut sum = SCALE;
    for n in 1..=TAYLOR_TERMS {
        term = term * remainder / SCALE / n;
        if term == 0 {
            break;
        }
        sum += term;
    }

    let hundredths = (sum << doublings) * 100 / SCALE;
    Multiplier(u64::try_from(hundredths).unwrap_or(u64::MAX))
}

/// First elapsed millisecond at which the curve reaches `target`.
pub fn elapsed_for(target: Multiplier) -> u64 {
    let (mut low, mut high) = (0u64, SEARCH_LIMIT_MS);
    while low < high {
        let mid = low + (high - low) / 2;
        if multiplier_at(mid) >= target {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    low
}
