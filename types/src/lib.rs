//! Common types shared by every liftoff crate.
//!
//! Monetary values are always integer wei ([Wei]) and multipliers are integer
//! hundredths ([Multiplier]). Nothing in this crate (or its dependents) stores
//! a floating point amount.

pub mod api;
pub mod chain;
pub mod ledger;
pub mod round;
pub mod wei;

pub use api::{ClientMessage, Envelope, Event};
pub use chain::{Address, TxHash};
pub use ledger::{Account, LedgerEntry, OpType};
pub use round::{Bet, BetStatus, Multiplier, Phase, RoundRecord, RoundSnapshot};
pub use wei::Wei;

/// Identifier of a player (the lowercase wallet address they logged in with).
pub type UserId = String;

/// Identifier of a round (also used as the provably-fair nonce).
pub type RoundId = u64;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Normalize a wallet address into the form used as a [UserId].
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Returns true if `address` looks like a 20-byte hex address (`0x` + 40 hex chars).
pub fn is_valid_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}
