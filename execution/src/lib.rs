//! Game logic for liftoff: the provably-fair crash formula, the growth curve, the round
//! state machine, the balance ledger and house solvency limits.

pub mod curve;
pub mod fair;
pub mod ledger;
pub mod round;
pub mod solvency;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use ledger::{Ledger, LedgerError, Memory, Store};
pub use round::{Cashout, CrashOutcome, GameError, Round, Settlement};
pub use solvency::{SolvencyError, SolvencyGuard};
