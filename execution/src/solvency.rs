//! House exposure limits.
//!
//! Every accepted bet adds `stake * max_payout` to the open liability. A bet is refused
//! once the liability would exceed `(house_funds - min_reserve) * max_liability_bps`, and
//! the guard enters emergency mode (refusing everything) when utilization crosses the
//! high water mark, either through a bet or a shrinking bankroll. Emergency mode stays
//! latched until [SolvencyGuard::rebalance] sees utilization back under the low water
//! mark or an operator calls [SolvencyGuard::clear_emergency].

use liftoff_types::{Multiplier, Wei};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{error, info};

const BPS: u128 = 10_000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Funds that are never put at risk.
    pub min_reserve: Wei,
    /// Share of the spendable bankroll that may be exposed at once.
    pub max_liability_bps: u32,
    /// Utilization (of the ceiling) that trips emergency mode.
    pub high_water_bps: u32,
    /// Utilization below which a rebalance leaves emergency mode.
    pub low_water_bps: u32,
    pub max_payout: Multiplier,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_reserve: 0,
            max_liability_bps: 1_000,
            high_water_bps: 9_500,
            low_water_bps: 5_000,
            max_payout: Multiplier(10_000),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolvencyError {
    #[error("liability {liability} + {requested} exceeds ceiling {ceiling}")]
    LimitExceeded {
        liability: Wei,
        requested: Wei,
        ceiling: Wei,
    },
    #[error("house is in emergency mode")]
    EmergencyMode,
    #[error("solvency state unavailable")]
    Poisoned,
}

/// Point-in-time view of the guard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub house_funds: Wei,
    pub open_liability: Wei,
    pub ceiling: Wei,
    pub emergency: bool,
}

impl Status {
    /// Liability as a share of the ceiling, in basis points.
    pub fn utilization_bps(&self) -> u128 {
        if self.ceiling == 0 {
            return if self.open_liability == 0 { 0 } else { BPS };
        }
        self.open_liability.saturating_mul(BPS) / self.ceiling
    }
}

#[derive(Default)]
struct State {
    house_funds: Wei,
    open_liability: Wei,
    emergency: bool,
}

pub struct SolvencyGuard {
    config: Config,
    state: Mutex<State>,
}

impl SolvencyGuard {
    pub fn new(config: Config, house_funds: Wei) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                house_funds,
                ..Default::default()
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Worst-case payout for a stake.
    pub fn liability_for(&self, stake: Wei) -> Wei {
        self.config.max_payout.apply(stake)
    }

    fn ceiling(&self, house_funds: Wei) -> Wei {
        house_funds
            .saturating_sub(self.config.min_reserve)
            .saturating_mul(self.config.max_liability_bps as u128)
            / BPS
    }

    fn snapshot(&self, state: &State) -> Status {
        Status {
            house_funds: state.house_funds,
            open_liability: state.open_liability,
            ceiling: self.ceiling(state.house_funds),
            emergency: state.emergency,
        }
    }

    /// Enter emergency mode if utilization is at or above the high water mark.
    fn check_high_water(&self, state: &mut State) {
        if state.emergency {
            return;
        }
        let status = self.snapshot(state);
        if status.utilization_bps() >= self.config.high_water_bps as u128 {
            error!(
                liability = %status.open_liability,
                ceiling = %status.ceiling,
                "liability crossed high water mark, entering emergency mode"
            );
            state.emergency = true;
        }
    }

    /// Reserve exposure for a new bet. Returns the liability to release later.
    pub fn admit(&self, stake: Wei) -> Result<Wei, SolvencyError> {
        let mut state = self.state.lock().map_err(|_| SolvencyError::Poisoned)?;
        if state.emergency {
            return Err(SolvencyError::EmergencyMode);
        }
        let requested = self.liability_for(stake);
        let ceiling = self.ceiling(state.house_funds);
        let next = state.open_liability.saturating_add(requested);
        if next > ceiling {
            return Err(SolvencyError::LimitExceeded {
                liability: state.open_liability,
                requested,
                ceiling,
            });
        }
        state.open_liability = next;
        self.check_high_water(&mut state);
        Ok(requested)
    }

    /// Release exposure once a bet has settled.
    pub fn release(&self, liability: Wei) {
        if let Ok(mut state) = self.state.lock() {
            state.open_liability = state.open_liability.saturating_sub(liability);
        }
    }

    /// Refresh the on-chain bankroll. A smaller bankroll can trip emergency mode.
    pub fn set_house_funds(&self, house_funds: Wei) {
        if let Ok(mut state) = self.state.lock() {
            state.house_funds = house_funds;
            self.check_high_water(&mut state);
        }
    }

    /// Leave emergency mode once utilization is under the low water mark. Returns true
    /// if the guard was cleared.
    pub fn rebalance(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if !state.emergency {
            return false;
        }
        let utilization = self.snapshot(&state).utilization_bps();
        if utilization >= self.config.low_water_bps as u128 {
            return false;
        }
        info!(
            utilization_bps = %utilization,
            "utilization back under low water mark, emergency mode cleared"
        );
        state.emergency = false;
        true
    }

    /// Operator override.
    pub fn clear_emergency(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.emergency {
                info!("emergency mode cleared");
            }
            state.emergency = false;
        }
    }

    pub fn status(&self) -> Status {
        match self.state.lock() {
            Ok(state) => self.snapshot(&state),
            Err(_) => Status {
                emergency: true,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SolvencyGuard {
        SolvencyGuard::new(
            Config {
                min_reserve: 1_000,
                max_liability_bps: 5_000,
                high_water_bps: 9_000,
                low_water_bps: 5_000,
                max_payout: Multiplier(1_000),
            },
            21_000,
        )
    }

    #[test]
    fn test_admit_within_ceiling() {
        let guard = guard();
        // ceiling = (21000 - 1000) * 50% = 10000, liability = stake * 10
        assert_eq!(guard.admit(500), Ok(5_000));
        assert_eq!(guard.status().open_liability, 5_000);
        assert_eq!(
            guard.admit(600),
            Err(SolvencyError::LimitExceeded {
                liability: 5_000,
                requested: 6_000,
                ceiling: 10_000
            })
        );
        guard.release(5_000);
        assert_eq!(guard.status().open_liability, 0);
    }

    #[test]
    fn test_emergency_mode() {
        let guard = guard();
        assert_eq!(guard.admit(900), Ok(9_000));
        assert!(guard.status().emergency);
        assert_eq!(guard.admit(1), Err(SolvencyError::EmergencyMode));

        guard.release(9_000);
        guard.clear_emergency();
        assert_eq!(guard.admit(1), Ok(10));
    }

    #[test]
    fn test_shrinking_bankroll_trips_emergency() {
        let guard = guard();
        assert_eq!(guard.admit(500), Ok(5_000));
        assert!(!guard.status().emergency);

        // ceiling drops to 5000 with 5000 already exposed
        guard.set_house_funds(11_000);
        let status = guard.status();
        assert_eq!(status.utilization_bps(), 10_000);
        assert!(status.emergency);
        assert_eq!(guard.admit(1), Err(SolvencyError::EmergencyMode));
    }

    #[test]
    fn test_rebalance_below_low_water() {
        let guard = guard();
        assert_eq!(guard.admit(900), Ok(9_000));
        assert!(guard.status().emergency);

        // Still at 90% utilization
        assert!(!guard.rebalance());
        assert_eq!(guard.admit(1), Err(SolvencyError::EmergencyMode));

        // 40% is under the low water mark
        guard.release(5_000);
        assert!(guard.rebalance());
        assert!(!guard.status().emergency);
        assert_eq!(guard.admit(1), Ok(10));

        // Nothing to clear
        assert!(!guard.rebalance());
    }

    #[test]
    fn test_reserve_blocks_everything() {
        let guard = guard();
        guard.set_house_funds(1_000);
        assert_eq!(guard.status().ceiling, 0);
        assert!(matches!(
            guard.admit(1),
            Err(SolvencyError::LimitExceeded { ceiling: 0, .. })
        ));
    }

    #[test]
    fn test_utilization() {
        let status = Status {
            house_funds: 0,
            open_liability: 25,
            ceiling: 100,
            emergency: false,
        };
        assert_eq!(status.utilization_bps(), 2_500);
    }
}
