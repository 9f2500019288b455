//! The round state machine.
//!
//! `Waiting -> Betting -> Running -> Crashed`. The [Round] knows nothing about clocks:
//! callers pass the time elapsed since the round started running, which keeps every
//! transition deterministic and lets a single loop own all mutation.

use crate::{
    curve::{elapsed_for, multiplier_at},
    fair,
    ledger::LedgerError,
    solvency::SolvencyError,
};
use liftoff_types::{Bet, BetStatus, Multiplier, Phase, RoundId, RoundRecord, UserId, Wei};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("betting is closed for round {0}")]
    PhaseClosed(RoundId),
    #[error("player already has a bet in round {0}")]
    DuplicateBet(RoundId),
    #[error("no open bet in round {0}")]
    NoOpenBet(RoundId),
    #[error("bet in round {0} was already cashed out")]
    AlreadyCashedOut(RoundId),
    #[error("round {0} is not running")]
    NotRunning(RoundId),
    #[error("round {0} has crashed")]
    RoundCrashed(RoundId),
    #[error("round {0} was already settled")]
    AlreadySettled(RoundId),
    #[error("no round in progress")]
    NoRound,
    #[error("bet amount {amount} outside [{min}, {max}]")]
    InvalidAmount { amount: Wei, min: Wei, max: Wei },
    #[error("auto cashout {0} is outside the allowed range")]
    InvalidAutoCashout(Multiplier),
    #[error(transparent)]
    Solvency(#[from] SolvencyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("game engine unavailable")]
    Unavailable,
}

impl GameError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::PhaseClosed(_) => "phase_closed",
            GameError::DuplicateBet(_) => "duplicate_bet",
            GameError::NoOpenBet(_) => "no_open_bet",
            GameError::AlreadyCashedOut(_) => "already_cashed_out",
            GameError::NotRunning(_) => "not_running",
            GameError::RoundCrashed(_) => "round_crashed",
            GameError::AlreadySettled(_) => "already_settled",
            GameError::NoRound => "no_round",
            GameError::InvalidAmount { .. } => "invalid_amount",
            GameError::InvalidAutoCashout(_) => "invalid_auto_cashout",
            GameError::Solvency(_) => "solvency_limit_exceeded",
            GameError::Ledger(err) => err.code(),
            GameError::Unavailable => "unavailable",
        }
    }
}

/// A bet leaving the curve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cashout {
    pub player: UserId,
    pub multiplier: Multiplier,
    pub payout: Wei,
}

/// Final outcome of one bet, posted to the ledger exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub round_id: RoundId,
    pub player: UserId,
    pub amount: Wei,
    /// Zero for a loss.
    pub payout: Wei,
    pub won: bool,
    pub client_id: String,
}

/// Everything that happened when a round crashed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrashOutcome {
    /// Auto cashouts whose target sat below the crash point but were not reached by a tick.
    pub cashouts: Vec<Cashout>,
    pub settlements: Vec<Settlement>,
}

pub struct Round {
    id: RoundId,
    server_seed: String,
    seed_hash: String,
    client_seed: String,
    crash_point: Multiplier,
    max_payout: Multiplier,
    phase: Phase,
    started_at: u64,
    crashed_at: Option<u64>,
    bets: BTreeMap<UserId, Bet>,
}

impl Round {
    /// Commit to a round. The crash point is computed here and never again.
    pub fn commit(
        id: RoundId,
        server_seed: String,
        client_seed: String,
        max_payout: Multiplier,
        now: u64,
    ) -> Self {
        let seed_hash = fair::seed_hash(&server_seed);
        let crash_point = fair::crash_point(&server_seed, &client_seed, id);
        Self {
            id,
            server_seed,
            seed_hash,
            client_seed,
            crash_point,
            max_payout,
            phase: Phase::Waiting,
            started_at: now,
            crashed_at: None,
            bets: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    /// Rounds use their id as the provably-fair nonce.
    pub fn nonce(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn seed_hash(&self) -> &str {
        &self.seed_hash
    }

    pub fn client_seed(&self) -> &str {
        &self.client_seed
    }

    /// Only published once the round has crashed.
    pub fn server_seed(&self) -> Option<&str> {
        (self.phase == Phase::Crashed).then_some(self.server_seed.as_str())
    }

    pub fn crash_point(&self) -> Multiplier {
        self.crash_point
    }

    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.bets.values()
    }

    pub fn bet(&self, player: &str) -> Option<&Bet> {
        self.bets.get(player)
    }

    /// Running time after which the curve has reached the crash point.
    pub fn crash_elapsed(&self) -> u64 {
        elapsed_for(self.crash_point)
    }

    pub fn has_crashed_at(&self, elapsed_ms: u64) -> bool {
        multiplier_at(elapsed_ms) >= self.crash_point
    }

    pub fn open_betting(&mut self) -> Result<(), GameError> {
        if self.phase != Phase::Waiting {
            return Err(GameError::PhaseClosed(self.id));
        }
        self.phase = Phase::Betting;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), GameError> {
        if self.phase != Phase::Betting {
            return Err(GameError::NotRunning(self.id));
        }
        self.phase = Phase::Running;
        Ok(())
    }

    /// Validate a bet before any funds move.
    ///
    /// `in_grace` is true while the round is running but still inside the late bet window.
    pub fn check_bet(&self, player: &str, in_grace: bool) -> Result<(), GameError> {
        match self.phase {
            Phase::Betting => {}
            Phase::Running if in_grace => {}
            _ => return Err(GameError::PhaseClosed(self.id)),
        }
        if self.bets.contains_key(player) {
            return Err(GameError::DuplicateBet(self.id));
        }
        Ok(())
    }

    /// Record a bet whose stake is already locked.
    pub fn insert_bet(&mut self, bet: Bet) {
        self.bets.insert(bet.player.clone(), bet);
    }

    /// Cash a player out at the curve value `elapsed_ms` into the run.
    pub fn cash_out(&mut self, player: &str, elapsed_ms: u64) -> Result<Cashout, GameError> {
        match self.phase {
            Phase::Running => {}
            Phase::Crashed => return Err(GameError::RoundCrashed(self.id)),
            _ => return Err(GameError::NotRunning(self.id)),
        }
        let current = multiplier_at(elapsed_ms);
        if current >= self.crash_point {
            return Err(GameError::RoundCrashed(self.id));
        }
        let multiplier = current.min(self.max_payout);
        let bet = self
            .bets
            .get_mut(player)
            .ok_or(GameError::NoOpenBet(self.id))?;
        if bet.status != BetStatus::Open {
            return Err(GameError::AlreadyCashedOut(self.id));
        }
        Ok(Self::exit(bet, multiplier))
    }

    /// Cash out every open bet whose target (auto cashout, capped by the maximum payout
    /// multiplier) has been reached by `elapsed_ms`.
    pub fn auto_cash_outs(&mut self, elapsed_ms: u64) -> Vec<Cashout> {
        if self.phase != Phase::Running {
            return Vec::new();
        }
        self.cash_out_targets(multiplier_at(elapsed_ms))
    }

    /// Crash the round and compute one settlement per bet.
    pub fn crash(&mut self, now: u64) -> Result<CrashOutcome, GameError> {
        match self.phase {
            Phase::Running => {}
            Phase::Crashed => return Err(GameError::AlreadySettled(self.id)),
            _ => return Err(GameError::NotRunning(self.id)),
        }

        // Targets below the crash point were reached before the crash, even if no tick saw it
        let below = Multiplier(self.crash_point.hundredths().saturating_sub(1));
        let cashouts = self.cash_out_targets(below);

        self.phase = Phase::Crashed;
        self.crashed_at = Some(now);

        let settlements = self
            .bets
            .values_mut()
            .map(|bet| {
                let won = matches!(bet.cashout, Some(multiplier) if multiplier < self.crash_point);
                bet.status = if won { BetStatus::Won } else { BetStatus::Lost };
                if !won {
                    bet.payout = 0;
                }
                Settlement {
                    round_id: self.id,
                    player: bet.player.clone(),
                    amount: bet.amount,
                    payout: bet.payout,
                    won,
                    client_id: Bet::client_id(self.id, &bet.player),
                }
            })
            .collect();
        Ok(CrashOutcome {
            cashouts,
            settlements,
        })
    }

    /// Verification record (seed only present once crashed).
    pub fn record(&self) -> RoundRecord {
        RoundRecord {
            round_id: self.id,
            seed_hash: self.seed_hash.clone(),
            server_seed: self.server_seed().map(str::to_string),
            client_seed: self.client_seed.clone(),
            nonce: self.nonce(),
            crash_point: (self.phase == Phase::Crashed).then_some(self.crash_point),
            started_at: self.started_at,
            crashed_at: self.crashed_at,
        }
    }

    fn cash_out_targets(&mut self, reached: Multiplier) -> Vec<Cashout> {
        let max_payout = self.max_payout;
        let crash_point = self.crash_point;
        self.bets
            .values_mut()
            .filter(|bet| bet.status == BetStatus::Open)
            .filter_map(|bet| {
                let target = bet.auto_cashout.unwrap_or(max_payout).min(max_payout);
                (target <= reached && target < crash_point).then(|| Self::exit(bet, target))
            })
            .collect()
    }

    fn exit(bet: &mut Bet, multiplier: Multiplier) -> Cashout {
        bet.cashout = Some(multiplier);
        bet.payout = multiplier.apply(bet.amount);
        bet.status = BetStatus::CashedOut;
        Cashout {
            player: bet.player.clone(),
            multiplier,
            payout: bet.payout,
        }
    }
}
