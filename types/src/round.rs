use crate::{
    api::{BetPlaced, Event, PlayerCashedOut},
    RoundId, UserId, Wei,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A multiplier expressed in hundredths (`100` == 1.00x).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(pub u64);

impl Multiplier {
    /// 1.00x, the value every round starts at.
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn hundredths(self) -> u64 {
        self.0
    }

    /// Stake times multiplier, rounded down to the nearest wei.
    pub fn apply(self, amount: Wei) -> Wei {
        amount.saturating_mul(self.0 as Wei) / 100
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

/// Round lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Waiting,
    Betting,
    Running,
    Crashed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Placed and still riding the curve.
    Open,
    /// Cashed out, waiting for the round to settle.
    CashedOut,
    Won,
    Lost,
}

/// A single player's wager in a round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub player: UserId,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    pub auto_cashout: Option<Multiplier>,
    pub cashout: Option<Multiplier>,
    #[serde(with = "crate::wei")]
    pub payout: Wei,
    pub status: BetStatus,
}

impl Bet {
    pub fn new(player: UserId, amount: Wei, auto_cashout: Option<Multiplier>) -> Self {
        Self {
            player,
            amount,
            auto_cashout,
            cashout: None,
            payout: 0,
            status: BetStatus::Open,
        }
    }

    /// Idempotency key used for every ledger posting this bet produces.
    pub fn client_id(round_id: RoundId, player: &str) -> String {
        format!("{round_id}:{player}")
    }
}

/// Everything a third party needs to recompute a round's crash point.
///
/// `server_seed` stays `None` until the round has crashed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round_id: RoundId,
    pub seed_hash: String,
    pub server_seed: Option<String>,
    pub client_seed: String,
    pub nonce: u64,
    pub crash_point: Option<Multiplier>,
    pub started_at: u64,
    pub crashed_at: Option<u64>,
}

/// Full view of the current round, sent to clients that cannot be caught up by replay.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    /// Id of the last event folded into this snapshot.
    pub last_event_id: u64,
    pub round_id: Option<RoundId>,
    pub phase: Phase,
    pub seed_hash: Option<String>,
    pub multiplier: Option<Multiplier>,
    pub crash_point: Option<Multiplier>,
    pub bets: Vec<Bet>,
}

impl RoundSnapshot {
    /// Fold a published event into the snapshot.
    pub fn apply(&mut self, id: u64, event: &Event) {
        match event {
            Event::RoundStarted(started) => {
                self.round_id = Some(started.round_id);
                self.phase = Phase::Betting;
                self.seed_hash = Some(started.seed_hash.clone());
                self.multiplier = Some(Multiplier::ONE);
                self.crash_point = None;
                self.bets.clear();
            }
            Event::MultiplierUpdate(update) => {
                self.phase = Phase::Running;
                self.multiplier = Some(update.multiplier);
            }
            Event::BetPlaced(BetPlaced {
                player,
                amount,
                auto_cashout,
                ..
            }) => {
                self.bets
                    .push(Bet::new(player.clone(), *amount, *auto_cashout));
            }
            Event::PlayerCashedOut(PlayerCashedOut {
                player,
                multiplier,
                payout,
                ..
            }) => {
                if let Some(bet) = self.bets.iter_mut().find(|bet| &bet.player == player) {
                    bet.cashout = Some(*multiplier);
                    bet.payout = *payout;
                    bet.status = BetStatus::CashedOut;
                }
            }
            Event::RoundCrashed(crashed) => {
                self.phase = Phase::Crashed;
                self.crash_point = Some(crashed.crash_point);
                self.multiplier = Some(crashed.crash_point);
                for bet in self.bets.iter_mut() {
                    bet.status = match bet.status {
                        BetStatus::CashedOut => BetStatus::Won,
                        BetStatus::Open => BetStatus::Lost,
                        status => status,
                    };
                }
            }
            Event::SyncTick(_) | Event::Snapshot(_) | Event::Reply(_) => {}
        }
        self.last_event_id = id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MultiplierUpdate, RoundCrashed, RoundStarted};

    #[test]
    fn test_multiplier_display() {
        assert_eq!(Multiplier(100).to_string(), "1.00x");
        assert_eq!(Multiplier(169).to_string(), "1.69x");
        assert_eq!(Multiplier(1_000_000).to_string(), "10000.00x");
        assert_eq!(Multiplier(105).to_string(), "1.05x");
    }

    #[test]
    fn test_multiplier_apply_rounds_down() {
        assert_eq!(Multiplier(169).apply(1_000), 1_690);
        assert_eq!(Multiplier(133).apply(7), 9);
        assert_eq!(Multiplier::ONE.apply(42), 42);
    }

    #[test]
    fn test_phase_wire_format() {
        assert_eq!(serde_json::to_string(&Phase::Running).unwrap(), "\"RUNNING\"");
    }

    #[test]
    fn test_snapshot_folds_round() {
        let mut snapshot = RoundSnapshot::default();
        snapshot.apply(
            1,
            &Event::RoundStarted(RoundStarted {
                round_id: 7,
                seed_hash: "abc".into(),
                client_seed: "client".into(),
                nonce: 7,
                betting_ms: 5_000,
            }),
        );
        snapshot.apply(
            2,
            &Event::BetPlaced(BetPlaced {
                round_id: 7,
                player: "alice".into(),
                amount: 100,
                auto_cashout: None,
            }),
        );
        snapshot.apply(
            3,
            &Event::BetPlaced(BetPlaced {
                round_id: 7,
                player: "bob".into(),
                amount: 50,
                auto_cashout: None,
            }),
        );
        snapshot.apply(
            4,
            &Event::MultiplierUpdate(MultiplierUpdate {
                round_id: 7,
                multiplier: Multiplier(150),
                elapsed_ms: 6_800,
            }),
        );
        snapshot.apply(
            5,
            &Event::PlayerCashedOut(PlayerCashedOut {
                round_id: 7,
                player: "alice".into(),
                multiplier: Multiplier(150),
                payout: 150,
            }),
        );
        assert_eq!(snapshot.phase, Phase::Running);
        snapshot.apply(
            6,
            &Event::RoundCrashed(RoundCrashed {
                round_id: 7,
                crash_point: Multiplier(169),
                server_seed: "seed".into(),
                seed_hash: "abc".into(),
                winners: 1,
                losers: 1,
            }),
        );

        assert_eq!(snapshot.last_event_id, 6);
        assert_eq!(snapshot.phase, Phase::Crashed);
        assert_eq!(snapshot.crash_point, Some(Multiplier(169)));
        assert_eq!(snapshot.bets[0].status, BetStatus::Won);
        assert_eq!(snapshot.bets[0].payout, 150);
        assert_eq!(snapshot.bets[1].status, BetStatus::Lost);
    }
}
