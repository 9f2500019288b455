use super::{
    ingress::{stopped, Mailbox, Message},
    Config, Publisher, SeedSource,
};
use futures::{channel::mpsc, StreamExt};
use liftoff_execution::{
    curve::multiplier_at, Cashout, GameError, Ledger, Round, Settlement, SolvencyGuard, Store,
};
use liftoff_types::{
    api::{BetPlaced, MultiplierUpdate, PlayerCashedOut, RoundCrashed, RoundStarted},
    now_millis, Bet, Event, Multiplier, Phase, RoundId, UserId, Wei,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

pub struct Actor<S: Store, P: Publisher, R: SeedSource> {
    config: Config,
    ledger: Ledger<S>,
    solvency: Arc<SolvencyGuard>,
    publisher: P,
    seeds: R,
    mailbox: mpsc::Receiver<Message>,
    stopped: watch::Receiver<bool>,

    next_round: RoundId,
    round: Option<Round>,
    running_since: Option<Instant>,
    deadline: Instant,
    liabilities: HashMap<UserId, Wei>,
    unsettled: Vec<Settlement>,
}

impl<S: Store, P: Publisher, R: SeedSource> Actor<S, P, R> {
    pub fn new(
        config: Config,
        ledger: Ledger<S>,
        solvency: Arc<SolvencyGuard>,
        publisher: P,
        seeds: R,
        stopped: watch::Receiver<bool>,
    ) -> (Self, Mailbox) {
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);
        let inbound = Mailbox::new(sender, stopped.clone());
        (
            Self {
                config,
                ledger,
                solvency,
                publisher,
                seeds,
                mailbox,
                stopped,
                next_round: 1,
                round: None,
                running_since: None,
                deadline: Instant::now(),
                liabilities: HashMap::new(),
                unsettled: Vec::new(),
            },
            inbound,
        )
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.new_round().await;
        loop {
            let running = self.running_since.is_some();
            let deadline = self.deadline;
            tokio::select! {
                _ = stopped(self.stopped.clone()) => break,
                message = self.mailbox.next() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.advance().await,
                _ = ticker.tick(), if running => self.tick().await,
            }
        }
        if let Some(round) = &self.round {
            info!(round = round.id(), phase = ?round.phase(), "round engine stopped");
        }
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::PlaceBet {
                user,
                amount,
                auto_cashout,
                response,
            } => {
                let result = self.place_bet(user, amount, auto_cashout).await;
                let _ = response.send(result);
            }
            Message::CashOut { user, response } => {
                let result = self.cash_out(&user);
                let _ = response.send(result);
            }
        }
    }

    fn elapsed_ms(&self, now: Instant) -> u64 {
        self.running_since.map_or(0, |since| {
            now.saturating_duration_since(since).as_millis() as u64
        })
    }

    async fn new_round(&mut self) {
        self.retry_unsettled().await;

        let id = self.next_round;
        self.next_round += 1;
        let mut round = Round::commit(
            id,
            self.seeds.next_seed(),
            self.config.client_seed.clone(),
            self.config.max_payout,
            now_millis(),
        );
        if let Err(e) = self.ledger.store().save_round(round.record()).await {
            error!(?e, round = id, "failed to persist round commitment");
        }
        if let Err(e) = round.open_betting() {
            error!(?e, round = id, "failed to open betting");
        }
        info!(round = id, seed_hash = round.seed_hash(), "betting open");
        self.publisher.publish(Event::RoundStarted(RoundStarted {
            round_id: id,
            seed_hash: round.seed_hash().to_string(),
            client_seed: round.client_seed().to_string(),
            nonce: round.nonce(),
            betting_ms: self.config.betting.as_millis() as u64,
        }));

        self.round = Some(round);
        self.running_since = None;
        self.deadline = Instant::now() + self.config.betting;
    }

    /// Move to the next phase once the current deadline passes.
    async fn advance(&mut self) {
        let Some(round) = self.round.as_mut() else {
            self.new_round().await;
            return;
        };
        match round.phase() {
            Phase::Betting => {
                if let Err(e) = round.start() {
                    error!(?e, round = round.id(), "failed to start round");
                    return;
                }
                let now = Instant::now();
                self.running_since = Some(now);
                self.deadline = now + Duration::from_millis(round.crash_elapsed());
                info!(round = round.id(), bets = round.bets().count(), "round running");
                self.publisher
                    .publish(Event::MultiplierUpdate(MultiplierUpdate {
                        round_id: round.id(),
                        multiplier: Multiplier::ONE,
                        elapsed_ms: 0,
                    }));
            }
            Phase::Running => self.crash().await,
            Phase::Crashed | Phase::Waiting => self.new_round().await,
        }
    }

    async fn tick(&mut self) {
        let elapsed = self.elapsed_ms(Instant::now());
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if round.phase() != Phase::Running {
            return;
        }
        if round.has_crashed_at(elapsed) {
            self.crash().await;
            return;
        }
        let round_id = round.id();
        let cashouts = round.auto_cash_outs(elapsed);
        self.publisher
            .publish(Event::MultiplierUpdate(MultiplierUpdate {
                round_id,
                multiplier: multiplier_at(elapsed),
                elapsed_ms: elapsed,
            }));
        for cashout in cashouts {
            self.publish_cashout(round_id, cashout);
        }
    }

    fn publish_cashout(&self, round_id: RoundId, cashout: Cashout) {
        debug!(
            round = round_id,
            player = %cashout.player,
            multiplier = %cashout.multiplier,
            "cashed out"
        );
        self.publisher
            .publish(Event::PlayerCashedOut(PlayerCashedOut {
                round_id,
                player: cashout.player,
                multiplier: cashout.multiplier,
                payout: cashout.payout,
            }));
    }

    async fn crash(&mut self) {
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let outcome = match round.crash(now_millis()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(?e, round = round.id(), "ignoring crash");
                return;
            }
        };
        let round_id = round.id();
        let crash_point = round.crash_point();
        let record = round.record();

        for cashout in outcome.cashouts {
            self.publish_cashout(round_id, cashout);
        }
        let mut winners = 0;
        let mut losers = 0;
        for settlement in outcome.settlements {
            if settlement.won {
                winners += 1;
            } else {
                losers += 1;
            }
            if let Some(liability) = self.liabilities.remove(&settlement.player) {
                self.solvency.release(liability);
            }
            self.settle(settlement).await;
        }

        info!(round = round_id, %crash_point, winners, losers, "round crashed");
        self.publisher.publish(Event::RoundCrashed(RoundCrashed {
            round_id,
            crash_point,
            server_seed: record.server_seed.clone().unwrap_or_default(),
            seed_hash: record.seed_hash.clone(),
            winners,
            losers,
        }));
        if let Err(e) = self.ledger.store().save_round(record).await {
            error!(?e, round = round_id, "failed to persist revealed round");
        }

        self.running_since = None;
        self.deadline = Instant::now() + self.config.cooldown;
    }

    async fn settle(&mut self, settlement: Settlement) {
        if let Err(e) = self.ledger.settle(&settlement).await {
            error!(
                ?e,
                round = settlement.round_id,
                player = %settlement.player,
                "settlement failed, will retry"
            );
            self.unsettled.push(settlement);
        }
    }

    async fn retry_unsettled(&mut self) {
        for settlement in std::mem::take(&mut self.unsettled) {
            self.settle(settlement).await;
        }
    }

    async fn place_bet(
        &mut self,
        user: UserId,
        amount: Wei,
        auto_cashout: Option<Multiplier>,
    ) -> Result<Bet, GameError> {
        let (min, max) = (self.config.min_bet, self.config.max_bet);
        if amount < min || amount > max {
            return Err(GameError::InvalidAmount { amount, min, max });
        }
        if let Some(target) = auto_cashout {
            if target <= Multiplier::ONE || target > self.config.max_payout {
                return Err(GameError::InvalidAutoCashout(target));
            }
        }

        let now = Instant::now();
        let elapsed = self.elapsed_ms(now);
        let in_grace = self
            .running_since
            .is_some_and(|since| now.saturating_duration_since(since) < self.config.grace);
        let round = self.round.as_ref().ok_or(GameError::NoRound)?;
        round.check_bet(&user, in_grace)?;
        let round_id = round.id();
        if round.phase() == Phase::Running {
            if round.has_crashed_at(elapsed) {
                return Err(GameError::PhaseClosed(round_id));
            }
            // A late target the curve already passed would pay out below the live multiplier
            if let Some(target) = auto_cashout {
                if target <= multiplier_at(elapsed) {
                    return Err(GameError::InvalidAutoCashout(target));
                }
            }
        }

        let liability = self.solvency.admit(amount)?;
        let client_id = Bet::client_id(round_id, &user);
        if let Err(e) = self
            .ledger
            .lock_bet(&user, amount, round_id, &client_id)
            .await
        {
            self.solvency.release(liability);
            return Err(e.into());
        }

        let bet = Bet::new(user.clone(), amount, auto_cashout);
        if let Some(round) = self.round.as_mut() {
            round.insert_bet(bet.clone());
        }
        self.liabilities.insert(user.clone(), liability);
        debug!(round = round_id, player = %user, amount = %amount, "bet placed");
        self.publisher.publish(Event::BetPlaced(BetPlaced {
            round_id,
            player: user,
            amount,
            auto_cashout,
        }));
        Ok(bet)
    }

    fn cash_out(&mut self, user: &str) -> Result<Cashout, GameError> {
        let elapsed = self.elapsed_ms(Instant::now());
        let round = self.round.as_mut().ok_or(GameError::NoRound)?;
        let cashout = round.cash_out(user, elapsed)?;
        let round_id = round.id();
        self.publish_cashout(round_id, cashout.clone());
        Ok(cashout)
    }
}
