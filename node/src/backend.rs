//! Connects the gateway to the engine, cashier and ledger.

use crate::{
    cashier::Cashier,
    chain::{Chain, Signer},
    engine::{Mailbox, MailboxError},
};
use liftoff_execution::{GameError, Ledger, Store};
use liftoff_gateway::{Backend, Rejection};
use liftoff_types::{Multiplier, RoundId, RoundRecord, Wei};
use tracing::warn;

fn rejected(e: GameError) -> Rejection {
    Rejection::new(e.code(), e.to_string())
}

fn unavailable(e: MailboxError) -> Rejection {
    warn!(?e, "engine unreachable");
    rejected(GameError::Unavailable)
}

pub struct Game<S: Store, C: Chain, Sg: Signer> {
    mailbox: Mailbox,
    cashier: Cashier<S, C, Sg>,
    ledger: Ledger<S>,
}

impl<S: Store, C: Chain, Sg: Signer> Clone for Game<S, C, Sg> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            cashier: self.cashier.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

impl<S: Store, C: Chain, Sg: Signer> Game<S, C, Sg> {
    pub fn new(mailbox: Mailbox, cashier: Cashier<S, C, Sg>, ledger: Ledger<S>) -> Self {
        Self {
            mailbox,
            cashier,
            ledger,
        }
    }
}

impl<S: Store, C: Chain, Sg: Signer> Backend for Game<S, C, Sg> {
    async fn place_bet(
        &self,
        user: &str,
        amount: Wei,
        auto_cashout: Option<Multiplier>,
    ) -> Result<(), Rejection> {
        self.mailbox
            .place_bet(user.to_string(), amount, auto_cashout)
            .await
            .map_err(unavailable)?
            .map(|_| ())
            .map_err(rejected)
    }

    async fn cash_out(&self, user: &str) -> Result<(), Rejection> {
        self.mailbox
            .cash_out(user.to_string())
            .await
            .map_err(unavailable)?
            .map(|_| ())
            .map_err(rejected)
    }

    async fn withdraw(&self, user: &str, to: &str, amount: Wei) -> Result<String, Rejection> {
        self.cashier
            .withdraw(user, to, amount)
            .await
            .map(|record| record.id)
            .map_err(|e| Rejection::new(e.code(), e.to_string()))
    }

    async fn round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, Rejection> {
        self.ledger
            .store()
            .round(round_id)
            .await
            .map_err(|e| Rejection::new(e.code(), e.to_string()))
    }
}
