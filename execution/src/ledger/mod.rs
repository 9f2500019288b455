//! Double-entry balance ledger.
//!
//! Every balance mutation writes an account row and an append-only [LedgerEntry] in one
//! atomic step. Bet locks and withdrawals are compare-and-swap writes against the account
//! version; [Ledger] wraps a [Store] and retries those on [LedgerError::VersionConflict].

use crate::round::Settlement;
use liftoff_types::{
    ledger::{BetLock, BetSettlement, Deposit, PayoutRecord, PayoutStatus, Totals, Withdrawal},
    Account, LedgerEntry, RoundId, RoundRecord, Wei,
};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

mod memory;
pub use memory::Memory;

/// Default number of compare-and-swap attempts before a conflict is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: Wei, requested: Wei },
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("no locked stake of {amount} for {user}")]
    LockMissing { user: String, amount: Wei },
    #[error("store error: {0}")]
    Store(String),
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::VersionConflict { .. } => "version_conflict",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::InvalidAmount => "invalid_amount",
            LedgerError::LockMissing { .. } => "lock_missing",
            LedgerError::Store(_) => "store_unavailable",
        }
    }
}

/// Persistence for balances, ledger entries, rounds, payouts and the deposit checkpoint.
///
/// Implementations must apply each mutating call atomically. Calls keyed by a client id
/// (locks, settlements, withdrawals) and deposits keyed by `(tx_hash, log_index)` are
/// idempotent: replaying one is a successful no-op.
pub trait Store: Clone + Send + Sync + 'static {
    /// Unknown users read as an empty account at version 0.
    fn account(&self, user: &str) -> impl Future<Output = Result<Account, LedgerError>> + Send;

    /// Move `amount` from available to locked if the account is still at `expected_version`.
    fn place_bet(&self, lock: BetLock)
        -> impl Future<Output = Result<Account, LedgerError>> + Send;

    /// Release the locked stake and credit the win. Returns false if already applied.
    fn process_win(
        &self,
        settlement: BetSettlement,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Release the locked stake to the house. Returns false if already applied.
    fn process_loss(
        &self,
        settlement: BetSettlement,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Credit a deposit. Returns false if `(tx_hash, log_index)` was already credited.
    fn record_deposit(
        &self,
        deposit: Deposit,
    ) -> impl Future<Output = Result<bool, LedgerError>> + Send;

    /// Debit available funds if the account is still at `expected_version`.
    fn withdraw(
        &self,
        withdrawal: Withdrawal,
    ) -> impl Future<Output = Result<Account, LedgerError>> + Send;

    /// Operator correction of available funds.
    fn adjust(
        &self,
        user: &str,
        delta: i128,
        reference: &str,
    ) -> impl Future<Output = Result<Account, LedgerError>> + Send;

    fn entries(&self, user: &str)
        -> impl Future<Output = Result<Vec<LedgerEntry>, LedgerError>> + Send;

    fn totals(&self) -> impl Future<Output = Result<Totals, LedgerError>> + Send;

    /// Last block fully processed by the deposit indexer.
    fn checkpoint(&self) -> impl Future<Output = Result<Option<u64>, LedgerError>> + Send;

    /// Move the checkpoint forward (never backward). Returns the stored value.
    fn advance_checkpoint(
        &self,
        block: u64,
    ) -> impl Future<Output = Result<u64, LedgerError>> + Send;

    fn save_round(&self, record: RoundRecord)
        -> impl Future<Output = Result<(), LedgerError>> + Send;

    fn round(
        &self,
        round_id: RoundId,
    ) -> impl Future<Output = Result<Option<RoundRecord>, LedgerError>> + Send;

    fn save_payout(
        &self,
        record: PayoutRecord,
    ) -> impl Future<Output = Result<(), LedgerError>> + Send;

    fn payout(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<PayoutRecord>, LedgerError>> + Send;

    fn payouts(
        &self,
        status: PayoutStatus,
    ) -> impl Future<Output = Result<Vec<PayoutRecord>, LedgerError>> + Send;
}

/// Ledger operations with optimistic concurrency retries.
#[derive(Clone)]
pub struct Ledger<S: Store> {
    store: S,
    max_attempts: usize,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: S) -> Self {
        Self::with_attempts(store, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_attempts(store: S, max_attempts: usize) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn balance(&self, user: &str) -> Result<Account, LedgerError> {
        self.store.account(user).await
    }

    /// Lock a stake for a bet, re-reading the account version on conflict.
    pub async fn lock_bet(
        &self,
        user: &str,
        amount: Wei,
        round_id: RoundId,
        client_id: &str,
    ) -> Result<Account, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut attempt = 1;
        loop {
            let account = self.store.account(user).await?;
            let lock = BetLock {
                user: user.to_string(),
                amount,
                round_id,
                client_id: client_id.to_string(),
                expected_version: account.version,
            };
            match self.store.place_bet(lock).await {
                Err(LedgerError::VersionConflict { expected, actual })
                    if attempt < self.max_attempts =>
                {
                    debug!(user, attempt, expected, actual, "bet lock conflict, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Debit available funds ahead of a payout, re-reading the account version on conflict.
    pub async fn withdraw(
        &self,
        user: &str,
        amount: Wei,
        client_id: &str,
    ) -> Result<Account, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let mut attempt = 1;
        loop {
            let account = self.store.account(user).await?;
            let withdrawal = Withdrawal {
                user: user.to_string(),
                amount,
                client_id: client_id.to_string(),
                expected_version: account.version,
            };
            match self.store.withdraw(withdrawal).await {
                Err(LedgerError::VersionConflict { expected, actual })
                    if attempt < self.max_attempts =>
                {
                    debug!(user, attempt, expected, actual, "withdraw conflict, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Post the outcome of a bet. Returns false if it had already been posted.
    pub async fn settle(&self, settlement: &Settlement) -> Result<bool, LedgerError> {
        let posting = BetSettlement {
            user: settlement.player.clone(),
            bet_amount: settlement.amount,
            win_amount: settlement.payout,
            round_id: settlement.round_id,
            client_id: settlement.client_id.clone(),
        };
        let applied = if settlement.won {
            self.store.process_win(posting).await?
        } else {
            self.store.process_loss(posting).await?
        };
        if !applied {
            warn!(
                round = settlement.round_id,
                player = %settlement.player,
                "settlement already posted"
            );
        }
        Ok(applied)
    }

    pub async fn record_deposit(&self, deposit: Deposit) -> Result<bool, LedgerError> {
        if deposit.amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.store.record_deposit(deposit).await
    }

    pub async fn adjust(
        &self,
        user: &str,
        delta: i128,
        reference: &str,
    ) -> Result<Account, LedgerError> {
        if delta == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.store.adjust(user, delta, reference).await
    }

    /// Compare the sum of all entries with the sum of all balances.
    pub async fn audit(&self) -> Result<Totals, LedgerError> {
        self.store.totals().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_types::OpType;

    fn deposit(user: &str, tx: &str, amount: Wei) -> Deposit {
        Deposit {
            tx_hash: tx.to_string(),
            log_index: 0,
            user: user.to_string(),
            amount,
        }
    }

    fn settlement(player: &str, amount: Wei, payout: Wei, won: bool) -> Settlement {
        Settlement {
            round_id: 1,
            player: player.to_string(),
            amount,
            payout,
            won,
            client_id: format!("1:{player}"),
        }
    }

    #[tokio::test]
    async fn test_lock_and_win() {
        let ledger = Ledger::new(Memory::default());
        assert!(ledger.record_deposit(deposit("alice", "0x01", 1_000)).await.unwrap());

        let account = ledger.lock_bet("alice", 400, 1, "1:alice").await.unwrap();
        assert_eq!(account.available, 600);
        assert_eq!(account.locked, 400);

        assert!(ledger.settle(&settlement("alice", 400, 800, true)).await.unwrap());
        let account = ledger.balance("alice").await.unwrap();
        assert_eq!(account.available, 1_400);
        assert_eq!(account.locked, 0);

        // Replays are no-ops
        assert!(!ledger.settle(&settlement("alice", 400, 800, true)).await.unwrap());
        assert_eq!(ledger.balance("alice").await.unwrap().available, 1_400);

        let ops: Vec<_> = ledger
            .store()
            .entries("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|entry| (entry.op, entry.delta))
            .collect();
        assert_eq!(
            ops,
            vec![
                (OpType::Deposit, 1_000),
                (OpType::BetLock, 0),
                (OpType::BetWin, 400)
            ]
        );
        assert_eq!(ledger.audit().await.unwrap().drift(), 0);
    }

    #[tokio::test]
    async fn test_loss_releases_lock() {
        let ledger = Ledger::new(Memory::default());
        ledger.record_deposit(deposit("bob", "0x02", 500)).await.unwrap();
        ledger.lock_bet("bob", 500, 1, "1:bob").await.unwrap();
        assert!(ledger.settle(&settlement("bob", 500, 0, false)).await.unwrap());

        let account = ledger.balance("bob").await.unwrap();
        assert_eq!(account.total(), 0);
        let totals = ledger.audit().await.unwrap();
        assert_eq!(totals.ledger, 0);
        assert_eq!(totals.drift(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let ledger = Ledger::new(Memory::default());
        ledger.record_deposit(deposit("carol", "0x03", 100)).await.unwrap();
        assert_eq!(
            ledger.lock_bet("carol", 101, 1, "1:carol").await,
            Err(LedgerError::InsufficientFunds {
                available: 100,
                requested: 101
            })
        );
        assert_eq!(
            ledger.lock_bet("carol", 0, 1, "1:carol").await,
            Err(LedgerError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let store = Memory::default();
        store.record_deposit(deposit("dave", "0x04", 100)).await.unwrap();
        let account = store.account("dave").await.unwrap();

        store.adjust("dave", 5, "bonus").await.unwrap();
        let stale = BetLock {
            user: "dave".into(),
            amount: 10,
            round_id: 1,
            client_id: "1:dave".into(),
            expected_version: account.version,
        };
        assert_eq!(
            store.place_bet(stale).await,
            Err(LedgerError::VersionConflict {
                expected: account.version,
                actual: account.version + 1
            })
        );
    }

    #[tokio::test]
    async fn test_concurrent_locks_never_overdraw() {
        let ledger = Ledger::with_attempts(Memory::default(), 20);
        ledger.record_deposit(deposit("erin", "0x05", 1_000)).await.unwrap();

        let mut handles = Vec::new();
        for round in 0..10u64 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .lock_bet("erin", 300, round, &format!("{round}:erin"))
                    .await
            }));
        }
        let mut locked = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                locked += 1;
            }
        }
        assert_eq!(locked, 3);
        let account = ledger.balance("erin").await.unwrap();
        assert_eq!(account.available, 100);
        assert_eq!(account.locked, 900);
    }

    #[tokio::test]
    async fn test_withdraw_and_adjust() {
        let ledger = Ledger::new(Memory::default());
        ledger.record_deposit(deposit("frank", "0x06", 1_000)).await.unwrap();

        let account = ledger.withdraw("frank", 250, "w-1").await.unwrap();
        assert_eq!(account.available, 750);
        // Same client id is not debited twice
        let account = ledger.withdraw("frank", 250, "w-1").await.unwrap();
        assert_eq!(account.available, 750);

        let account = ledger.adjust("frank", -50, "chargeback").await.unwrap();
        assert_eq!(account.available, 700);
        assert_eq!(
            ledger.adjust("frank", -701, "too much").await,
            Err(LedgerError::InsufficientFunds {
                available: 700,
                requested: 701
            })
        );
        let totals = ledger.audit().await.unwrap();
        assert_eq!(totals.ledger, 700);
        assert_eq!(totals.drift(), 0);
    }

    #[tokio::test]
    async fn test_deposit_idempotent() {
        let ledger = Ledger::new(Memory::default());
        assert!(ledger.record_deposit(deposit("gina", "0x07", 10)).await.unwrap());
        assert!(!ledger.record_deposit(deposit("gina", "0x07", 10)).await.unwrap());
        assert_eq!(ledger.balance("gina").await.unwrap().available, 10);
    }

    #[tokio::test]
    async fn test_settle_without_lock() {
        let ledger = Ledger::new(Memory::default());
        assert_eq!(
            ledger.settle(&settlement("henry", 10, 0, false)).await,
            Err(LedgerError::LockMissing {
                user: "henry".into(),
                amount: 10
            })
        );
    }
}
