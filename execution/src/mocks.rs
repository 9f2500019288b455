use crate::ledger::{Ledger, LedgerError, Memory, Store};
use liftoff_types::{
    ledger::{BetLock, BetSettlement, Deposit, PayoutRecord, PayoutStatus, Totals, Withdrawal},
    Account, Address, LedgerEntry, RoundId, RoundRecord, Wei,
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Server seed with published reference crash points (nonce 1 crashes at 1.69x).
pub const SERVER_SEED: &str = "a3f1c2e4b5d6978812345678901234567890abcdefabcdefabcdef0123456789";

/// Client seed paired with [SERVER_SEED].
pub const CLIENT_SEED: &str = "0000000000000000000301e2801a9a9598bfb114e574a91a887f2132f33047e6";

/// One ether in wei.
pub const ETHER: Wei = 1_000_000_000_000_000_000;

/// Deterministic user address for a test seed.
pub fn create_address(seed: u64) -> Address {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut bytes = [0u8; 20];
    rng.fill_bytes(&mut bytes);
    format!("0x{}", commonware_utils::hex(&bytes))
}

/// Credit `amount` to each user through the deposit path.
pub async fn fund<S: Store>(
    ledger: &Ledger<S>,
    users: &[&str],
    amount: Wei,
) -> Result<(), LedgerError> {
    for user in users {
        ledger
            .record_deposit(Deposit {
                tx_hash: format!("0xfund-{user}"),
                log_index: 0,
                user: user.to_string(),
                amount,
            })
            .await?;
    }
    Ok(())
}

/// In-memory ledger with every user pre-funded.
pub async fn create_funded_ledger(
    users: &[&str],
    amount: Wei,
) -> Result<Ledger<Memory>, LedgerError> {
    let ledger = Ledger::new(Memory::default());
    fund(&ledger, users, amount).await?;
    Ok(ledger)
}

/// [Memory] with injected store outages.
#[derive(Clone, Default)]
pub struct Flaky {
    inner: Memory,
    settlements: Arc<AtomicUsize>,
    payout_reads: Arc<AtomicUsize>,
    payout_writes: Arc<AtomicUsize>,
}

impl Flaky {
    /// Fail the next `count` wins or losses.
    pub fn fail_settlements(&self, count: usize) {
        self.settlements.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` payout listings.
    pub fn fail_payout_reads(&self, count: usize) {
        self.payout_reads.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` payout saves.
    pub fn fail_payout_writes(&self, count: usize) {
        self.payout_writes.store(count, Ordering::SeqCst);
    }

    fn outage(remaining: &AtomicUsize) -> Result<(), LedgerError> {
        let failed = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LedgerError::Store("connection reset".into()));
        }
        Ok(())
    }
}

impl Store for Flaky {
    async fn account(&self, user: &str) -> Result<Account, LedgerError> {
        self.inner.account(user).await
    }

    async fn place_bet(&self, lock: BetLock) -> Result<Account, LedgerError> {
        self.inner.place_bet(lock).await
    }

    async fn process_win(&self, settlement: BetSettlement) -> Result<bool, LedgerError> {
        Self::outage(&self.settlements)?;
        self.inner.process_win(settlement).await
    }

    async fn process_loss(&self, settlement: BetSettlement) -> Result<bool, LedgerError> {
        Self::outage(&self.settlements)?;
        self.inner.process_loss(settlement).await
    }

    async fn record_deposit(&self, deposit: Deposit) -> Result<bool, LedgerError> {
        self.inner.record_deposit(deposit).await
    }

    async fn withdraw(&self, withdrawal: Withdrawal) -> Result<Account, LedgerError> {
        self.inner.withdraw(withdrawal).await
    }

    async fn adjust(
        &self,
        user: &str,
        delta: i128,
        reference: &str,
    ) -> Result<Account, LedgerError> {
        self.inner.adjust(user, delta, reference).await
    }

    async fn entries(&self, user: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.entries(user).await
    }

    async fn totals(&self) -> Result<Totals, LedgerError> {
        self.inner.totals().await
    }

    async fn checkpoint(&self) -> Result<Option<u64>, LedgerError> {
        self.inner.checkpoint().await
    }

    async fn advance_checkpoint(&self, block: u64) -> Result<u64, LedgerError> {
        self.inner.advance_checkpoint(block).await
    }

    async fn save_round(&self, record: RoundRecord) -> Result<(), LedgerError> {
        self.inner.save_round(record).await
    }

    async fn round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, LedgerError> {
        self.inner.round(round_id).await
    }

    async fn save_payout(&self, record: PayoutRecord) -> Result<(), LedgerError> {
        Self::outage(&self.payout_writes)?;
        self.inner.save_payout(record).await
    }

    async fn payout(&self, id: &str) -> Result<Option<PayoutRecord>, LedgerError> {
        self.inner.payout(id).await
    }

    async fn payouts(&self, status: PayoutStatus) -> Result<Vec<PayoutRecord>, LedgerError> {
        Self::outage(&self.payout_reads)?;
        self.inner.payouts(status).await
    }
}
