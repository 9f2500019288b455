use super::{LedgerError, Store};
use liftoff_types::{
    ledger::{BetLock, BetSettlement, Deposit, PayoutRecord, PayoutStatus, Totals, Withdrawal},
    now_millis, Account, LedgerEntry, OpType, RoundId, RoundRecord, TxHash, UserId, Wei,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Default)]
struct Inner {
    accounts: HashMap<UserId, Account>,
    entries: Vec<LedgerEntry>,
    applied: HashSet<String>,
    deposits: HashSet<(TxHash, u32)>,
    checkpoint: Option<u64>,
    rounds: BTreeMap<RoundId, RoundRecord>,
    payouts: HashMap<String, PayoutRecord>,
}

impl Inner {
    fn account(&mut self, user: &str) -> &mut Account {
        self.accounts
            .entry(user.to_string())
            .or_insert_with(|| Account::new(user.to_string()))
    }

    fn push(&mut self, user: &str, op: OpType, amount: Wei, delta: i128, reference: String) {
        let id = self.entries.len() as u64 + 1;
        self.entries.push(LedgerEntry {
            id,
            user: user.to_string(),
            op,
            amount,
            delta,
            reference,
            created_at: now_millis(),
        });
    }

    fn check_version(account: &Account, expected: u64) -> Result<(), LedgerError> {
        if account.version != expected {
            return Err(LedgerError::VersionConflict {
                expected,
                actual: account.version,
            });
        }
        Ok(())
    }

    fn release(&mut self, user: &str, amount: Wei) -> Result<&mut Account, LedgerError> {
        let account = self.account(user);
        if account.locked < amount {
            return Err(LedgerError::LockMissing {
                user: user.to_string(),
                amount,
            });
        }
        account.locked -= amount;
        Ok(account)
    }
}

/// In-process [Store] used by tests and single-node deployments.
#[derive(Clone, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

impl Memory {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LedgerError> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Store("ledger lock poisoned".into()))
    }
}

impl Store for Memory {
    async fn account(&self, user: &str) -> Result<Account, LedgerError> {
        let inner = self.lock()?;
        Ok(inner
            .accounts
            .get(user)
            .cloned()
            .unwrap_or_else(|| Account::new(user.to_string())))
    }

    async fn place_bet(&self, lock: BetLock) -> Result<Account, LedgerError> {
        let mut inner = self.lock()?;
        let key = format!("lock:{}", lock.client_id);
        if inner.applied.contains(&key) {
            return Ok(inner.account(&lock.user).clone());
        }
        let account = inner.account(&lock.user);
        Inner::check_version(account, lock.expected_version)?;
        if account.available < lock.amount {
            return Err(LedgerError::InsufficientFunds {
                available: account.available,
                requested: lock.amount,
            });
        }
        account.available -= lock.amount;
        account.locked += lock.amount;
        account.version += 1;
        let updated = account.clone();

        inner.applied.insert(key);
        inner.push(&lock.user, OpType::BetLock, lock.amount, 0, lock.client_id);
        Ok(updated)
    }

    async fn process_win(&self, settlement: BetSettlement) -> Result<bool, LedgerError> {
        let mut inner = self.lock()?;
        let key = format!("settle:{}", settlement.client_id);
        if inner.applied.contains(&key) {
            return Ok(false);
        }
        let account = inner.release(&settlement.user, settlement.bet_amount)?;
        account.available += settlement.win_amount;
        account.version += 1;

        inner.applied.insert(key);
        let delta = settlement.win_amount as i128 - settlement.bet_amount as i128;
        inner.push(
            &settlement.user,
            OpType::BetWin,
            settlement.win_amount,
            delta,
            settlement.client_id,
        );
        Ok(true)
    }

    async fn process_loss(&self, settlement: BetSettlement) -> Result<bool, LedgerError> {
        let mut inner = self.lock()?;
        let key = format!("settle:{}", settlement.client_id);
        if inner.applied.contains(&key) {
            return Ok(false);
        }
        let account = inner.release(&settlement.user, settlement.bet_amount)?;
        account.version += 1;

        inner.applied.insert(key);
        inner.push(
            &settlement.user,
            OpType::BetLoss,
            settlement.bet_amount,
            -(settlement.bet_amount as i128),
            settlement.client_id,
        );
        Ok(true)
    }

    async fn record_deposit(&self, deposit: Deposit) -> Result<bool, LedgerError> {
        let mut inner = self.lock()?;
        if !inner
            .deposits
            .insert((deposit.tx_hash.clone(), deposit.log_index))
        {
            return Ok(false);
        }
        let account = inner.account(&deposit.user);
        account.available += deposit.amount;
        account.version += 1;

        let reference = format!("{}:{}", deposit.tx_hash, deposit.log_index);
        inner.push(
            &deposit.user,
            OpType::Deposit,
            deposit.amount,
            deposit.amount as i128,
            reference,
        );
        Ok(true)
    }

    async fn withdraw(&self, withdrawal: Withdrawal) -> Result<Account, LedgerError> {
        let mut inner = self.lock()?;
        let key = format!("withdraw:{}", withdrawal.client_id);
        if inner.applied.contains(&key) {
            return Ok(inner.account(&withdrawal.user).clone());
        }
        let account = inner.account(&withdrawal.user);
        Inner::check_version(account, withdrawal.expected_version)?;
        if account.available < withdrawal.amount {
            return Err(LedgerError::InsufficientFunds {
                available: account.available,
                requested: withdrawal.amount,
            });
        }
        account.available -= withdrawal.amount;
        account.version += 1;
        let updated = account.clone();

        inner.applied.insert(key);
        inner.push(
            &withdrawal.user,
            OpType::Withdraw,
            withdrawal.amount,
            -(withdrawal.amount as i128),
            withdrawal.client_id,
        );
        Ok(updated)
    }

    async fn adjust(&self, user: &str, delta: i128, reference: &str) -> Result<Account, LedgerError> {
        let mut inner = self.lock()?;
        let account = inner.account(user);
        let amount = delta.unsigned_abs();
        if delta < 0 {
            if account.available < amount {
                return Err(LedgerError::InsufficientFunds {
                    available: account.available,
                    requested: amount,
                });
            }
            account.available -= amount;
        } else {
            account.available += amount;
        }
        account.version += 1;
        let updated = account.clone();

        inner.push(user, OpType::Adjustment, amount, delta, reference.to_string());
        Ok(updated)
    }

    async fn entries(&self, user: &str) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .iter()
            .filter(|entry| entry.user == user)
            .cloned()
            .collect())
    }

    async fn totals(&self) -> Result<Totals, LedgerError> {
        let inner = self.lock()?;
        Ok(Totals {
            ledger: inner.entries.iter().map(|entry| entry.delta).sum(),
            accounts: inner
                .accounts
                .values()
                .map(|account| account.total() as i128)
                .sum(),
        })
    }

    async fn checkpoint(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.lock()?.checkpoint)
    }

    async fn advance_checkpoint(&self, block: u64) -> Result<u64, LedgerError> {
        let mut inner = self.lock()?;
        let next = inner.checkpoint.map_or(block, |current| current.max(block));
        inner.checkpoint = Some(next);
        Ok(next)
    }

    async fn save_round(&self, record: RoundRecord) -> Result<(), LedgerError> {
        self.lock()?.rounds.insert(record.round_id, record);
        Ok(())
    }

    async fn round(&self, round_id: RoundId) -> Result<Option<RoundRecord>, LedgerError> {
        Ok(self.lock()?.rounds.get(&round_id).cloned())
    }

    async fn save_payout(&self, record: PayoutRecord) -> Result<(), LedgerError> {
        self.lock()?.payouts.insert(record.id.clone(), record);
        Ok(())
    }

    async fn payout(&self, id: &str) -> Result<Option<PayoutRecord>, LedgerError> {
        Ok(self.lock()?.payouts.get(id).cloned())
    }

    async fn payouts(&self, status: PayoutStatus) -> Result<Vec<PayoutRecord>, LedgerError> {
        let inner = self.lock()?;
        let mut records: Vec<_> = inner
            .payouts
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkpoint_monotonic() {
        let store = Memory::default();
        assert_eq!(store.checkpoint().await.unwrap(), None);
        assert_eq!(store.advance_checkpoint(10).await.unwrap(), 10);
        assert_eq!(store.advance_checkpoint(7).await.unwrap(), 10);
        assert_eq!(store.advance_checkpoint(12).await.unwrap(), 12);
        assert_eq!(store.checkpoint().await.unwrap(), Some(12));
    }

    #[tokio::test]
    async fn test_rounds_and_payouts() {
        let store = Memory::default();
        let record = RoundRecord {
            round_id: 3,
            seed_hash: "hash".into(),
            server_seed: None,
            client_seed: "client".into(),
            nonce: 3,
            crash_point: None,
            started_at: 1,
            crashed_at: None,
        };
        store.save_round(record.clone()).await.unwrap();
        assert_eq!(store.round(3).await.unwrap(), Some(record));
        assert_eq!(store.round(4).await.unwrap(), None);

        let payout = PayoutRecord {
            id: "p-1".into(),
            user: "0xabc".into(),
            to: "0xabc".into(),
            amount: 5,
            status: PayoutStatus::Pending,
            tx_hash: None,
            nonce: None,
            error: None,
            attempts: 0,
            created_at: 1,
            updated_at: 1,
        };
        store.save_payout(payout.clone()).await.unwrap();
        assert_eq!(store.payouts(PayoutStatus::Pending).await.unwrap(), vec![payout]);
        assert!(store.payouts(PayoutStatus::Failed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_lock_is_noop() {
        let store = Memory::default();
        store
            .record_deposit(Deposit {
                tx_hash: "0x01".into(),
                log_index: 0,
                user: "alice".into(),
                amount: 100,
            })
            .await
            .unwrap();
        let lock = BetLock {
            user: "alice".into(),
            amount: 60,
            round_id: 1,
            client_id: "1:alice".into(),
            expected_version: 1,
        };
        store.place_bet(lock.clone()).await.unwrap();
        let account = store.place_bet(lock).await.unwrap();
        assert_eq!(account.available, 40);
        assert_eq!(account.locked, 60);
        assert_eq!(store.entries("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_locks_same_version() {
        let store = Memory::default();
        store
            .record_deposit(Deposit {
                tx_hash: "0x01".into(),
                log_index: 0,
                user: "alice".into(),
                amount: 100,
            })
            .await
            .unwrap();
        let lock = |client_id: &str| BetLock {
            user: "alice".into(),
            amount: 60,
            round_id: 1,
            client_id: client_id.into(),
            expected_version: 1,
        };

        let (first, second) = tokio::join!(
            store.place_bet(lock("1:alice")),
            store.place_bet(lock("2:alice"))
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|result| matches!(
                    result,
                    Err(LedgerError::VersionConflict {
                        expected: 1,
                        actual: 2
                    })
                ))
                .count(),
            1
        );

        // Exactly one stake moved
        let account = store.account("alice").await.unwrap();
        assert_eq!((account.available, account.locked), (40, 60));
        assert_eq!(account.version, 2);
        assert_eq!(store.entries("alice").await.unwrap().len(), 2);
    }
}
