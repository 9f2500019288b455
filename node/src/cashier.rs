//! Withdrawals: ledger debit, payout record and on-chain transfer.

use crate::{
    chain::{Chain, Signer},
    payout::{PayoutError, PayoutSender},
};
use liftoff_execution::{Ledger, LedgerError, Store};
use liftoff_types::{
    is_valid_address,
    ledger::{PayoutRecord, PayoutStatus},
    normalize_address, now_millis, Wei,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CashierError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("payout {0} not found")]
    NotFound(String),
    #[error("payout {id} is {status:?}, only failed payouts can be retried")]
    NotRetryable { id: String, status: PayoutStatus },
}

impl CashierError {
    pub fn code(&self) -> &'static str {
        match self {
            CashierError::Ledger(err) => err.code(),
            CashierError::InvalidRecipient(_) => "invalid_recipient",
            CashierError::NotFound(_) => "not_found",
            CashierError::NotRetryable { .. } => "not_retryable",
        }
    }
}

pub struct Cashier<S: Store, C: Chain, Sg: Signer> {
    ledger: Ledger<S>,
    sender: Arc<PayoutSender<C, Sg>>,
}

impl<S: Store, C: Chain, Sg: Signer> Clone for Cashier<S, C, Sg> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<S: Store, C: Chain, Sg: Signer> Cashier<S, C, Sg> {
    pub fn new(ledger: Ledger<S>, sender: Arc<PayoutSender<C, Sg>>) -> Self {
        Self { ledger, sender }
    }

    pub fn sender(&self) -> &Arc<PayoutSender<C, Sg>> {
        &self.sender
    }

    pub async fn payout(&self, id: &str) -> Result<Option<PayoutRecord>, CashierError> {
        Ok(self.ledger.store().payout(id).await?)
    }

    /// Debit the player and persist a pending payout.
    ///
    /// The payout id doubles as the ledger client id, so the debit happens at most once
    /// per payout.
    pub async fn request(
        &self,
        user: &str,
        to: &str,
        amount: Wei,
    ) -> Result<PayoutRecord, CashierError> {
        if !is_valid_address(to) {
            return Err(CashierError::InvalidRecipient(to.to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.ledger.withdraw(user, amount, &id).await?;

        let now = now_millis();
        let record = PayoutRecord {
            id,
            user: user.to_string(),
            to: normalize_address(to),
            amount,
            status: PayoutStatus::Pending,
            tx_hash: None,
            nonce: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.ledger.store().save_payout(record.clone()).await?;
        info!(id = %record.id, user, amount = %amount, "payout requested");
        Ok(record)
    }

    /// Hand a pending (or failed) payout to the chain.
    pub async fn dispatch(&self, mut record: PayoutRecord) -> Result<PayoutRecord, CashierError> {
        record.attempts += 1;
        let metadata = format!("payout:{}", record.id);
        match self.sender.submit(&record.to, record.amount, &metadata).await {
            Ok(pending) => {
                record.status = PayoutStatus::Submitted;
                record.tx_hash = Some(pending.hash);
                record.nonce = Some(pending.nonce);
                record.error = None;
            }
            Err(e) => {
                error!(id = %record.id, ?e, "payout failed, needs operator retry");
                record.status = PayoutStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.updated_at = now_millis();
        self.ledger.store().save_payout(record.clone()).await?;
        Ok(record)
    }

    /// Wait for a submitted payout to land.
    ///
    /// A timeout leaves the record submitted for [Self::reconcile].
    pub async fn confirm(&self, mut record: PayoutRecord) -> Result<PayoutRecord, CashierError> {
        let Some(hash) = record.tx_hash.clone() else {
            return Ok(record);
        };
        match self.sender.wait_for_receipt(&hash).await {
            Ok(_) => record.status = PayoutStatus::Confirmed,
            Err(PayoutError::ReceiptTimeout { .. }) => {
                warn!(id = %record.id, %hash, "payout receipt timed out");
                return Ok(record);
            }
            Err(e) => {
                error!(id = %record.id, %hash, ?e, "payout did not confirm");
                record.status = PayoutStatus::Failed;
                record.error = Some(e.to_string());
            }
        }
        record.updated_at = now_millis();
        self.ledger.store().save_payout(record.clone()).await?;
        Ok(record)
    }

    /// Debit, submit and confirm in the background. Returns the record after submission.
    pub async fn withdraw(
        &self,
        user: &str,
        to: &str,
        amount: Wei,
    ) -> Result<PayoutRecord, CashierError> {
        let record = self.request(user, to, amount).await?;
        let record = self.dispatch(record).await?;
        if record.status == PayoutStatus::Submitted {
            let cashier = self.clone();
            let submitted = record.clone();
            tokio::spawn(async move {
                if let Err(e) = cashier.confirm(submitted).await {
                    error!(?e, "failed to record payout confirmation");
                }
            });
        }
        Ok(record)
    }

    /// Re-submit a failed payout without debiting the player again.
    pub async fn retry(&self, id: &str) -> Result<PayoutRecord, CashierError> {
        let record = self
            .payout(id)
            .await?
            .ok_or_else(|| CashierError::NotFound(id.to_string()))?;
        if record.status != PayoutStatus::Failed {
            return Err(CashierError::NotRetryable {
                id: id.to_string(),
                status: record.status,
            });
        }
        info!(id, attempts = record.attempts, "retrying payout");
        self.dispatch(record).await
    }

    /// Settle submitted payouts whose receipts arrived after their wait was abandoned.
    ///
    /// Receipts that cannot be recorded are tracked again for the next pass.
    pub async fn reconcile(&self) -> Result<usize, CashierError> {
        let submitted = self
            .ledger
            .store()
            .payouts(PayoutStatus::Submitted)
            .await?;
        let mut landed = self.sender.reconcile().await.into_iter();
        let mut updated = 0;
        while let Some((tx, receipt)) = landed.next() {
            let Some(mut record) = submitted
                .iter()
                .find(|record| record.tx_hash.as_deref() == Some(tx.hash.as_str()))
                .cloned()
            else {
                continue;
            };
            if receipt.success {
                record.status = PayoutStatus::Confirmed;
            } else {
                error!(id = %record.id, hash = %tx.hash, "payout reverted");
                record.status = PayoutStatus::Failed;
                record.error = Some(
                    PayoutError::Reverted {
                        hash: tx.hash.clone(),
                    }
                    .to_string(),
                );
            }
            record.updated_at = now_millis();
            if let Err(e) = self.ledger.store().save_payout(record).await {
                self.sender.track(tx);
                for (tx, _) in landed {
                    self.sender.track(tx);
                }
                return Err(e.into());
            }
            updated += 1;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::{ChainError, DevSigner, Simulated},
        payout::Config,
    };
    use liftoff_execution::{
        mocks::{create_address, fund, Flaky, ETHER},
        Memory,
    };
    use std::time::Duration;

    const HOT: &str = "0x1111111111111111111111111111111111111111";

    async fn setup() -> (Simulated, Cashier<Memory, Simulated, DevSigner>, String) {
        setup_with(Memory::default()).await
    }

    async fn setup_with<S: Store>(
        store: S,
    ) -> (Simulated, Cashier<S, Simulated, DevSigner>, String) {
        let player = create_address(1);
        let ledger = Ledger::new(store);
        fund(&ledger, &[&player], ETHER).await.unwrap();
        let chain = Simulated::new(100);
        chain.fund(HOT, 10 * ETHER);
        let sender = PayoutSender::new(
            chain.clone(),
            DevSigner::new(HOT),
            Config {
                receipt_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
        );
        (chain, Cashier::new(ledger, Arc::new(sender)), player)
    }

    #[tokio::test]
    async fn test_withdraw_debits_and_submits() {
        let (chain, cashier, player) = setup().await;
        let to = create_address(2);
        let record = cashier.withdraw(&player, &to, ETHER / 4).await.unwrap();
        assert_eq!(record.status, PayoutStatus::Submitted);
        assert_eq!(record.nonce, Some(0));
        assert_eq!(record.attempts, 1);
        assert_eq!(chain.pool_len(), 1);

        let account = cashier.ledger.balance(&player).await.unwrap();
        assert_eq!(account.available, ETHER - ETHER / 4);

        chain.mine();
        let record = cashier.confirm(record).await.unwrap();
        assert_eq!(record.status, PayoutStatus::Confirmed);
        assert_eq!(chain.balance(&to).await.unwrap(), ETHER / 4);
    }

    #[tokio::test]
    async fn test_rejects_bad_recipient_and_overdraw() {
        let (_, cashier, player) = setup().await;
        assert!(matches!(
            cashier.withdraw(&player, "nowhere", 1).await,
            Err(CashierError::InvalidRecipient(_))
        ));
        let result = cashier
            .withdraw(&player, &create_address(2), 2 * ETHER)
            .await;
        assert!(matches!(
            result,
            Err(CashierError::Ledger(LedgerError::InsufficientFunds { .. }))
        ));
        assert!(cashier
            .ledger
            .store()
            .payouts(PayoutStatus::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_payout_retry() {
        let (chain, cashier, player) = setup().await;
        chain.fail_next(ChainError::Reverted("execution reverted".into()));
        let record = cashier
            .withdraw(&player, &create_address(2), ETHER / 2)
            .await
            .unwrap();
        assert_eq!(record.status, PayoutStatus::Failed);
        assert!(record.error.is_some());

        // Funds stay debited while the payout waits for an operator
        let account = cashier.ledger.balance(&player).await.unwrap();
        assert_eq!(account.available, ETHER / 2);

        let retried = cashier.retry(&record.id).await.unwrap();
        assert_eq!(retried.status, PayoutStatus::Submitted);
        assert_eq!(retried.attempts, 2);
        assert!(matches!(
            cashier.retry(&record.id).await,
            Err(CashierError::NotRetryable { .. })
        ));
        assert!(matches!(
            cashier.retry("missing").await,
            Err(CashierError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_confirms_landed_payouts() {
        let (chain, cashier, player) = setup().await;
        let record = cashier.request(&player, &create_address(3), 10).await.unwrap();
        let record = cashier.dispatch(record).await.unwrap();
        assert_eq!(cashier.reconcile().await.unwrap(), 0);

        chain.mine();
        assert_eq!(cashier.reconcile().await.unwrap(), 1);
        let stored = cashier.payout(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_reconcile_survives_store_outage() {
        let store = Flaky::default();
        let (chain, cashier, player) = setup_with(store.clone()).await;
        let record = cashier.request(&player, &create_address(3), 10).await.unwrap();
        let record = cashier.dispatch(record).await.unwrap();
        chain.mine();

        // Listing fails before any receipt is consumed
        store.fail_payout_reads(1);
        assert!(matches!(
            cashier.reconcile().await,
            Err(CashierError::Ledger(LedgerError::Store(_)))
        ));
        assert_eq!(cashier.sender().pending().len(), 1);

        // Saving fails after the receipt was read
        store.fail_payout_writes(1);
        assert!(cashier.reconcile().await.is_err());
        assert_eq!(cashier.sender().pending().len(), 1);

        assert_eq!(cashier.reconcile().await.unwrap(), 1);
        assert!(cashier.sender().pending().is_empty());
        let stored = cashier.payout(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PayoutStatus::Confirmed);
    }
}
