//! Nonce-serialized outbound transactions.
//!
//! Every send from the hot wallet goes through one async mutex that owns the local nonce,
//! so two payouts can never race for the same sequence number. The nonce is advanced as
//! soon as the chain accepts a transaction; receipts are awaited outside the lock and
//! unconfirmed transactions stay tracked as [PendingTx] until [PayoutSender::reconcile]
//! sees them land.

use crate::chain::{bounded, Chain, ChainError, Signer};
use liftoff_types::{
    chain::{PendingTx, Receipt, TxRequest},
    now_millis, Address, TxHash, Wei,
};
use std::{
    collections::BTreeMap,
    sync::{Mutex as SyncMutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const BPS: Wei = 10_000;

#[derive(Clone, Debug)]
pub struct Config {
    /// Fee multiplier applied after a replacement is rejected as underpriced.
    pub fee_bump_bps: u32,
    pub max_attempts: u32,
    pub receipt_timeout: Duration,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fee_bump_bps: 11_250,
            max_attempts: 5,
            receipt_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayoutError {
    #[error("unrecoverable chain error: {0}")]
    Unrecoverable(ChainError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ChainError },
    #[error("no receipt for {hash} within the timeout")]
    ReceiptTimeout { hash: TxHash },
    #[error("transaction {hash} reverted")]
    Reverted { hash: TxHash },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Local versus on-chain view of the hot wallet nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NonceHealth {
    pub local: Option<u64>,
    pub pending: u64,
    pub latest: u64,
    pub in_flight: usize,
}

impl NonceHealth {
    /// Local nonce minus the chain's pending count.
    pub fn drift(&self) -> i128 {
        self.local.map_or(0, |local| local as i128 - self.pending as i128)
    }
}

pub struct PayoutSender<C: Chain, S: Signer> {
    chain: C,
    signer: S,
    config: Config,
    nonce: Mutex<Option<u64>>,
    pending: SyncMutex<BTreeMap<TxHash, PendingTx>>,
}

impl<C: Chain, S: Signer> PayoutSender<C, S> {
    pub fn new(chain: C, signer: S, config: Config) -> Self {
        Self {
            chain,
            signer,
            config,
            nonce: Mutex::new(None),
            pending: SyncMutex::new(BTreeMap::new()),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    fn pending_txs(&self) -> MutexGuard<'_, BTreeMap<TxHash, PendingTx>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn chain_nonce(&self) -> Result<u64, ChainError> {
        bounded(
            self.config.rpc_timeout,
            self.chain.transaction_count(&self.signer.address(), true),
        )
        .await
    }

    /// Load the local nonce from the chain's pending transaction count.
    pub async fn init(&self) -> Result<u64, PayoutError> {
        let mut nonce = self.nonce.lock().await;
        let next = self.chain_nonce().await?;
        *nonce = Some(next);
        info!(address = %self.signer.address(), nonce = next, "payout nonce initialized");
        Ok(next)
    }

    /// Submit a transfer and advance the local nonce once the chain accepts it.
    pub async fn submit(
        &self,
        to: &str,
        amount: Wei,
        metadata: &str,
    ) -> Result<PendingTx, PayoutError> {
        let mut nonce = self.nonce.lock().await;
        let mut next = match *nonce {
            Some(next) => next,
            None => self.chain_nonce().await?,
        };
        let mut gas_price = bounded(self.config.rpc_timeout, self.chain.gas_price()).await?;

        let mut attempt = 0;
        let mut last = ChainError::Timeout;
        while attempt < self.config.max_attempts {
            attempt += 1;
            let request = TxRequest {
                from: self.signer.address(),
                to: to.to_string(),
                value: amount,
                nonce: next,
                gas_price,
                data: metadata.to_string(),
            };
            let signed = self.signer.sign(&request)?;
            let hash = match bounded(
                self.config.rpc_timeout,
                self.chain.send_raw_transaction(&signed.raw),
            )
            .await
            {
                Ok(hash) => hash,
                // Our own bytes are already in the pool from an attempt that timed out
                Err(ChainError::AlreadyKnown) => signed.hash.clone(),
                Err(ChainError::NonceTooLow(message)) => {
                    let refreshed = self.chain_nonce().await?;
                    warn!(stale = next, refreshed, %message, "payout nonce refreshed");
                    next = refreshed.max(next + 1);
                    last = ChainError::NonceTooLow(message);
                    continue;
                }
                Err(ChainError::ReplacementUnderpriced(message)) => {
                    let bumped = gas_price * self.config.fee_bump_bps as Wei / BPS;
                    debug!(from = %gas_price, to = %bumped, "bumping payout fee");
                    gas_price = bumped.max(gas_price + 1);
                    last = ChainError::ReplacementUnderpriced(message);
                    continue;
                }
                Err(e) if e.is_unrecoverable() => {
                    warn!(?e, to, amount = %amount, "payout rejected");
                    *nonce = Some(next);
                    return Err(PayoutError::Unrecoverable(e));
                }
                Err(e) => {
                    debug!(?e, attempt, "transient payout error");
                    last = e;
                    continue;
                }
            };

            *nonce = Some(next + 1);
            let pending = PendingTx {
                hash: hash.clone(),
                to: to.to_string(),
                amount,
                nonce: next,
                attempt,
                gas_price,
                timestamp: now_millis(),
            };
            self.pending_txs().insert(hash.clone(), pending.clone());
            info!(%hash, nonce = next, attempt, amount = %amount, "payout submitted");
            return Ok(pending);
        }

        *nonce = Some(next);
        Err(PayoutError::Exhausted {
            attempts: attempt,
            last,
        })
    }

    /// Poll for a receipt until the configured timeout.
    ///
    /// On timeout the transaction stays tracked so [Self::reconcile] can pick it up later.
    pub async fn wait_for_receipt(&self, hash: &str) -> Result<Receipt, PayoutError> {
        let poll = async {
            loop {
                match bounded(self.config.rpc_timeout, self.chain.transaction_receipt(hash)).await
                {
                    Ok(Some(receipt)) => return receipt,
                    Ok(None) => {}
                    Err(e) => debug!(?e, hash, "receipt poll failed"),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        let receipt = tokio::time::timeout(self.config.receipt_timeout, poll)
            .await
            .map_err(|_| PayoutError::ReceiptTimeout {
                hash: hash.to_string(),
            })?;
        self.pending_txs().remove(hash);
        if !receipt.success {
            return Err(PayoutError::Reverted {
                hash: hash.to_string(),
            });
        }
        Ok(receipt)
    }

    /// Submit and wait for confirmation.
    pub async fn send_transaction(
        &self,
        to: &str,
        amount: Wei,
        metadata: &str,
    ) -> Result<Receipt, PayoutError> {
        let pending = self.submit(to, amount, metadata).await?;
        self.wait_for_receipt(&pending.hash).await
    }

    /// Check every tracked transaction once, returning the ones that landed.
    pub async fn reconcile(&self) -> Vec<(PendingTx, Receipt)> {
        let tracked: Vec<PendingTx> = self.pending_txs().values().cloned().collect();
        let mut landed = Vec::new();
        for tx in tracked {
            match bounded(
                self.config.rpc_timeout,
                self.chain.transaction_receipt(&tx.hash),
            )
            .await
            {
                Ok(Some(receipt)) => {
                    self.pending_txs().remove(&tx.hash);
                    info!(hash = %tx.hash, success = receipt.success, "reconciled payout");
                    landed.push((tx, receipt));
                }
                Ok(None) => {}
                Err(e) => warn!(?e, hash = %tx.hash, "reconcile lookup failed"),
            }
        }
        landed
    }

    /// Watch a transaction again, e.g. when its receipt could not be recorded.
    pub fn track(&self, tx: PendingTx) {
        self.pending_txs().insert(tx.hash.clone(), tx);
    }

    pub fn pending(&self) -> Vec<PendingTx> {
        self.pending_txs().values().cloned().collect()
    }

    pub async fn health(&self) -> Result<NonceHealth, PayoutError> {
        let local = *self.nonce.lock().await;
        let address = self.signer.address();
        let pending = self.chain_nonce().await?;
        let latest = bounded(
            self.config.rpc_timeout,
            self.chain.transaction_count(&address, false),
        )
        .await?;
        Ok(NonceHealth {
            local,
            pending,
            latest,
            in_flight: self.pending_txs().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{DevSigner, Simulated};
    use std::sync::Arc;

    const HOT: &str = "0x1111111111111111111111111111111111111111";
    const PLAYER: &str = "0x2222222222222222222222222222222222222222";

    fn sender(chain: &Simulated) -> PayoutSender<Simulated, DevSigner> {
        chain.fund(HOT, 1_000_000);
        PayoutSender::new(
            chain.clone(),
            DevSigner::new(HOT),
            Config {
                receipt_timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_sequential_nonces() {
        let chain = Simulated::new(100);
        let sender = sender(&chain);
        assert_eq!(sender.init().await.unwrap(), 0);

        let mut nonces = Vec::new();
        for i in 0..5 {
            let tx = sender.submit(PLAYER, 10 + i, "payout").await.unwrap();
            nonces.push(tx.nonce);
        }
        assert_eq!(nonces, vec![0, 1, 2, 3, 4]);
        assert_eq!(sender.pending().len(), 5);
        assert_eq!(sender.health().await.unwrap().drift(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_sends_never_share_nonce() {
        let chain = Simulated::new(100);
        let sender = Arc::new(sender(&chain));
        sender.init().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10u128 {
            let sender = sender.clone();
            handles.push(tokio::spawn(async move {
                sender.submit(PLAYER, 1 + i, "payout").await.unwrap().nonce
            }));
        }
        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_nonce_refresh() {
        let chain = Simulated::new(100);
        let sender = sender(&chain);
        sender.init().await.unwrap();

        // Another process used nonces 0 and 1 behind our back
        let signer = DevSigner::new(HOT);
        for nonce in 0..2 {
            let raw = signer
                .sign(&TxRequest {
                    from: HOT.into(),
                    to: PLAYER.into(),
                    value: 1,
                    nonce,
                    gas_price: 100,
                    data: "external".into(),
                })
                .unwrap()
                .raw;
            chain.send_raw_transaction(&raw).await.unwrap();
        }
        chain.mine();

        let tx = sender.submit(PLAYER, 5, "payout").await.unwrap();
        assert_eq!(tx.nonce, 2);
        assert_eq!(tx.attempt, 2);
    }

    #[tokio::test]
    async fn test_fee_bump_on_underpriced() {
        let chain = Simulated::new(1_000);
        let sender = sender(&chain);
        sender.init().await.unwrap();
        chain.fail_next(ChainError::classify("replacement transaction underpriced"));

        let tx = sender.submit(PLAYER, 5, "payout").await.unwrap();
        assert_eq!(tx.gas_price, 1_125);
        assert_eq!(tx.attempt, 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_aborts() {
        let chain = Simulated::new(100);
        let sender = sender(&chain);
        sender.init().await.unwrap();

        let result = sender.submit(PLAYER, 10_000_000, "payout").await;
        assert!(matches!(
            result,
            Err(PayoutError::Unrecoverable(ChainError::InsufficientFunds(_)))
        ));
        // The nonce was not consumed
        assert_eq!(sender.submit(PLAYER, 1, "payout").await.unwrap().nonce, 0);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust() {
        let chain = Simulated::new(100);
        let sender = sender(&chain);
        for _ in 0..5 {
            chain.fail_next(ChainError::Rpc("connection reset".into()));
        }
        assert_eq!(
            sender.submit(PLAYER, 1, "payout").await,
            Err(PayoutError::Exhausted {
                attempts: 5,
                last: ChainError::Rpc("connection reset".into())
            })
        );
        assert!(sender.pending().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation() {
        let chain = Simulated::new(100);
        chain.set_auto_mine(true);
        let sender = sender(&chain);
        let receipt = sender.send_transaction(PLAYER, 42, "payout").await.unwrap();
        assert!(receipt.success);
        assert!(sender.pending().is_empty());
        assert_eq!(chain.balance(PLAYER).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receipt_timeout_then_reconcile() {
        let chain = Simulated::new(100);
        let sender = sender(&chain);
        let tx = sender.submit(PLAYER, 42, "payout").await.unwrap();

        assert_eq!(
            sender.wait_for_receipt(&tx.hash).await,
            Err(PayoutError::ReceiptTimeout {
                hash: tx.hash.clone()
            })
        );
        assert_eq!(sender.pending().len(), 1);
        assert!(sender.reconcile().await.is_empty());

        chain.mine();
        let landed = sender.reconcile().await;
        assert_eq!(landed.len(), 1);
        assert_eq!(landed[0].0.hash, tx.hash);
        assert!(sender.pending().is_empty());
    }
}
