//! Deposit indexer.
//!
//! Each pass rescans `reorg_buffer` blocks behind the stored checkpoint so transfers
//! re-included after a reorg are still seen. Credits are keyed by `(tx_hash, log_index)`
//! and are idempotent, which makes the overlap (and the optional push watcher) harmless.

use crate::chain::{bounded, Chain, ChainError};
use futures::StreamExt;
use liftoff_execution::{Ledger, LedgerError, Store};
use liftoff_types::{ledger::Deposit, normalize_address, Address};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub struct Config {
    /// Collection address players deposit to.
    pub address: Address,
    /// First block to scan when no checkpoint exists.
    pub start_block: u64,
    pub reorg_buffer: u64,
    /// Maximum blocks per pass (always larger than the reorg buffer).
    pub max_span: u64,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub from: u64,
    pub to: u64,
    pub head: u64,
    pub credited: usize,
    pub duplicates: usize,
}

impl ScanReport {
    /// True while the chain head is beyond the scanned range.
    pub fn behind(&self) -> bool {
        self.to < self.head
    }
}

pub struct DepositIndexer<C: Chain, S: Store> {
    chain: C,
    ledger: Ledger<S>,
    config: Config,
}

impl<C: Chain, S: Store> DepositIndexer<C, S> {
    pub fn new(chain: C, ledger: Ledger<S>, mut config: Config) -> Self {
        config.address = normalize_address(&config.address);
        config.max_span = config.max_span.max(1);
        Self {
            chain,
            ledger,
            config,
        }
    }

    /// Next range to scan given the stored checkpoint and chain head.
    fn range(&self, checkpoint: Option<u64>, head: u64) -> Option<(u64, u64)> {
        let from = match checkpoint {
            Some(last) => (last + 1)
                .saturating_sub(self.config.reorg_buffer)
                .max(self.config.start_block),
            None => self.config.start_block,
        };
        if from > head {
            return None;
        }
        let to = head.min(from + self.config.max_span - 1);
        Some((from, to))
    }

    /// Credit every transfer into the collection address in `from..=to`.
    ///
    /// Returns `(credited, duplicates)`. Does not touch the checkpoint.
    pub async fn credit_range(&self, from: u64, to: u64) -> Result<(usize, usize), IndexerError> {
        let blocks = bounded(self.config.rpc_timeout, self.chain.blocks(from, to, true)).await?;
        let mut credited = 0;
        let mut duplicates = 0;
        for block in blocks {
            for tx in block.transactions {
                let Some(to) = tx.to.as_deref() else {
                    continue;
                };
                if tx.value == 0 || normalize_address(to) != self.config.address {
                    continue;
                }
                let deposit = Deposit {
                    tx_hash: tx.hash.clone(),
                    log_index: 0,
                    user: normalize_address(&tx.from),
                    amount: tx.value,
                };
                if self.ledger.record_deposit(deposit).await? {
                    info!(
                        block = block.number,
                        hash = %tx.hash,
                        user = %tx.from,
                        amount = %tx.value,
                        "credited deposit"
                    );
                    credited += 1;
                } else {
                    duplicates += 1;
                }
            }
        }
        Ok((credited, duplicates))
    }

    /// Scan the next range and advance the checkpoint. `None` when already at head.
    pub async fn scan_once(&self) -> Result<Option<ScanReport>, IndexerError> {
        let head = bounded(self.config.rpc_timeout, self.chain.block_number()).await?;
        let checkpoint = self.ledger.store().checkpoint().await?;
        let Some((from, to)) = self.range(checkpoint, head) else {
            return Ok(None);
        };
        let (credited, duplicates) = self.credit_range(from, to).await?;
        self.ledger.store().advance_checkpoint(to).await?;
        debug!(from, to, head, credited, duplicates, "scanned deposits");
        Ok(Some(ScanReport {
            from,
            to,
            head,
            credited,
            duplicates,
        }))
    }

    /// Poll until `shutdown` flips, catching up without delay while behind.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(address = %self.config.address, "deposit indexer started");
        loop {
            let delay = match self.scan_once().await {
                Ok(Some(report)) if report.behind() => Duration::ZERO,
                Ok(_) => self.config.poll_interval,
                Err(e) => {
                    warn!(?e, "deposit scan failed");
                    self.config.poll_interval
                }
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("deposit indexer stopped");
    }

    /// Credit the head block as soon as it is announced.
    ///
    /// The checkpoint is left to the polling loop; this only shortens credit latency.
    pub async fn watch(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), IndexerError> {
        let mut heads = self.chain.new_heads().await?;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                head = heads.next() => match head {
                    Some(Ok(number)) => {
                        if let Err(e) = self.credit_range(number, number).await {
                            warn!(?e, number, "failed to credit new head");
                        }
                    }
                    Some(Err(e)) => warn!(?e, "new head subscription error"),
                    None => break,
                },
            }
        }
        Ok(())
    }
}
