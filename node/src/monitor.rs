//! Background checks: ledger audit, bankroll refresh, payout nonce drift and payout
//! reconciliation.

use crate::{
    cashier::Cashier,
    chain::{bounded, Chain, ChainError, Signer},
    payout::{NonceHealth, PayoutError},
};
use liftoff_execution::{Ledger, LedgerError, SolvencyGuard, Store};
use liftoff_types::{ledger::Totals, Wei};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct Config {
    pub audit_interval: Duration,
    pub house_funds_interval: Duration,
    pub nonce_interval: Duration,
    pub reconcile_interval: Duration,
    pub rpc_timeout: Duration,
}

pub struct Monitor<S: Store, C: Chain, Sg: Signer> {
    config: Config,
    ledger: Ledger<S>,
    chain: C,
    cashier: Cashier<S, C, Sg>,
    solvency: Arc<SolvencyGuard>,
}

impl<S: Store, C: Chain, Sg: Signer> Monitor<S, C, Sg> {
    pub fn new(
        config: Config,
        ledger: Ledger<S>,
        chain: C,
        cashier: Cashier<S, C, Sg>,
        solvency: Arc<SolvencyGuard>,
    ) -> Self {
        Self {
            config,
            ledger,
            chain,
            cashier,
            solvency,
        }
    }

    /// Compare ledger and account totals. Drift is reported, never corrected.
    pub async fn audit(&self) -> Result<Totals, LedgerError> {
        let totals = self.ledger.audit().await?;
        if totals.drift() != 0 {
            error!(
                ledger = %totals.ledger,
                accounts = %totals.accounts,
                drift = %totals.drift(),
                "ledger invariant violated"
            );
        } else {
            debug!(total = %totals.accounts, "ledger audit passed");
        }
        Ok(totals)
    }

    /// Feed the hot wallet balance to the solvency guard and lift emergency mode once
    /// utilization is back under the low water mark.
    pub async fn refresh_house_funds(&self) -> Result<Wei, ChainError> {
        let address = self.cashier.sender().address();
        let funds = bounded(self.config.rpc_timeout, self.chain.balance(&address)).await?;
        self.solvency.set_house_funds(funds);
        if self.solvency.rebalance() {
            info!(funds = %funds, "betting resumed after rebalance");
        }
        let status = self.solvency.status();
        debug!(
            funds = %funds,
            liability = %status.open_liability,
            utilization_bps = %status.utilization_bps(),
            "house funds refreshed"
        );
        if status.emergency {
            warn!("solvency guard is in emergency mode");
        }
        Ok(funds)
    }

    pub async fn check_nonce(&self) -> Result<NonceHealth, PayoutError> {
        let health = self.cashier.sender().health().await?;
        if health.drift() != 0 {
            warn!(
                local = ?health.local,
                pending = health.pending,
                latest = health.latest,
                in_flight = health.in_flight,
                "payout nonce drift"
            );
        }
        Ok(health)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut audit = tokio::time::interval(self.config.audit_interval);
        let mut house = tokio::time::interval(self.config.house_funds_interval);
        let mut nonce = tokio::time::interval(self.config.nonce_interval);
        let mut reconcile = tokio::time::interval(self.config.reconcile_interval);
        for interval in [&mut audit, &mut house, &mut nonce, &mut reconcile] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        info!("monitors started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = audit.tick() => {
                    if let Err(e) = self.audit().await {
                        warn!(?e, "ledger audit failed");
                    }
                },
                _ = house.tick() => {
                    if let Err(e) = self.refresh_house_funds().await {
                        warn!(?e, "house funds refresh failed");
                    }
                },
                _ = nonce.tick() => {
                    if let Err(e) = self.check_nonce().await {
                        warn!(?e, "nonce health check failed");
                    }
                },
                _ = reconcile.tick() => match self.cashier.reconcile().await {
                    Ok(0) => {}
                    Ok(updated) => info!(updated, "reconciled payouts"),
                    Err(e) => warn!(?e, "payout reconciliation failed"),
                },
            }
        }
        info!("monitors stopped");
    }
}
