use crate::{Address, RoundId, TxHash, UserId, Wei};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A player's balance row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub user: UserId,
    #[serde(with = "crate::wei")]
    pub available: Wei,
    #[serde(with = "crate::wei")]
    pub locked: Wei,
    /// Bumped on every successful compare-and-swap write.
    pub version: u64,
}

impl Account {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }

    /// available + locked
    pub fn total(&self) -> Wei {
        self.available + self.locked
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Deposit,
    BetLock,
    BetWin,
    BetLoss,
    Withdraw,
    Adjustment,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Deposit => "deposit",
            OpType::BetLock => "bet_lock",
            OpType::BetWin => "bet_win",
            OpType::BetLoss => "bet_loss",
            OpType::Withdraw => "withdraw",
            OpType::Adjustment => "adjustment",
        };
        f.write_str(name)
    }
}

/// An append-only ledger row.
///
/// `delta` is the signed change this entry made to `available + locked`; the sum of
/// all deltas always equals the sum of all account totals.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: u64,
    pub user: UserId,
    pub op: OpType,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    #[serde(with = "crate::wei::signed")]
    pub delta: i128,
    pub reference: String,
    pub created_at: u64,
}

/// Request to move a stake from available to locked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetLock {
    pub user: UserId,
    pub amount: Wei,
    pub round_id: RoundId,
    pub client_id: String,
    pub expected_version: u64,
}

/// Settlement posting for a single bet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetSettlement {
    pub user: UserId,
    pub bet_amount: Wei,
    /// Credited back to available (zero for a loss).
    pub win_amount: Wei,
    pub round_id: RoundId,
    pub client_id: String,
}

/// An observed on-chain transfer into the deposit address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub tx_hash: TxHash,
    pub log_index: u32,
    pub user: UserId,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
}

/// Debit of available funds ahead of an on-chain payout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Withdrawal {
    pub user: UserId,
    pub amount: Wei,
    pub client_id: String,
    pub expected_version: u64,
}

/// Sum of all ledger deltas versus sum of all account totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub ledger: i128,
    pub accounts: i128,
}

impl Totals {
    pub fn drift(&self) -> i128 {
        self.ledger - self.accounts
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Debited from the ledger, not yet accepted by the chain.
    Pending,
    /// Accepted by the chain, waiting for a receipt.
    Submitted,
    Confirmed,
    /// Rejected or reverted; needs an operator retry.
    Failed,
}

/// Lifecycle of one withdrawal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    pub id: String,
    pub user: UserId,
    pub to: Address,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    pub status: PayoutStatus,
    pub tx_hash: Option<TxHash>,
    pub nonce: Option<u64>,
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: u64,
    pub updated_at: u64,
}
