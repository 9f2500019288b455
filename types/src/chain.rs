use crate::Wei;
use serde::{Deserialize, Serialize};

/// `0x`-prefixed hex account address.
pub type Address = String;

/// `0x`-prefixed hex transaction hash.
pub type TxHash = String;

/// A transaction as returned inside a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(with = "crate::wei")]
    pub value: Wei,
    pub nonce: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Empty when the block was fetched without transactions.
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// Unsigned outbound transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    #[serde(with = "crate::wei")]
    pub value: Wei,
    pub nonce: u64,
    #[serde(with = "crate::wei")]
    pub gas_price: Wei,
    pub data: String,
}

/// Signed, ready to broadcast transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTx {
    pub hash: TxHash,
    pub raw: Vec<u8>,
}

/// A submitted payout transaction that has not been confirmed yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTx {
    pub hash: TxHash,
    pub to: Address,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    pub nonce: u64,
    /// Submission attempt (1-based) that was accepted.
    pub attempt: u32,
    #[serde(with = "crate::wei")]
    pub gas_price: Wei,
    pub timestamp: u64,
}
