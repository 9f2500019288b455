//! Blockchain RPC boundary.
//!
//! The node only needs a handful of calls from the chain it settles on; anything that
//! speaks them (a JSON-RPC endpoint, a local devnet, [Simulated]) can back the payout
//! sender and the deposit indexer.

use futures::stream::BoxStream;
use liftoff_types::{
    chain::{Block, Receipt, SignedTx, TxRequest},
    Address, TxHash, Wei,
};
use std::{future::Future, time::Duration};
use thiserror::Error;

mod simulated;
pub use simulated::{DevSigner, Simulated};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("nonce too low: {0}")]
    NonceTooLow(String),
    #[error("transaction already known")]
    AlreadyKnown,
    #[error("replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("rpc call timed out")]
    Timeout,
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Map a raw node error message onto a typed error.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let message = message.to_string();
        if lower.contains("already known") {
            ChainError::AlreadyKnown
        } else if lower.contains("nonce too low") || lower.contains("nonce has already been used") {
            ChainError::NonceTooLow(message)
        } else if lower.contains("underpriced") {
            ChainError::ReplacementUnderpriced(message)
        } else if lower.contains("insufficient funds") {
            ChainError::InsufficientFunds(message)
        } else if lower.contains("execution reverted") {
            ChainError::Reverted(message)
        } else if lower.contains("invalid address") || lower.contains("invalid recipient") {
            ChainError::InvalidRecipient(message)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            ChainError::Timeout
        } else {
            ChainError::Rpc(message)
        }
    }

    /// Errors no retry can fix.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            ChainError::InsufficientFunds(_)
                | ChainError::Reverted(_)
                | ChainError::InvalidRecipient(_)
        )
    }
}

/// Read and submit access to a chain.
pub trait Chain: Clone + Send + Sync + 'static {
    fn block_number(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Blocks `from..=to`, with or without their transactions.
    fn blocks(
        &self,
        from: u64,
        to: u64,
        include_transactions: bool,
    ) -> impl Future<Output = Result<Vec<Block>, ChainError>> + Send;

    fn transaction_receipt(
        &self,
        hash: &str,
    ) -> impl Future<Output = Result<Option<Receipt>, ChainError>> + Send;

    /// Next nonce for `address`, counting pool transactions when `pending`.
    fn transaction_count(
        &self,
        address: &str,
        pending: bool,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: &[u8],
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<Wei, ChainError>> + Send;

    fn balance(&self, address: &str) -> impl Future<Output = Result<Wei, ChainError>> + Send;

    /// Stream of new head block numbers.
    fn new_heads(
        &self,
    ) -> impl Future<Output = Result<BoxStream<'static, Result<u64, ChainError>>, ChainError>> + Send;
}

/// Signs outbound transactions for one key.
pub trait Signer: Clone + Send + Sync + 'static {
    fn address(&self) -> Address;

    fn sign(&self, tx: &TxRequest) -> Result<SignedTx, ChainError>;
}

/// Bound an RPC call, mapping expiry to [ChainError::Timeout].
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, ChainError>>,
) -> Result<T, ChainError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| ChainError::Timeout)?
}
