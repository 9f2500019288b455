use super::{Chain, ChainError, Signer};
use commonware_cryptography::{sha256::Sha256, Hasher};
use commonware_utils::hex;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use liftoff_types::{
    chain::{Block, ChainTransaction, Receipt, SignedTx, TxRequest},
    is_valid_address, normalize_address, Address, TxHash, Wei,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

/// Minimum fee increase (percent) for a same-nonce replacement to be accepted.
const REPLACEMENT_BUMP_PERCENT: Wei = 110;

fn sha256_hex(message: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message);
    format!("0x{}", hex(&hasher.finalize().0))
}

/// Hash of a raw transaction as both [DevSigner] and [Simulated] compute it.
pub fn tx_hash(raw: &[u8]) -> TxHash {
    sha256_hex(raw)
}

#[derive(Clone)]
struct Pooled {
    tx: ChainTransaction,
    gas_price: Wei,
}

struct Inner {
    blocks: Vec<Block>,
    pool: Vec<Pooled>,
    receipts: HashMap<TxHash, Receipt>,
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, Wei>,
    failures: VecDeque<ChainError>,
    heads: Vec<mpsc::UnboundedSender<Result<u64, ChainError>>>,
    gas_price: Wei,
    auto_mine: bool,
    forks: u64,
}

impl Inner {
    fn pending_nonce(&self, address: &str) -> u64 {
        let confirmed = self.nonces.get(address).copied().unwrap_or_default();
        self.pool
            .iter()
            .filter(|pooled| pooled.tx.from == address)
            .map(|pooled| pooled.tx.nonce + 1)
            .fold(confirmed, u64::max)
    }

    fn mine(&mut self) -> u64 {
        let number = self.blocks.len() as u64;
        let parent_hash = self
            .blocks
            .last()
            .map(|block| block.hash.clone())
            .unwrap_or_default();

        let mut pooled = std::mem::take(&mut self.pool);
        pooled.sort_by(|a, b| (&a.tx.from, a.tx.nonce).cmp(&(&b.tx.from, b.tx.nonce)));
        let transactions: Vec<ChainTransaction> =
            pooled.into_iter().map(|pooled| pooled.tx).collect();

        for tx in &transactions {
            let from = self.balances.entry(tx.from.clone()).or_default();
            *from = from.saturating_sub(tx.value);
            if let Some(to) = &tx.to {
                *self.balances.entry(to.clone()).or_default() += tx.value;
            }
            let next = self.nonces.entry(tx.from.clone()).or_default();
            *next = (*next).max(tx.nonce + 1);
            self.receipts.insert(
                tx.hash.clone(),
                Receipt {
                    tx_hash: tx.hash.clone(),
                    block_number: number,
                    success: true,
                },
            );
        }

        let hashes: Vec<&str> = transactions.iter().map(|tx| tx.hash.as_str()).collect();
        let hash = sha256_hex(
            format!("{parent_hash}:{number}:{}:{}", self.forks, hashes.join(",")).as_bytes(),
        );
        self.blocks.push(Block {
            number,
            hash,
            parent_hash,
            transactions,
        });
        self.heads
            .retain(|head| head.unbounded_send(Ok(number)).is_ok());
        number
    }

    fn reorg(&mut self, depth: usize) -> usize {
        let depth = depth.min(self.blocks.len().saturating_sub(1));
        for _ in 0..depth {
            let Some(block) = self.blocks.pop() else {
                break;
            };
            for tx in block.transactions.into_iter().rev() {
                if let Some(to) = &tx.to {
                    let balance = self.balances.entry(to.clone()).or_default();
                    *balance = balance.saturating_sub(tx.value);
                }
                *self.balances.entry(tx.from.clone()).or_default() += tx.value;
                let next = self.nonces.entry(tx.from.clone()).or_default();
                *next = (*next).min(tx.nonce);
                self.receipts.remove(&tx.hash);
                self.pool.push(Pooled {
                    tx,
                    gas_price: self.gas_price,
                });
            }
        }
        self.forks += 1;
        depth
    }
}

/// In-process chain for devnets and tests.
///
/// Blocks are produced on demand with [Simulated::mine] (or on every accepted
/// transaction with auto mining), and [Simulated::reorg] rolls recent blocks back into
/// the pool so they are re-included under new hashes.
#[derive(Clone)]
pub struct Simulated {
    inner: Arc<Mutex<Inner>>,
}

impl Simulated {
    pub fn new(gas_price: Wei) -> Self {
        let mut inner = Inner {
            blocks: Vec::new(),
            pool: Vec::new(),
            receipts: HashMap::new(),
            nonces: HashMap::new(),
            balances: HashMap::new(),
            failures: VecDeque::new(),
            heads: Vec::new(),
            gas_price,
            auto_mine: false,
            forks: 0,
        };
        inner.mine();
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fund(&self, address: &str, amount: Wei) {
        *self
            .inner()
            .balances
            .entry(normalize_address(address))
            .or_default() += amount;
    }

    /// Queue a plain transfer from an external wallet (e.g. a player deposit).
    pub fn push_transfer(&self, from: &str, to: &str, value: Wei) -> TxHash {
        let mut inner = self.inner();
        let from = normalize_address(from);
        let nonce = inner.pending_nonce(&from);
        let hash = sha256_hex(format!("transfer:{from}:{to}:{value}:{nonce}").as_bytes());
        let gas_price = inner.gas_price;
        inner.pool.push(Pooled {
            tx: ChainTransaction {
                hash: hash.clone(),
                from,
                to: Some(normalize_address(to)),
                value,
                nonce,
            },
            gas_price,
        });
        hash
    }

    /// Seal the pool into a new block. Returns its number.
    pub fn mine(&self) -> u64 {
        self.inner().mine()
    }

    pub fn mine_blocks(&self, count: usize) -> u64 {
        let mut inner = self.inner();
        let mut head = inner.blocks.len() as u64 - 1;
        for _ in 0..count {
            head = inner.mine();
        }
        head
    }

    /// Drop the `depth` most recent blocks, returning their transactions to the pool.
    pub fn reorg(&self, depth: usize) -> usize {
        let dropped = self.inner().reorg(depth);
        debug!(dropped, "simulated reorg");
        dropped
    }

    /// Fail the next `send_raw_transaction` with `error`.
    pub fn fail_next(&self, error: ChainError) {
        self.inner().failures.push_back(error);
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        self.inner().auto_mine = enabled;
    }

    pub fn set_gas_price(&self, gas_price: Wei) {
        self.inner().gas_price = gas_price;
    }

    pub fn pool_len(&self) -> usize {
        self.inner().pool.len()
    }

    pub fn head(&self) -> u64 {
        self.inner().blocks.len() as u64 - 1
    }

    /// Pool transaction sent with `nonce` from `address`, if any.
    pub fn pooled(&self, address: &str, nonce: u64) -> Option<(TxHash, Wei)> {
        self.inner()
            .pool
            .iter()
            .find(|pooled| pooled.tx.from == address && pooled.tx.nonce == nonce)
            .map(|pooled| (pooled.tx.hash.clone(), pooled.gas_price))
    }

    fn submit(&self, raw: &[u8]) -> Result<TxHash, ChainError> {
        let mut inner = self.inner();
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }
        let request: TxRequest = serde_json::from_slice(raw)
            .map_err(|e| ChainError::Rpc(format!("invalid transaction: {e}")))?;
        if !is_valid_address(&request.to) {
            return Err(ChainError::classify("invalid address"));
        }
        let hash = tx_hash(raw);
        if inner.receipts.contains_key(&hash) || inner.pool.iter().any(|p| p.tx.hash == hash) {
            return Err(ChainError::classify("already known"));
        }
        let from = normalize_address(&request.from);
        let confirmed = inner.nonces.get(&from).copied().unwrap_or_default();
        if request.nonce < confirmed {
            return Err(ChainError::classify(&format!(
                "nonce too low: next nonce {confirmed}, tx nonce {}",
                request.nonce
            )));
        }
        let balance = inner.balances.get(&from).copied().unwrap_or_default();
        if balance < request.value {
            return Err(ChainError::classify(
                "insufficient funds for gas * price + value",
            ));
        }

        let tx = ChainTransaction {
            hash: hash.clone(),
            from: from.clone(),
            to: Some(normalize_address(&request.to)),
            value: request.value,
            nonce: request.nonce,
        };
        match inner
            .pool
            .iter_mut()
            .find(|pooled| pooled.tx.from == from && pooled.tx.nonce == request.nonce)
        {
            Some(existing) => {
                if request.gas_price * 100 < existing.gas_price * REPLACEMENT_BUMP_PERCENT {
                    return Err(ChainError::classify("replacement transaction underpriced"));
                }
                *existing = Pooled {
                    tx,
                    gas_price: request.gas_price,
                };
            }
            None => inner.pool.push(Pooled {
                tx,
                gas_price: request.gas_price,
            }),
        }
        if inner.auto_mine {
            inner.mine();
        }
        Ok(hash)
    }
}

impl Chain for Simulated {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.head())
    }

    async fn blocks(
        &self,
        from: u64,
        to: u64,
        include_transactions: bool,
    ) -> Result<Vec<Block>, ChainError> {
        let inner = self.inner();
        Ok(inner
            .blocks
            .iter()
            .filter(|block| block.number >= from && block.number <= to)
            .map(|block| {
                let mut block = block.clone();
                if !include_transactions {
                    block.transactions.clear();
                }
                block
            })
            .collect())
    }

    async fn transaction_receipt(&self, hash: &str) -> Result<Option<Receipt>, ChainError> {
        Ok(self.inner().receipts.get(hash).cloned())
    }

    async fn transaction_count(&self, address: &str, pending: bool) -> Result<u64, ChainError> {
        let inner = self.inner();
        let address = normalize_address(address);
        if pending {
            return Ok(inner.pending_nonce(&address));
        }
        Ok(inner.nonces.get(&address).copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: &[u8]) -> Result<TxHash, ChainError> {
        self.submit(raw)
    }

    async fn gas_price(&self) -> Result<Wei, ChainError> {
        Ok(self.inner().gas_price)
    }

    async fn balance(&self, address: &str) -> Result<Wei, ChainError> {
        Ok(self
            .inner()
            .balances
            .get(&normalize_address(address))
            .copied()
            .unwrap_or_default())
    }

    async fn new_heads(&self) -> Result<BoxStream<'static, Result<u64, ChainError>>, ChainError> {
        let (sender, receiver) = mpsc::unbounded();
        self.inner().heads.push(sender);
        Ok(receiver.boxed())
    }
}

/// Signer for [Simulated]: the "signature" is the JSON encoding of the request.
#[derive(Clone)]
pub struct DevSigner {
    address: Address,
}

impl DevSigner {
    pub fn new(address: &str) -> Self {
        Self {
            address: normalize_address(address),
        }
    }
}

impl Signer for DevSigner {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn sign(&self, tx: &TxRequest) -> Result<SignedTx, ChainError> {
        let raw = serde_json::to_vec(tx).map_err(|e| ChainError::Rpc(e.to_string()))?;
        Ok(SignedTx {
            hash: tx_hash(&raw),
            raw,
        })
    }
}
