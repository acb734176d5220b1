//! In-memory chain and recording handler for tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy::{
    primitives::{Address, B256, BlockHash, Bytes, LogData, TxHash, U256, keccak256},
    rpc::types::Log,
    sol_types::SolValue,
    transports::{TransportErrorKind, TransportResult},
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    HandlerError,
    events::EventKind,
    robust_node::ChainClient,
    tail::{Deposit, DepositDeployed, DispatchContext, Erc20Transfer, TailHandler},
    types::{Block, LogQuery, Receipt, Transaction},
};

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or_default()
}

/// An empty block at `number` whose hash is derived from `tag`.
#[must_use]
pub fn block_at(number: u64, tag: &str) -> Block {
    Block {
        hash: keccak256(format!("{number}:{tag}")),
        number,
        timestamp: 0,
        transactions: Vec::new(),
    }
}

/// Hash of the block [`MockChain`] serves at `number` unless scripted otherwise.
#[must_use]
pub fn canonical_hash(number: u64) -> BlockHash {
    block_at(number, "canonical").hash
}

#[must_use]
pub fn transaction(index: u64, from: Address, to: Option<Address>, value: U256) -> Transaction {
    Transaction { hash: keccak256(format!("tx:{index}:{from}")), index, from, to, value }
}

fn log_at(
    emitter: Address,
    topics: Vec<B256>,
    data: Vec<u8>,
    block: u64,
    transaction_index: u64,
    log_index: u64,
) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address: emitter,
            data: LogData::new_unchecked(topics, Bytes::from(data)),
        },
        block_number: Some(block),
        transaction_index: Some(transaction_index),
        log_index: Some(log_index),
        ..Default::default()
    }
}

/// `Deployed(contract)` emitted by `factory`.
#[must_use]
pub fn factory_deployed_log(
    factory: Address,
    contract: Address,
    block: u64,
    transaction_index: u64,
    log_index: u64,
) -> Log {
    let topics = vec![EventKind::DepositFactoryDeployed.topic(), contract.into_word()];
    log_at(factory, topics, Vec::new(), block, transaction_index, log_index)
}

/// `DepositForwarded(to, amount)` emitted by the deposit contract `contract`.
#[must_use]
pub fn deposit_forwarded_log(
    contract: Address,
    to: Address,
    amount: U256,
    block: u64,
    transaction_index: u64,
    log_index: u64,
) -> Log {
    let topics = vec![EventKind::DepositForwarded.topic()];
    log_at(contract, topics, (to, amount).abi_encode(), block, transaction_index, log_index)
}

/// ERC20 `Transfer(from, to, amount)` emitted by `token`.
#[must_use]
pub fn erc20_transfer_log(
    token: Address,
    from: Address,
    to: Address,
    amount: U256,
    block: u64,
    transaction_index: u64,
    log_index: u64,
) -> Log {
    let topics = vec![EventKind::Erc20Transfer.topic(), from.into_word(), to.into_word()];
    log_at(token, topics, amount.to_be_bytes_vec(), block, transaction_index, log_index)
}

/// Number of node calls served, per method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub block_number: usize,
    pub blocks: usize,
    pub logs: usize,
    pub receipts: usize,
    pub code: usize,
}

#[derive(Debug, Default)]
struct State {
    height: u64,
    timestamps: HashMap<u64, u64>,
    scripted: HashMap<u64, VecDeque<Block>>,
    transactions: HashMap<u64, Vec<Transaction>>,
    logs: Vec<Log>,
    failed_receipts: HashSet<TxHash>,
    receipt_errors: HashMap<TxHash, usize>,
    receipt_calls: HashMap<TxHash, usize>,
    receipts_in_flight: usize,
    receipt_starts: Vec<usize>,
    code: HashMap<Address, u64>,
    block_errors: usize,
    latency: Duration,
    calls: Calls,
}

/// Scriptable in-memory [`ChainClient`].
///
/// Blocks up to the current height exist and carry the transactions registered for them;
/// receipts succeed unless marked failed; logs are served from whatever was pushed.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<State>>,
}

impl MockChain {
    #[must_use]
    pub fn new(height: u64) -> Self {
        let chain = Self::default();
        chain.set_height(height);
        chain
    }

    #[must_use]
    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    /// Timestamp of the block served at `number`; defaults to the time of the call.
    pub fn set_timestamp(&self, number: u64, timestamp: u64) {
        self.state.lock().timestamps.insert(number, timestamp);
    }

    /// Serve `blocks` at `number` in turn, repeating the last one forever.
    pub fn script_blocks(&self, number: u64, blocks: impl IntoIterator<Item = Block>) {
        self.state.lock().scripted.insert(number, blocks.into_iter().collect());
    }

    /// Add a transaction to the canonical block at `number`, at the next index.
    pub fn push_transaction(
        &self,
        number: u64,
        from: Address,
        to: Option<Address>,
        value: U256,
    ) -> Transaction {
        let mut state = self.state.lock();
        let transactions = state.transactions.entry(number).or_default();
        let index = transactions.len() as u64;
        let transaction = Transaction {
            hash: keccak256(format!("tx:{number}:{index}")),
            index,
            from,
            to,
            value,
        };
        transactions.push(transaction.clone());
        transaction
    }

    /// Serve `log` to matching queries, in insertion order.
    pub fn push_log(&self, log: Log) {
        self.state.lock().logs.push(log);
    }

    /// Report `hash` as reverted.
    pub fn fail_receipt(&self, hash: TxHash) {
        self.state.lock().failed_receipts.insert(hash);
    }

    /// Fail the next `times` receipt lookups of `hash` with a transport error.
    pub fn receipt_errors(&self, hash: TxHash, times: usize) {
        self.state.lock().receipt_errors.insert(hash, times);
    }

    /// Receipt lookups served for `hash`, failed ones included.
    #[must_use]
    pub fn receipt_calls(&self, hash: TxHash) -> usize {
        self.state.lock().receipt_calls.get(&hash).copied().unwrap_or_default()
    }

    /// For every receipt lookup, how many lookups were in flight when it started, itself
    /// included.
    #[must_use]
    pub fn receipt_concurrency(&self) -> Vec<usize> {
        self.state.lock().receipt_starts.clone()
    }

    /// Give `address` bytecode from height `number` on.
    pub fn deploy_code(&self, address: Address, number: u64) {
        self.state.lock().code.insert(address, number);
    }

    /// Fail the next `times` block lookups; `usize::MAX` fails them all, `0` resets.
    pub fn fail_blocks(&self, times: usize) {
        self.state.lock().block_errors = times;
    }

    /// Delay every answer by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    #[must_use]
    pub fn calls(&self) -> Calls {
        self.state.lock().calls
    }

    fn receipt_started(&self) -> ReceiptInFlight {
        let mut state = self.state.lock();
        state.receipts_in_flight += 1;
        let in_flight = state.receipts_in_flight;
        state.receipt_starts.push(in_flight);
        ReceiptInFlight(Arc::clone(&self.state))
    }

    async fn delay(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

struct ReceiptInFlight(Arc<Mutex<State>>);

impl Drop for ReceiptInFlight {
    fn drop(&mut self) {
        self.0.lock().receipts_in_flight -= 1;
    }
}

impl ChainClient for MockChain {
    async fn block_number(&self) -> TransportResult<u64> {
        self.delay().await;
        let mut state = self.state.lock();
        state.calls.block_number += 1;
        Ok(state.height)
    }

    async fn block_by_number(&self, number: u64) -> TransportResult<Option<Block>> {
        self.delay().await;
        let mut state = self.state.lock();
        state.calls.blocks += 1;

        if state.block_errors > 0 {
            if state.block_errors != usize::MAX {
                state.block_errors -= 1;
            }
            return Err(TransportErrorKind::backend_gone());
        }

        if let Some(script) = state.scripted.get_mut(&number) {
            let block = if script.len() > 1 { script.pop_front() } else { script.front().cloned() };
            if block.is_some() {
                return Ok(block);
            }
        }

        if number > state.height {
            return Ok(None);
        }
        Ok(Some(Block {
            timestamp: state.timestamps.get(&number).copied().unwrap_or_else(unix_now),
            transactions: state.transactions.get(&number).cloned().unwrap_or_default(),
            ..block_at(number, "canonical")
        }))
    }

    async fn logs(&self, query: &LogQuery) -> TransportResult<Vec<Log>> {
        self.delay().await;
        let mut state = self.state.lock();
        state.calls.logs += 1;

        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.block_number.is_some_and(|number| {
                    (query.from_block..=query.to_block).contains(&number)
                }) && query.matches(log.address(), log.topics())
            })
            .cloned()
            .collect())
    }

    async fn transaction_receipt(&self, hash: TxHash) -> TransportResult<Option<Receipt>> {
        let _in_flight = self.receipt_started();
        self.delay().await;
        let mut state = self.state.lock();
        state.calls.receipts += 1;
        *state.receipt_calls.entry(hash).or_default() += 1;

        if let Some(remaining) = state.receipt_errors.get_mut(&hash) &&
            *remaining > 0
        {
            *remaining -= 1;
            return Err(TransportErrorKind::backend_gone());
        }

        let succeeded = !state.failed_receipts.contains(&hash);
        Ok(Some(Receipt { transaction_hash: hash, succeeded }))
    }

    async fn code_at(&self, address: Address, number: u64) -> TransportResult<Bytes> {
        self.delay().await;
        let mut state = self.state.lock();
        state.calls.code += 1;

        let deployed = state.code.get(&address).is_some_and(|from| *from <= number);
        Ok(if deployed { Bytes::from_static(&[0x60, 0x80, 0x60, 0x40]) } else { Bytes::new() })
    }
}

/// One callback observed by a [`RecordingHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Block { number: u64, confirmations: u64 },
    Transaction { block: u64, index: u64, hash: TxHash },
    DepositDeployed(DepositDeployed),
    Deposit(Deposit),
    Erc20Transfer(Erc20Transfer),
    Checkpoint(u64),
    Fork { number: u64, fresh: BlockHash, stale: BlockHash },
}

/// [`TailHandler`] that records every callback, optionally failing at a given block.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    records: Arc<Mutex<Vec<Recorded>>>,
    checkpoint: Arc<watch::Sender<u64>>,
    fail_at: Arc<Mutex<Option<u64>>>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::default(),
            checkpoint: Arc::new(watch::Sender::new(0)),
            fail_at: Arc::default(),
        }
    }

    /// Fail `on_block` for the block at `number`.
    pub fn fail_at(&self, number: u64) {
        *self.fail_at.lock() = Some(number);
    }

    #[must_use]
    pub fn records(&self) -> Vec<Recorded> {
        self.records.lock().clone()
    }

    /// Records other than block and checkpoint notifications.
    #[must_use]
    pub fn deliveries(&self) -> Vec<Recorded> {
        self.records
            .lock()
            .iter()
            .filter(|record| !matches!(record, Recorded::Block { .. } | Recorded::Checkpoint(_)))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn blocks(&self) -> Vec<u64> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::Block { number, .. } => Some(*number),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn checkpoints(&self) -> Vec<u64> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                Recorded::Checkpoint(next) => Some(*next),
                _ => None,
            })
            .collect()
    }

    /// Wait until a checkpoint of at least `next` was recorded.
    pub async fn wait_for_checkpoint(&self, next: u64) {
        let mut checkpoints = self.checkpoint.subscribe();
        // the sender lives as long as `self`
        let _ = checkpoints.wait_for(|current| *current >= next).await;
    }

    fn record(&self, record: Recorded) {
        self.records.lock().push(record);
    }
}

impl TailHandler for RecordingHandler {
    async fn on_block(&self, block: &Block, confirmations: u64) -> Result<(), HandlerError> {
        if *self.fail_at.lock() == Some(block.number) {
            return Err(format!("refusing block {}", block.number).into());
        }
        self.record(Recorded::Block { number: block.number, confirmations });
        Ok(())
    }

    async fn on_transaction(
        &self,
        transaction: &Transaction,
        ctx: &DispatchContext<'_>,
    ) -> Result<(), HandlerError> {
        self.record(Recorded::Transaction {
            block: ctx.block.number,
            index: transaction.index,
            hash: transaction.hash,
        });
        Ok(())
    }

    async fn on_deposit_deployed(
        &self,
        event: &DepositDeployed,
        _ctx: &DispatchContext<'_>,
    ) -> Result<(), HandlerError> {
        self.record(Recorded::DepositDeployed(*event));
        Ok(())
    }

    async fn on_deposit(
        &self,
        event: &Deposit,
        _ctx: &DispatchContext<'_>,
    ) -> Result<(), HandlerError> {
        self.record(Recorded::Deposit(*event));
        Ok(())
    }

    async fn on_erc20_transfer(
        &self,
        event: &Erc20Transfer,
        _ctx: &DispatchContext<'_>,
    ) -> Result<(), HandlerError> {
        self.record(Recorded::Erc20Transfer(*event));
        Ok(())
    }

    async fn on_checkpoint(&self, next: u64) -> Result<(), HandlerError> {
        self.record(Recorded::Checkpoint(next));
        self.checkpoint.send_replace(next);
        Ok(())
    }

    async fn on_fork(&self, number: u64, fresh: &Block, stale: &Block) -> Result<(), HandlerError> {
        self.record(Recorded::Fork { number, fresh: fresh.hash, stale: stale.hash });
        Ok(())
    }
}
