use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use alloy::{
    primitives::{Address, TxHash},
    rpc::types::Log,
};
use futures::{
    FutureExt, StreamExt,
    future::{BoxFuture, Shared},
    stream::FuturesOrdered,
};

use crate::{
    TailError,
    deployment_cache::{DeploymentCache, TxPosition, is_deposit_contract},
    events::{EventCatalog, TailEvent},
    robust_node::{ChainClient, RobustNode},
    tail::{AddressFilter, tracking::Tracking},
    types::{Block, Direction, LogQuery, Transaction},
};

type ReceiptFuture = Shared<BoxFuture<'static, Result<bool, TailError>>>;

/// Width of the receipt resolution window: starts at `initial` and grows by one per resolved
/// receipt up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptConcurrency {
    pub initial: usize,
    pub max: usize,
}

impl Default for ReceiptConcurrency {
    fn default() -> Self {
        Self { initial: 2, max: 64 }
    }
}

/// One item awaiting dispatch: a decoded event or a plain transaction.
#[derive(Debug, Clone)]
pub(crate) struct DispatchEntry {
    /// Position of the transaction in `block.transactions`.
    pub(crate) position: usize,
    pub(crate) log: Option<Log>,
    pub(crate) event: Option<TailEvent>,
    /// Accepted by the address filter (always set for events).
    pub(crate) filtered: bool,
    /// Touches a tracked address.
    pub(crate) tracked: bool,
}

impl DispatchEntry {
    fn order_key(&self, block: &Block) -> (u64, u64) {
        let index = block.transactions[self.position].index;
        (index, self.log.as_ref().and_then(|log| log.log_index).unwrap_or(u64::MAX))
    }
}

/// A block with everything its dispatch needs, receipts already resolved.
#[derive(Debug, Clone)]
pub(crate) struct PreparedBlock {
    pub(crate) block: Arc<Block>,
    pub(crate) entries: Vec<DispatchEntry>,
}

/// Turns a loaded block into the ordered list of items to dispatch.
pub(crate) struct Preparer<C> {
    pub(crate) node: RobustNode<C>,
    pub(crate) catalog: Arc<EventCatalog>,
    pub(crate) factories: Arc<[Address]>,
    pub(crate) filter: AddressFilter,
    pub(crate) tracking: Tracking,
    pub(crate) cache: Option<Arc<DeploymentCache>>,
    pub(crate) zero_value_transactions: bool,
    pub(crate) receipts: ReceiptConcurrency,
}

impl<C: ChainClient> Preparer<C> {
    /// Decode, filter and resolve receipts for `block`.
    ///
    /// # Errors
    ///
    /// * [`TailError::LogsMismatch`] if the node answered logs for a different block.
    /// * [`TailError::InvalidLogOrder`] if log indexes do not strictly increase per transaction.
    /// * Node errors from the log, receipt and bytecode lookups.
    pub(crate) async fn prepare(&self, block: Arc<Block>) -> Result<PreparedBlock, TailError> {
        let number = block.number;
        let query = LogQuery::at(number).topic(self.catalog.topics());
        let mut logs = self.node.logs(&query).await?;

        if let Some(found) =
            logs.iter().filter_map(|log| log.block_hash).find(|hash| *hash != block.hash)
        {
            warn!(
                number = number,
                expected = %block.hash,
                found = %found,
                "Logs belong to another block"
            );
            return Err(TailError::LogsMismatch { number, expected: block.hash, found });
        }

        // Group by transaction only; within a transaction the node's order is checked, not fixed.
        logs.sort_by_key(|log| log.transaction_index);
        EventCatalog::check_log_order(number, &logs)?;

        let candidates = self.select(&block, logs).await?;
        let entries = self.resolve_receipts(&block, candidates).await?;
        trace!(number = number, entries = entries.len(), "Prepared block");

        Ok(PreparedBlock { block, entries })
    }

    async fn select(&self, block: &Block, logs: Vec<Log>) -> Result<Vec<DispatchEntry>, TailError> {
        let mut by_transaction: HashMap<u64, Vec<Log>> = HashMap::new();
        for log in logs {
            if let Some(index) = log.transaction_index {
                by_transaction.entry(index).or_default().push(log);
            }
        }

        let mut entries = Vec::new();
        let mut is_contract = HashSet::new();
        let mut deployed_here: HashMap<Address, u64> = HashMap::new();

        for (position, tx) in block.transactions.iter().enumerate() {
            let mut matched = false;

            for log in by_transaction.remove(&tx.index).unwrap_or_default() {
                let Some(event) = self.catalog.decode(&log) else { continue };
                let emitter = log.address();
                if !self.accepts_event(&event, emitter) {
                    continue;
                }
                if let TailEvent::DepositFactoryDeployed { contract_address } = event {
                    deployed_here.entry(contract_address).or_insert(tx.index);
                }

                is_contract.insert(emitter);
                matched = true;
                entries.push(DispatchEntry {
                    position,
                    log: Some(log),
                    event: Some(event),
                    filtered: true,
                    tracked: false,
                });
            }

            if matched {
                continue;
            }
            if let Some(entry) =
                self.plain_transaction(block, position, tx, &is_contract, &deployed_here).await?
            {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    fn accepts_event(&self, event: &TailEvent, emitter: Address) -> bool {
        match *event {
            TailEvent::Erc20Transfer { from, to, .. } => {
                (self.filter)(to, Direction::Incoming) || (self.filter)(from, Direction::Outgoing)
            }
            TailEvent::DepositForwarded { .. } => (self.filter)(emitter, Direction::Incoming),
            TailEvent::DepositFactoryDeployed { .. } => self.factories.contains(&emitter),
        }
    }

    async fn plain_transaction(
        &self,
        block: &Block,
        position: usize,
        tx: &Transaction,
        is_contract: &HashSet<Address>,
        deployed_here: &HashMap<Address, u64>,
    ) -> Result<Option<DispatchEntry>, TailError> {
        if tx.value.is_zero() && !self.zero_value_transactions {
            return Ok(None);
        }

        let tracked = self.tracking.touches(tx);
        let mut filtered = tx.to.is_some_and(|to| (self.filter)(to, Direction::Incoming)) ||
            (self.filter)(tx.from, Direction::Outgoing);

        // transfers into contracts are reported through the contracts' own events
        if filtered &&
            let Some(to) = tx.to &&
            (is_contract.contains(&to) ||
                self.is_deposit_contract(block, tx, to, deployed_here).await?)
        {
            trace!(hash = %tx.hash, to = %to, "Plain transfer into a known contract");
            filtered = false;
        }

        if !filtered && !tracked {
            return Ok(None);
        }
        Ok(Some(DispatchEntry { position, log: None, event: None, filtered, tracked }))
    }

    /// Whether `to` was a factory-deployed deposit contract at `tx`'s position.
    async fn is_deposit_contract(
        &self,
        block: &Block,
        tx: &Transaction,
        to: Address,
        deployed_here: &HashMap<Address, u64>,
    ) -> Result<bool, TailError> {
        if let Some(&deployed_at) = deployed_here.get(&to) {
            return Ok(deployed_at <= tx.index);
        }
        let position = TxPosition { block_number: block.number, transaction_index: tx.index };
        is_deposit_contract(self.cache.as_deref(), &self.node, &self.factories, to, position).await
    }

    async fn resolve_receipts(
        &self,
        block: &Block,
        mut candidates: Vec<DispatchEntry>,
    ) -> Result<Vec<DispatchEntry>, TailError> {
        candidates.sort_by_key(|entry| entry.order_key(block));

        let mut receipts: HashMap<TxHash, ReceiptFuture> = HashMap::new();
        let mut pending = candidates.into_iter().map(|entry| {
            let hash = block.transactions[entry.position].hash;
            let receipt = receipts
                .entry(hash)
                .or_insert_with(|| {
                    let node = self.node.clone();
                    async move { node.transaction_receipt(hash).await.map(|r| r.succeeded) }
                        .boxed()
                        .shared()
                })
                .clone();
            async move { (entry, receipt.await) }
        });

        let mut window = self.receipts.initial;
        let mut in_flight = FuturesOrdered::new();
        let mut kept = Vec::new();

        loop {
            while in_flight.len() < window {
                match pending.next() {
                    Some(next) => in_flight.push_back(next),
                    None => break,
                }
            }
            let Some((entry, succeeded)) = in_flight.next().await else { break };

            if succeeded? {
                kept.push(entry);
            } else {
                trace!(
                    hash = %block.transactions[entry.position].hash,
                    "Dropping entry of failed transaction"
                );
            }
            window = (window + 1).min(self.receipts.max);
        }

        Ok(kept)
    }
}
