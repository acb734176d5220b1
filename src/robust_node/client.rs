use std::sync::Arc;

use alloy::{
    consensus::{self, BlockHeader},
    eips::{BlockId, BlockNumberOrTag},
    network::{
        BlockResponse, Ethereum, ReceiptResponse, TransactionResponse, primitives::HeaderResponse,
    },
    primitives::{Address, Bytes, TxHash},
    providers::{Provider, RootProvider},
    rpc::types::{self as rpc, Filter, Log},
    transports::TransportResult,
};

use crate::types::{Block, LogQuery, Receipt, Transaction};

/// The remote calls the tail makes against a node.
///
/// A `null` answer is reported as `Ok(None)`; deciding whether that deserves a retry is left to
/// [`RobustNode`](super::RobustNode).
pub trait ChainClient: Send + Sync + 'static {
    /// `eth_blockNumber`
    fn block_number(&self) -> impl Future<Output = TransportResult<u64>> + Send;

    /// `eth_getBlockByNumber` with full transactions.
    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = TransportResult<Option<Block>>> + Send;

    /// `eth_getLogs` (historical queries through `eth_getPastLogs` use the same call).
    fn logs(&self, query: &LogQuery) -> impl Future<Output = TransportResult<Vec<Log>>> + Send;

    /// `eth_getTransactionReceipt`
    fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = TransportResult<Option<Receipt>>> + Send;

    /// `eth_getCode` at a given height.
    fn code_at(
        &self,
        address: Address,
        number: u64,
    ) -> impl Future<Output = TransportResult<Bytes>> + Send;
}

impl ChainClient for RootProvider<Ethereum> {
    async fn block_number(&self) -> TransportResult<u64> {
        self.get_block_number().await
    }

    async fn block_by_number(&self, number: u64) -> TransportResult<Option<Block>> {
        let block = self.get_block_by_number(BlockNumberOrTag::Number(number)).full().await?;
        Ok(block.map(into_block))
    }

    async fn logs(&self, query: &LogQuery) -> TransportResult<Vec<Log>> {
        self.get_logs(&Filter::from(query)).await
    }

    async fn transaction_receipt(&self, hash: TxHash) -> TransportResult<Option<Receipt>> {
        let receipt = self.get_transaction_receipt(hash).await?;
        Ok(receipt.map(|receipt| Receipt {
            transaction_hash: receipt.transaction_hash,
            succeeded: ReceiptResponse::status(&receipt),
        }))
    }

    async fn code_at(&self, address: Address, number: u64) -> TransportResult<Bytes> {
        self.get_code_at(address).block_id(BlockId::number(number)).await
    }
}

impl<C: ChainClient> ChainClient for Arc<C> {
    fn block_number(&self) -> impl Future<Output = TransportResult<u64>> + Send {
        (**self).block_number()
    }

    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = TransportResult<Option<Block>>> + Send {
        (**self).block_by_number(number)
    }

    fn logs(&self, query: &LogQuery) -> impl Future<Output = TransportResult<Vec<Log>>> + Send {
        (**self).logs(query)
    }

    fn transaction_receipt(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = TransportResult<Option<Receipt>>> + Send {
        (**self).transaction_receipt(hash)
    }

    fn code_at(
        &self,
        address: Address,
        number: u64,
    ) -> impl Future<Output = TransportResult<Bytes>> + Send {
        (**self).code_at(address, number)
    }
}

fn into_block(block: rpc::Block) -> Block {
    let header = block.header();
    let (hash, number, timestamp) = (header.hash(), header.number(), header.timestamp());

    let transactions = block
        .transactions
        .into_transactions()
        .enumerate()
        .map(|(position, tx)| Transaction {
            hash: TransactionResponse::tx_hash(&tx),
            index: TransactionResponse::transaction_index(&tx).unwrap_or(position as u64),
            from: TransactionResponse::from(&tx),
            to: consensus::Transaction::to(&tx),
            value: consensus::Transaction::value(&tx),
        })
        .collect();

    Block { hash, number, timestamp, transactions }
}
