use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    block_fetcher::{BlockFetcher, ConfirmationGate, ForkObserver},
    robust_node::{ChainClient, RobustNode},
    types::Block,
};

/// A confirmed block together with the depth it was buried under when released.
#[derive(Debug, Clone)]
pub struct ConfirmedBlock {
    pub block: Arc<Block>,
    pub confirmations: u64,
}

/// Sequential, one-block-at-a-time reader over confirmed blocks.
///
/// This is the unbuffered counterpart of the tail's prefetching pipeline.
#[derive(Debug)]
pub struct BlockCursor<C, O = ()> {
    gate: ConfirmationGate<C>,
    fetcher: BlockFetcher<C, O>,
    next: u64,
    stopped: CancellationToken,
}

impl<C: ChainClient, O: ForkObserver> BlockCursor<C, O> {
    #[must_use]
    pub fn new(node: RobustNode<C>, since: u64, confirmations: u64, observer: O) -> Self {
        let stopped = CancellationToken::new();
        Self {
            gate: ConfirmationGate::new(node.clone(), confirmations, stopped.clone()),
            fetcher: BlockFetcher::new(node, observer, stopped.clone()),
            next: since,
            stopped,
        }
    }

    /// Replace the fetcher, e.g. to tune its retry policy.
    #[must_use]
    pub fn with_fetcher(
        mut self,
        configure: impl FnOnce(BlockFetcher<C, O>) -> BlockFetcher<C, O>,
    ) -> Self {
        self.fetcher = configure(self.fetcher);
        self
    }

    /// Height the next call to [`next`](Self::next) will return.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Wait for the next block to be confirmed and return it.
    ///
    /// Returns `Ok(None)` once the cursor is stopped.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error if the block could not be loaded; the cursor stays at the
    /// same height so a later call tries it again.
    pub async fn next(&mut self) -> Result<Option<ConfirmedBlock>, TailError> {
        let sequence = self.next;
        let confirmations = match self.gate.wait(sequence).await {
            Ok(confirmations) => confirmations,
            Err(TailError::Stopped) => return Ok(None),
            Err(err) => return Err(err),
        };

        self.next += 1;
        match self.fetcher.fetch(sequence, |block| async move { Ok(block) }).await {
            Ok(block) => Ok(Some(ConfirmedBlock { block, confirmations })),
            Err(_) if self.stopped.is_cancelled() => {
                self.next -= 1;
                Ok(None)
            }
            Err(err) => {
                self.next -= 1;
                Err(err)
            }
        }
    }

    /// Stop the cursor. Pending and future calls to [`next`](Self::next) return `Ok(None)`.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    /// A handle that stops this cursor from another task.
    #[must_use]
    pub fn stop_handle(&self) -> CancellationToken {
        self.stopped.clone()
    }
}
