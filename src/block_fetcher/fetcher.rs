use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    robust_node::{ChainClient, RobustNode},
    types::Block,
};

/// How many times a block is reloaded while it still matches a known-stale block.
pub const DEFAULT_RELOAD_ATTEMPTS: usize = 15;
/// Pause between reloads of a suspected-stale block.
pub const DEFAULT_RELOAD_DELAY: Duration = Duration::from_secs(1);
/// How many times processing of a block is retried after a recoverable failure.
pub const DEFAULT_FETCH_RETRIES: usize = 5;
/// Pause between processing retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Notified when a reloaded block is still the one previously flagged as stale.
pub trait ForkObserver: Send + Sync + 'static {
    fn on_fork(
        &self,
        number: u64,
        fresh: &Block,
        stale: &Block,
    ) -> impl Future<Output = Result<(), TailError>> + Send;
}

impl ForkObserver for () {
    async fn on_fork(&self, _: u64, _: &Block, _: &Block) -> Result<(), TailError> {
        Ok(())
    }
}

/// Loads blocks by height, re-fetching them when the node still serves a block already known
/// to be inconsistent, and retries processing that fails for transient reasons.
#[derive(Debug)]
pub struct BlockFetcher<C, O = ()> {
    node: RobustNode<C>,
    observer: O,
    stopped: CancellationToken,
    reload_attempts: usize,
    reload_delay: Duration,
    fetch_retries: usize,
    retry_delay: Duration,
}

impl<C: ChainClient, O: ForkObserver> BlockFetcher<C, O> {
    #[must_use]
    pub fn new(node: RobustNode<C>, observer: O, stopped: CancellationToken) -> Self {
        Self {
            node,
            observer,
            stopped,
            reload_attempts: DEFAULT_RELOAD_ATTEMPTS,
            reload_delay: DEFAULT_RELOAD_DELAY,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn reload_attempts(mut self, attempts: usize) -> Self {
        self.reload_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn reload_delay(mut self, delay: Duration) -> Self {
        self.reload_delay = delay;
        self
    }

    #[must_use]
    pub fn fetch_retries(mut self, retries: usize) -> Self {
        self.fetch_retries = retries;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn node(&self) -> &RobustNode<C> {
        &self.node
    }

    /// Load block `number`, reloading while its hash equals `stale`'s.
    ///
    /// On the last attempt the block is returned even if it still matches `stale`. Node errors
    /// are returned as they are; the node has already retried them.
    ///
    /// # Errors
    ///
    /// * [`TailError::Stopped`] if stopped between reloads.
    /// * Node errors from `eth_getBlockByNumber`.
    /// * Whatever the fork observer returns.
    pub async fn load_block(&self, number: u64, stale: Option<&Block>) -> Result<Block, TailError> {
        let mut attempt = 1;

        loop {
            let block = self.node.block_by_number(number).await?;
            match stale {
                Some(stale) if stale.hash == block.hash && attempt < self.reload_attempts => {
                    warn!(
                        number = number,
                        hash = %block.hash,
                        attempt = attempt,
                        "Node still serves a stale block, reloading"
                    );
                    self.observer.on_fork(number, &block, stale).await?;
                }
                _ => return Ok(block),
            }

            attempt += 1;
            self.pause(self.reload_delay).await?;
        }
    }

    /// Load block `number` and run `process` on it.
    ///
    /// A recoverable failure marks the loaded block as stale and starts over, at most
    /// `fetch_retries` times. Unrecoverable failures are returned as they are.
    ///
    /// # Errors
    ///
    /// * [`TailError::BlockUnavailable`] once retries are exhausted.
    /// * Any unrecoverable error from loading or `process`.
    pub async fn fetch<T, P, Fut>(&self, number: u64, process: P) -> Result<T, TailError>
    where
        P: Fn(Arc<Block>) -> Fut,
        Fut: Future<Output = Result<T, TailError>>,
    {
        let mut stale: Option<Arc<Block>> = None;
        let mut retries = 0;

        loop {
            let mut loaded = None;
            let outcome = match self.load_block(number, stale.as_deref()).await {
                Ok(block) => {
                    let block = Arc::new(block);
                    loaded = Some(Arc::clone(&block));
                    process(block).await
                }
                Err(err) => Err(err),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_recoverable() => return Err(err),
                Err(err) => err,
            };

            if retries >= self.fetch_retries {
                error!(number = number, error = %err, "Giving up on block");
                return Err(TailError::BlockUnavailable { number, source: Box::new(err) });
            }
            retries += 1;

            debug!(
                number = number,
                error = %err,
                retry = retries,
                "Block processing failed, retrying"
            );
            if loaded.is_some() {
                stale = loaded;
            }
            self.pause(self.retry_delay).await?;
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), TailError> {
        tokio::select! {
            () = self.stopped.cancelled() => Err(TailError::Stopped),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
