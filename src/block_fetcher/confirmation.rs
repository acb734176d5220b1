use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    robust_node::{ChainClient, RobustNode},
};

/// Default interval between chain height polls while waiting for confirmations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Holds back a sequence number until the chain is `confirmations` blocks past it.
///
/// The observed chain height only ever moves forward within one gate, even if a node briefly
/// reports a lower height.
#[derive(Debug)]
pub struct ConfirmationGate<C> {
    node: RobustNode<C>,
    confirmations: u64,
    height: Arc<AtomicU64>,
    poll_interval: Duration,
    stopped: CancellationToken,
}

impl<C> Clone for ConfirmationGate<C> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            confirmations: self.confirmations,
            height: Arc::clone(&self.height),
            poll_interval: self.poll_interval,
            stopped: self.stopped.clone(),
        }
    }
}

impl<C: ChainClient> ConfirmationGate<C> {
    #[must_use]
    pub fn new(node: RobustNode<C>, confirmations: u64, stopped: CancellationToken) -> Self {
        Self {
            node,
            confirmations,
            height: Arc::new(AtomicU64::new(0)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stopped,
        }
    }

    #[must_use]
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Highest chain height observed so far.
    #[must_use]
    pub fn chain_height(&self) -> u64 {
        self.height.load(Ordering::Acquire)
    }

    /// Whether `sequence` is confirmed according to the last observed height.
    #[must_use]
    pub fn is_confirmed(&self, sequence: u64) -> bool {
        self.chain_height() >= sequence.saturating_add(self.confirmations)
    }

    /// Wait until `sequence` is confirmed and return the depth it is buried under.
    ///
    /// # Errors
    ///
    /// * [`TailError::Stopped`] if the gate is stopped while waiting.
    /// * Node errors once the retrier gives up on `eth_blockNumber`.
    pub async fn wait(&self, sequence: u64) -> Result<u64, TailError> {
        loop {
            if self.stopped.is_cancelled() {
                return Err(TailError::Stopped);
            }
            if self.is_confirmed(sequence) {
                return Ok(self.chain_height() - sequence);
            }

            let height = tokio::select! {
                biased;
                () = self.stopped.cancelled() => return Err(TailError::Stopped),
                height = self.node.block_number() => height?,
            };
            let previous = self.height.fetch_max(height, Ordering::AcqRel);
            if height > previous {
                trace!(height = height, "Chain height advanced");
            }
            if self.is_confirmed(sequence) {
                continue;
            }

            trace!(
                sequence = sequence,
                height = self.chain_height(),
                confirmations = self.confirmations,
                "Waiting for confirmations"
            );
            tokio::select! {
                () = self.stopped.cancelled() => return Err(TailError::Stopped),
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
