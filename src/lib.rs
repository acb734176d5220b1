//! eth-tail follows an EVM chain block by block and delivers ordered, checkpointed callbacks.
//!
//! The main entry point is [`Tail`], built with a [`TailBuilder`] around a [`RobustNode`] and a
//! [`TailHandler`]. Once started, a tail:
//!
//! * waits until each block is buried under the configured number of confirmations,
//! * prefetches blocks ahead of delivery, bounded by a buffer and a parallelism limit,
//! * decodes factory deployments, deposit forwards and (optionally) ERC20 transfers,
//! * drops anything whose transaction reverted,
//! * calls the handler for every remaining item in chain order and then checkpoints the block.
//!
//! # Ordering
//!
//! Blocks are delivered strictly by height with no gaps. Within a block, items are delivered by
//! `(transactionIndex, logIndex)`; a plain transaction sorts after any log of its index.
//! Each callback is awaited before the next one starts.
//!
//! # Checkpoints
//!
//! [`TailHandler::on_checkpoint`] receives `number + 1` after everything in block `number` was
//! delivered. Persist it and restart with [`TailBuilder::from_block`] to resume; blocks beyond
//! the confirmation depth are then delivered exactly as before.
//!
//! # Reorgs
//!
//! Blocks are only released once confirmed. If a block's logs turn out to belong to a different
//! block, the block is flagged as stale and refetched; while the node keeps serving the stale
//! block, [`TailHandler::on_fork`] is notified.
//!
//! # Failures
//!
//! Transient node failures are retried with Fibonacci backoff by [`RobustNode`]. Everything else
//! (exhausted retries, malformed log order, handler errors) ends the run; the error is returned
//! by the [`Completion`] from [`Tail::start`].

#[macro_use]
mod logging;

pub mod block_fetcher;
pub mod deployment_cache;
pub mod events;
pub mod prefetch_queue;
pub mod robust_node;
pub mod tail;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;
mod types;

pub use error::{HandlerError, TailError};
pub use types::{Block, Direction, LogQuery, Receipt, StartPosition, Transaction};

pub use deployment_cache::{
    DEFAULT_DEPLOYMENT_CACHE_CAPACITY, Deployment, DeploymentCache, DeploymentCacheConfig,
};
pub use events::{EventCatalog, EventKind, TailEvent};
pub use robust_node::{ChainClient, IntoRobustNode, RobustNode, RobustNodeBuilder};
pub use tail::{
    AddressFilter, Completion, DEFAULT_CONFIRMATIONS, DEFAULT_FRESHNESS_WINDOW, Deposit,
    DepositDeployed, DispatchContext, Erc20Transfer, ReceiptConcurrency, Tail, TailBuilder,
    TailHandler, TrackFn,
};
