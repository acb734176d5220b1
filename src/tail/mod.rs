//! The top-level driver.
//!
//! A [`Tail`] pulls prepared blocks from a [`PrefetchQueue`] in height order and delivers each
//! one to its [`TailHandler`]: the block hook, then every accepted event and plain transaction
//! in `(transactionIndex, logIndex)` order, then the checkpoint. Decoding, filtering and
//! receipt resolution happen ahead of time inside the prefetch tasks; only delivery is
//! serialized.
//!
//! ```no_run
//! use alloy::primitives::address;
//! use eth_tail::{Direction, RobustNodeBuilder, TailBuilder, TailHandler};
//!
//! struct Printer;
//!
//! impl TailHandler for Printer {
//!     async fn on_checkpoint(&self, next: u64) -> Result<(), eth_tail::HandlerError> {
//!         println!("resume from {next}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let wallet = address!("0x00000000000000000000000000000000000000b2");
//! let node = RobustNodeBuilder::connect("http://localhost:8545").await?;
//! let tail = TailBuilder::new()
//!     .from_now()
//!     .confirmations(12)
//!     .filter(move |address, direction| address == wallet && direction == Direction::Incoming)
//!     .build(node, Printer)?;
//!
//! let completion = tail.start()?;
//! completion.await?;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::primitives::Address;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    block_fetcher::{BlockFetcher, ConfirmationGate, ForkObserver},
    deployment_cache::DeploymentCache,
    events::EventCatalog,
    prefetch_queue::{PrefetchQueue, SequenceLoader},
    robust_node::{ChainClient, RobustNode},
    types::{Block, Direction, StartPosition, Transaction},
};

mod barrier;
mod builder;
mod clock;
mod dispatch;
mod handler;
mod prepare;
mod tracking;

pub use builder::{DEFAULT_CONFIRMATIONS, TailBuilder};
pub use clock::DEFAULT_FRESHNESS_WINDOW;
pub use handler::{Deposit, DepositDeployed, DispatchContext, Erc20Transfer, TailHandler};
pub use prepare::ReceiptConcurrency;
pub use tracking::TrackFn;

use barrier::BlockBarrier;
use dispatch::dispatch_block;
use prepare::{PreparedBlock, Preparer};
use tracking::Tracking;

/// Predicate deciding whether an address is of interest in a given direction.
pub type AddressFilter = Arc<dyn Fn(Address, Direction) -> bool + Send + Sync>;

/// Resolves when a started tail has fully shut down: `Ok(())` after [`Tail::stop`], or the
/// error that ended the run. Cloneable; every clone observes the same outcome.
pub type Completion = Shared<BoxFuture<'static, Result<(), TailError>>>;

#[derive(Clone)]
pub(crate) struct TailConfig {
    pub(crate) start: StartPosition,
    pub(crate) min_since: u64,
    pub(crate) confirmations: u64,
    pub(crate) factories: Arc<[Address]>,
    pub(crate) erc20: bool,
    pub(crate) filter: AddressFilter,
    pub(crate) cache: Option<Arc<DeploymentCache>>,
    pub(crate) max_buffered: usize,
    pub(crate) max_parallel: usize,
    pub(crate) freshness_window: Duration,
    pub(crate) zero_value_transactions: bool,
    pub(crate) receipt_concurrency: ReceiptConcurrency,
}

enum State {
    Idle,
    Running(Completion),
    Stopped(Completion),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Stopped(_) => "stopped",
        }
    }
}

/// A tail over one chain. Cheap to clone; clones drive the same run.
pub struct Tail<C, H> {
    inner: Arc<Inner<C, H>>,
}

impl<C, H> Clone for Tail<C, H> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<C, H> fmt::Debug for Tail<C, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tail")
            .field("state", &self.inner.state.lock().name())
            .field("since", &self.inner.since.load(Ordering::Acquire))
            .field("confirmations", &self.inner.config.confirmations)
            .field("tracking", &self.inner.tracking)
            .finish_non_exhaustive()
    }
}

struct Inner<C, H> {
    node: RobustNode<C>,
    handler: Arc<H>,
    config: TailConfig,
    catalog: Arc<EventCatalog>,
    tracking: Tracking,
    barrier: BlockBarrier,
    gate: ConfirmationGate<C>,
    stopping: CancellationToken,
    since: AtomicU64,
    state: Mutex<State>,
}

impl<C: ChainClient, H: TailHandler> Tail<C, H> {
    pub(crate) fn new(node: RobustNode<C>, handler: H, config: TailConfig) -> Self {
        let stopping = CancellationToken::new();
        let since = match config.start {
            StartPosition::Number(number) => number,
            StartPosition::Now => 0,
        }
        .max(config.min_since);

        let inner = Inner {
            gate: ConfirmationGate::new(node.clone(), config.confirmations, stopping.clone()),
            catalog: Arc::new(EventCatalog::new(config.erc20)),
            node,
            handler: Arc::new(handler),
            config,
            tracking: Tracking::default(),
            barrier: BlockBarrier::default(),
            stopping,
            since: AtomicU64::new(since),
            state: Mutex::new(State::Idle),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Start tailing on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::AlreadyStarted`] if the tail was started or stopped before.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn start(&self) -> Result<Completion, TailError> {
        let mut state = self.inner.state.lock();
        if !matches!(*state, State::Idle) {
            return Err(TailError::AlreadyStarted);
        }

        let inner = Arc::clone(&self.inner);
        let run = tokio::spawn(inner.run());
        let completion = async move {
            run.await.map_err(|err| TailError::TaskFailed(err.to_string().into()))?
        }
        .boxed()
        .shared();

        *state = State::Running(completion.clone());
        Ok(completion)
    }

    /// Stop the tail and tear down its node connection.
    ///
    /// A graceful stop lets in-flight node calls finish; a hard stop abandons them. Either way
    /// no callback starts once the returned [`Completion`] resolves. Stopping an idle tail
    /// prevents it from ever starting.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn stop(&self, graceful: bool) -> Completion {
        info!(graceful = graceful, "Stopping tail");
        self.inner.stopping.cancel();
        self.inner.node.close(graceful);

        let mut state = self.inner.state.lock();
        match &*state {
            State::Running(completion) | State::Stopped(completion) => completion.clone(),
            State::Idle => {
                let completion = futures::future::ready(Ok(())).boxed().shared();
                *state = State::Stopped(completion.clone());
                completion
            }
        }
    }

    /// Next height to be delivered; after a block's checkpoint this is the checkpoint value.
    #[must_use]
    pub fn since(&self) -> u64 {
        self.inner.since.load(Ordering::Acquire)
    }

    /// Highest chain height observed while waiting for confirmations.
    #[must_use]
    pub fn chain_height(&self) -> u64 {
        self.inner.gate.chain_height()
    }

    #[must_use]
    pub fn confirmations(&self) -> u64 {
        self.inner.config.confirmations
    }

    /// The current, sufficiently fresh chain height.
    ///
    /// # Errors
    ///
    /// * [`TailError::Stopped`] if the tail is stopped while waiting for a fresh head.
    /// * Node errors once the retrier gives up.
    pub async fn now(&self) -> Result<u64, TailError> {
        let inner = &self.inner;
        clock::current_height(&inner.node, inner.config.freshness_window, &inner.stopping).await
    }

    /// Dispatch every successful transaction sent from or to `address` to `callback`, whether
    /// or not the address filter accepts it. Replaces an earlier callback for the address.
    pub fn track<F>(&self, address: Address, callback: F)
    where
        F: Fn(&Transaction, u64, &Block) + Send + Sync + 'static,
    {
        debug!(address = %address, "Tracking address");
        self.inner.tracking.track(address, Arc::new(callback));
    }

    /// Stop tracking `address`. Returns whether it was tracked.
    pub fn untrack(&self, address: &Address) -> bool {
        self.inner.tracking.untrack(address)
    }

    /// Run `task` between two blocks: after every callback of the block being dispatched has
    /// resolved and before the next block starts.
    pub async fn run_between_blocks<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.inner.barrier.run_between(task).await
    }

    /// A companion tail following the chain tip.
    ///
    /// It starts at the current fresh height, but never below `since() + confirmations()`,
    /// requires no confirmations, keeps no deployment cache and shares this tail's filter,
    /// factories and connection. The connection is a child of this one: stopping the parent
    /// stops the companion's calls too. Create it inside
    /// [`run_between_blocks`](Self::run_between_blocks) for a floor consistent with the
    /// parent's progress.
    #[must_use]
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "trace", skip_all))]
    pub fn head<H2: TailHandler>(&self, handler: H2) -> Tail<C, H2> {
        let config = TailConfig {
            start: StartPosition::Now,
            min_since: self.since().saturating_add(self.inner.config.confirmations),
            confirmations: 0,
            cache: None,
            ..self.inner.config.clone()
        };
        debug!(min_since = config.min_since, "Creating head tail");
        Tail::new(self.inner.node.detached(), handler, config)
    }
}

impl<C: ChainClient, H: TailHandler> Inner<C, H> {
    async fn run(self: Arc<Self>) -> Result<(), TailError> {
        let result = self.drive().await;
        let requested = self.stopping.is_cancelled();
        self.stopping.cancel();

        match result {
            Ok(()) => Ok(()),
            Err(err) if requested && !matches!(err, TailError::Handler(_)) => {
                debug!(error = %err, "Tail stopped");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Tail failed");
                Err(err)
            }
        }
    }

    async fn drive(&self) -> Result<(), TailError> {
        let since = match self.config.start {
            StartPosition::Number(number) => number,
            StartPosition::Now => {
                clock::current_height(&self.node, self.config.freshness_window, &self.stopping)
                    .await?
            }
        }
        .max(self.config.min_since);
        self.since.store(since, Ordering::Release);

        info!(since = since, confirmations = self.config.confirmations, "Tail started");

        let pipeline = Arc::new(BlockPipeline {
            gate: self.gate.clone(),
            fetcher: BlockFetcher::new(
                self.node.clone(),
                ForkRelay(Arc::clone(&self.handler)),
                self.stopping.clone(),
            ),
            preparer: Preparer {
                node: self.node.clone(),
                catalog: Arc::clone(&self.catalog),
                factories: Arc::clone(&self.config.factories),
                filter: Arc::clone(&self.config.filter),
                tracking: self.tracking.clone(),
                cache: self.config.cache.clone(),
                zero_value_transactions: self.config.zero_value_transactions,
                receipts: self.config.receipt_concurrency,
            },
        });
        let mut queue = PrefetchQueue::start(
            pipeline,
            since,
            self.config.max_buffered,
            self.config.max_parallel,
            &self.stopping,
        )?;

        let result = self.consume(&mut queue).await;
        queue.control().destroy().await;
        result
    }

    async fn consume(&self, queue: &mut PrefetchQueue<PreparedBlock>) -> Result<(), TailError> {
        loop {
            let prepared = queue.shift().await?;
            let _boundary = self.barrier.enter().await;
            if self.stopping.is_cancelled() {
                return Err(TailError::Stopped);
            }

            let number = prepared.block.number;
            let confirmations = self.gate.chain_height().saturating_sub(number);
            let next = dispatch_block(
                self.handler.as_ref(),
                &self.tracking,
                self.config.cache.as_deref(),
                &prepared,
                confirmations,
            )
            .await?;
            self.since.store(next, Ordering::Release);
            debug!(
                number = number,
                entries = prepared.entries.len(),
                confirmations = confirmations,
                "Block delivered"
            );
        }
    }
}

/// Waits for confirmation, then loads and prepares one block.
struct BlockPipeline<C, H> {
    gate: ConfirmationGate<C>,
    fetcher: BlockFetcher<C, ForkRelay<H>>,
    preparer: Preparer<C>,
}

impl<C: ChainClient, H: TailHandler> SequenceLoader for BlockPipeline<C, H> {
    type Output = PreparedBlock;

    async fn confirmed(&self, sequence: u64) -> Result<(), TailError> {
        self.gate.wait(sequence).await.map(|_| ())
    }

    async fn load(&self, sequence: u64) -> Result<PreparedBlock, TailError> {
        self.fetcher.fetch(sequence, |block| self.preparer.prepare(block)).await
    }
}

/// Forwards fork notifications to the handler.
struct ForkRelay<H>(Arc<H>);

impl<H: TailHandler> ForkObserver for ForkRelay<H> {
    async fn on_fork(&self, number: u64, fresh: &Block, stale: &Block) -> Result<(), TailError> {
        self.0.on_fork(number, fresh, stale).await.map_err(TailError::handler)
    }
}
