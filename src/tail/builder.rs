use std::{fmt, sync::Arc, time::Duration};

use alloy::primitives::Address;

use crate::{
    TailError,
    deployment_cache::DeploymentCacheConfig,
    prefetch_queue::{DEFAULT_MAX_BUFFERED, DEFAULT_MAX_PARALLEL},
    robust_node::{ChainClient, IntoRobustNode},
    tail::{
        AddressFilter, DEFAULT_FRESHNESS_WINDOW, ReceiptConcurrency, Tail, TailConfig,
        handler::TailHandler,
    },
    types::{Direction, StartPosition},
};

/// Default confirmation depth.
pub const DEFAULT_CONFIRMATIONS: u64 = 0;

/// Builder/configuration for a [`Tail`].
#[derive(Clone)]
pub struct TailBuilder {
    /// Where the tail begins.
    pub start: StartPosition,
    /// Floor applied to the resolved starting height.
    pub min_since: u64,
    /// Blocks required on top of a block before it is delivered.
    pub confirmations: u64,
    /// Factories whose `Deployed` events are trusted.
    pub deposit_factories: Vec<Address>,
    /// Whether ERC20 `Transfer` logs are decoded.
    pub erc20: bool,
    pub filter: AddressFilter,
    pub deployment_cache: DeploymentCacheConfig,
    /// Blocks that may be prefetched ahead of dispatch.
    pub max_buffered: usize,
    /// Concurrent block downloads.
    pub max_parallel: usize,
    /// Maximum age of a head block accepted as "now".
    pub freshness_window: Duration,
    /// Dispatch plain transactions that carry no value.
    pub zero_value_transactions: bool,
    pub receipt_concurrency: ReceiptConcurrency,
}

impl fmt::Debug for TailBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailBuilder")
            .field("start", &self.start)
            .field("min_since", &self.min_since)
            .field("confirmations", &self.confirmations)
            .field("deposit_factories", &self.deposit_factories)
            .field("erc20", &self.erc20)
            .field("deployment_cache", &self.deployment_cache)
            .field("max_buffered", &self.max_buffered)
            .field("max_parallel", &self.max_parallel)
            .field("freshness_window", &self.freshness_window)
            .field("zero_value_transactions", &self.zero_value_transactions)
            .field("receipt_concurrency", &self.receipt_concurrency)
            .finish_non_exhaustive()
    }
}

impl Default for TailBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TailBuilder {
    /// A tail starting at height 0 with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: StartPosition::Number(0),
            min_since: 0,
            confirmations: DEFAULT_CONFIRMATIONS,
            deposit_factories: Vec::new(),
            erc20: true,
            filter: Arc::new(|_, _| true),
            deployment_cache: DeploymentCacheConfig::default(),
            max_buffered: DEFAULT_MAX_BUFFERED,
            max_parallel: DEFAULT_MAX_PARALLEL,
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            zero_value_transactions: false,
            receipt_concurrency: ReceiptConcurrency::default(),
        }
    }

    /// Start at a concrete height, typically a persisted checkpoint.
    #[must_use]
    pub fn from_block(mut self, number: u64) -> Self {
        self.start = StartPosition::Number(number);
        self
    }

    /// Start at the current, sufficiently fresh chain height.
    #[must_use]
    pub fn from_now(mut self) -> Self {
        self.start = StartPosition::Now;
        self
    }

    /// Never start below `min_since`, whatever the start position resolves to.
    #[must_use]
    pub fn min_since(mut self, min_since: u64) -> Self {
        self.min_since = min_since;
        self
    }

    #[must_use]
    pub fn confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Add a factory to the deposit-factory allow-list.
    #[must_use]
    pub fn deposit_factory(mut self, factory: Address) -> Self {
        if !self.deposit_factories.contains(&factory) {
            self.deposit_factories.push(factory);
        }
        self
    }

    #[must_use]
    pub fn deposit_factories(mut self, factories: impl IntoIterator<Item = Address>) -> Self {
        for factory in factories {
            self = self.deposit_factory(factory);
        }
        self
    }

    /// Enable or disable ERC20 transfer decoding. Enabled by default.
    #[must_use]
    pub fn erc20(mut self, enabled: bool) -> Self {
        self.erc20 = enabled;
        self
    }

    /// Set the address filter deciding which transfers are of interest.
    ///
    /// ERC20 transfers are offered as `(to, Incoming)` then `(from, Outgoing)`, deposits as
    /// `(deposit contract, Incoming)`, plain transactions as `(to, Incoming)` then
    /// `(from, Outgoing)`. The default accepts everything.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Address, Direction) -> bool + Send + Sync + 'static,
    {
        self.filter = Arc::new(filter);
        self
    }

    #[must_use]
    pub fn deployment_cache(mut self, config: DeploymentCacheConfig) -> Self {
        self.deployment_cache = config;
        self
    }

    /// Maximum blocks prefetched ahead of dispatch. Must be greater than 0.
    #[must_use]
    pub fn max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    /// Maximum concurrent block downloads. Must be greater than 0.
    #[must_use]
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    #[must_use]
    pub fn freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    /// Also dispatch plain transactions that carry no value. Off by default.
    #[must_use]
    pub fn zero_value_transactions(mut self, enabled: bool) -> Self {
        self.zero_value_transactions = enabled;
        self
    }

    /// Set the receipt resolution window. Requires `0 < initial <= max`.
    #[must_use]
    pub fn receipt_concurrency(mut self, initial: usize, max: usize) -> Self {
        self.receipt_concurrency = ReceiptConcurrency { initial, max };
        self
    }

    /// Build the tail. It does nothing until [`Tail::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero buffer, parallelism or cache capacity, or an
    /// empty receipt window.
    pub fn build<C, H>(
        self,
        node: impl IntoRobustNode<C>,
        handler: H,
    ) -> Result<Tail<C, H>, TailError>
    where
        C: ChainClient,
        H: TailHandler,
    {
        if self.max_buffered == 0 {
            return Err(TailError::InvalidMaxBuffered);
        }
        if self.max_parallel == 0 {
            return Err(TailError::InvalidMaxParallel);
        }
        let ReceiptConcurrency { initial, max } = self.receipt_concurrency;
        if initial == 0 || initial > max {
            return Err(TailError::InvalidReceiptConcurrency { initial, max });
        }

        let cache = self.deployment_cache.into_cache()?;

        debug!(
            start = ?self.start,
            confirmations = self.confirmations,
            factories = self.deposit_factories.len(),
            erc20 = self.erc20,
            "Building tail"
        );

        let config = TailConfig {
            start: self.start,
            min_since: self.min_since,
            confirmations: self.confirmations,
            factories: self.deposit_factories.into(),
            erc20: self.erc20,
            filter: self.filter,
            cache,
            max_buffered: self.max_buffered,
            max_parallel: self.max_parallel,
            freshness_window: self.freshness_window,
            zero_value_transactions: self.zero_value_transactions,
            receipt_concurrency: self.receipt_concurrency,
        };
        Ok(Tail::new(node.into_robust_node(), handler, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;

    #[test]
    fn defaults() {
        let builder = TailBuilder::new();
        assert_eq!(builder.start, StartPosition::Number(0));
        assert_eq!(builder.max_buffered, 512);
        assert_eq!(builder.max_parallel, 16);
        assert_eq!(builder.freshness_window, Duration::from_secs(30));
        assert!(builder.erc20);
        assert!(!builder.zero_value_transactions);
        assert!((builder.filter)(Address::ZERO, Direction::Incoming));
    }

    #[test]
    fn factories_are_deduplicated() {
        let factory = Address::repeat_byte(0xf);
        let builder = TailBuilder::new().deposit_factory(factory).deposit_factories([factory]);
        assert_eq!(builder.deposit_factories, vec![factory]);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let chain = MockChain::new(0);
        assert!(matches!(
            TailBuilder::new().max_buffered(0).build(chain.clone(), ()),
            Err(TailError::InvalidMaxBuffered)
        ));
        assert!(matches!(
            TailBuilder::new().max_parallel(0).build(chain.clone(), ()),
            Err(TailError::InvalidMaxParallel)
        ));
        assert!(matches!(
            TailBuilder::new().receipt_concurrency(4, 2).build(chain.clone(), ()),
            Err(TailError::InvalidReceiptConcurrency { initial: 4, max: 2 })
        ));
        assert!(matches!(
            TailBuilder::new().deployment_cache(DeploymentCacheConfig::Capacity(0)).build(chain, ()),
            Err(TailError::InvalidDeploymentCacheCapacity)
        ));
    }
}
