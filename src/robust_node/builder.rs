use std::{sync::Arc, time::Duration};

use alloy::{network::Ethereum, providers::RootProvider};

use crate::{
    TailError,
    robust_node::{ChainClient, FibonacciBackoff, RobustNode, node::Connection},
};

/// Default timeout for a single call attempt.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of attempts, the first call included.
pub const DEFAULT_MAX_ATTEMPTS: usize = 15;
/// Default base delay of the Fibonacci backoff.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);
/// Default ceiling of the Fibonacci backoff.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Builder for constructing a [`RobustNode`].
pub struct RobustNodeBuilder<C> {
    client: C,
    call_timeout: Duration,
    max_attempts: usize,
    min_delay: Duration,
    max_delay: Duration,
}

impl<C: ChainClient> RobustNodeBuilder<C> {
    #[must_use]
    pub fn new(client: C) -> Self {
        Self {
            client,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// A node that never retries; only the call timeout applies.
    #[must_use]
    pub fn fragile(client: C) -> Self {
        Self::new(client).max_attempts(1).min_delay(Duration::ZERO)
    }

    /// Set the timeout of a single call attempt.
    #[must_use]
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the number of attempts, the first call included.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay `B` of the `B, 2B, 3B, 5B, ...` schedule.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Set the ceiling any single delay is clamped to.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn build(self) -> RobustNode<C> {
        debug!(
            call_timeout_ms = self.call_timeout.as_millis(),
            max_attempts = self.max_attempts,
            min_delay_ms = self.min_delay.as_millis(),
            "Building RobustNode"
        );

        RobustNode {
            client: Arc::new(self.client),
            connection: Connection::default(),
            call_timeout: self.call_timeout,
            backoff: FibonacciBackoff::new(self.min_delay, self.max_delay, self.max_attempts.max(1)),
        }
    }
}

impl RobustNodeBuilder<RootProvider<Ethereum>> {
    /// Dial `url` (HTTP, WebSocket or IPC) and wrap the resulting provider with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::RpcError`] if the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, TailError> {
        info!(url = url, "Connecting to node");
        let provider = RootProvider::<Ethereum>::connect(url).await?;
        Ok(Self::new(provider))
    }
}

/// Conversion into a [`RobustNode`], so tails accept either a raw client or a configured node.
pub trait IntoRobustNode<C> {
    fn into_robust_node(self) -> RobustNode<C>;
}

impl<C: ChainClient> IntoRobustNode<C> for C {
    fn into_robust_node(self) -> RobustNode<C> {
        RobustNodeBuilder::new(self).build()
    }
}

impl<C: ChainClient> IntoRobustNode<C> for RobustNode<C> {
    fn into_robust_node(self) -> RobustNode<C> {
        self
    }
}

impl<C: ChainClient> IntoRobustNode<C> for RobustNodeBuilder<C> {
    fn into_robust_node(self) -> RobustNode<C> {
        self.build()
    }
}
