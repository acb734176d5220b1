use std::{error::Error as StdError, sync::Arc};

use alloy::{
    primitives::BlockHash,
    transports::{RpcError, TransportErrorKind},
};
use thiserror::Error;

/// Error type returned by consumer callbacks.
pub type HandlerError = Box<dyn StdError + Send + Sync>;

/// Errors emitted by the tail and its collaborators.
///
/// Values are cheap to clone so that a single terminal failure can be handed to every caller
/// awaiting a [`Completion`](crate::Completion).
#[derive(Error, Debug, Clone)]
pub enum TailError {
    /// The underlying RPC transport returned an error.
    #[error("RPC error: {0}")]
    RpcError(Arc<RpcError<TransportErrorKind>>),

    /// A single call attempt did not answer within the configured call timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The node answered `null` where a value was expected.
    #[error("{0} returned an empty result")]
    EmptyResponse(&'static str),

    /// The connection was closed, either by `stop()` or because the owning tail went away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A block could not be processed after exhausting the fetch ceiling.
    #[error("Block {number} could not be fetched: {source}")]
    BlockUnavailable {
        /// Height that was being fetched.
        number: u64,
        /// Last error observed while fetching it.
        source: Box<TailError>,
    },

    /// Logs returned for a height belong to a different block than the one loaded for it.
    #[error("Logs for block {number} belong to block {found}, expected {expected}")]
    LogsMismatch {
        /// Height being processed.
        number: u64,
        /// Hash of the loaded block.
        expected: BlockHash,
        /// Block hash carried by the logs.
        found: BlockHash,
    },

    /// The node returned logs whose `logIndex` does not strictly increase within a transaction.
    #[error("Invalid log order in block {block_number}, transaction index {transaction_index}")]
    InvalidLogOrder {
        /// Height of the offending block.
        block_number: u64,
        /// Index of the offending transaction.
        transaction_index: u64,
    },

    /// A consumer callback failed.
    #[error("Handler failed: {0}")]
    Handler(Arc<dyn StdError + Send + Sync>),

    /// `start()` was called on a tail that is not idle.
    #[error("Tail already started")]
    AlreadyStarted,

    /// The tail was stopped before the operation could complete.
    #[error("Tail stopped")]
    Stopped,

    /// The prefetch queue was destroyed while a consumer was waiting on it.
    #[error("Prefetch queue destroyed")]
    QueueDestroyed,

    /// A background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    TaskFailed(Arc<str>),

    /// The configured prefetch buffer size is invalid (must be greater than zero).
    #[error("Max buffered blocks must be greater than 0")]
    InvalidMaxBuffered,

    /// The configured prefetch parallelism is invalid (must be greater than zero).
    #[error("Max parallel fetches must be greater than 0")]
    InvalidMaxParallel,

    /// The configured deployment cache capacity is invalid (must be greater than zero).
    #[error("Deployment cache capacity must be greater than 0")]
    InvalidDeploymentCacheCapacity,

    /// The receipt concurrency window is invalid (initial must be in `1..=max`).
    #[error("Receipt concurrency must satisfy 0 < initial <= max, got {initial}..={max}")]
    InvalidReceiptConcurrency {
        /// Initial window width.
        initial: usize,
        /// Hard ceiling.
        max: usize,
    },
}

impl TailError {
    /// Whether the backoff retrier should try the call again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcError(_) | Self::Timeout | Self::EmptyResponse(_))
    }

    /// Whether the block fetcher may re-fetch the block and try processing it again.
    ///
    /// Ordering violations, handler failures, fetch exhaustion and shutdown are terminal for the
    /// run.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.is_transient() || matches!(self, Self::LogsMismatch { .. })
    }

    pub(crate) fn handler(err: HandlerError) -> Self {
        Self::Handler(Arc::from(err))
    }
}

impl From<RpcError<TransportErrorKind>> for TailError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        TailError::RpcError(Arc::new(error))
    }
}

impl From<tokio::time::error::Elapsed> for TailError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TailError::Timeout
    }
}
