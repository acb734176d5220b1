//! Confirmation-gated block loading with recovery from short reorganizations.
//!
//! [`ConfirmationGate`] holds a height back until the chain has moved `confirmations` blocks
//! past it. [`BlockFetcher`] loads a block, reloading it while the node keeps serving a block
//! already flagged as stale, and retries processing that fails for transient reasons.
//! [`BlockCursor`] combines both into a sequential reader.

mod confirmation;
mod cursor;
mod fetcher;

pub use confirmation::{ConfirmationGate, DEFAULT_POLL_INTERVAL};
pub use cursor::{BlockCursor, ConfirmedBlock};
pub use fetcher::{
    BlockFetcher, DEFAULT_FETCH_RETRIES, DEFAULT_RELOAD_ATTEMPTS, DEFAULT_RELOAD_DELAY,
    DEFAULT_RETRY_DELAY, ForkObserver,
};
