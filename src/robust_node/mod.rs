//! Retrying access to a chain node.
//!
//! [`ChainClient`] is the narrow set of remote calls the tail needs. It is implemented for
//! Alloy's [`RootProvider`](alloy::providers::RootProvider), so any transport Alloy supports can
//! be used, and by the in-memory `MockChain` used in tests.
//!
//! [`RobustNode`] wraps a client and routes every call through a single retry helper:
//! * a per-attempt timeout
//! * Fibonacci-shaped backoff (`B, 2B, 3B, 5B, ...`, capped) via [`FibonacciBackoff`]
//! * `null` answers treated as transient failures
//! * prompt termination once the connection is closed
//!
//! # Examples
//!
//! ```rust,no_run
//! use eth_tail::robust_node::RobustNodeBuilder;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let node = RobustNodeBuilder::connect("ws://localhost:8545")
//!     .await?
//!     .call_timeout(Duration::from_secs(30))
//!     .max_attempts(10)
//!     .build();
//!
//! let height = node.block_number().await?;
//! println!("Current block: {height}");
//! # Ok(()) }
//! ```

pub mod backoff;
pub mod builder;
pub mod client;
pub mod node;

pub use backoff::{FibonacciBackoff, FibonacciDelays};
pub use builder::*;
pub use client::ChainClient;
pub use node::RobustNode;
