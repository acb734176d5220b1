#![allow(dead_code)]

use std::time::Duration;

use alloy::primitives::{Address, address};
use eth_tail::{Completion, RobustNode, RobustNodeBuilder, test_utils::MockChain};

pub const ALICE: Address = address!("0x00000000000000000000000000000000000000a1");
pub const BOB: Address = address!("0x00000000000000000000000000000000000000b2");
pub const CAROL: Address = address!("0x00000000000000000000000000000000000000c3");
pub const TOKEN: Address = address!("0x0000000000000000000000000000000000007070");
pub const FACTORY: Address = address!("0x000000000000000000000000000000000000f0f0");
pub const DEPOSIT: Address = address!("0x000000000000000000000000000000000000dd01");

/// Upper bound on how long a test waits for the tail, in virtual time.
pub const PATIENCE: Duration = Duration::from_secs(120);

/// Node over `chain` with short retry delays.
pub fn fast_node(chain: &MockChain) -> RobustNode<MockChain> {
    RobustNodeBuilder::new(chain.clone())
        .min_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(100))
        .build()
}

/// Await `completion`, failing the test if it does not resolve in time.
pub async fn settle(completion: Completion) -> anyhow::Result<Result<(), eth_tail::TailError>> {
    Ok(tokio::time::timeout(PATIENCE, completion).await?)
}
