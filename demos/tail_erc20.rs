//! Follow ERC20 transfers into one address.
//!
//! ```sh
//! RUST_LOG=eth_tail=debug cargo run --example tail_erc20 -- <rpc-url> <address> [from-block]
//! ```

use std::time::Duration;

use alloy::primitives::Address;
use eth_tail::{
    DispatchContext, Direction, Erc20Transfer, HandlerError, RobustNodeBuilder, TailBuilder,
    TailHandler,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Printer;

impl TailHandler for Printer {
    async fn on_erc20_transfer(
        &self,
        event: &Erc20Transfer,
        ctx: &DispatchContext<'_>,
    ) -> Result<(), HandlerError> {
        info!(
            block = ctx.block.number,
            tx = %ctx.transaction.hash,
            token = %event.token,
            from = %event.from,
            amount = %event.amount,
            "Incoming transfer"
        );
        Ok(())
    }

    async fn on_checkpoint(&self, next: u64) -> Result<(), HandlerError> {
        info!(next = next, "Checkpoint");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).try_init();

    let mut args = std::env::args().skip(1);
    let url = args.next().unwrap_or_else(|| "ws://localhost:8545".to_owned());
    let watched: Address = args.next().ok_or_else(|| anyhow::anyhow!("missing address"))?.parse()?;
    let from_block = args.next().map(|arg| arg.parse::<u64>()).transpose()?;

    let node = RobustNodeBuilder::connect(&url)
        .await?
        .call_timeout(Duration::from_secs(30))
        .min_delay(Duration::from_millis(500))
        .build();

    let builder = TailBuilder::new()
        .confirmations(12)
        .filter(move |address, direction| address == watched && direction == Direction::Incoming);
    let builder = match from_block {
        Some(number) => builder.from_block(number),
        None => builder.from_now(),
    };
    let tail = builder.build(node, Printer)?;

    let completion = tail.start()?;
    tokio::select! {
        result = completion => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(since = tail.since(), "Stopping");
            tail.stop(true).await?;
        }
    }

    Ok(())
}
