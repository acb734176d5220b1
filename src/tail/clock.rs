use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::{
    TailError,
    robust_node::{ChainClient, RobustNode},
};

/// Default distance from wall-clock time within which a block counts as current.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

const UNCHANGED_HEIGHT_DELAY: Duration = Duration::from_millis(500);
const STALENESS_GRACE: Duration = Duration::from_secs(60);
const MIN_STALE_DELAY: Duration = Duration::from_millis(500);
const MAX_STALE_DELAY: Duration = Duration::from_secs(120);

/// How long to wait before polling again after seeing a head that is `staleness` behind.
pub(crate) fn staleness_delay(staleness: Duration) -> Duration {
    staleness.saturating_sub(STALENESS_GRACE).clamp(MIN_STALE_DELAY, MAX_STALE_DELAY)
}

/// Resolve the current chain height, refusing heads older than `window`.
///
/// A node that is still syncing keeps reporting a head far behind wall-clock time; polling
/// backs off in proportion to how stale that head is.
pub(crate) async fn current_height<C: ChainClient>(
    node: &RobustNode<C>,
    window: Duration,
    stopped: &CancellationToken,
) -> Result<u64, TailError> {
    let mut previous = None;

    loop {
        if stopped.is_cancelled() {
            return Err(TailError::Stopped);
        }

        let height = node.block_number().await?;
        if previous == Some(height) {
            pause(UNCHANGED_HEIGHT_DELAY, stopped).await?;
            continue;
        }
        previous = Some(height);

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let block = match node.block_by_number(height).await {
            Ok(block) => block,
            Err(err) if err.is_transient() => {
                debug!(height = height, error = %err, "Could not load head block");
                continue;
            }
            Err(err) => return Err(err),
        };

        let produced = Duration::from_secs(block.timestamp);
        let staleness = now.saturating_sub(produced);
        if staleness <= window {
            debug!(height = block.number, "Resolved current height");
            return Ok(block.number);
        }

        let delay = staleness_delay(staleness);
        info!(
            height = height,
            staleness_secs = staleness.as_secs(),
            delay_ms = delay.as_millis(),
            "Node head is stale, waiting"
        );
        pause(delay, stopped).await?;
    }
}

async fn pause(delay: Duration, stopped: &CancellationToken) -> Result<(), TailError> {
    tokio::select! {
        () = stopped.cancelled() => Err(TailError::Stopped),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{robust_node::RobustNodeBuilder, test_utils::{MockChain, unix_now}};

    #[test]
    fn staleness_delay_is_clamped() {
        assert_eq!(staleness_delay(Duration::from_secs(31)), MIN_STALE_DELAY);
        assert_eq!(staleness_delay(Duration::from_secs(90)), Duration::from_secs(30));
        assert_eq!(staleness_delay(Duration::from_secs(3_600)), MAX_STALE_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_head_is_accepted() -> anyhow::Result<()> {
        let chain = MockChain::new(77);
        chain.set_timestamp(77, unix_now() - 5);
        let node = RobustNodeBuilder::new(chain).build();

        let height =
            current_height(&node, DEFAULT_FRESHNESS_WINDOW, &CancellationToken::new()).await?;
        assert_eq!(height, 77);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn future_timestamps_count_as_fresh() -> anyhow::Result<()> {
        let chain = MockChain::new(3);
        chain.set_timestamp(3, unix_now() + 100);
        let node = RobustNodeBuilder::new(chain).build();

        assert_eq!(current_height(&node, Duration::ZERO, &CancellationToken::new()).await?, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stale_head_waits_for_a_fresh_one() -> anyhow::Result<()> {
        let chain = MockChain::new(10);
        chain.set_timestamp(10, unix_now() - 600);
        let node = RobustNodeBuilder::new(chain.clone()).build();

        let syncing = chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(200)).await;
            syncing.set_timestamp(11, unix_now());
            syncing.set_height(11);
        });

        let started = tokio::time::Instant::now();
        let height =
            current_height(&node, DEFAULT_FRESHNESS_WINDOW, &CancellationToken::new()).await?;

        assert_eq!(height, 11);
        assert!(started.elapsed() >= Duration::from_secs(200));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_interrupts_the_wait() {
        let chain = MockChain::new(10);
        chain.set_timestamp(10, unix_now() - 600);
        let node = RobustNodeBuilder::new(chain).build();
        let stopped = CancellationToken::new();

        let waiter = tokio::spawn({
            let stopped = stopped.clone();
            async move { current_height(&node, DEFAULT_FRESHNESS_WINDOW, &stopped).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        stopped.cancel();

        assert!(matches!(waiter.await, Ok(Err(TailError::Stopped))));
    }
}
