mod common;

use std::time::Duration;

use alloy::primitives::U256;
use eth_tail::{
    Block, Erc20Transfer, TailBuilder, TailError,
    block_fetcher::DEFAULT_FETCH_RETRIES,
    robust_node::DEFAULT_MAX_ATTEMPTS,
    test_utils::{
        MockChain, Recorded, RecordingHandler, block_at, canonical_hash, erc20_transfer_log,
        transaction,
    },
};
use tokio::time::{Instant, timeout};

use crate::common::{ALICE, BOB, PATIENCE, TOKEN, fast_node, settle};

#[tokio::test(start_paused = true)]
async fn stale_block_is_refetched_until_it_matches_its_logs() -> anyhow::Result<()> {
    let chain = MockChain::new(200);
    let stale = block_at(200, "stale");
    let canonical = Block {
        transactions: vec![transaction(0, ALICE, Some(TOKEN), U256::ZERO)],
        ..block_at(200, "canonical")
    };
    chain.script_blocks(200, [stale.clone(), stale.clone(), canonical]);

    let mut log = erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(4), 200, 0, 0);
    log.block_hash = Some(canonical_hash(200));
    chain.push_log(log);

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new().from_block(200).build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(201)).await?;

    assert_eq!(
        handler.records(),
        vec![
            Recorded::Fork { number: 200, fresh: stale.hash, stale: stale.hash },
            Recorded::Block { number: 200, confirmations: 0 },
            Recorded::Erc20Transfer(Erc20Transfer {
                from: ALICE,
                to: BOB,
                amount: U256::from(4),
                token: TOKEN,
            }),
            Recorded::Checkpoint(201),
        ]
    );

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn block_that_never_matches_its_logs_ends_the_run() -> anyhow::Result<()> {
    let chain = MockChain::new(60);
    chain.script_blocks(60, [block_at(60, "stale")]);

    let mut log = erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(1), 60, 0, 0);
    log.block_hash = Some(canonical_hash(60));
    chain.push_log(log);

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new().from_block(60).build(fast_node(&chain), handler.clone())?;

    let result = settle(tail.start()?).await?;

    match result {
        Err(TailError::BlockUnavailable { number, source }) => {
            assert_eq!(number, 60);
            assert!(matches!(*source, TailError::LogsMismatch { number: 60, .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    // every reload but the last of each of the five retries reports the fork
    let forks =
        handler.records().iter().filter(|record| matches!(record, Recorded::Fork { .. })).count();
    assert_eq!(forks, 5 * 14);
    assert!(handler.blocks().is_empty());
    assert_eq!(tail.since(), 60);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unreachable_block_fails_after_bounded_attempts() -> anyhow::Result<()> {
    let chain = MockChain::new(40);
    chain.fail_blocks(usize::MAX);
    let tail = TailBuilder::new().from_block(40).build(fast_node(&chain), ())?;

    let started = Instant::now();
    let result = settle(tail.start()?).await?;

    assert!(matches!(result, Err(TailError::BlockUnavailable { number: 40, .. })));
    assert_eq!(chain.calls().blocks, DEFAULT_MAX_ATTEMPTS * (DEFAULT_FETCH_RETRIES + 1));
    // six node retry cycles of about 1.1s each
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn restarting_from_a_checkpoint_replays_the_same_deliveries() -> anyhow::Result<()> {
    let chain = MockChain::new(12);
    for number in 8..=12 {
        chain.push_transaction(number, ALICE, Some(TOKEN), U256::ZERO);
        chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(number), number, 0, 0));
    }

    let first = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(8)
        .confirmations(2)
        .build(fast_node(&chain), first.clone())?;
    let completion = tail.start()?;
    timeout(PATIENCE, first.wait_for_checkpoint(11)).await?;
    let _ = tail.stop(true);
    settle(completion).await??;
    let resume_at = tail.since();
    assert_eq!(resume_at, 11);

    let replay = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(9)
        .confirmations(2)
        .build(fast_node(&chain), replay.clone())?;
    let completion = tail.start()?;
    timeout(PATIENCE, replay.wait_for_checkpoint(resume_at)).await?;
    let _ = tail.stop(true);
    settle(completion).await??;

    let tail_of = |records: Vec<Recorded>| -> Vec<Recorded> {
        let from = records
            .iter()
            .position(|record| matches!(record, Recorded::Block { number: 9, .. }))
            .unwrap_or(records.len());
        records[from..].to_vec()
    };
    assert_eq!(tail_of(first.records()), tail_of(replay.records()));
    assert_eq!(replay.blocks(), vec![9, 10]);
    Ok(())
}

#[tokio::test]
async fn deployment_cache_capacity_must_be_positive() {
    let chain = MockChain::new(1);
    let result = TailBuilder::new()
        .deployment_cache(eth_tail::DeploymentCacheConfig::Capacity(0))
        .build(fast_node(&chain), ());
    assert!(matches!(result, Err(TailError::InvalidDeploymentCacheCapacity)));
}
