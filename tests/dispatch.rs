mod common;

use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, TxHash, U256};
use eth_tail::{
    Deposit, DepositDeployed, Direction, Erc20Transfer, TailBuilder, TailError,
    test_utils::{
        MockChain, Recorded, RecordingHandler, deposit_forwarded_log, erc20_transfer_log,
        factory_deployed_log,
    },
};
use parking_lot::Mutex;
use tokio::time::timeout;

use crate::common::{ALICE, BOB, CAROL, DEPOSIT, FACTORY, PATIENCE, TOKEN, fast_node, settle};

#[tokio::test(start_paused = true)]
async fn erc20_transfer_is_delivered_and_checkpointed() -> anyhow::Result<()> {
    let chain = MockChain::new(100);
    chain.push_transaction(100, ALICE, Some(TOKEN), U256::ZERO);
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(5), 100, 0, 0));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(100)
        .filter(|address, _| address == BOB)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(101)).await?;

    assert_eq!(
        handler.records(),
        vec![
            Recorded::Block { number: 100, confirmations: 0 },
            Recorded::Erc20Transfer(Erc20Transfer {
                from: ALICE,
                to: BOB,
                amount: U256::from(5),
                token: TOKEN,
            }),
            Recorded::Checkpoint(101),
        ]
    );
    assert_eq!(tail.since(), 101);

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn filter_sees_both_directions_of_a_transfer() -> anyhow::Result<()> {
    let chain = MockChain::new(7);
    chain.push_transaction(7, ALICE, Some(TOKEN), U256::ZERO);
    chain.push_transaction(7, BOB, Some(TOKEN), U256::ZERO);
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, CAROL, U256::from(1), 7, 0, 0));
    chain.push_log(erc20_transfer_log(TOKEN, BOB, CAROL, U256::from(2), 7, 1, 1));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(7)
        .filter(|address, direction| address == ALICE && direction == Direction::Outgoing)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(8)).await?;

    assert_eq!(
        handler.deliveries(),
        vec![Recorded::Erc20Transfer(Erc20Transfer {
            from: ALICE,
            to: CAROL,
            amount: U256::from(1),
            token: TOKEN,
        })]
    );

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deployment_in_block_hides_later_transfers_into_the_contract() -> anyhow::Result<()> {
    let chain = MockChain::new(50);
    // 0: transfer into the contract before it exists
    let early = chain.push_transaction(50, ALICE, Some(DEPOSIT), U256::from(1));
    chain.push_transaction(50, ALICE, Some(BOB), U256::ZERO);
    chain.push_transaction(50, ALICE, Some(FACTORY), U256::ZERO);
    chain.push_log(factory_deployed_log(FACTORY, DEPOSIT, 50, 2, 0));
    // 3: transfer into the freshly deployed contract
    chain.push_transaction(50, ALICE, Some(DEPOSIT), U256::from(7));
    // 4: the contract forwards the funds
    chain.push_transaction(50, BOB, Some(DEPOSIT), U256::ZERO);
    chain.push_log(deposit_forwarded_log(DEPOSIT, CAROL, U256::from(7), 50, 4, 1));
    // 5: unrelated plain transfer
    let plain = chain.push_transaction(50, BOB, Some(CAROL), U256::from(3));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(50)
        .deposit_factory(FACTORY)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(51)).await?;

    assert_eq!(
        handler.deliveries(),
        vec![
            Recorded::Transaction { block: 50, index: 0, hash: early.hash },
            Recorded::DepositDeployed(DepositDeployed {
                contract_address: DEPOSIT,
                factory: FACTORY,
            }),
            Recorded::Deposit(Deposit { from: DEPOSIT, to: CAROL, amount: U256::from(7) }),
            Recorded::Transaction { block: 50, index: 5, hash: plain.hash },
        ]
    );

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn only_deposit_contracts_hide_plain_transfers() -> anyhow::Result<()> {
    let chain = MockChain::new(50);
    let wallet = Address::repeat_byte(0x5a);
    chain.deploy_code(wallet, 10);
    chain.deploy_code(DEPOSIT, 20);
    chain.push_log(factory_deployed_log(FACTORY, DEPOSIT, 20, 0, 0));
    let into_wallet = chain.push_transaction(50, ALICE, Some(wallet), U256::from(9));
    let into_deposit = chain.push_transaction(50, ALICE, Some(DEPOSIT), U256::from(4));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(50)
        .deposit_factory(FACTORY)
        .filter(move |address, _| address == wallet || address == DEPOSIT)
        .build(fast_node(&chain), handler.clone())?;

    let tracked: Arc<Mutex<Vec<TxHash>>> = Arc::default();
    for address in [wallet, DEPOSIT] {
        let sink = Arc::clone(&tracked);
        tail.track(address, move |tx, _, _| sink.lock().push(tx.hash));
    }

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(51)).await?;

    assert_eq!(
        handler.deliveries(),
        vec![Recorded::Transaction { block: 50, index: 0, hash: into_wallet.hash }]
    );
    assert_eq!(*tracked.lock(), vec![into_wallet.hash, into_deposit.hash]);

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn deployments_from_unknown_factories_are_ignored() -> anyhow::Result<()> {
    let chain = MockChain::new(3);
    let stranger = Address::repeat_byte(0x55);
    chain.push_transaction(3, ALICE, Some(stranger), U256::ZERO);
    chain.push_log(factory_deployed_log(stranger, DEPOSIT, 3, 0, 0));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(3)
        .deposit_factory(FACTORY)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(4)).await?;
    assert!(handler.deliveries().is_empty());

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reverted_transactions_are_never_delivered() -> anyhow::Result<()> {
    let chain = MockChain::new(10);
    let reverted = chain.push_transaction(10, ALICE, Some(BOB), U256::from(1));
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(9), 10, 0, 0));
    chain.fail_receipt(reverted.hash);
    let kept = chain.push_transaction(10, ALICE, Some(BOB), U256::from(2));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new().from_block(10).build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(11)).await?;

    assert_eq!(
        handler.deliveries(),
        vec![Recorded::Transaction { block: 10, index: 1, hash: kept.hash }]
    );

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn receipts_are_fetched_once_per_transaction() -> anyhow::Result<()> {
    let chain = MockChain::new(4);
    let tx = chain.push_transaction(4, ALICE, Some(TOKEN), U256::ZERO);
    for log_index in 0..3 {
        let amount = U256::from(log_index);
        chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, amount, 4, 0, log_index));
    }

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(4)
        .receipt_concurrency(1, 4)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(5)).await?;

    assert_eq!(handler.deliveries().len(), 3);
    assert_eq!(chain.receipt_calls(tx.hash), 1);

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

/// Receipt lookups in flight at the start of each lookup, for a block of `transactions` plain
/// transfers resolved with the given window.
async fn receipt_concurrency(
    transactions: usize,
    initial: usize,
    max: usize,
) -> anyhow::Result<Vec<usize>> {
    let chain = MockChain::new(6);
    chain.set_latency(Duration::from_millis(100));
    for _ in 0..transactions {
        chain.push_transaction(6, ALICE, Some(BOB), U256::from(1));
    }

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(6)
        .receipt_concurrency(initial, max)
        .build(fast_node(&chain), handler.clone())?;
    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(7)).await?;
    let _ = tail.stop(true);
    settle(completion).await??;

    assert_eq!(handler.deliveries().len(), transactions);
    Ok(chain.receipt_concurrency())
}

#[tokio::test(start_paused = true)]
async fn receipt_window_grows_up_to_its_ceiling() -> anyhow::Result<()> {
    let concurrency = receipt_concurrency(16, 2, 4).await?;

    assert_eq!(concurrency.len(), 16);
    assert_eq!(concurrency[..2], [1, 2]);
    let peak = concurrency.iter().copied().max().unwrap_or_default();
    assert!(peak > 2, "window never grew: {concurrency:?}");
    assert!(peak <= 4, "window exceeded its ceiling: {concurrency:?}");

    let sequential = receipt_concurrency(5, 1, 1).await?;
    assert_eq!(sequential, vec![1; 5]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn entries_follow_transaction_and_log_order() -> anyhow::Result<()> {
    let chain = MockChain::new(30);
    chain.push_transaction(30, ALICE, Some(BOB), U256::from(1));
    chain.push_transaction(30, ALICE, Some(TOKEN), U256::ZERO);
    chain.push_transaction(30, ALICE, Some(BOB), U256::from(1));
    chain.push_transaction(30, ALICE, Some(TOKEN), U256::ZERO);
    // transactions out of order; log indexes still increase within each one
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(30), 30, 3, 4));
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(11), 30, 1, 1));
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(12), 30, 1, 2));
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(31), 30, 3, 5));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(30)
        .receipt_concurrency(2, 2)
        .build(fast_node(&chain), handler.clone())?;

    let completion = tail.start()?;
    timeout(PATIENCE, handler.wait_for_checkpoint(31)).await?;

    let order: Vec<String> = handler
        .deliveries()
        .into_iter()
        .map(|record| match record {
            Recorded::Transaction { index, .. } => format!("tx{index}"),
            Recorded::Erc20Transfer(transfer) => format!("log{}", transfer.amount),
            other => format!("{other:?}"),
        })
        .collect();
    assert_eq!(order, ["tx0", "log11", "log12", "tx2", "log30", "log31"]);

    let _ = tail.stop(true);
    settle(completion).await??;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn zero_value_transactions_are_opt_in() -> anyhow::Result<()> {
    let chain = MockChain::new(2);
    let tx = chain.push_transaction(2, ALICE, Some(BOB), U256::ZERO);

    let skipping = RecordingHandler::new();
    let tail = TailBuilder::new().from_block(2).build(fast_node(&chain), skipping.clone())?;
    let completion = tail.start()?;
    timeout(PATIENCE, skipping.wait_for_checkpoint(3)).await?;
    let _ = tail.stop(true);
    settle(completion).await??;
    assert!(skipping.deliveries().is_empty());

    let keeping = RecordingHandler::new();
    let tail = TailBuilder::new()
        .from_block(2)
        .zero_value_transactions(true)
        .build(fast_node(&chain), keeping.clone())?;
    let completion = tail.start()?;
    timeout(PATIENCE, keeping.wait_for_checkpoint(3)).await?;
    let _ = tail.stop(true);
    settle(completion).await??;
    assert_eq!(
        keeping.deliveries(),
        vec![Recorded::Transaction { block: 2, index: 0, hash: tx.hash }]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn repeated_log_index_is_fatal() -> anyhow::Result<()> {
    let chain = MockChain::new(5);
    chain.push_transaction(5, ALICE, Some(TOKEN), U256::ZERO);
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(1), 5, 0, 1));
    chain.push_log(erc20_transfer_log(TOKEN, ALICE, BOB, U256::from(2), 5, 0, 1));

    let handler = RecordingHandler::new();
    let tail = TailBuilder::new().from_block(5).build(fast_node(&chain), handler.clone())?;

    let result = settle(tail.start()?).await?;

    assert!(matches!(
        result,
        Err(TailError::InvalidLogOrder { block_number: 5, transaction_index: 0 })
    ));
    assert!(handler.records().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn handler_failure_ends_the_run_without_checkpointing() -> anyhow::Result<()> {
    let chain = MockChain::new(15);
    let handler = RecordingHandler::new();
    handler.fail_at(12);
    let tail = TailBuilder::new().from_block(10).build(fast_node(&chain), handler.clone())?;

    let result = settle(tail.start()?).await?;

    assert!(matches!(result, Err(TailError::Handler(_))));
    assert_eq!(handler.checkpoints(), vec![11, 12]);
    assert_eq!(tail.since(), 12);
    assert!(matches!(settle(tail.stop(true)).await?, Err(TailError::Handler(_))));
    Ok(())
}
