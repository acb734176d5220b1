use crate::{
    TailError,
    deployment_cache::DeploymentCache,
    events::TailEvent,
    tail::{
        handler::{Deposit, DepositDeployed, DispatchContext, Erc20Transfer, TailHandler},
        prepare::PreparedBlock,
        tracking::Tracking,
    },
};

/// Deliver one prepared block: block hook, entries in chain order, then the checkpoint.
///
/// Every callback is awaited before the next starts; the first failure aborts the block
/// without checkpointing it.
pub(crate) async fn dispatch_block<H: TailHandler>(
    handler: &H,
    tracking: &Tracking,
    cache: Option<&DeploymentCache>,
    prepared: &PreparedBlock,
    confirmations: u64,
) -> Result<u64, TailError> {
    let block = prepared.block.as_ref();
    handler.on_block(block, confirmations).await.map_err(TailError::handler)?;

    for entry in &prepared.entries {
        let transaction = &block.transactions[entry.position];
        let ctx =
            DispatchContext { block, transaction, log: entry.log.as_ref(), confirmations };

        if entry.filtered {
            let delivered = match (entry.event, entry.log.as_ref()) {
                (Some(TailEvent::DepositFactoryDeployed { contract_address }), Some(log)) => {
                    if let Some(cache) = cache {
                        cache.set_authoritative(contract_address);
                    }
                    let event = DepositDeployed { contract_address, factory: log.address() };
                    handler.on_deposit_deployed(&event, &ctx).await
                }
                (Some(TailEvent::DepositForwarded { to, amount }), Some(log)) => {
                    let event = Deposit { from: log.address(), to, amount };
                    handler.on_deposit(&event, &ctx).await
                }
                (Some(TailEvent::Erc20Transfer { from, to, amount }), Some(log)) => {
                    let event = Erc20Transfer { from, to, amount, token: log.address() };
                    handler.on_erc20_transfer(&event, &ctx).await
                }
                _ => handler.on_transaction(transaction, &ctx).await,
            };
            delivered.map_err(TailError::handler)?;
        }

        if entry.tracked {
            tracking.notify(transaction, confirmations, block);
        }
    }

    let next = block.number + 1;
    handler.on_checkpoint(next).await.map_err(TailError::handler)?;
    trace!(number = block.number, next = next, "Block dispatched");
    Ok(next)
}
