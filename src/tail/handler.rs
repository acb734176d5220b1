use alloy::{
    primitives::{Address, U256},
    rpc::types::Log,
};

use crate::{
    error::HandlerError,
    types::{Block, Transaction},
};

/// A deposit contract announced by an allow-listed factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositDeployed {
    pub contract_address: Address,
    pub factory: Address,
}

/// Funds forwarded by a deposit contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deposit {
    /// The deposit contract that emitted the event.
    pub from: Address,
    pub to: Address,
    pub amount: U256,
}

/// An ERC20 `Transfer` of `token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Erc20Transfer {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub token: Address,
}

/// Where a dispatched item came from.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub block: &'a Block,
    pub transaction: &'a Transaction,
    /// The log behind an event; `None` for plain transactions.
    pub log: Option<&'a Log>,
    /// Blocks on top of `block` when it was released.
    pub confirmations: u64,
}

/// Consumer callbacks.
///
/// Every method has a no-op default, so implementors only override what they consume.
/// Callbacks for one tail are awaited one at a time, in chain order; an error stops the tail.
pub trait TailHandler: Send + Sync + 'static {
    /// A block is about to be dispatched.
    fn on_block(
        &self,
        _block: &Block,
        _confirmations: u64,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    /// A successful plain transaction accepted by the address filter.
    fn on_transaction(
        &self,
        _transaction: &Transaction,
        _ctx: &DispatchContext<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    fn on_deposit_deployed(
        &self,
        _event: &DepositDeployed,
        _ctx: &DispatchContext<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    fn on_deposit(
        &self,
        _event: &Deposit,
        _ctx: &DispatchContext<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    fn on_erc20_transfer(
        &self,
        _event: &Erc20Transfer,
        _ctx: &DispatchContext<'_>,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    /// Everything below `next` has been dispatched; `next` is the height to resume from.
    fn on_checkpoint(&self, _next: u64) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }

    /// The node kept serving a block previously found inconsistent at `number`.
    ///
    /// Informational; it may be called from a prefetch task, ahead of dispatch.
    fn on_fork(
        &self,
        _number: u64,
        _fresh: &Block,
        _stale: &Block,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        async { Ok(()) }
    }
}

impl TailHandler for () {}
