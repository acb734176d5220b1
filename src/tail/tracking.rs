use std::{collections::HashMap, fmt, sync::Arc};

use alloy::primitives::Address;
use parking_lot::RwLock;

use crate::types::{Block, Transaction};

/// Callback invoked for every successful transaction touching a tracked address.
pub type TrackFn = Arc<dyn Fn(&Transaction, u64, &Block) + Send + Sync>;

/// Addresses whose transactions are dispatched regardless of the address filter.
#[derive(Clone, Default)]
pub(crate) struct Tracking {
    callbacks: Arc<RwLock<HashMap<Address, TrackFn>>>,
}

impl fmt::Debug for Tracking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.callbacks.read().keys()).finish()
    }
}

impl Tracking {
    pub(crate) fn track(&self, address: Address, callback: TrackFn) {
        self.callbacks.write().insert(address, callback);
    }

    pub(crate) fn untrack(&self, address: &Address) -> bool {
        self.callbacks.write().remove(address).is_some()
    }

    pub(crate) fn touches(&self, transaction: &Transaction) -> bool {
        let callbacks = self.callbacks.read();
        callbacks.contains_key(&transaction.from) ||
            transaction.to.is_some_and(|to| callbacks.contains_key(&to))
    }

    /// Invoke the callbacks registered for the sender and the recipient, in that order.
    pub(crate) fn notify(&self, transaction: &Transaction, confirmations: u64, block: &Block) {
        let (sender, recipient) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.get(&transaction.from).cloned(),
                transaction.to.and_then(|to| callbacks.get(&to).cloned()),
            )
        };
        for callback in sender.into_iter().chain(recipient) {
            callback(transaction, confirmations, block);
        }
    }
}
