//! The fixed set of contract events the tail understands.
//!
//! Decoding concatenates the non-primary topics with the data payload and ABI-decodes the
//! result as the event's argument tuple, so a signature decodes the same way whichever of its
//! arguments happen to be indexed.

use alloy::{
    primitives::{Address, B256, U256},
    rpc::types::Log,
    sol,
    sol_types::{SolEvent, SolValue},
};

use crate::TailError;

sol! {
    event Deployed(address contractAddress);
    event DepositForwarded(address to, uint256 amount);
    event Transfer(address from, address to, uint256 value);
}

/// Kinds of events in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `Deployed(address)` emitted by a deposit factory.
    DepositFactoryDeployed,
    /// `DepositForwarded(address,uint256)` emitted by a deposit contract.
    DepositForwarded,
    /// `Transfer(address,address,uint256)` emitted by an ERC20 token.
    Erc20Transfer,
}

impl EventKind {
    /// Topic identifier: keccak-256 of the canonical signature.
    #[must_use]
    pub const fn topic(self) -> B256 {
        match self {
            Self::DepositFactoryDeployed => Deployed::SIGNATURE_HASH,
            Self::DepositForwarded => DepositForwarded::SIGNATURE_HASH,
            Self::Erc20Transfer => Transfer::SIGNATURE_HASH,
        }
    }

    #[must_use]
    pub const fn signature(self) -> &'static str {
        match self {
            Self::DepositFactoryDeployed => Deployed::SIGNATURE,
            Self::DepositForwarded => DepositForwarded::SIGNATURE,
            Self::Erc20Transfer => Transfer::SIGNATURE,
        }
    }
}

/// A decoded catalog event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailEvent {
    DepositFactoryDeployed { contract_address: Address },
    DepositForwarded { to: Address, amount: U256 },
    Erc20Transfer { from: Address, to: Address, amount: U256 },
}

impl TailEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::DepositFactoryDeployed { .. } => EventKind::DepositFactoryDeployed,
            Self::DepositForwarded { .. } => EventKind::DepositForwarded,
            Self::Erc20Transfer { .. } => EventKind::Erc20Transfer,
        }
    }
}

/// Immutable topic-to-decoder table, built once per tail and shared by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCatalog {
    kinds: Vec<EventKind>,
}

impl EventCatalog {
    /// Catalog with the deposit events, plus ERC20 transfers when `erc20` is set.
    #[must_use]
    pub fn new(erc20: bool) -> Self {
        let mut kinds = vec![EventKind::DepositFactoryDeployed, EventKind::DepositForwarded];
        if erc20 {
            kinds.push(EventKind::Erc20Transfer);
        }
        Self { kinds }
    }

    /// Topic identifiers to request from the node.
    pub fn topics(&self) -> impl Iterator<Item = B256> + '_ {
        self.kinds.iter().map(|kind| kind.topic())
    }

    #[must_use]
    pub fn erc20_enabled(&self) -> bool {
        self.kinds.contains(&EventKind::Erc20Transfer)
    }

    /// Decode `log`, or `None` if its primary topic is not in the catalog or its payload is
    /// malformed.
    #[must_use]
    pub fn decode(&self, log: &Log) -> Option<TailEvent> {
        let topics = log.topics();
        let primary = topics.first()?;
        let kind = self.kinds.iter().copied().find(|kind| kind.topic() == *primary)?;

        let mut payload = Vec::with_capacity(32 * (topics.len() - 1) + log.data().data.len());
        for topic in &topics[1..] {
            payload.extend_from_slice(topic.as_slice());
        }
        payload.extend_from_slice(&log.data().data);

        let decoded = match kind {
            EventKind::DepositFactoryDeployed => Address::abi_decode(&payload)
                .map(|contract_address| TailEvent::DepositFactoryDeployed { contract_address }),
            EventKind::DepositForwarded => <(Address, U256)>::abi_decode(&payload)
                .map(|(to, amount)| TailEvent::DepositForwarded { to, amount }),
            EventKind::Erc20Transfer => <(Address, Address, U256)>::abi_decode(&payload)
                .map(|(from, to, amount)| TailEvent::Erc20Transfer { from, to, amount }),
        };

        match decoded {
            Ok(event) => Some(event),
            Err(err) => {
                debug!(
                    signature = kind.signature(),
                    error = %err,
                    "Skipping log with malformed payload"
                );
                None
            }
        }
    }

    /// Topic filter selecting the `Deployed` log that announces `contract_address`.
    #[must_use]
    pub fn deployment_topics(contract_address: Address) -> [B256; 2] {
        [EventKind::DepositFactoryDeployed.topic(), contract_address.into_word()]
    }

    /// Check that `logs`, already grouped by transaction, carry strictly increasing
    /// `logIndex` values within each transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TailError::InvalidLogOrder`] at the first repeated or decreasing index.
    pub fn check_log_order(block_number: u64, logs: &[Log]) -> Result<(), TailError> {
        for pair in logs.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            if previous.transaction_index != current.transaction_index {
                continue;
            }
            if current.log_index <= previous.log_index {
                return Err(TailError::InvalidLogOrder {
                    block_number,
                    transaction_index: current.transaction_index.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}
