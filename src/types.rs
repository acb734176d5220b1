use alloy::{
    primitives::{Address, B256, BlockHash, TxHash, U256},
    rpc::types::Filter,
};

/// A block as seen by the tail: identity, height, time and its transactions in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: BlockHash,
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: TxHash,
    /// Position of the transaction inside its block.
    pub index: u64,
    pub from: Address,
    /// `None` for contract creations.
    pub to: Option<Address>,
    pub value: U256,
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub succeeded: bool,
}

/// Which side of a transfer an address sits on when it is offered to the address filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The address receives value.
    Incoming,
    /// The address sends value.
    Outgoing,
}

/// Where a tail begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// A concrete height.
    Number(u64),
    /// The current chain height, as resolved by `Tail::now`.
    Now,
}

impl From<u64> for StartPosition {
    fn from(number: u64) -> Self {
        StartPosition::Number(number)
    }
}

/// Log query over an inclusive block range.
///
/// `topics[i]` lists the accepted values for topic position `i`; an empty list matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
}

impl LogQuery {
    /// Query for a single block.
    #[must_use]
    pub fn at(number: u64) -> Self {
        Self { from_block: number, to_block: number, ..Self::default() }
    }

    #[must_use]
    pub fn addresses(mut self, addresses: impl IntoIterator<Item = Address>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    /// Appends the accepted values for the next topic position.
    #[must_use]
    pub fn topic(mut self, values: impl IntoIterator<Item = B256>) -> Self {
        self.topics.push(values.into_iter().collect());
        self
    }

    /// Whether a log emitted by `address` with `topics` satisfies the query.
    #[must_use]
    pub fn matches(&self, address: Address, topics: &[B256]) -> bool {
        if !self.addresses.is_empty() && !self.addresses.contains(&address) {
            return false;
        }
        self.topics.iter().enumerate().all(|(position, accepted)| {
            accepted.is_empty() || topics.get(position).is_some_and(|t| accepted.contains(t))
        })
    }
}

impl From<&LogQuery> for Filter {
    fn from(query: &LogQuery) -> Self {
        let mut filter =
            Filter::new().from_block(query.from_block).to_block(query.to_block);
        if !query.addresses.is_empty() {
            filter = filter.address(query.addresses.clone());
        }
        for (position, values) in query.topics.iter().enumerate().take(4) {
            if values.is_empty() {
                continue;
            }
            let values = values.clone();
            filter = match position {
                0 => filter.event_signature(values),
                1 => filter.topic1(values),
                2 => filter.topic2(values),
                _ => filter.topic3(values),
            };
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256};

    const TOPIC: B256 = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");
    const OTHER: B256 = b256!("0x2222222222222222222222222222222222222222222222222222222222222222");

    #[test]
    fn query_matches_address_and_topic_positions() {
        let emitter = address!("0x00000000000000000000000000000000000000f1");
        let query = LogQuery::at(10).addresses([emitter]).topic([TOPIC]).topic([OTHER]);

        assert!(query.matches(emitter, &[TOPIC, OTHER]));
        assert!(!query.matches(emitter, &[TOPIC]));
        assert!(!query.matches(emitter, &[OTHER, OTHER]));
        assert!(!query.matches(Address::ZERO, &[TOPIC, OTHER]));
    }

    #[test]
    fn empty_positions_match_anything() {
        let query = LogQuery::at(1).topic([]).topic([OTHER]);
        assert!(query.matches(Address::ZERO, &[TOPIC, OTHER]));
        assert!(query.matches(Address::repeat_byte(9), &[OTHER, OTHER]));
    }

    #[test]
    fn query_converts_to_single_block_filter() {
        let filter = Filter::from(&LogQuery::at(42).topic([TOPIC]));
        assert_eq!(filter.get_from_block(), Some(42));
        assert_eq!(filter.get_to_block(), Some(42));
        assert!(filter.topics[0].matches(&TOPIC));
        assert!(!filter.topics[0].matches(&OTHER));
    }
}
