//! Memoized answers to "is this address an already-deployed contract".

use std::{collections::HashSet, num::NonZeroUsize, sync::Arc};

use alloy::primitives::Address;
use lru::LruCache;
use parking_lot::Mutex;

use crate::{
    TailError,
    events::EventCatalog,
    robust_node::{ChainClient, RobustNode},
    types::LogQuery,
};

/// Default number of bytecode-check answers kept.
pub const DEFAULT_DEPLOYMENT_CACHE_CAPACITY: usize = 4096;

/// Cached deployment state of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deployment {
    NotDeployed,
    Deployed,
    Unknown,
}

/// How a tail obtains its deployment cache.
#[derive(Debug, Clone)]
pub enum DeploymentCacheConfig {
    /// No caching; every check goes to the node.
    Disabled,
    /// A fresh cache of the given capacity. Must be greater than 0.
    Capacity(usize),
    /// A cache shared with other tails.
    Shared(Arc<DeploymentCache>),
}

impl Default for DeploymentCacheConfig {
    fn default() -> Self {
        Self::Capacity(DEFAULT_DEPLOYMENT_CACHE_CAPACITY)
    }
}

impl DeploymentCacheConfig {
    pub(crate) fn into_cache(self) -> Result<Option<Arc<DeploymentCache>>, TailError> {
        match self {
            Self::Disabled => Ok(None),
            Self::Capacity(capacity) => {
                let capacity =
                    NonZeroUsize::new(capacity).ok_or(TailError::InvalidDeploymentCacheCapacity)?;
                Ok(Some(Arc::new(DeploymentCache::new(capacity))))
            }
            Self::Shared(cache) => Ok(Some(cache)),
        }
    }
}

/// Bounded LRU of bytecode-check answers plus a pinned set of addresses learned from
/// `Deployed` events. Pinned addresses are never evicted.
#[derive(Debug)]
pub struct DeploymentCache {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    pinned: HashSet<Address>,
    recent: LruCache<Address, bool>,
}

impl DeploymentCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { inner: Mutex::new(Inner { pinned: HashSet::new(), recent: LruCache::new(capacity) }) }
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Deployment {
        let mut inner = self.inner.lock();
        if inner.pinned.contains(address) {
            return Deployment::Deployed;
        }
        match inner.recent.get(address) {
            Some(true) => Deployment::Deployed,
            Some(false) => Deployment::NotDeployed,
            None => Deployment::Unknown,
        }
    }

    /// Record a probabilistic answer. Pinned addresses keep their authoritative state.
    pub fn set(&self, address: Address, deployed: bool) {
        let mut inner = self.inner.lock();
        if !inner.pinned.contains(&address) {
            inner.recent.put(address, deployed);
        }
    }

    /// Record an address announced by a `Deployed` event.
    pub fn set_authoritative(&self, address: Address) {
        let mut inner = self.inner.lock();
        inner.recent.pop(&address);
        inner.pinned.insert(address);
    }

    /// Whether `address` was learned from a `Deployed` event.
    #[must_use]
    pub fn is_authoritative(&self, address: &Address) -> bool {
        self.inner.lock().pinned.contains(address)
    }

    /// Number of entries, pinned included.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pinned.len() + inner.recent.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A transaction's position, used as the reference point of a deployment check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxPosition {
    pub block_number: u64,
    pub transaction_index: u64,
}

/// Whether `address` already holds a deployed contract as seen by the transaction at `at`.
///
/// Consults `cache` first, then the bytecode at the previous height, then factory `Deployed`
/// logs at the exact height: a deployment in the same block counts only for transactions at or
/// after the deploying transaction's index. Negative answers are never cached since the
/// contract may be deployed later.
///
/// # Errors
///
/// Propagates node errors once the retrier gives up.
pub async fn is_deployed<C: ChainClient>(
    cache: Option<&DeploymentCache>,
    node: &RobustNode<C>,
    factories: &[Address],
    address: Address,
    at: TxPosition,
) -> Result<bool, TailError> {
    if let Some(cache) = cache {
        match cache.get(&address) {
            Deployment::Deployed => return Ok(true),
            Deployment::NotDeployed | Deployment::Unknown => {}
        }
    }

    if at.block_number > 0 {
        let code = node.code_at(address, at.block_number - 1).await?;
        if !code.is_empty() {
            trace!(address = %address, "Bytecode found before transaction block");
            if let Some(cache) = cache {
                cache.set(address, true);
            }
            return Ok(true);
        }
    }

    if factories.is_empty() {
        return Ok(false);
    }

    let [id, word] = EventCatalog::deployment_topics(address);
    let query = LogQuery::at(at.block_number)
        .addresses(factories.iter().copied())
        .topic([id])
        .topic([word]);
    let deployed = node
        .logs(&query)
        .await?
        .iter()
        .any(|log| log.transaction_index.is_some_and(|index| index <= at.transaction_index));

    if deployed && let Some(cache) = cache {
        cache.set(address, true);
    }
    Ok(deployed)
}

/// Whether `address` is a contract announced by one of `factories` no later than the
/// transaction at `at`. Other contracts never qualify.
///
/// Pinned addresses answer from `cache`. Otherwise bytecode at the previous height only
/// decides how far back to look for a factory `Deployed` log: without it, just a deployment
/// earlier in the same block counts. Announced addresses are pinned.
///
/// # Errors
///
/// Propagates node errors once the retrier gives up.
pub async fn is_deposit_contract<C: ChainClient>(
    cache: Option<&DeploymentCache>,
    node: &RobustNode<C>,
    factories: &[Address],
    address: Address,
    at: TxPosition,
) -> Result<bool, TailError> {
    if factories.is_empty() {
        return Ok(false);
    }
    if cache.is_some_and(|cache| cache.is_authoritative(&address)) {
        return Ok(true);
    }

    let from_block = if is_deployed(cache, node, &[], address, at).await? {
        0
    } else {
        at.block_number
    };
    let [id, word] = EventCatalog::deployment_topics(address);
    let query = LogQuery { from_block, ..LogQuery::at(at.block_number) }
        .addresses(factories.iter().copied())
        .topic([id])
        .topic([word]);
    let announced = node.logs(&query).await?.iter().any(|log| match log.block_number {
        Some(number) if number < at.block_number => true,
        Some(number) => {
            number == at.block_number &&
                log.transaction_index.is_some_and(|index| index <= at.transaction_index)
        }
        None => false,
    });

    if announced && let Some(cache) = cache {
        trace!(address = %address, "Deposit contract confirmed by factory log");
        cache.set_authoritative(address);
    }
    Ok(announced)
}
