//! Address Selection
//!
//! Picks one endpoint out of a service's healthy candidates.
//!
//! # Strategies
//!
//! - **HashAlgorithm**: Consistent hashing on the call key (default)
//! - **Polling**: Round-robin per service id
//! - **Random**: Uniform random choice
//! - **WeightedRandom**: Random choice biased by operator-assigned weights
//!
//! Every strategy implements [`AddressSelector`]. Endpoints a call already
//! tried are passed as `excluded` and skipped while other candidates remain.
//!
//! ```rust,ignore
//! use trellis_core::selector::{selector_for, SelectionContext};
//! use trellis_core::ShuntStrategy;
//!
//! let selector = selector_for(ShuntStrategy::Polling);
//! let ctx = SelectionContext::new("order.create", "customer-42", &candidates);
//! let endpoint = selector.select(&ctx);
//! ```

mod hash_ring;
mod strategies;

pub use hash_ring::{ConsistentHash, DEFAULT_REPLICATION_FACTOR, ring_hash};
pub use strategies::{HashAlgorithmSelector, PollingSelector, RandomSelector, WeightedRandomSelector};

use crate::command::ShuntStrategy;
use crate::endpoint::EndpointAddress;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Selection Context
// ============================================================================

/// Inputs for one selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Service being called.
    pub service_id: &'a str,
    /// Hash key of the call.
    pub key: &'a str,
    /// Healthy candidate endpoints.
    pub candidates: &'a [EndpointAddress],
    /// Every endpoint of the route, healthy or not. Hash rings are built
    /// from this set so a health flip never rebuilds them.
    pub members: &'a [EndpointAddress],
    /// Endpoints already tried by this call.
    pub excluded: &'a [EndpointAddress],
}

impl<'a> SelectionContext<'a> {
    /// Create a context with nothing excluded.
    pub fn new(service_id: &'a str, key: &'a str, candidates: &'a [EndpointAddress]) -> Self {
        Self {
            service_id,
            key,
            candidates,
            members: candidates,
            excluded: &[],
        }
    }

    /// Set the route's full address set when it differs from the candidates.
    pub fn members(mut self, members: &'a [EndpointAddress]) -> Self {
        self.members = members;
        self
    }

    /// Exclude endpoints already tried.
    pub fn excluding(mut self, excluded: &'a [EndpointAddress]) -> Self {
        self.excluded = excluded;
        self
    }

    /// Candidates not yet tried, or every candidate once all were tried.
    pub fn eligible(&self) -> Vec<&'a EndpointAddress> {
        let fresh: Vec<_> = self
            .candidates
            .iter()
            .filter(|a| !self.excluded.contains(a))
            .collect();

        if fresh.is_empty() {
            self.candidates.iter().collect()
        } else {
            fresh
        }
    }
}

// ============================================================================
// Selector Trait
// ============================================================================

/// Strategy choosing one endpoint for a call.
pub trait AddressSelector: Send + Sync {
    /// Choose an endpoint, or `None` when there are no candidates.
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<EndpointAddress>;

    /// Strategy implemented by this selector.
    fn strategy(&self) -> ShuntStrategy;
}

/// Build a standalone selector for a strategy.
pub fn selector_for(strategy: ShuntStrategy) -> Arc<dyn AddressSelector> {
    match strategy {
        ShuntStrategy::Polling => Arc::new(PollingSelector::new()),
        ShuntStrategy::Random => Arc::new(RandomSelector::new()),
        ShuntStrategy::HashAlgorithm => Arc::new(HashAlgorithmSelector::default()),
        ShuntStrategy::WeightedRandom => Arc::new(WeightedRandomSelector::new()),
    }
}

/// One shared selector per strategy.
///
/// Selectors keep per-service state (rings, round-robin counters), so a
/// process normally holds a single set and hands out the one matching each
/// service's command.
pub struct SelectorSet {
    polling: Arc<PollingSelector>,
    random: Arc<RandomSelector>,
    hash: Arc<HashAlgorithmSelector>,
    weighted: Arc<WeightedRandomSelector>,
}

impl SelectorSet {
    /// Create a set whose hash rings use `replication_factor` virtual entries.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            polling: Arc::new(PollingSelector::new()),
            random: Arc::new(RandomSelector::new()),
            hash: Arc::new(HashAlgorithmSelector::new(replication_factor)),
            weighted: Arc::new(WeightedRandomSelector::new()),
        }
    }

    /// Selector for a strategy.
    pub fn get(&self, strategy: ShuntStrategy) -> Arc<dyn AddressSelector> {
        match strategy {
            ShuntStrategy::Polling => self.polling.clone(),
            ShuntStrategy::Random => self.random.clone(),
            ShuntStrategy::HashAlgorithm => self.hash.clone(),
            ShuntStrategy::WeightedRandom => self.weighted.clone(),
        }
    }

    /// Weighted selector, for assigning weights.
    pub fn weighted(&self) -> &Arc<WeightedRandomSelector> {
        &self.weighted
    }

    /// Hash selector, for inspecting rings.
    pub fn hash(&self) -> &Arc<HashAlgorithmSelector> {
        &self.hash
    }
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION_FACTOR)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Selection counters.
#[derive(Debug)]
pub struct SelectorStats {
    polling_selections: AtomicU64,
    random_selections: AtomicU64,
    hash_selections: AtomicU64,
    weighted_selections: AtomicU64,
    empty_selections: AtomicU64,
}

impl SelectorStats {
    fn record(&self, strategy: ShuntStrategy, hit: bool) {
        if !hit {
            self.empty_selections.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counter = match strategy {
            ShuntStrategy::Polling => &self.polling_selections,
            ShuntStrategy::Random => &self.random_selections,
            ShuntStrategy::HashAlgorithm => &self.hash_selections,
            ShuntStrategy::WeightedRandom => &self.weighted_selections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Polling selections.
    pub fn polling_selections(&self) -> u64 {
        self.polling_selections.load(Ordering::Relaxed)
    }

    /// Random selections.
    pub fn random_selections(&self) -> u64 {
        self.random_selections.load(Ordering::Relaxed)
    }

    /// Hash selections.
    pub fn hash_selections(&self) -> u64 {
        self.hash_selections.load(Ordering::Relaxed)
    }

    /// Weighted selections.
    pub fn weighted_selections(&self) -> u64 {
        self.weighted_selections.load(Ordering::Relaxed)
    }

    /// Selections that found no candidate.
    pub fn empty_selections(&self) -> u64 {
        self.empty_selections.load(Ordering::Relaxed)
    }

    /// Total successful selections.
    pub fn total_selections(&self) -> u64 {
        self.polling_selections()
            + self.random_selections()
            + self.hash_selections()
            + self.weighted_selections()
    }
}

/// Global statistics.
static SELECTOR_STATS: SelectorStats = SelectorStats {
    polling_selections: AtomicU64::new(0),
    random_selections: AtomicU64::new(0),
    hash_selections: AtomicU64::new(0),
    weighted_selections: AtomicU64::new(0),
    empty_selections: AtomicU64::new(0),
};

/// Get global selector statistics.
pub fn selector_stats() -> &'static SelectorStats {
    &SELECTOR_STATS
}

pub(crate) fn record_selection(strategy: ShuntStrategy, selected: &Option<EndpointAddress>) {
    SELECTOR_STATS.record(strategy, selected.is_some());
}

// ============================================================================
// Tests
// ============================================================================
