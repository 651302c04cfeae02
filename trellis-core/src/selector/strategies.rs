use super::{AddressSelector, ConsistentHash, DEFAULT_REPLICATION_FACTOR, SelectionContext, record_selection};
use crate::command::ShuntStrategy;
use crate::endpoint::EndpointAddress;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Hash Algorithm
// ============================================================================

struct ServiceRing {
    ring: ConsistentHash<EndpointAddress>,
    members: ArcSwap<HashSet<EndpointAddress>>,
    rebuild: Mutex<()>,
}

impl ServiceRing {
    fn new(replication_factor: usize) -> Self {
        Self {
            ring: ConsistentHash::new(replication_factor),
            members: ArcSwap::from_pointee(HashSet::new()),
            rebuild: Mutex::new(()),
        }
    }

    fn is_current(members: &HashSet<EndpointAddress>, wanted: &[EndpointAddress]) -> bool {
        wanted.iter().all(|a| members.contains(a)) && members.iter().all(|m| wanted.contains(m))
    }

    /// Bring ring membership in line with the route's address set, touching
    /// only the endpoints that joined or left. Unchanged membership costs one
    /// snapshot load and no lock.
    fn reconcile(&self, wanted: &[EndpointAddress]) {
        if Self::is_current(&self.members.load(), wanted) {
            return;
        }

        let _rebuild = self.rebuild.lock();
        let current = self.members.load_full();
        if Self::is_current(&current, wanted) {
            return;
        }

        let wanted: HashSet<EndpointAddress> = wanted.iter().cloned().collect();
        for addr in current.difference(&wanted) {
            self.ring.remove(&addr.key());
        }
        for addr in wanted.difference(&current) {
            self.ring.add(addr.clone(), &addr.key());
        }
        self.members.store(Arc::new(wanted));
    }
}

/// Consistent hashing on the call key, one ring per service id.
pub struct HashAlgorithmSelector {
    replication_factor: usize,
    rings: DashMap<String, Arc<ServiceRing>>,
}

impl HashAlgorithmSelector {
    /// Create a selector whose rings use `replication_factor` virtual entries.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            rings: DashMap::new(),
        }
    }

    /// Virtual entries on a service's ring, if one exists.
    pub fn ring_len(&self, service_id: &str) -> Option<usize> {
        self.rings.get(service_id).map(|r| r.ring.len())
    }

    /// Drop a service's ring.
    pub fn forget(&self, service_id: &str) {
        self.rings.remove(service_id);
    }

    fn ring(&self, service_id: &str) -> Arc<ServiceRing> {
        if let Some(ring) = self.rings.get(service_id) {
            return ring.clone();
        }
        self.rings
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(ServiceRing::new(self.replication_factor)))
            .clone()
    }
}

impl Default for HashAlgorithmSelector {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION_FACTOR)
    }
}

impl AddressSelector for HashAlgorithmSelector {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<EndpointAddress> {
        let ring = self.ring(ctx.service_id);
        ring.reconcile(ctx.members);

        let eligible = ctx.eligible();
        let selected = ring
            .ring
            .select_where(ctx.key, |node| eligible.contains(&node))
            .map(|node| (*node).clone());

        record_selection(ShuntStrategy::HashAlgorithm, &selected);
        selected
    }

    fn strategy(&self) -> ShuntStrategy {
        ShuntStrategy::HashAlgorithm
    }
}

// ============================================================================
// Polling
// ============================================================================

/// Round-robin per service id.
#[derive(Default)]
pub struct PollingSelector {
    counters: DashMap<String, AtomicUsize>,
}

impl PollingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self, service_id: &str) -> usize {
        if let Some(counter) = self.counters.get(service_id) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl AddressSelector for PollingSelector {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<EndpointAddress> {
        let eligible = ctx.eligible();
        let selected = if eligible.is_empty() {
            None
        } else {
            let idx = self.next(ctx.service_id) % eligible.len();
            Some(eligible[idx].clone())
        };

        record_selection(ShuntStrategy::Polling, &selected);
        selected
    }

    fn strategy(&self) -> ShuntStrategy {
        ShuntStrategy::Polling
    }
}

// ============================================================================
// Random
// ============================================================================

/// Uniform random choice.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl RandomSelector {
    pub fn new() -> Self {
        Self
    }
}

impl AddressSelector for RandomSelector {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<EndpointAddress> {
        let eligible = ctx.eligible();
        let selected = if eligible.is_empty() {
            None
        } else {
            let idx = rand::rng().random_range(0..eligible.len());
            Some(eligible[idx].clone())
        };

        record_selection(ShuntStrategy::Random, &selected);
        selected
    }

    fn strategy(&self) -> ShuntStrategy {
        ShuntStrategy::Random
    }
}

// ============================================================================
// Weighted Random
// ============================================================================

/// Random choice biased by operator-assigned weights.
///
/// Endpoints without an assigned weight count as weight 1. A weight of 0
/// removes an endpoint from rotation unless every candidate has weight 0.
#[derive(Default)]
pub struct WeightedRandomSelector {
    weights: DashMap<String, u32>,
}

impl WeightedRandomSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a weight to an endpoint.
    pub fn set_weight(&self, endpoint: &EndpointAddress, weight: u32) {
        self.weights.insert(endpoint.key(), weight);
    }

    /// Weight of an endpoint.
    pub fn weight(&self, endpoint: &EndpointAddress) -> u32 {
        self.weights.get(&endpoint.key()).map(|w| *w).unwrap_or(1)
    }
}

impl AddressSelector for WeightedRandomSelector {
    fn select(&self, ctx: &SelectionContext<'_>) -> Option<EndpointAddress> {
        let eligible = ctx.eligible();
        if eligible.is_empty() {
            record_selection(ShuntStrategy::WeightedRandom, &None);
            return None;
        }

        let weights: Vec<u64> = eligible.iter().map(|a| self.weight(a) as u64).collect();
        let total: u64 = weights.iter().sum();

        let mut rng = rand::rng();
        let idx = if total == 0 {
            rng.random_range(0..eligible.len())
        } else {
            let mut point = rng.random_range(0..total);
            weights
                .iter()
                .position(|w| {
                    if point < *w {
                        true
                    } else {
                        point -= *w;
                        false
                    }
                })
                .unwrap_or(eligible.len() - 1)
        };

        let selected = Some(eligible[idx].clone());
        record_selection(ShuntStrategy::WeightedRandom, &selected);
        selected
    }

    fn strategy(&self) -> ShuntStrategy {
        ShuntStrategy::WeightedRandom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn addrs(n: usize) -> Vec<EndpointAddress> {
        (1..=n)
            .map(|i| EndpointAddress::new(format!("10.0.0.{}", i), 80))
            .collect()
    }

    #[test]
    fn test_hash_selector_is_sticky() {
        let selector = HashAlgorithmSelector::new(100);
        let candidates = addrs(4);
        let ctx = SelectionContext::new("svc", "customer-7", &candidates);

        let first = selector.select(&ctx).unwrap();
        for _ in 0..20 {
            assert_eq!(selector.select(&ctx).unwrap(), first);
        }
        assert_eq!(selector.ring_len("svc"), Some(400));
    }

    #[test]
    fn test_hash_selector_reconciles_membership() {
        let selector = HashAlgorithmSelector::new(100);
        let all = addrs(3);

        let owner = selector
            .select(&SelectionContext::new("svc", "key", &all))
            .unwrap();

        let survivors: Vec<_> = all.iter().filter(|a| **a != owner).cloned().collect();
        let next = selector
            .select(&SelectionContext::new("svc", "key", &survivors))
            .unwrap();

        assert_ne!(next, owner);
        assert_eq!(selector.ring_len("svc"), Some(200));

        // Owner comes back and reclaims the key
        let again = selector
            .select(&SelectionContext::new("svc", "key", &all))
            .unwrap();
        assert_eq!(again, owner);
    }

    #[test]
    fn test_hash_selector_health_filter_keeps_ring() {
        let selector = HashAlgorithmSelector::new(100);
        let all = addrs(3);
        let owner = selector
            .select(&SelectionContext::new("svc", "key", &all))
            .unwrap();

        let live: Vec<_> = all.iter().filter(|a| **a != owner).cloned().collect();
        let successor = selector
            .select(&SelectionContext::new("svc", "key", &live).members(&all))
            .unwrap();
        assert_eq!(selector.ring_len("svc"), Some(300));

        // Same successor a removal would have produced
        let shrunk = HashAlgorithmSelector::new(100);
        let removed = shrunk
            .select(&SelectionContext::new("svc", "key", &live))
            .unwrap();
        assert_eq!(successor, removed);
    }

    #[test]
    fn test_hash_selector_skips_excluded_without_churn() {
        let selector = HashAlgorithmSelector::new(100);
        let all = addrs(3);
        let ctx = SelectionContext::new("svc", "key", &all);
        let owner = selector.select(&ctx).unwrap();

        let tried = vec![owner.clone()];
        let retry = selector.select(&ctx.excluding(&tried)).unwrap();
        assert_ne!(retry, owner);
        assert_eq!(selector.ring_len("svc"), Some(300));
    }

    #[test]
    fn test_hash_selector_rings_are_per_service() {
        let selector = HashAlgorithmSelector::new(10);
        let a = addrs(2);
        let b = addrs(3);
        selector.select(&SelectionContext::new("a", "k", &a));
        selector.select(&SelectionContext::new("b", "k", &b));

        assert_eq!(selector.ring_len("a"), Some(20));
        assert_eq!(selector.ring_len("b"), Some(30));

        selector.forget("a");
        assert_eq!(selector.ring_len("a"), None);
    }

    #[test]
    fn test_polling_rotates_per_service() {
        let selector = PollingSelector::new();
        let candidates = addrs(3);
        let ctx = SelectionContext::new("svc", "k", &candidates);

        let picks: Vec<_> = (0..6).map(|_| selector.select(&ctx).unwrap()).collect();
        assert_eq!(picks[0], candidates[0]);
        assert_eq!(picks[1], candidates[1]);
        assert_eq!(picks[2], candidates[2]);
        assert_eq!(picks[3], candidates[0]);

        // A different service starts its own rotation
        let other = SelectionContext::new("other", "k", &candidates);
        assert_eq!(selector.select(&other).unwrap(), candidates[0]);
    }

    #[test]
    fn test_random_stays_within_candidates() {
        let selector = RandomSelector::new();
        let candidates = addrs(3);
        let ctx = SelectionContext::new("svc", "k", &candidates);

        for _ in 0..50 {
            assert!(candidates.contains(&selector.select(&ctx).unwrap()));
        }
    }

    #[test]
    fn test_weighted_random_respects_weights() {
        let selector = WeightedRandomSelector::new();
        let candidates = addrs(2);
        selector.set_weight(&candidates[0], 0);
        selector.set_weight(&candidates[1], 5);

        let ctx = SelectionContext::new("svc", "k", &candidates);
        for _ in 0..50 {
            assert_eq!(selector.select(&ctx).unwrap(), candidates[1]);
        }
    }

    #[test]
    fn test_weighted_random_default_weight() {
        let selector = WeightedRandomSelector::new();
        let candidates = addrs(2);
        assert_eq!(selector.weight(&candidates[0]), 1);

        let ctx = SelectionContext::new("svc", "k", &candidates);
        let mut seen: HashMap<EndpointAddress, usize> = HashMap::new();
        for _ in 0..200 {
            *seen.entry(selector.select(&ctx).unwrap()).or_default() += 1;
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_weighted_random_all_zero_still_selects() {
        let selector = WeightedRandomSelector::new();
        let candidates = addrs(2);
        for c in &candidates {
            selector.set_weight(c, 0);
        }
        let ctx = SelectionContext::new("svc", "k", &candidates);
        assert!(selector.select(&ctx).is_some());
    }
}
