//! Consistent hash ring.
//!
//! Each physical node is placed on the ring `replication_factor` times, at
//! positions derived from `seed + replica index`. A key maps to the first
//! position at or after its own hash, wrapping to the start of the ring.
//!
//! Mutations go through an ordered map behind a mutex; lookups read an
//! immutable sorted snapshot published with [`ArcSwap`], so `select` never
//! takes a lock and never observes a half-added node.
//!
//! ```
//! use trellis_core::selector::ConsistentHash;
//!
//! let ring = ConsistentHash::new(100);
//! ring.add("node-a", "10.0.0.1:80");
//! ring.add("node-b", "10.0.0.2:80");
//!
//! let node = ring.select("customer-42").unwrap();
//! assert!(*node == "node-a" || *node == "node-b");
//! ```

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default number of virtual entries per physical node.
pub const DEFAULT_REPLICATION_FACTOR: usize = 1000;

/// Ring position of a string: the first 8 bytes of its SHA-256 digest.
pub fn ring_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Position of a seed's `i`-th virtual entry. The separator keeps one seed's
/// positions from landing on another's (`"h:8"`, 50 vs `"h:85"`, 0).
fn virtual_position(seed: &str, i: usize) -> u64 {
    ring_hash(&format!("{}#{}", seed, i))
}

#[derive(Debug)]
struct VirtualEntry<N> {
    seed: Arc<str>,
    node: Arc<N>,
}

/// Sorted, immutable view used by lookups.
#[derive(Debug)]
struct RingSnapshot<N> {
    positions: Vec<u64>,
    nodes: Vec<Arc<N>>,
}

impl<N> RingSnapshot<N> {
    fn empty() -> Self {
        Self {
            positions: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Index of the first position >= hash, wrapping.
    fn start_index(&self, hash: u64) -> usize {
        match self.positions.binary_search(&hash) {
            Ok(i) => i,
            Err(i) if i == self.positions.len() => 0,
            Err(i) => i,
        }
    }
}

/// Consistent hash ring over nodes of type `N`.
pub struct ConsistentHash<N> {
    replication_factor: usize,
    entries: Mutex<BTreeMap<u64, VirtualEntry<N>>>,
    snapshot: ArcSwap<RingSnapshot<N>>,
}

impl<N> ConsistentHash<N> {
    /// Create an empty ring.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
            entries: Mutex::new(BTreeMap::new()),
            snapshot: ArcSwap::from_pointee(RingSnapshot::empty()),
        }
    }

    /// Virtual entries per node.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Add a node under `seed`. Re-adding an existing seed replaces its node.
    pub fn add(&self, node: N, seed: &str) {
        let node = Arc::new(node);
        let seed: Arc<str> = Arc::from(seed);

        let mut entries = self.entries.lock();
        for i in 0..self.replication_factor {
            entries.insert(
                virtual_position(&seed, i),
                VirtualEntry {
                    seed: seed.clone(),
                    node: node.clone(),
                },
            );
        }
        self.publish(&entries);
    }

    /// Remove every virtual entry belonging to `seed`.
    pub fn remove(&self, seed: &str) {
        let mut entries = self.entries.lock();
        let mut changed = false;
        for i in 0..self.replication_factor {
            let position = virtual_position(seed, i);
            // A colliding entry from another seed stays put.
            if entries.get(&position).is_some_and(|e| &*e.seed == seed) {
                entries.remove(&position);
                changed = true;
            }
        }
        if changed {
            self.publish(&entries);
        }
    }

    /// Number of virtual entries on the ring.
    pub fn len(&self) -> usize {
        self.snapshot.load().positions.len()
    }

    /// Whether the ring has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node owning `key`.
    pub fn select(&self, key: &str) -> Option<Arc<N>> {
        self.select_where(key, |_| true)
    }

    /// First node at or after `key`'s position that satisfies `accept`.
    ///
    /// Walks the ring clockwise, so skipping a node hands its keys to the
    /// same successor a removal would.
    pub fn select_where(&self, key: &str, mut accept: impl FnMut(&N) -> bool) -> Option<Arc<N>> {
        let snapshot = self.snapshot.load();
        if snapshot.positions.is_empty() {
            return None;
        }

        let start = snapshot.start_index(ring_hash(key));
        let len = snapshot.nodes.len();
        (0..len)
            .map(|offset| &snapshot.nodes[(start + offset) % len])
            .find(|node| accept(&***node))
            .cloned()
    }

    fn publish(&self, entries: &BTreeMap<u64, VirtualEntry<N>>) {
        let mut positions = Vec::with_capacity(entries.len());
        let mut nodes = Vec::with_capacity(entries.len());
        for (position, entry) in entries {
            positions.push(*position);
            nodes.push(entry.node.clone());
        }
        self.snapshot.store(Arc::new(RingSnapshot { positions, nodes }));
    }
}

impl<N> Default for ConsistentHash<N> {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICATION_FACTOR)
    }
}

impl<N> std::fmt::Debug for ConsistentHash<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentHash")
            .field("replication_factor", &self.replication_factor)
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_ring() {
        let ring: ConsistentHash<String> = ConsistentHash::new(10);
        assert!(ring.is_empty());
        assert!(ring.select("k").is_none());
    }

    #[test]
    fn test_replication_factor_entries() {
        let ring = ConsistentHash::new(50);
        ring.add("a", "a");
        ring.add("b", "b");
        assert_eq!(ring.len(), 100);

        ring.remove("a");
        assert_eq!(ring.len(), 50);

        // Removing an unknown seed is a no-op
        ring.remove("zzz");
        assert_eq!(ring.len(), 50);
    }

    #[test]
    fn test_prefix_seeds_keep_all_entries() {
        let ring = ConsistentHash::new(100);
        ring.add("short", "h:8");
        ring.add("long", "h:85");
        assert_eq!(ring.len(), 200);

        ring.remove("h:8");
        assert_eq!(ring.len(), 100);
        assert_eq!(*ring.select("any").unwrap(), "long");
    }

    #[test]
    fn test_select_is_deterministic() {
        let ring = ConsistentHash::new(100);
        for n in ["a", "b", "c"] {
            ring.add(n.to_string(), n);
        }

        let first = ring.select("customer-1").unwrap();
        for _ in 0..10 {
            assert_eq!(ring.select("customer-1").unwrap(), first);
        }
    }

    #[test]
    fn test_distribution_touches_all_nodes() {
        let ring = ConsistentHash::new(DEFAULT_REPLICATION_FACTOR);
        for n in ["a", "b", "c", "d"] {
            ring.add(n.to_string(), n);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..4000 {
            let node = ring.select(&format!("key-{}", i)).unwrap();
            *counts.entry((*node).clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!(*count > 500, "skewed distribution: {:?}", counts);
        }
    }

    #[test]
    fn test_select_where_skips_rejected_nodes() {
        let ring = ConsistentHash::new(20);
        ring.add("a".to_string(), "a");
        ring.add("b".to_string(), "b");

        let owner = ring.select("key").unwrap();
        let other = ring.select_where("key", |n| *n != *owner).unwrap();
        assert_ne!(other, owner);

        assert!(ring.select_where("key", |_| false).is_none());
    }

    #[test]
    fn test_skip_matches_removal() {
        let ring = ConsistentHash::new(30);
        for n in ["a", "b", "c"] {
            ring.add(n.to_string(), n);
        }

        let skipped: Vec<_> = (0..200)
            .map(|i| ring.select_where(&format!("k{}", i), |n| n != "b").unwrap())
            .collect();

        ring.remove("b");
        let removed: Vec<_> = (0..200)
            .map(|i| ring.select(&format!("k{}", i)).unwrap())
            .collect();

        assert_eq!(skipped, removed);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_add_only_moves_keys_to_new_node(
            existing in proptest::collection::hash_set("[a-z]{4}", 1..6),
            newcomer in "[A-Z]{4}",
            keys in proptest::collection::vec("[a-z0-9]{1,12}", 1..40),
        ) {
            let ring = ConsistentHash::new(16);
            for n in &existing {
                ring.add(n.clone(), n);
            }
            let before: Vec<_> = keys.iter().map(|k| ring.select(k).unwrap()).collect();

            ring.add(newcomer.clone(), &newcomer);

            for (k, old) in keys.iter().zip(before) {
                let now = ring.select(k).unwrap();
                prop_assert!(now == old || *now == newcomer);
            }
        }

        #[test]
        fn prop_remove_only_moves_keys_of_removed_node(
            nodes in proptest::collection::hash_set("[a-z]{4}", 2..6),
            keys in proptest::collection::vec("[a-z0-9]{1,12}", 1..40),
        ) {
            let ring = ConsistentHash::new(16);
            for n in &nodes {
                ring.add(n.clone(), n);
            }
            let victim = nodes.iter().next().cloned().unwrap();
            let before: Vec<_> = keys.iter().map(|k| ring.select(k).unwrap()).collect();

            ring.remove(&victim);

            for (k, old) in keys.iter().zip(before) {
                let now = ring.select(k).unwrap();
                if *old != victim {
                    prop_assert_eq!(now, old);
                } else {
                    prop_assert_ne!(&*now, &victim);
                }
            }
        }
    }
}
