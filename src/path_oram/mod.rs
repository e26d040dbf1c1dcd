// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The Path ORAM engine shared by the oblivious map and queue.
//!
//! The engine owns the bucket tree and the stash and implements the access
//! protocol: sweep a root-to-leaf path into the stash, let the caller mutate
//! the stash, write the path back with blocks placed as deep as their
//! assigned leaves allow. On top of that sit the overload measures: a
//! watermark ladder on stash occupancy, bounded full-tree eviction, remapping
//! of stuck blocks, and an explicit emergency mode that sheds or grows rather
//! than failing outright.
//!
//! The engine knows nothing about keys beyond carrying them; every remap or
//! drop it performs is reported back so the map can keep its position map
//! consistent within the same critical section.

pub(crate) mod bucket;
pub(crate) mod stash;
pub(crate) mod tree_index;

pub(crate) use bucket::Block;
pub(crate) use stash::Watermarks;
pub(crate) use tree_index::{Leaf, TreeIndex};

use crate::{OramConfig, OramError, OramStats};
use bucket::Bucket;
use stash::Stash;

/// Bound on passes per full-tree eviction.
pub(crate) const MAX_EVICTION_ROUNDS: usize = 5;
/// Bound on passes when evicting under emergency pressure.
pub(crate) const EMERGENCY_EVICTION_ROUNDS: usize = 8;
/// Failed full-eviction passes after which a block is considered stuck.
const REMAP_ATTEMPT_LIMIT: u32 = 3;

/// How a path write-back drains the stash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteBackPolicy {
    /// Place every placeable block (map).
    Greedy,
    /// Stop draining once occupancy reaches the low watermark, oldest blocks
    /// evicted first, so recent items stay stash-resident (queue).
    RetainRecent,
}

/// Position-map adjustments produced by eviction and emergency measures.
pub(crate) struct Maintenance<K> {
    /// Blocks reassigned to a new leaf, by key.
    pub remapped: Vec<(K, Leaf)>,
    /// Blocks shed under emergency pressure, by key.
    pub dropped: Vec<K>,
}

impl<K> Default for Maintenance<K> {
    fn default() -> Self {
        Self {
            remapped: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

impl<K> Maintenance<K> {
    fn merge(&mut self, mut other: Maintenance<K>) {
        self.remapped.append(&mut other.remapped);
        self.dropped.append(&mut other.dropped);
    }
}

#[derive(Debug)]
pub(crate) struct PathOram<K> {
    /// Buckets in heap order; index 0 is unused, as in the flat-array layout
    /// the arithmetic assumes.
    buckets: Vec<Bucket<K>>,
    height: u32,
    bucket_capacity: usize,
    stash: Stash<K>,
    policy: WriteBackPolicy,
    emergency_permitted: bool,
    emergency_mode: bool,
    stats: OramStats,
}

impl<K> PathOram<K> {
    pub fn new(config: &OramConfig, policy: WriteBackPolicy) -> Result<Self, OramError> {
        config.validate()?;
        log::debug!(
            "PathOram::new(height = {}, bucket_capacity = {}, stash_limit = {})",
            config.tree_height,
            config.bucket_capacity,
            config.stash_limit
        );
        let buckets = (0..=tree_index::bucket_count(config.tree_height))
            .map(|_| Bucket::new(config.bucket_capacity))
            .collect();
        Ok(Self {
            buckets,
            height: config.tree_height,
            bucket_capacity: config.bucket_capacity,
            stash: Stash::new(config.stash_limit),
            policy,
            emergency_permitted: config.emergency_mode,
            emergency_mode: false,
            stats: OramStats::default(),
        })
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bucket_capacity(&self) -> usize {
        self.bucket_capacity
    }

    pub fn stash_len(&self) -> usize {
        self.stash.len()
    }

    pub fn stash_limit(&self) -> usize {
        self.stash.limit()
    }

    pub fn watermarks(&self) -> Watermarks {
        self.stash.marks()
    }

    pub fn stats(&self) -> OramStats {
        self.stats
    }

    pub fn emergency_mode(&self) -> bool {
        self.emergency_mode
    }

    /// Allows or forbids emergency degradation. Forbidding it also clears the
    /// sticky emergency flag; subsequent overload fails with
    /// [`OramError::StashOverflow`] instead of degrading.
    pub fn set_emergency_permitted(&mut self, permitted: bool) {
        self.emergency_permitted = permitted;
        if !permitted {
            self.emergency_mode = false;
        }
    }

    pub fn random_leaf(&self) -> Result<Leaf, OramError> {
        tree_index::random_leaf(self.height)
    }

    /// Moves every real block on the path to `leaf` into the stash, leaving
    /// the path all-dummy, and returns the path root-first for the matching
    /// write-back.
    ///
    /// Fails with [`OramError::StashOverflow`] if the sweep pushes the stash
    /// past its limit; the swept blocks stay consistent in the stash.
    pub fn read_path(&mut self, leaf: Leaf) -> Result<Vec<TreeIndex>, OramError> {
        let path = tree_index::path_indices(self.height, leaf);
        for &index in &path {
            for block in self.buckets[index].drain_real() {
                self.stash.push_back(block);
            }
        }
        self.stats.path_reads += 1;
        self.stats.stash_peak = self.stats.stash_peak.max(self.stash.len());
        self.overflow_check()?;
        Ok(path)
    }

    /// Fails with [`OramError::StashOverflow`] if occupancy exceeds the
    /// (possibly grown) limit.
    pub fn overflow_check(&self) -> Result<(), OramError> {
        if self.stash.len() > self.stash.limit() {
            return Err(OramError::StashOverflow {
                occupancy: self.stash.len(),
                limit: self.stash.limit(),
            });
        }
        Ok(())
    }

    /// Writes the stash back along `path`, filling free slots leaf-to-root
    /// with the oldest block placeable in each bucket.
    pub fn write_path(&mut self, path: &[TreeIndex]) {
        let floor = match self.policy {
            WriteBackPolicy::Greedy => 0,
            WriteBackPolicy::RetainRecent => self.stash.marks().low,
        };
        let height = self.height;
        for &index in path.iter().rev() {
            while self.stash.len() > floor {
                let Some(slot) = self.buckets[index].free_slot() else {
                    break;
                };
                let Some(found) = self
                    .stash
                    .position(|block| tree_index::on_path(index, height, block.leaf))
                else {
                    break;
                };
                if let Some(block) = self.stash.remove_at(found) {
                    self.buckets[index].put(slot, block);
                }
            }
            if self.stash.len() <= floor {
                return;
            }
        }
    }

    /// One full-tree pass: tries to place every stash block as deep as its
    /// path allows. Returns the number of blocks placed; blocks that could
    /// not be placed have their attempt counters bumped.
    fn evict_pass(&mut self) -> usize {
        let mut placed = 0;
        let mut index = 0;
        while index < self.stash.len() {
            let leaf = match self.stash.get(index) {
                Some(block) => block.leaf,
                None => break,
            };
            match self.deepest_free_on_path(leaf) {
                Some((bucket_index, slot)) => {
                    if let Some(block) = self.stash.remove_at(index) {
                        self.buckets[bucket_index].put(slot, block);
                        placed += 1;
                    }
                }
                None => {
                    if let Some(block) = self.stash.get_mut(index) {
                        block.attempts += 1;
                    }
                    index += 1;
                }
            }
        }
        placed
    }

    fn deepest_free_on_path(&self, leaf: Leaf) -> Option<(TreeIndex, usize)> {
        let mut index = tree_index::leaf_to_index(self.height, leaf);
        while index > 0 {
            if let Some(slot) = self.buckets[index].free_slot() {
                return Some((index, slot));
            }
            index /= 2;
        }
        None
    }

    /// Full-tree eviction: repeated placement passes, stopping early once a
    /// pass makes no progress. Performs no remapping, so consecutive calls
    /// with no intervening operations are idempotent.
    pub fn full_eviction(&mut self, rounds: usize) {
        self.stats.full_evictions += 1;
        if self.stash.is_empty() {
            return;
        }
        for _ in 0..rounds {
            if self.evict_pass() == 0 {
                break;
            }
        }
        log::debug!(
            "full eviction finished: stash occupancy {} of limit {}",
            self.stash.len(),
            self.stash.limit()
        );
    }
}

impl<K: Clone> PathOram<K> {
    /// Reassigns stuck blocks (those past the attempt limit) to fresh random
    /// leaves. Returns the affected keys and their new leaves.
    pub fn remap_stuck(&mut self) -> Result<Vec<(K, Leaf)>, OramError> {
        self.remap_where(|block| block.attempts >= REMAP_ATTEMPT_LIMIT)
    }

    fn remap_all(&mut self) -> Result<Vec<(K, Leaf)>, OramError> {
        self.remap_where(|_| true)
    }

    fn remap_where<F: Fn(&Block<K>) -> bool>(
        &mut self,
        predicate: F,
    ) -> Result<Vec<(K, Leaf)>, OramError> {
        let leaves = tree_index::leaf_count(self.height);
        let mut remapped = Vec::new();
        for block in self.stash.iter_mut() {
            if predicate(block) {
                block.leaf = crate::crypto::secure_random_index(leaves)?;
                block.attempts = 0;
                remapped.push((block.key.clone(), block.leaf));
            }
        }
        Ok(remapped)
    }

    /// Watermark-driven measures that run before each access, while the
    /// access leaf is still unchosen:
    ///
    /// - at or above `high`: full-tree eviction;
    /// - if a worst-case path sweep would push occupancy past `critical`:
    ///   emergency measures (remap everything, evict harder, shed stuck
    ///   blocks, grow the limit as a last resort).
    ///
    /// The returned [`Maintenance`] must be applied to the position map
    /// before the caller consults it.
    pub fn pre_access(&mut self) -> Result<Maintenance<K>, OramError> {
        let mut outcome = Maintenance::default();
        if self.stash.len() >= self.stash.marks().high {
            self.full_eviction(MAX_EVICTION_ROUNDS);
        }
        let worst_case_sweep = self.bucket_capacity * (self.height as usize + 1);
        let projected = self.stash.len() + worst_case_sweep;
        if projected > self.stash.marks().critical && self.emergency_permitted {
            outcome.merge(self.emergency_measures()?);
        }
        Ok(outcome)
    }

    /// The documented degradation ladder. Leaves the engine in emergency mode
    /// (sticky) so callers can observe that obliviousness was weakened.
    fn emergency_measures(&mut self) -> Result<Maintenance<K>, OramError> {
        if !self.emergency_mode {
            self.emergency_mode = true;
            self.stats.emergency_entries += 1;
            log::warn!(
                "entering emergency mode: stash occupancy {} of limit {}",
                self.stash.len(),
                self.stash.limit()
            );
        }
        let mut outcome = Maintenance::default();
        outcome.remapped = self.remap_all()?;
        self.full_eviction(EMERGENCY_EVICTION_ROUNDS);

        let critical = self.stash.marks().critical;
        if self.stash.len() > critical {
            let shed = self.stash.shed_to(critical);
            if !shed.is_empty() {
                self.stats.dropped_blocks += shed.len() as u64;
                log::warn!("emergency mode dropped {} stash blocks", shed.len());
                outcome.dropped = shed.into_iter().map(|block| block.key).collect();
            }
        }
        if self.stash.len() > self.stash.marks().critical {
            let limit = self.stash.grow_limit();
            self.stats.limit_growths += 1;
            log::warn!("stash overflow pressure: limit grown to {limit}");
        }
        Ok(outcome)
    }
}

impl<K: PartialEq> PathOram<K> {
    /// Removes every stash block carrying `key`. The uniqueness invariant
    /// rests on this running after the key's current path has been swept.
    pub fn stash_remove_key(&mut self, key: &K) -> usize {
        self.stash.remove_key(key)
    }

    pub fn find_key_mut(&mut self, key: &K) -> Option<&mut Block<K>> {
        self.stash.find_key_mut(key)
    }
}

impl<K> PathOram<K> {
    pub fn stash_push(&mut self, block: Block<K>) {
        self.stash.push_back(block);
        self.stats.stash_peak = self.stats.stash_peak.max(self.stash.len());
    }

    pub fn stash_pop_front(&mut self) -> Option<Block<K>> {
        self.stash.pop_front()
    }
}

#[cfg(test)]
impl<K: Clone> PathOram<K> {
    /// Keys per bucket slot, for snapshot comparisons in tests.
    pub fn bucket_keys(&self) -> Vec<Vec<K>> {
        self.buckets
            .iter()
            .map(|bucket| bucket.blocks().map(|block| block.key.clone()).collect())
            .collect()
    }

    pub fn stash_keys(&self) -> Vec<K> {
        self.stash.iter().map(|block| block.key.clone()).collect()
    }

    /// Asserts the path and capacity invariants over the whole tree.
    pub fn check_invariants(&self) {
        for (index, bucket) in self.buckets.iter().enumerate().skip(1) {
            assert_eq!(bucket.capacity(), self.bucket_capacity);
            for block in bucket.blocks() {
                assert!(
                    tree_index::on_path(index, self.height, block.leaf),
                    "block assigned to leaf {} found off-path in bucket {}",
                    block.leaf,
                    index
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(
        height: u32,
        bucket_capacity: usize,
        stash_limit: usize,
        policy: WriteBackPolicy,
    ) -> PathOram<u32> {
        let config = OramConfig {
            tree_height: height,
            bucket_capacity,
            stash_limit,
            ..OramConfig::for_map()
        };
        PathOram::new(&config, policy).unwrap()
    }

    fn block(key: u32, leaf: Leaf) -> Block<u32> {
        Block::new(key, Vec::new(), leaf)
    }

    #[test]
    fn write_back_places_blocks_as_deep_as_their_leaf_allows() {
        let mut oram = engine(3, 4, 100, WriteBackPolicy::Greedy);
        let path = oram.read_path(5).unwrap();
        oram.stash_push(block(1, 5));
        oram.write_path(&path);

        assert_eq!(oram.stash_len(), 0);
        // Deepest bucket on the path to leaf 5 is its leaf bucket.
        let keys = oram.bucket_keys();
        assert_eq!(keys[tree_index::leaf_to_index(3, 5)], vec![1]);
        oram.check_invariants();
    }

    #[test]
    fn read_path_sweeps_the_whole_path_into_the_stash() {
        let mut oram = engine(3, 4, 100, WriteBackPolicy::Greedy);
        for key in 0..3 {
            let path = oram.read_path(5).unwrap();
            oram.stash_push(block(key, 5));
            oram.write_path(&path);
        }
        assert_eq!(oram.stash_len(), 0);

        oram.read_path(5).unwrap();
        assert_eq!(oram.stash_len(), 3);
        // The swept buckets are now all dummies.
        for index in tree_index::path_indices(3, 5) {
            assert!(oram.bucket_keys()[index].is_empty());
        }
        oram.check_invariants();
    }

    #[test]
    fn blocks_for_other_leaves_place_no_deeper_than_the_common_prefix() {
        let mut oram = engine(3, 4, 100, WriteBackPolicy::Greedy);
        let path = oram.read_path(0).unwrap();
        // Leaf 7 shares only the root with the path to leaf 0.
        oram.stash_push(block(9, 7));
        oram.write_path(&path);
        assert_eq!(oram.stash_len(), 0);
        assert_eq!(oram.bucket_keys()[1], vec![9]);
        oram.check_invariants();
    }

    #[test]
    fn retain_recent_policy_keeps_small_stashes_resident() {
        let mut oram = engine(3, 4, 100, WriteBackPolicy::RetainRecent);
        for key in 0..3 {
            let path = oram.read_path(key as Leaf).unwrap();
            oram.stash_push(block(key, key as Leaf));
            oram.write_path(&path);
        }
        // low watermark is 30; nothing should have been evicted.
        assert_eq!(oram.stash_len(), 3);
        assert_eq!(oram.stash_keys(), vec![0, 1, 2]);
    }

    #[test]
    fn path_invariant_holds_across_random_operations() {
        let mut oram = engine(4, 2, 200, WriteBackPolicy::Greedy);
        for key in 0..60u32 {
            let leaf = oram.random_leaf().unwrap();
            let path = oram.read_path(leaf).unwrap();
            oram.stash_push(block(key, leaf));
            oram.write_path(&path);
            oram.check_invariants();
        }
        oram.full_eviction(MAX_EVICTION_ROUNDS);
        oram.check_invariants();
    }

    #[test]
    fn full_eviction_is_idempotent() {
        let mut oram = engine(2, 1, 100, WriteBackPolicy::Greedy);
        // More blocks than the tree can hold, on colliding leaves.
        for key in 0..12u32 {
            oram.stash_push(block(key, (key % 4) as Leaf));
        }
        oram.full_eviction(MAX_EVICTION_ROUNDS);
        let buckets_after_first = oram.bucket_keys();
        let stash_after_first = oram.stash_keys();
        assert!(!stash_after_first.is_empty());

        oram.full_eviction(MAX_EVICTION_ROUNDS);
        assert_eq!(oram.bucket_keys(), buckets_after_first);
        assert_eq!(oram.stash_keys(), stash_after_first);
        oram.check_invariants();
    }

    #[test]
    fn pre_access_evicts_at_the_high_watermark() {
        let mut oram = engine(4, 4, 40, WriteBackPolicy::Greedy);
        // high = 30; spread blocks over distinct leaves so they place cleanly.
        for key in 0..32u32 {
            oram.stash_push(block(key, (key % 16) as Leaf));
        }
        let outcome = oram.pre_access().unwrap();
        assert!(oram.stash_len() < 30);
        assert!(outcome.dropped.is_empty());
        oram.check_invariants();
    }

    #[test]
    fn emergency_sheds_stuck_blocks_and_reports_them() {
        // A tree with 3 buckets of 1 slot; 12 blocks can never all place.
        let mut oram = engine(1, 1, 8, WriteBackPolicy::Greedy);
        for key in 0..12u32 {
            oram.stash_push(block(key, (key % 2) as Leaf));
        }
        let outcome = oram.pre_access().unwrap();
        assert!(oram.emergency_mode());
        assert!(!outcome.dropped.is_empty());
        assert_eq!(
            oram.stats().dropped_blocks,
            outcome.dropped.len() as u64
        );
        oram.check_invariants();
    }

    #[test]
    fn overflow_is_fatal_when_emergency_is_forbidden() {
        let mut oram = engine(2, 4, 6, WriteBackPolicy::Greedy);
        oram.set_emergency_permitted(false);
        // Fill the path to leaf 0 with 4 tree blocks, then load the stash.
        let path = oram.read_path(0).unwrap();
        for key in 0..4u32 {
            oram.stash_push(block(key, 0));
        }
        oram.write_path(&path);
        for key in 4..10u32 {
            oram.stash_push(block(key, 1));
        }
        let result = oram.read_path(0);
        assert!(matches!(result, Err(OramError::StashOverflow { .. })));
        assert!(!oram.emergency_mode());
        oram.check_invariants();
    }

    #[test]
    fn remap_stuck_reassigns_only_failed_blocks() {
        let mut oram = engine(3, 1, 100, WriteBackPolicy::Greedy);
        oram.stash_push(block(1, 0));
        oram.stash_push(block(2, 0));
        if let Some(stuck) = oram.stash.get_mut(0) {
            stuck.attempts = REMAP_ATTEMPT_LIMIT;
        }
        let remapped = oram.remap_stuck().unwrap();
        assert_eq!(remapped.len(), 1);
        assert_eq!(remapped[0].0, 1);
        assert_eq!(oram.stash.get(0).unwrap().attempts, 0);
        assert_eq!(oram.stash.get(1).unwrap().leaf, 0);
    }
}
