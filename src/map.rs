// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious map: keyed insert/lookup over the Path ORAM engine.
//!
//! This is the structure backing an NDN router's FIB and PIT. Keys map to a
//! leaf through a plaintext position map held by the trusted client; values
//! are sealed with AES-256-GCM before they enter a block. Every operation,
//! whether it hits or misses, reads exactly one root-to-leaf path and writes
//! it back, and every access remaps its key to a fresh random leaf, so the
//! observable trace is one random-looking path access regardless of what the
//! operation did.

use std::{
    collections::HashMap,
    hash::Hash,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    crypto,
    evictor::{BackgroundEvictor, EvictTarget},
    path_oram::{
        Block, Leaf, Maintenance, PathOram, Watermarks, WriteBackPolicy,
        EMERGENCY_EVICTION_ROUNDS, MAX_EVICTION_ROUNDS,
    },
    OramConfig, OramError, OramStats,
};

pub(crate) struct MapState<K> {
    oram: PathOram<K>,
    position: HashMap<K, Leaf>,
}

impl<K: Eq + Hash + Clone> MapState<K> {
    /// Applies remaps and drops to the position map. Must run in the same
    /// critical section as the eviction that produced them.
    fn apply(&mut self, outcome: Maintenance<K>) {
        for (key, leaf) in outcome.remapped {
            self.position.insert(key, leaf);
        }
        for key in outcome.dropped {
            self.position.remove(&key);
        }
    }
}

impl<K: Eq + Hash + Clone + Send> EvictTarget for MapState<K> {
    fn stash_occupancy(&self) -> usize {
        self.oram.stash_len()
    }

    fn watermarks(&self) -> Watermarks {
        self.oram.watermarks()
    }

    fn maintenance_evict(&mut self, critical: bool) {
        if critical {
            match self.oram.remap_stuck() {
                Ok(remapped) => {
                    for (key, leaf) in remapped {
                        self.position.insert(key, leaf);
                    }
                }
                Err(e) => log::warn!("evictor could not remap stuck blocks: {e}"),
            }
            self.oram.full_eviction(EMERGENCY_EVICTION_ROUNDS);
        } else {
            self.oram.full_eviction(MAX_EVICTION_ROUNDS);
        }
    }
}

/// An access-pattern-hiding map from `K` to `V`.
///
/// All operations take `&self` and are linearizable: a single mutex guards
/// the tree, stash, position map, and emergency state for the full duration
/// of each call. The structure is `Send + Sync` and may be shared across
/// threads behind an [`Arc`].
pub struct ObliviousMap<K, V> {
    state: Arc<Mutex<MapState<K>>>,
    _evictor: BackgroundEvictor,
    _payload: PhantomData<fn() -> V>,
}

impl<K, V> ObliviousMap<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Serialize + DeserializeOwned,
{
    /// Creates a map with the defaults of [`OramConfig::for_map`].
    ///
    /// # Errors
    ///
    /// [`OramError::InvalidConfiguration`] if the configuration is rejected.
    pub fn new() -> Result<Self, OramError> {
        Self::with_config(OramConfig::for_map())
    }

    /// Creates a map with explicit tree height, bucket capacity, and stash
    /// limit, keeping the remaining defaults.
    ///
    /// # Errors
    ///
    /// [`OramError::InvalidConfiguration`] on out-of-range parameters; a
    /// height-0 tree is rejected.
    pub fn new_with_parameters(
        tree_height: u32,
        bucket_capacity: usize,
        stash_limit: usize,
    ) -> Result<Self, OramError> {
        Self::with_config(OramConfig {
            tree_height,
            bucket_capacity,
            stash_limit,
            ..OramConfig::for_map()
        })
    }

    /// Creates a map from a full configuration.
    ///
    /// # Errors
    ///
    /// [`OramError::InvalidConfiguration`] if the configuration is rejected.
    pub fn with_config(config: OramConfig) -> Result<Self, OramError> {
        let oram = PathOram::new(&config, WriteBackPolicy::Greedy)?;
        let state = Arc::new(Mutex::new(MapState {
            oram,
            position: HashMap::new(),
        }));
        let evictor = BackgroundEvictor::spawn(state.clone(), config.evictor_interval);
        Ok(Self {
            state,
            _evictor: evictor,
            _payload: PhantomData,
        })
    }

    /// Stores `key -> value`, overwriting any previous value for `key`.
    ///
    /// The path read targets the key's current leaf (a fresh random leaf for
    /// unknown keys), which retires any prior block for the key before the
    /// replacement is enqueued under a newly drawn leaf.
    ///
    /// # Errors
    ///
    /// [`OramError::StashOverflow`] if the stash limit is exceeded after all
    /// measures, [`OramError::Rng`]/[`OramError::Crypto`] on primitive
    /// failures, [`OramError::Serialization`] if the value cannot be encoded.
    pub fn insert(&self, key: K, value: &V) -> Result<(), OramError> {
        let plaintext =
            bincode::serialize(value).map_err(|e| OramError::Serialization(e.to_string()))?;

        let mut state = self.state.lock().expect("oblivious map lock poisoned");
        let outcome = state.oram.pre_access()?;
        state.apply(outcome);

        let read_leaf = match state.position.get(&key).copied() {
            Some(leaf) => leaf,
            None => state.oram.random_leaf()?,
        };
        let path = state.oram.read_path(read_leaf)?;
        state.oram.stash_remove_key(&key);

        let new_leaf = state.oram.random_leaf()?;
        let sealed = crypto::seal(&plaintext)?;
        state.position.insert(key.clone(), new_leaf);
        state.oram.stash_push(Block::new(key, sealed, new_leaf));
        state.oram.overflow_check()?;
        state.oram.write_path(&path);

        if state.oram.stash_len() > state.oram.watermarks().mid {
            state.oram.full_eviction(MAX_EVICTION_ROUNDS);
        }
        Ok(())
    }

    /// Returns the value stored for `key`, or `None`.
    ///
    /// A miss performs the same path access as a hit (one read of a random
    /// leaf's path and its write-back), so hits and misses are externally
    /// indistinguishable. On a hit the key is remapped to a fresh leaf.
    ///
    /// # Errors
    ///
    /// As for [`ObliviousMap::insert`].
    pub fn lookup(&self, key: &K) -> Result<Option<V>, OramError> {
        let mut state = self.state.lock().expect("oblivious map lock poisoned");
        let outcome = state.oram.pre_access()?;
        state.apply(outcome);

        let Some(leaf) = state.position.get(key).copied() else {
            let dummy_leaf = state.oram.random_leaf()?;
            let path = state.oram.read_path(dummy_leaf)?;
            state.oram.write_path(&path);
            return Ok(None);
        };

        let path = state.oram.read_path(leaf)?;
        let new_leaf = state.oram.random_leaf()?;
        let mut value = None;
        if let Some(block) = state.oram.find_key_mut(key) {
            let plaintext = crypto::open(&block.payload)?;
            value = Some(
                bincode::deserialize(&plaintext)
                    .map_err(|e| OramError::Serialization(e.to_string()))?,
            );
            block.leaf = new_leaf;
        }
        state.position.insert(key.clone(), new_leaf);
        state.oram.write_path(&path);
        Ok(value)
    }

    /// Current stash occupancy.
    pub fn stash_size(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .stash_len()
    }

    /// Runs a bounded full-tree eviction. Deterministic: repeated calls with
    /// no intervening operations leave tree and stash unchanged.
    pub fn trigger_full_eviction(&self) {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .full_eviction(MAX_EVICTION_ROUNDS);
    }

    /// Permits or forbids emergency degradation (shedding, limit growth).
    /// Forbidding it makes overload fail with [`OramError::StashOverflow`].
    pub fn enable_emergency_mode(&self, enabled: bool) {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .set_emergency_permitted(enabled);
    }

    /// Whether the engine has entered emergency mode. Sticky once set.
    ///
    /// Under emergency mode access-pattern leakage increases: remap bursts,
    /// block drops, and stash growth are all load-dependent events an
    /// observer can correlate with the offered workload.
    pub fn is_emergency_mode_enabled(&self) -> bool {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .emergency_mode()
    }

    /// Blocks shed by emergency measures so far. Zero under nominal load.
    pub fn dropped_block_count(&self) -> u64 {
        self.stats().dropped_blocks
    }

    /// Snapshot of the internal counters.
    pub fn stats(&self) -> OramStats {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .stats()
    }

    /// Height of the bucket tree.
    pub fn tree_height(&self) -> u32 {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .height()
    }

    /// Blocks per bucket.
    pub fn bucket_capacity(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .bucket_capacity()
    }

    /// Current stash limit (grows under emergency pressure).
    pub fn stash_limit(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious map lock poisoned")
            .oram
            .stash_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn insert_then_lookup_round_trips() {
        let map: ObliviousMap<String, u32> = ObliviousMap::new_with_parameters(5, 4, 100).unwrap();
        map.insert("k1".to_owned(), &10).unwrap();
        assert!(map.stash_size() <= 4);
        assert_eq!(map.lookup(&"k1".to_owned()).unwrap(), Some(10));
        assert!(map.stash_size() <= 4);
        assert_eq!(map.lookup(&"k2".to_owned()).unwrap(), None);
        assert!(map.stash_size() <= 4);
        assert_eq!(map.dropped_block_count(), 0);
    }

    #[test]
    fn reinsert_overwrites_without_accumulating() {
        let map: ObliviousMap<String, String> = ObliviousMap::new().unwrap();
        map.insert("/example".to_owned(), &"eth0".to_owned()).unwrap();
        map.insert("/example".to_owned(), &"eth1".to_owned()).unwrap();
        assert_eq!(
            map.lookup(&"/example".to_owned()).unwrap(),
            Some("eth1".to_owned())
        );

        // Exactly one block for the key across tree + stash.
        let state = map.state.lock().unwrap();
        let in_tree: usize = state
            .oram
            .bucket_keys()
            .iter()
            .flatten()
            .filter(|key| key.as_str() == "/example")
            .count();
        let in_stash = state
            .oram
            .stash_keys()
            .iter()
            .filter(|key| key.as_str() == "/example")
            .count();
        assert_eq!(in_tree + in_stash, 1);
    }

    #[test]
    fn miss_performs_a_full_path_access() {
        let map: ObliviousMap<String, u32> = ObliviousMap::new().unwrap();
        let before = map.stats().path_reads;
        assert_eq!(map.lookup(&"absent".to_owned()).unwrap(), None);
        assert_eq!(map.stats().path_reads, before + 1);
    }

    #[test]
    fn every_access_performs_exactly_one_path_read() {
        let map: ObliviousMap<String, u32> = ObliviousMap::new().unwrap();
        map.insert("a".to_owned(), &1).unwrap();
        let after_insert = map.stats().path_reads;
        assert_eq!(after_insert, 1);
        map.lookup(&"a".to_owned()).unwrap();
        assert_eq!(map.stats().path_reads, 2);
    }

    #[test]
    fn random_workload_matches_a_mirror_map() {
        let mut rng = StdRng::seed_from_u64(0);
        let map: ObliviousMap<u32, u64> = ObliviousMap::new_with_parameters(6, 4, 200).unwrap();
        let mut mirror: HashMap<u32, u64> = HashMap::new();

        for _ in 0..300 {
            let key = rng.gen_range(0..24u32);
            if rng.gen::<bool>() {
                let value = rng.gen::<u64>();
                map.insert(key, &value).unwrap();
                mirror.insert(key, value);
            } else {
                assert_eq!(map.lookup(&key).unwrap(), mirror.get(&key).copied());
            }
        }
        for (key, value) in &mirror {
            assert_eq!(map.lookup(key).unwrap(), Some(*value));
        }
        assert_eq!(map.dropped_block_count(), 0);
        assert!(!map.is_emergency_mode_enabled());
    }

    #[test]
    fn position_map_tracks_the_unique_block() {
        let map: ObliviousMap<u32, u32> = ObliviousMap::new_with_parameters(4, 4, 100).unwrap();
        for key in 0..12u32 {
            map.insert(key, &(key * 10)).unwrap();
        }
        let state = map.state.lock().unwrap();
        state.oram.check_invariants();
        let tree_keys = state.oram.bucket_keys();
        let stash_keys = state.oram.stash_keys();
        for key in 0..12u32 {
            let leaf = state.position[&key];
            let on_assigned_path = crate::path_oram::tree_index::path_indices(4, leaf)
                .iter()
                .any(|&index| tree_keys[index].contains(&key));
            let in_stash = stash_keys.contains(&key);
            assert!(
                on_assigned_path || in_stash,
                "block for key {key} is neither on its path nor in the stash"
            );
        }
    }

    #[test]
    fn accessors_report_construction_parameters() {
        let map: ObliviousMap<String, u32> = ObliviousMap::new_with_parameters(6, 8, 150).unwrap();
        assert_eq!(map.tree_height(), 6);
        assert_eq!(map.bucket_capacity(), 8);
        assert_eq!(map.stash_limit(), 150);
    }

    #[test]
    fn manual_eviction_is_idempotent_through_the_public_api() {
        let map: ObliviousMap<u32, u32> = ObliviousMap::new_with_parameters(3, 2, 100).unwrap();
        for key in 0..10u32 {
            map.insert(key, &key).unwrap();
        }
        map.trigger_full_eviction();
        let (buckets_first, stash_first) = {
            let state = map.state.lock().unwrap();
            (state.oram.bucket_keys(), state.oram.stash_keys())
        };
        map.trigger_full_eviction();
        let state = map.state.lock().unwrap();
        assert_eq!(state.oram.bucket_keys(), buckets_first);
        assert_eq!(state.oram.stash_keys(), stash_first);
    }
}
