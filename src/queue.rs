// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious queue: FIFO push/pop over the Path ORAM engine.
//!
//! This is the structure backing an NDN router's Content Store. Queue blocks
//! carry no key and no position-map entry; every operation draws a fresh
//! random leaf, reads that path, and writes it back, so pushes and pops
//! (including pops of an empty queue) produce identical traces.
//!
//! Ordering discipline: blocks currently in the stash are served strictly in
//! insertion order. Blocks that eviction has placed into the tree re-enter
//! the stash in whatever order later path sweeps find them, so ordering
//! across tree residency is best-effort. The write-back policy keeps the
//! stash resident up to the low watermark (oldest blocks evicted first),
//! which keeps small queues exactly FIFO.

use std::{
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    crypto,
    evictor::{BackgroundEvictor, EvictTarget},
    path_oram::{
        Block, PathOram, Watermarks, WriteBackPolicy, EMERGENCY_EVICTION_ROUNDS,
        MAX_EVICTION_ROUNDS,
    },
    OramConfig, OramError, OramStats,
};

pub(crate) struct QueueState {
    oram: PathOram<()>,
    len: usize,
}

impl EvictTarget for QueueState {
    fn stash_occupancy(&self) -> usize {
        self.oram.stash_len()
    }

    fn watermarks(&self) -> Watermarks {
        self.oram.watermarks()
    }

    fn maintenance_evict(&mut self, critical: bool) {
        if critical {
            if let Err(e) = self.oram.remap_stuck() {
                log::warn!("evictor could not remap stuck blocks: {e}");
            }
            self.oram.full_eviction(EMERGENCY_EVICTION_ROUNDS);
        } else {
            self.oram.full_eviction(MAX_EVICTION_ROUNDS);
        }
    }
}

/// An access-pattern-hiding FIFO queue of `V`.
///
/// All operations take `&self` and are linearizable behind a single mutex.
/// The structure is `Send + Sync` and may be shared across threads behind an
/// [`Arc`].
pub struct ObliviousQueue<V> {
    state: Arc<Mutex<QueueState>>,
    _evictor: BackgroundEvictor,
    _payload: PhantomData<fn() -> V>,
}

impl<V> ObliviousQueue<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Creates a queue with the defaults of [`OramConfig::for_queue`].
    ///
    /// # Errors
    ///
    /// [`OramError::InvalidConfiguration`] if the configuration is rejected.
    pub fn new() -> Result<Self, OramError> {
        Self::with_config(OramConfig::for_queue())
    }

    /// Creates a queue with explicit tree height, bucket capacity, and stash
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
            ..OramConfig::for_queue()
        })
    }

    /// Creates a queue from a full configuration.
    ///
    /// # Errors
    ///
    /// [`OramError::InvalidConfiguration`] if the configuration is rejected.
    pub fn with_config(config: OramConfig) -> Result<Self, OramError> {
        let oram = PathOram::new(&config, WriteBackPolicy::RetainRecent)?;
        let state = Arc::new(Mutex::new(QueueState { oram, len: 0 }));
        let evictor = BackgroundEvictor::spawn(state.clone(), config.evictor_interval);
        Ok(Self {
            state,
            _evictor: evictor,
            _payload: PhantomData,
        })
    }

    /// Appends `value` to the queue.
    ///
    /// # Errors
    ///
    /// [`OramError::StashOverflow`] if the stash limit is exceeded after all
    /// measures, [`OramError::Rng`]/[`OramError::Crypto`] on primitive
    /// failures, [`OramError::Serialization`] if the value cannot be encoded.
    pub fn push(&self, value: &V) -> Result<(), OramError> {
        let plaintext =
            bincode::serialize(value).map_err(|e| OramError::Serialization(e.to_string()))?;

        let mut state = self.state.lock().expect("oblivious queue lock poisoned");
        let outcome = state.oram.pre_access()?;
        state.len = state.len.saturating_sub(outcome.dropped.len());

        let leaf = state.oram.random_leaf()?;
        let path = state.oram.read_path(leaf)?;
        let sealed = crypto::seal(&plaintext)?;
        state.oram.stash_push(Block::new((), sealed, leaf));
        state.len += 1;
        state.oram.overflow_check()?;
        state.oram.write_path(&path);
        Ok(())
    }

    /// Removes and returns the oldest stash-resident value, or `None`.
    ///
    /// The path traversal happens regardless of the outcome, so popping an
    /// empty queue is indistinguishable from a successful pop. A `None` with
    /// [`ObliviousQueue::len`] nonzero means the remaining blocks sit in the
    /// tree; they surface on later sweeps.
    ///
    /// # Errors
    ///
    /// As for [`ObliviousQueue::push`].
    pub fn pop(&self) -> Result<Option<V>, OramError> {
        let mut state = self.state.lock().expect("oblivious queue lock poisoned");
        let outcome = state.oram.pre_access()?;
        state.len = state.len.saturating_sub(outcome.dropped.len());

        let leaf = state.oram.random_leaf()?;
        let path = state.oram.read_path(leaf)?;
        let value = match state.oram.stash_pop_front() {
            Some(block) => {
                state.len = state.len.saturating_sub(1);
                let plaintext = crypto::open(&block.payload)?;
                Some(
                    bincode::deserialize(&plaintext)
                        .map_err(|e| OramError::Serialization(e.to_string()))?,
                )
            }
            None => None,
        };
        state.oram.write_path(&path);
        Ok(value)
    }

    /// Number of values logically in the queue (stash and tree combined).
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .len
    }

    /// Whether the queue holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current stash occupancy.
    pub fn stash_size(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .oram
            .stash_len()
    }

    /// Runs a bounded full-tree eviction. Deterministic: repeated calls with
    /// no intervening operations leave tree and stash unchanged.
    pub fn trigger_full_eviction(&self) {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .oram
            .full_eviction(MAX_EVICTION_ROUNDS);
    }

    /// Permits or forbids emergency degradation (shedding, limit growth).
    /// Forbidding it makes overload fail with [`OramError::StashOverflow`].
    pub fn enable_emergency_mode(&self, enabled: bool) {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
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
            .expect("oblivious queue lock poisoned")
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
            .expect("oblivious queue lock poisoned")
            .oram
            .stats()
    }

    /// Height of the bucket tree.
    pub fn tree_height(&self) -> u32 {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .oram
            .height()
    }

    /// Blocks per bucket.
    pub fn bucket_capacity(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .oram
            .bucket_capacity()
    }

    /// Current stash limit (grows under emergency pressure).
    pub fn stash_limit(&self) -> usize {
        self.state
            .lock()
            .expect("oblivious queue lock poisoned")
            .oram
            .stash_limit()
    }
}
