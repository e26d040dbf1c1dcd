// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Blocks and fixed-capacity buckets.

use super::tree_index::Leaf;

/// A real ORAM block: one logical value and its placement state.
///
/// `K` is the application key for map blocks and `()` for queue blocks. The
/// payload is always an authenticated ciphertext; plaintext values never sit
/// in the tree or the stash.
#[derive(Clone, Debug)]
pub(crate) struct Block<K> {
    pub key: K,
    pub payload: Vec<u8>,
    /// The leaf whose root path this block must reside on.
    pub leaf: Leaf,
    /// Consecutive full-eviction passes that failed to place this block.
    pub attempts: u32,
    /// Blocks with this flag set are shed last under emergency pressure.
    pub priority: bool,
}

impl<K> Block<K> {
    pub fn new(key: K, payload: Vec<u8>, leaf: Leaf) -> Self {
        Self {
            key,
            payload,
            leaf,
            attempts: 0,
            priority: false,
        }
    }
}

/// A bucket of exactly `capacity` slots; empty slots are the dummies.
#[derive(Clone, Debug)]
pub(crate) struct Bucket<K> {
    slots: Vec<Option<Block<K>>>,
}

impl<K> Bucket<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Index of the first free slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn put(&mut self, slot: usize, block: Block<K>) {
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(block);
    }

    /// Removes and returns every real block, leaving all slots dummy.
    pub fn drain_real(&mut self) -> Vec<Block<K>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    #[cfg(test)]
    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[cfg(test)]
    pub fn blocks(&self) -> impl Iterator<Item = &Block<K>> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_fill_and_drain() {
        let mut bucket: Bucket<u32> = Bucket::new(3);
        assert_eq!(bucket.capacity(), 3);
        assert_eq!(bucket.occupancy(), 0);
        assert_eq!(bucket.free_slot(), Some(0));

        bucket.put(0, Block::new(7, vec![1, 2], 4));
        bucket.put(1, Block::new(8, vec![], 5));
        assert_eq!(bucket.occupancy(), 2);
        assert_eq!(bucket.free_slot(), Some(2));

        bucket.put(2, Block::new(9, vec![3], 6));
        assert_eq!(bucket.free_slot(), None);

        let drained = bucket.drain_real();
        assert_eq!(drained.len(), 3);
        assert_eq!(bucket.occupancy(), 0);
        assert_eq!(bucket.capacity(), 3);
    }
}
