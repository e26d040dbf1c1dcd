// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The stash: blocks awaiting placement back into the tree.
//!
//! Only real blocks ever enter the stash; dummies stay in the tree. The deque
//! preserves arrival order: the queue's FIFO discipline among stash-resident
//! blocks depends on it, and the map simply doesn't care. The soft limit `S`
//! carries a ladder of watermarks that drive eviction and emergency measures.

use std::collections::VecDeque;

use super::bucket::Block;

/// Occupancy thresholds derived from the stash limit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Watermarks {
    /// Below this the write-back of a queue retains recent blocks (0.3 S).
    pub low: usize,
    /// Post-insert full-eviction trigger (0.5 S).
    pub mid: usize,
    /// Pre-access full-eviction trigger and evictor wake threshold (0.75 S).
    pub high: usize,
    /// Emergency-mode trigger and shedding target (0.9 S).
    pub critical: usize,
}

impl Watermarks {
    pub fn from_limit(limit: usize) -> Self {
        Self {
            low: limit * 3 / 10,
            mid: limit / 2,
            high: limit * 3 / 4,
            critical: limit * 9 / 10,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Stash<K> {
    blocks: VecDeque<Block<K>>,
    limit: usize,
    marks: Watermarks,
}

impl<K> Stash<K> {
    pub fn new(limit: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            limit,
            marks: Watermarks::from_limit(limit),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn marks(&self) -> Watermarks {
        self.marks
    }

    pub fn push_back(&mut self, block: Block<K>) {
        self.blocks.push_back(block);
    }

    pub fn pop_front(&mut self) -> Option<Block<K>> {
        self.blocks.pop_front()
    }

    pub fn get(&self, index: usize) -> Option<&Block<K>> {
        self.blocks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Block<K>> {
        self.blocks.get_mut(index)
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Block<K>> {
        self.blocks.remove(index)
    }

    /// Index of the oldest block satisfying `predicate`.
    pub fn position<F: Fn(&Block<K>) -> bool>(&self, predicate: F) -> Option<usize> {
        self.blocks.iter().position(predicate)
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Block<K>> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Block<K>> {
        self.blocks.iter_mut()
    }

    /// Grows the soft limit by 20% (at least one block) and rebuilds the
    /// watermark ladder. Returns the new limit.
    pub fn grow_limit(&mut self) -> usize {
        self.limit += (self.limit / 5).max(1);
        self.marks = Watermarks::from_limit(self.limit);
        self.limit
    }

    /// Emergency shedding: removes blocks until occupancy is at most
    /// `target`, considering only blocks that have already failed at least
    /// one eviction attempt. Victims are taken in priority order (unflagged
    /// first), most-failed first. Relative order of survivors is preserved.
    pub fn shed_to(&mut self, target: usize) -> Vec<Block<K>> {
        if self.blocks.len() <= target {
            return Vec::new();
        }
        let mut victims: Vec<usize> = (0..self.blocks.len())
            .filter(|&i| self.blocks[i].attempts > 0)
            .collect();
        victims.sort_by(|&a, &b| {
            let (left, right) = (&self.blocks[a], &self.blocks[b]);
            left.priority
                .cmp(&right.priority)
                .then(right.attempts.cmp(&left.attempts))
        });
        victims.truncate(self.blocks.len() - target);
        // Remove back-to-front so earlier indices stay valid.
        victims.sort_unstable_by(|a, b| b.cmp(a));
        victims
            .into_iter()
            .filter_map(|index| self.blocks.remove(index))
            .collect()
    }
}

impl<K: PartialEq> Stash<K> {
    /// Removes every block carrying `key`; returns how many were removed.
    pub fn remove_key(&mut self, key: &K) -> usize {
        let before = self.blocks.len();
        self.blocks.retain(|block| block.key != *key);
        before - self.blocks.len()
    }

    pub fn find_key_mut(&mut self, key: &K) -> Option<&mut Block<K>> {
        self.blocks.iter_mut().find(|block| block.key == *key)
    }
}
