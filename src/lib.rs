// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious forwarding-plane data structures for Named Data Networking routers.
//!
//! This crate replaces the three NDN forwarding tables (the FIB, the PIT,
//! and the Content Store) with structures whose memory traces leak nothing
//! about which entries are read, written, or removed:
//!
//! - [`ObliviousMap`]: keyed insert/lookup (FIB and PIT),
//! - [`ObliviousQueue`]: FIFO push/pop (Content Store).
//!
//! Both are built on a shared Path ORAM substrate: a complete binary tree of
//! fixed-capacity buckets holding AES-256-GCM-encrypted blocks, a client-side
//! position map, and a stash of blocks awaiting placement. Every operation
//! reads one root-to-leaf path and writes it back, so hits, misses, inserts,
//! and removals are externally indistinguishable. A background evictor task
//! keeps the stash bounded while the structure is idle.
//!
//! All state is volatile; nothing is persisted. Under sustained overload the
//! engine degrades explicitly rather than failing: it remaps stuck blocks,
//! sheds the least useful ones (counted, never silent), and finally grows the
//! stash limit. See [`ObliviousMap::is_emergency_mode_enabled`] for the
//! leakage caveat attached to that degradation.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::time::Duration;
use thiserror::Error;

pub mod crypto;
mod evictor;
mod map;
mod path_oram;
mod queue;

pub use map::ObliviousMap;
pub use queue::ObliviousQueue;

/// Trees taller than this are rejected: the bucket array is allocated eagerly.
pub const MAX_TREE_HEIGHT: u32 = 24;

/// Errors surfaced by the oblivious structures.
///
/// Every variant is fatal to the operation that produced it; nothing is
/// silently retried. Emergency-mode block drops are *not* errors; they are
/// counted in [`OramStats::dropped_blocks`].
#[derive(Debug, Error)]
pub enum OramError {
    /// AEAD failure: tag mismatch, truncated or malformed ciphertext.
    #[error("authenticated encryption failure: {0}")]
    Crypto(&'static str),

    /// The OS-backed CSPRNG failed.
    #[error("system randomness unavailable: {0}")]
    Rng(String),

    /// A payload could not be encoded or decoded.
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// The stash exceeded its limit after all eviction and emergency measures.
    #[error("stash overflow: {occupancy} blocks exceeds limit {limit}")]
    StashOverflow {
        /// Number of blocks in the stash when the overflow was detected.
        occupancy: usize,
        /// The configured (possibly grown) stash limit.
        limit: usize,
    },

    /// A construction parameter was out of range.
    #[error("invalid configuration: {parameter_name} = {parameter_value}")]
    InvalidConfiguration {
        /// Name of the offending parameter.
        parameter_name: &'static str,
        /// The rejected value.
        parameter_value: String,
    },
}

/// Construction parameters for an oblivious structure.
#[derive(Clone, Debug)]
pub struct OramConfig {
    /// Height of the bucket tree; `2^tree_height` leaves. Must be in
    /// `1..=MAX_TREE_HEIGHT` (a height-0, single-bucket tree is rejected).
    pub tree_height: u32,
    /// Blocks per bucket (the parameter `Z` from the Path ORAM literature).
    pub bucket_capacity: usize,
    /// Soft limit on stash occupancy; exceeding it after all measures is a
    /// fatal [`OramError::StashOverflow`].
    pub stash_limit: usize,
    /// Wake period of the background evictor.
    pub evictor_interval: Duration,
    /// Whether the engine may degrade (remap, shed, grow) instead of failing
    /// when the stash approaches its limit.
    pub emergency_mode: bool,
}

impl OramConfig {
    /// Defaults for map-shaped workloads (FIB, PIT).
    pub fn for_map() -> Self {
        Self {
            tree_height: 5,
            bucket_capacity: 4,
            stash_limit: 100,
            evictor_interval: Duration::from_millis(7),
            emergency_mode: true,
        }
    }

    /// Defaults for queue-shaped workloads (Content Store).
    pub fn for_queue() -> Self {
        Self {
            tree_height: 4,
            bucket_capacity: 8,
            stash_limit: 100,
            evictor_interval: Duration::from_millis(7),
            emergency_mode: true,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), OramError> {
        if self.tree_height < 1 || self.tree_height > MAX_TREE_HEIGHT {
            return Err(OramError::InvalidConfiguration {
                parameter_name: "tree_height",
                parameter_value: self.tree_height.to_string(),
            });
        }
        if self.bucket_capacity < 1 {
            return Err(OramError::InvalidConfiguration {
                parameter_name: "bucket_capacity",
                parameter_value: self.bucket_capacity.to_string(),
            });
        }
        if self.stash_limit < 1 {
            return Err(OramError::InvalidConfiguration {
                parameter_name: "stash_limit",
                parameter_value: self.stash_limit.to_string(),
            });
        }
        Ok(())
    }
}

/// A snapshot of an oblivious structure's internal counters.
///
/// `dropped_blocks` is the caller-visible record of emergency shedding; it
/// stays zero under nominal workloads. `path_reads` counts one per public
/// operation, including dummy accesses for misses and empty pops.
#[derive(Clone, Copy, Debug, Default)]
pub struct OramStats {
    /// Root-to-leaf path reads performed.
    pub path_reads: u64,
    /// Full-tree eviction passes (manual, watermark-driven, and background).
    pub full_evictions: u64,
    /// Times the engine entered emergency mode.
    pub emergency_entries: u64,
    /// Blocks dropped by emergency shedding.
    pub dropped_blocks: u64,
    /// Times the stash limit was grown by 20%.
    pub limit_growths: u64,
    /// Highest stash occupancy observed.
    pub stash_peak: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_flat_tree() {
        let config = OramConfig {
            tree_height: 0,
            ..OramConfig::for_map()
        };
        assert!(matches!(
            config.validate(),
            Err(OramError::InvalidConfiguration {
                parameter_name: "tree_height",
                ..
            })
        ));
    }

    #[test]
    fn config_rejects_oversized_tree() {
        let config = OramConfig {
            tree_height: MAX_TREE_HEIGHT + 1,
            ..OramConfig::for_map()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_rejects_degenerate_buckets_and_stash() {
        let config = OramConfig {
            bucket_capacity: 0,
            ..OramConfig::for_map()
        };
        assert!(config.validate().is_err());

        let config = OramConfig {
            stash_limit: 0,
            ..OramConfig::for_queue()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_configs_validate() {
        assert!(OramConfig::for_map().validate().is_ok());
        assert!(OramConfig::for_queue().validate().is_ok());
    }
}
