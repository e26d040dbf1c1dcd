// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A background thread that drains the stash while the structure is idle.
//!
//! Each oblivious structure spawns one evictor at construction. The thread
//! wakes on a short period, takes the structure's lock, and if occupancy sits
//! above the high watermark runs a single full-eviction pass before releasing
//! the lock, so application operations are only ever briefly delayed. The
//! state machine escalates to a critical mode (harder eviction plus remapping
//! of stuck blocks) when occupancy stops shrinking, and settles back to idle
//! once occupancy falls to the mid watermark.
//!
//! Dropping the owning structure sets the stop flag and joins the thread; no
//! operations are issued after that point.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{sleep, Builder as ThreadBuilder, JoinHandle},
    time::Duration,
};

use crate::path_oram::Watermarks;

/// Rounds without stash shrinkage before escalating to critical eviction.
const STAGNANT_ROUNDS_BEFORE_CRITICAL: u32 = 3;

/// The slice of an oblivious structure the evictor is allowed to touch.
pub(crate) trait EvictTarget: Send {
    fn stash_occupancy(&self) -> usize;
    fn watermarks(&self) -> Watermarks;
    /// One full-eviction pass; `critical` additionally remaps stuck blocks.
    fn maintenance_evict(&mut self, critical: bool);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EvictorState {
    Idle,
    EvictingLight,
    EvictingCritical,
}

pub(crate) struct BackgroundEvictor {
    join_handle: Option<JoinHandle<()>>,
    stop_requested: Arc<AtomicBool>,
}

impl BackgroundEvictor {
    pub fn spawn<T: EvictTarget + 'static>(target: Arc<Mutex<T>>, interval: Duration) -> Self {
        let stop_requested = Arc::new(AtomicBool::new(false));
        let thread_stop_requested = stop_requested.clone();
        let join_handle = Some(
            ThreadBuilder::new()
                .name("oram-evictor".to_owned())
                .spawn(move || run(target, thread_stop_requested, interval))
                .expect("could not spawn evictor thread"),
        );
        Self {
            join_handle,
            stop_requested,
        }
    }

    /// Signals the thread to stop and joins it.
    pub fn stop(&mut self) {
        if let Some(join_handle) = self.join_handle.take() {
            self.stop_requested.store(true, Ordering::SeqCst);
            let _ = join_handle.join();
        }
    }
}

impl Drop for BackgroundEvictor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<T: EvictTarget>(target: Arc<Mutex<T>>, stop_requested: Arc<AtomicBool>, interval: Duration) {
    let mut state = EvictorState::Idle;
    let mut stagnant_rounds = 0u32;
    let mut last_occupancy = 0usize;

    while !stop_requested.load(Ordering::SeqCst) {
        sleep(interval);
        if stop_requested.load(Ordering::SeqCst) {
            break;
        }
        let Ok(mut guard) = target.lock() else {
            break;
        };
        let occupancy = guard.stash_occupancy();
        let marks = guard.watermarks();

        state = match state {
            EvictorState::Idle => {
                if occupancy > marks.high {
                    guard.maintenance_evict(false);
                    stagnant_rounds = 0;
                    last_occupancy = guard.stash_occupancy();
                    EvictorState::EvictingLight
                } else {
                    EvictorState::Idle
                }
            }
            EvictorState::EvictingLight => {
                guard.maintenance_evict(false);
                let now = guard.stash_occupancy();
                if now <= marks.mid {
                    EvictorState::Idle
                } else {
                    if now >= last_occupancy {
                        stagnant_rounds += 1;
                    } else {
                        stagnant_rounds = 0;
                    }
                    last_occupancy = now;
                    if stagnant_rounds >= STAGNANT_ROUNDS_BEFORE_CRITICAL {
                        log::debug!("evictor escalating to critical after {stagnant_rounds} stagnant rounds");
                        EvictorState::EvictingCritical
                    } else {
                        EvictorState::EvictingLight
                    }
                }
            }
            EvictorState::EvictingCritical => {
                guard.maintenance_evict(true);
                if guard.stash_occupancy() <= marks.mid {
                    stagnant_rounds = 0;
                    EvictorState::Idle
                } else {
                    EvictorState::EvictingCritical
                }
            }
        };
    }
}
