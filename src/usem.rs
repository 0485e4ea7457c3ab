// SPDX-License-Identifier: MIT
//! Coalescing update signal ("usem").
//!
//! A single-slot, edge-triggered signal: `set` idempotently marks the slot
//! without blocking, `wait` clears it and returns. Any number of `set`s
//! between two `wait`s collapse to a single wake. One signal exists per
//! (subscriber, course) pair; the update notifier uses them to fan seat
//! count changes out without amplifying bursts.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Usem {
    pending: AtomicBool,
    notify: Notify,
}

impl Usem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the slot. Never blocks; redundant sets are absorbed.
    pub fn set(&self) {
        if !self.pending.swap(true, Ordering::AcqRel) {
            self.notify.notify_one();
        }
    }

    /// Wait until the slot is marked, then clear it.
    ///
    /// A `set` that happened before the first `wait` is not lost: the flag
    /// is checked after registering interest, so the set/check interleaving
    /// cannot drop a wake.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }
}
