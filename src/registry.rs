// SPDX-License-Identifier: MIT
//! Session registry: userid → the live session's cancellation handle.
//!
//! At most one session per user. A new session preempts the old one by
//! cancelling its handle and waiting (bounded) for the old session to
//! observe cancellation before installing its own — installs are
//! join-capable, so a client reconnecting cannot race its own teardown.

use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `install` waits for a preempted session to exit before giving
/// up and replacing its handle anyway. Bounds registry stalls if a session
/// task dies without firing its exit token.
const PREEMPT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Fired to ask the session to stop (preemption, mode → closed).
    pub cancel: CancellationToken,
    /// Fired by the session when it has fully torn down. The session holds
    /// a drop guard on this token, so it fires even on a panicked task.
    pub exited: CancellationToken,
    epoch: u64,
}

impl SessionHandle {
    /// Registry epoch, used by `compare_and_delete` so a session never
    /// removes a successor's handle.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    handles: DashMap<String, SessionHandle>,
    next_epoch: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh handle for `user`, preempting any prior session.
    ///
    /// The prior session is cancelled and its exit awaited (bounded by
    /// `PREEMPT_WAIT`) before the new handle goes in, so the caller can
    /// assume the old session has released its subscriber-table entries.
    pub async fn install(&self, user: &str) -> SessionHandle {
        loop {
            if let Some(prior) = self.handles.get(user).map(|e| e.value().clone()) {
                debug!(user, "preempting prior session");
                prior.cancel.cancel();
                if tokio::time::timeout(PREEMPT_WAIT, prior.exited.cancelled())
                    .await
                    .is_err()
                {
                    warn!(user, "preempted session did not exit in time — replacing handle");
                }
                // Remove the stale entry only if it is still the one we
                // cancelled; a concurrent install may have won already.
                self.handles
                    .remove_if(user, |_, v| v.epoch == prior.epoch);
            }

            let handle = SessionHandle {
                cancel: CancellationToken::new(),
                exited: CancellationToken::new(),
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1,
            };
            match self.handles.entry(user.to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(handle.clone());
                    return handle;
                }
                // Another install slipped in between removal and insert;
                // let the loop preempt it — latest connection wins.
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Remove `user`'s entry iff it still holds the caller's handle.
    pub fn compare_and_delete(&self, user: &str, epoch: u64) {
        self.handles.remove_if(user, |_, v| v.epoch == epoch);
    }

    /// Fire every live handle (mode → closed). Entries are removed by each
    /// session's own teardown, not here.
    pub fn cancel_all(&self) {
        for entry in self.handles.iter() {
            entry.value().cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
