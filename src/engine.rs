// SPDX-License-Identifier: MIT
//! The selection engine: admission control, transactional commit, and
//! compensation on failure.
//!
//! Capacity lives in memory (the per-course counter) while the `choices`
//! table stays the durable record. The DB's unique constraint only stops
//! duplicate (user, course) pairs; the per-course lock decides capacity, so
//! a full course rejects instantly and contention stays proportional to a
//! course's popularity rather than global load.

use crate::catalogue::Course;
use crate::modes::Mode;
use crate::protocol::{self, Message};
use crate::storage::{InsertChoice, Storage};
use crate::AppContext;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-session bookkeeping. Mutated only from the session's own select
/// loop — handlers run serially within a session, so no lock is needed.
pub struct SessionState {
    pub user_id: String,
    /// group → course held in that group. Mapping to the course id (not a
    /// bare set) lets a re-affirmed `Y` for the held course fall through to
    /// the idempotent path instead of reading as a group conflict.
    pub groups: HashMap<String, i64>,
    /// Course-type counters. Maintained for every hold and release; no cap
    /// is enforced on them.
    pub kinds: HashMap<String, u32>,
}

impl SessionState {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            groups: HashMap::new(),
            kinds: HashMap::new(),
        }
    }

    pub fn hold(&mut self, group: &str, kind: &str, course_id: i64) {
        self.groups.insert(group.to_string(), course_id);
        *self.kinds.entry(kind.to_string()).or_insert(0) += 1;
    }

    /// Returns false if the group was not held by this course — the
    /// caller's bookkeeping has diverged from the catalogue.
    fn release(&mut self, group: &str, kind: &str, course_id: i64) -> bool {
        if self.groups.get(group) != Some(&course_id) {
            return false;
        }
        self.groups.remove(group);
        if let Some(count) = self.kinds.get_mut(kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.kinds.remove(kind);
            }
        }
        true
    }
}

/// Faults that end the session. Everything recoverable becomes a protocol
/// reply instead.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("database error: {0}")]
    Db(anyhow::Error),
    #[error("inconsistent session state: {0}")]
    Inconsistent(String),
}

impl From<sqlx::Error> for SessionFault {
    fn from(e: sqlx::Error) -> Self {
        SessionFault::Db(e.into())
    }
}

impl From<anyhow::Error> for SessionFault {
    fn from(e: anyhow::Error) -> Self {
        SessionFault::Db(e)
    }
}

impl SessionFault {
    /// The `E :<reason>` trailing sent before the session closes.
    pub fn wire_reason(&self) -> &'static str {
        match self {
            SessionFault::Db(_) => "Database error",
            SessionFault::Inconsistent(_) => "Inconsistent session state",
        }
    }
}

const NOT_OPEN: &str = "Course selections are not open";

/// Compensation primitive: back out an in-memory admission and tell
/// subscribers. Used when the durable commit fails after the counter
/// already moved.
pub fn decrement_and_propagate(course: &Course) {
    course.force_decrement();
    course.propagate();
}

/// Handle `Y <courseid>`: try to hold a seat.
pub async fn choose(
    ctx: &AppContext,
    state: &mut SessionState,
    course_id: i64,
) -> Result<Vec<Message>, SessionFault> {
    if ctx.modes.current() != Mode::Open {
        return Ok(vec![protocol::error(NOT_OPEN)]);
    }
    let Some(course) = ctx.catalogue.lookup(course_id) else {
        return Ok(vec![protocol::rejected(course_id, "No such course")]);
    };
    // Holding another course in this group is a conflict; holding this
    // course is a re-affirmation and falls through to the idempotent path.
    if let Some(&holder) = state.groups.get(&course.group) {
        if holder != course_id {
            return Ok(vec![protocol::rejected(course_id, "Group conflict")]);
        }
    }

    let mut tx = ctx.storage.begin().await?;
    let seltime = chrono::Utc::now().timestamp_micros();
    match Storage::insert_choice(&mut tx, &state.user_id, course_id, seltime).await {
        Ok(InsertChoice::Inserted) => {}
        Ok(InsertChoice::Duplicate) => {
            // The seat is already held; re-confirm without touching the
            // counter.
            let _ = tx.rollback().await;
            return Ok(vec![protocol::confirmed(course_id)]);
        }
        Err(e) => {
            let _ = tx.rollback().await;
            return Err(e.into());
        }
    }

    if course.try_admit() {
        if let Err(e) = tx.commit().await {
            // The in-memory count ran ahead of the database; back it out
            // before surfacing the fault.
            warn!(course = course_id, err = %e, "commit failed — compensating seat counter");
            decrement_and_propagate(course);
            return Err(e.into());
        }
        state.hold(&course.group, &course.kind, course_id);
        course.propagate();
        debug!(user = %state.user_id, course = course_id, "seat held");

        let mut replies = vec![protocol::confirmed(course_id)];
        if ctx.config.perf.propagate_immediate {
            replies.push(protocol::seat_count(course_id, course.selected()));
        }
        Ok(replies)
    } else {
        let _ = tx.rollback().await;
        Ok(vec![protocol::rejected(course_id, "Full")])
    }
}

/// Handle `N <courseid>`: release a held seat. Releasing a course the user
/// does not hold — an unknown id included — is a no-op that still
/// replies `N`.
pub async fn unchoose(
    ctx: &AppContext,
    state: &mut SessionState,
    course_id: i64,
) -> Result<Vec<Message>, SessionFault> {
    if ctx.modes.current() != Mode::Open {
        return Ok(vec![protocol::error(NOT_OPEN)]);
    }

    let removed = ctx.storage.delete_choice(&state.user_id, course_id).await?;

    if removed > 0 {
        // Course attributes are only needed once a row is known to have
        // existed; a durable choice for a course the catalogue does not
        // know is a divergence we cannot book-keep past.
        let Some(course) = ctx.catalogue.lookup(course_id) else {
            return Err(SessionFault::Inconsistent(format!(
                "released course {course_id} that is not in the catalogue"
            )));
        };
        course.force_decrement();
        course.propagate();
        if !state.release(&course.group, &course.kind, course_id) {
            // A durable hold existed that this session never accounted for;
            // its view of the world cannot be trusted any further.
            return Err(SessionFault::Inconsistent(format!(
                "released course {course_id} whose group {:?} was not held",
                course.group
            )));
        }
        debug!(user = %state.user_id, course = course_id, "seat released");
    }
    Ok(vec![protocol::released(course_id)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::FrameBroadcaster;
    use crate::catalogue::Catalogue;
    use crate::config::ServerConfig;
    use crate::modes::ModeController;
    use crate::registry::SessionRegistry;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    async fn test_ctx(courses: &[(i64, &str, &str, i64)]) -> (Arc<AppContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("engine.db");
        let storage = Arc::new(Storage::new(db.to_str().unwrap()).await.unwrap());
        for (id, group, kind, max) in courses {
            storage
                .insert_course(*id, &format!("Course {id}"), group, kind, *max)
                .await
                .unwrap();
        }
        let catalogue = Arc::new(Catalogue::load(&storage).await.unwrap());
        let broadcaster = Arc::new(FrameBroadcaster::new());
        let modes = Arc::new(
            ModeController::load(storage.clone(), broadcaster.clone())
                .await
                .unwrap(),
        );
        let registry = Arc::new(SessionRegistry::new());
        modes.set(&registry, Mode::Open).await.unwrap();

        let ctx = Arc::new(AppContext {
            config: Arc::new(ServerConfig::default()),
            storage,
            catalogue,
            registry,
            modes,
            broadcaster,
            usem_count: AtomicU64::new(0),
            started_at: std::time::Instant::now(),
        });
        (ctx, dir)
    }

    fn encoded(replies: &[Message]) -> Vec<String> {
        replies.iter().map(Message::encode).collect()
    }

    #[tokio::test]
    async fn choose_holds_a_seat() {
        let (ctx, _dir) = test_ctx(&[(7, "x", "sport", 1)]).await;
        let mut state = SessionState::new("alice");
        let replies = choose(&ctx, &mut state, 7).await.unwrap();
        assert_eq!(encoded(&replies), ["Y 7"]);
        assert_eq!(ctx.catalogue.lookup(7).unwrap().selected(), 1);
        assert_eq!(state.groups.get("x"), Some(&7));
        assert_eq!(state.kinds.get("sport"), Some(&1));
        assert_eq!(ctx.storage.choice_counts().await.unwrap(), vec![(7, 1)]);
    }

    #[tokio::test]
    async fn full_course_rejects_and_rolls_back() {
        let (ctx, _dir) = test_ctx(&[(7, "x", "t", 1), (8, "y", "t", 1)]).await;
        let mut alice = SessionState::new("alice");
        let mut bob = SessionState::new("bob");
        choose(&ctx, &mut alice, 7).await.unwrap();
        let replies = choose(&ctx, &mut bob, 7).await.unwrap();
        assert_eq!(encoded(&replies), ["R 7 :Full"]);
        assert_eq!(ctx.catalogue.lookup(7).unwrap().selected(), 1);
        // Only alice's row survives.
        assert_eq!(ctx.storage.choice_counts().await.unwrap(), vec![(7, 1)]);
        assert!(bob.groups.is_empty());
    }

    #[tokio::test]
    async fn group_conflict_is_rejected_before_the_db() {
        let (ctx, _dir) = test_ctx(&[(3, "x", "t", 5), (4, "x", "t", 5)]).await;
        let mut state = SessionState::new("alice");
        choose(&ctx, &mut state, 3).await.unwrap();
        let replies = choose(&ctx, &mut state, 4).await.unwrap();
        assert_eq!(encoded(&replies), ["R 4 :Group conflict"]);
        assert_eq!(ctx.catalogue.lookup(4).unwrap().selected(), 0);
    }

    #[tokio::test]
    async fn repeated_choose_is_idempotent() {
        let (ctx, _dir) = test_ctx(&[(5, "x", "t", 3)]).await;
        let mut state = SessionState::new("alice");
        choose(&ctx, &mut state, 5).await.unwrap();

        // Same session re-affirms: the unique constraint fires, not the
        // group-conflict check.
        let replies = choose(&ctx, &mut state, 5).await.unwrap();
        assert_eq!(encoded(&replies), ["Y 5"]);
        assert_eq!(ctx.catalogue.lookup(5).unwrap().selected(), 1);

        // A reconnected session (fresh state) re-affirms the same way.
        let mut fresh = SessionState::new("alice");
        let replies = choose(&ctx, &mut fresh, 5).await.unwrap();
        assert_eq!(encoded(&replies), ["Y 5"]);
        assert_eq!(ctx.catalogue.lookup(5).unwrap().selected(), 1);
    }

    #[tokio::test]
    async fn choose_rejects_an_unknown_course() {
        let (ctx, _dir) = test_ctx(&[(1, "x", "t", 1)]).await;
        let mut state = SessionState::new("alice");
        let replies = choose(&ctx, &mut state, 99).await.unwrap();
        assert_eq!(encoded(&replies), ["R 99 :No such course"]);
    }

    #[tokio::test]
    async fn unchoose_of_an_unknown_course_is_idempotent() {
        let (ctx, _dir) = test_ctx(&[(1, "x", "t", 1)]).await;
        let mut state = SessionState::new("alice");
        let replies = unchoose(&ctx, &mut state, 99).await.unwrap();
        assert_eq!(encoded(&replies), ["N 99"]);
        assert!(ctx.storage.choice_counts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_and_rejoin_restores_the_count() {
        let (ctx, _dir) = test_ctx(&[(2, "x", "t", 4)]).await;
        let mut state = SessionState::new("alice");
        assert_eq!(encoded(&choose(&ctx, &mut state, 2).await.unwrap()), ["Y 2"]);
        assert_eq!(
            encoded(&unchoose(&ctx, &mut state, 2).await.unwrap()),
            ["N 2"]
        );
        assert_eq!(ctx.catalogue.lookup(2).unwrap().selected(), 0);
        assert!(state.groups.is_empty());
        assert!(state.kinds.is_empty());
        assert_eq!(encoded(&choose(&ctx, &mut state, 2).await.unwrap()), ["Y 2"]);
        assert_eq!(ctx.catalogue.lookup(2).unwrap().selected(), 1);
    }

    #[tokio::test]
    async fn release_of_unheld_course_is_idempotent() {
        let (ctx, _dir) = test_ctx(&[(2, "x", "t", 4)]).await;
        let mut state = SessionState::new("alice");
        let replies = unchoose(&ctx, &mut state, 2).await.unwrap();
        assert_eq!(encoded(&replies), ["N 2"]);
        assert_eq!(ctx.catalogue.lookup(2).unwrap().selected(), 0);
    }

    #[tokio::test]
    async fn closed_and_frozen_modes_gate_both_verbs() {
        let (ctx, _dir) = test_ctx(&[(1, "x", "t", 1)]).await;
        let mut state = SessionState::new("alice");
        for mode in [Mode::Closed, Mode::Frozen] {
            ctx.modes.set(&ctx.registry, mode).await.unwrap();
            for replies in [
                choose(&ctx, &mut state, 1).await.unwrap(),
                unchoose(&ctx, &mut state, 1).await.unwrap(),
            ] {
                assert_eq!(encoded(&replies), ["E :Course selections are not open"]);
            }
            assert_eq!(ctx.catalogue.lookup(1).unwrap().selected(), 0);
            assert!(ctx.storage.choice_counts().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn propagate_immediate_appends_the_seat_count() {
        let (ctx, _dir) = test_ctx(&[(6, "x", "t", 2)]).await;
        let mut config = ServerConfig::default();
        config.perf.propagate_immediate = true;
        let ctx = Arc::new(AppContext {
            config: Arc::new(config),
            storage: ctx.storage.clone(),
            catalogue: ctx.catalogue.clone(),
            registry: ctx.registry.clone(),
            modes: ctx.modes.clone(),
            broadcaster: ctx.broadcaster.clone(),
            usem_count: AtomicU64::new(0),
            started_at: std::time::Instant::now(),
        });
        let mut state = SessionState::new("alice");
        let replies = choose(&ctx, &mut state, 6).await.unwrap();
        assert_eq!(encoded(&replies), ["Y 6", "M 6 1"]);
    }

    #[tokio::test]
    async fn choose_signals_subscribers() {
        let (ctx, _dir) = test_ctx(&[(9, "x", "t", 2)]).await;
        let usem = Arc::new(crate::usem::Usem::new());
        ctx.catalogue
            .lookup(9)
            .unwrap()
            .subscribers
            .insert("watcher".into(), usem.clone());

        let mut state = SessionState::new("alice");
        choose(&ctx, &mut state, 9).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), usem.wait())
            .await
            .expect("subscriber signalled after a successful Y");
    }

    #[tokio::test]
    async fn unaccounted_release_is_a_terminal_fault() {
        let (ctx, _dir) = test_ctx(&[(3, "x", "t", 5)]).await;
        // A durable hold exists that this session's state never saw.
        let mut tx = ctx.storage.begin().await.unwrap();
        Storage::insert_choice(&mut tx, "alice", 3, 0).await.unwrap();
        tx.commit().await.unwrap();
        ctx.catalogue.lookup(3).unwrap().try_admit();

        let mut state = SessionState::new("alice");
        let fault = unchoose(&ctx, &mut state, 3).await.unwrap_err();
        assert!(matches!(fault, SessionFault::Inconsistent(_)));
        assert_eq!(fault.wire_reason(), "Inconsistent session state");
    }
}
