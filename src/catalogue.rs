// SPDX-License-Identifier: MIT
//! The course catalogue: immutable metadata loaded once at startup, plus the
//! two mutable cells per course — the seat counter and the subscriber table.
//!
//! The seat counter is the authoritative in-memory capacity gate. Keeping it
//! here (instead of a hot DB row) lets a full course reject instantly without
//! a round-trip; the `choices` table remains the durable source of truth and
//! the counter is re-derived from it at startup.

use crate::storage::Storage;
use crate::usem::Usem;
use anyhow::{Context as _, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Course {
    pub id: i64,
    pub title: String,
    /// Exclusivity key: a user holds at most one course per group.
    pub group: String,
    /// Soft classification, counted per user but not capped.
    pub kind: String,
    pub max: u32,
    /// Allocated seats. Read lock-free; written only under `selected_lock`.
    selected: AtomicU32,
    /// Guards the admission check-and-increment. Held only across the
    /// in-memory compare, never across DB calls or I/O.
    selected_lock: Mutex<()>,
    /// userid → that session's coalescing signal for this course.
    pub subscribers: DashMap<String, Arc<Usem>>,
}

impl Course {
    fn new(id: i64, title: String, group: String, kind: String, max: u32, selected: u32) -> Self {
        Self {
            id,
            title,
            group,
            kind,
            max,
            selected: AtomicU32::new(selected),
            selected_lock: Mutex::new(()),
            subscribers: DashMap::new(),
        }
    }

    /// Current seat count. May be slightly fresher than the event a caller
    /// is reacting to; that is fine — the value is monotone-correct and
    /// clients only want the latest.
    pub fn selected(&self) -> u32 {
        self.selected.load(Ordering::Acquire)
    }

    /// The admission critical section: admit and increment iff a seat is
    /// free. Linearizes concurrent admits on this course.
    pub fn try_admit(&self) -> bool {
        let _guard = self.selected_lock.lock();
        let current = self.selected.load(Ordering::Acquire);
        if current < self.max {
            self.selected.store(current + 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Decrement the seat count (release or compensation path), clamping at
    /// zero. A decrement at zero means bookkeeping went wrong somewhere;
    /// it is loud but not fatal.
    pub fn force_decrement(&self) {
        let _guard = self.selected_lock.lock();
        let current = self.selected.load(Ordering::Acquire);
        if current == 0 {
            error!(course = self.id, "seat counter decrement at zero — count desynchronised");
            return;
        }
        self.selected.store(current - 1, Ordering::Release);
    }

    /// Fan the current count out: mark every subscriber's signal. Redundant
    /// marks coalesce inside the signal, so bursts cost one wake per pair.
    pub fn propagate(&self) {
        for entry in self.subscribers.iter() {
            entry.value().set();
        }
    }
}

pub struct Catalogue {
    courses: BTreeMap<i64, Arc<Course>>,
}

impl Catalogue {
    /// Read course rows and derive each seat counter by counting existing
    /// choices, re-establishing `selected == count(choices)` after a crash
    /// that died between an in-memory increment and its compensation.
    pub async fn load(storage: &Storage) -> Result<Self> {
        let rows = storage.list_courses().await.context("load courses")?;
        let counts: BTreeMap<i64, i64> = storage
            .choice_counts()
            .await
            .context("derive seat counts")?
            .into_iter()
            .collect();

        let mut courses = BTreeMap::new();
        for row in rows {
            let selected = counts.get(&row.id).copied().unwrap_or(0);
            if selected > row.max {
                warn!(
                    course = row.id,
                    selected,
                    max = row.max,
                    "course is over capacity — admissions will stay closed until seats free up"
                );
            }
            courses.insert(
                row.id,
                Arc::new(Course::new(
                    row.id,
                    row.title,
                    row.grp,
                    row.kind,
                    row.max as u32,
                    selected as u32,
                )),
            );
        }
        info!(courses = courses.len(), "catalogue loaded");
        Ok(Self { courses })
    }

    pub fn lookup(&self, id: i64) -> Option<&Arc<Course>> {
        self.courses.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Course>> {
        self.courses.values()
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(max: u32, selected: u32) -> Course {
        Course::new(7, "Pottery".into(), "x".into(), "art".into(), max, selected)
    }

    #[test]
    fn admits_until_full() {
        let c = course(2, 0);
        assert!(c.try_admit());
        assert!(c.try_admit());
        assert!(!c.try_admit());
        assert_eq!(c.selected(), 2);
    }

    #[test]
    fn concurrent_admits_never_exceed_capacity() {
        let c = Arc::new(course(10, 0));
        let mut handles = Vec::new();
        let admitted = Arc::new(AtomicU32::new(0));
        for _ in 0..32 {
            let c = c.clone();
            let admitted = admitted.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    if c.try_admit() {
                        admitted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 10);
        assert_eq!(c.selected(), 10);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let c = course(3, 1);
        c.force_decrement();
        assert_eq!(c.selected(), 0);
        c.force_decrement();
        assert_eq!(c.selected(), 0);
    }

    #[test]
    fn release_reopens_a_full_course() {
        let c = course(1, 1);
        assert!(!c.try_admit());
        c.force_decrement();
        assert!(c.try_admit());
    }

    #[tokio::test]
    async fn propagate_marks_every_subscriber() {
        let c = course(5, 0);
        let a = Arc::new(Usem::new());
        let b = Arc::new(Usem::new());
        c.subscribers.insert("alice".into(), a.clone());
        c.subscribers.insert("bob".into(), b.clone());

        c.propagate();
        tokio::time::timeout(std::time::Duration::from_secs(1), a.wait())
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), b.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn load_derives_counts_from_choices() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("cat.db");
        let storage = Storage::new(db.to_str().unwrap()).await.unwrap();
        storage.insert_course(1, "A", "g1", "t", 5).await.unwrap();
        storage.insert_course(2, "B", "g2", "t", 5).await.unwrap();
        for user in ["u1", "u2"] {
            let mut tx = storage.begin().await.unwrap();
            Storage::insert_choice(&mut tx, user, 1, 0).await.unwrap();
            tx.commit().await.unwrap();
        }

        let cat = Catalogue::load(&storage).await.unwrap();
        assert_eq!(cat.len(), 2);
        assert_eq!(cat.lookup(1).unwrap().selected(), 2);
        assert_eq!(cat.lookup(2).unwrap().selected(), 0);
        assert!(cat.lookup(99).is_none());
    }
}
