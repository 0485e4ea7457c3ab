// SPDX-License-Identifier: MIT
//! SQLite persistence layer.
//!
//! Four tables: `courses` (the catalogue), `choices` (durable seat holds),
//! `sessions` (auth cookies), and `misc` (the mode row). Every transaction
//! is short — a single insert or delete plus commit — and no lock is ever
//! held across a call into this module.

use anyhow::{Context as _, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Sqlite, Transaction,
};
use std::str::FromStr;

/// Key of the `misc` row holding the global mode.
const STATE_KEY: &str = "state";

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CourseRow {
    pub id: i64,
    pub title: String,
    /// Exclusivity key: a user holds at most one course per group.
    pub grp: String,
    /// Soft classification, counted per user but not capped.
    pub kind: String,
    pub max: i64,
}

/// A user's existing choice joined with the catalogue attributes the
/// session bookkeeping needs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserChoiceRow {
    pub courseid: i64,
    pub grp: String,
    pub kind: String,
}

/// Outcome of a choice insert inside the admission transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertChoice {
    Inserted,
    /// Unique violation on (userid, courseid) — the seat is already held.
    Duplicate,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the database at `conn` and run migrations.
    ///
    /// `conn` is either a plain path or a `sqlite:` URL.
    pub async fn new(conn: &str) -> Result<Self> {
        let url = if conn.starts_with("sqlite:") {
            conn.to_string()
        } else {
            format!("sqlite://{conn}?mode=rwc")
        };
        let opts = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("parse db conn string {conn:?}"))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .context("open sqlite database")?;
        Self::migrate(&pool).await.context("run migrations")?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Catalogue ──────────────────────────────────────────────────────────

    pub async fn list_courses(&self) -> Result<Vec<CourseRow>> {
        Ok(sqlx::query_as(
            "SELECT id, title, \"group\" AS grp, \"type\" AS kind, max FROM courses ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// (courseid, held seats) for every course with at least one choice.
    pub async fn choice_counts(&self) -> Result<Vec<(i64, i64)>> {
        Ok(
            sqlx::query_as("SELECT courseid, COUNT(*) FROM choices GROUP BY courseid")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Used by operator tooling and tests to seed the catalogue.
    pub async fn insert_course(
        &self,
        id: i64,
        title: &str,
        group: &str,
        kind: &str,
        max: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO courses (id, title, \"group\", \"type\", max) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(title)
        .bind(group)
        .bind(kind)
        .bind(max)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Choices ────────────────────────────────────────────────────────────

    pub async fn user_choices(&self, userid: &str) -> Result<Vec<UserChoiceRow>> {
        Ok(sqlx::query_as(
            "SELECT c.courseid, k.\"group\" AS grp, k.\"type\" AS kind
             FROM choices c JOIN courses k ON k.id = c.courseid
             WHERE c.userid = ? ORDER BY c.seltime",
        )
        .bind(userid)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Insert a choice row inside an open transaction. A unique violation on
    /// (userid, courseid) is not an error — it means the seat is already held.
    pub async fn insert_choice(
        tx: &mut Transaction<'static, Sqlite>,
        userid: &str,
        courseid: i64,
        seltime_micros: i64,
    ) -> Result<InsertChoice, sqlx::Error> {
        let res = sqlx::query("INSERT INTO choices (userid, courseid, seltime) VALUES (?, ?, ?)")
            .bind(userid)
            .bind(courseid)
            .bind(seltime_micros)
            .execute(&mut **tx)
            .await;
        match res {
            Ok(_) => Ok(InsertChoice::Inserted),
            Err(sqlx::Error::Database(db))
                if db.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Ok(InsertChoice::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a choice; returns how many rows went away (0 or 1).
    pub async fn delete_choice(&self, userid: &str, courseid: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM choices WHERE userid = ? AND courseid = ?")
            .bind(userid)
            .bind(courseid)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // ─── Mode ───────────────────────────────────────────────────────────────

    pub async fn load_mode(&self) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM misc WHERE key = ?")
            .bind(STATE_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn store_mode(&self, value: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO misc (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(STATE_KEY)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ─── Auth sessions ──────────────────────────────────────────────────────

    /// Resolve a session cookie to a userid, honouring expiry.
    pub async fn userid_for_cookie(&self, cookie: &str, now_secs: i64) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT userid FROM sessions WHERE cookie = ? AND (expr IS NULL OR expr > ?)",
        )
        .bind(cookie)
        .bind(now_secs)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(u,)| u))
    }

    pub async fn insert_auth_session(
        &self,
        cookie: &str,
        userid: &str,
        expr_secs: i64,
    ) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO sessions (cookie, userid, expr) VALUES (?, ?, ?)")
            .bind(cookie)
            .bind(userid)
            .bind(expr_secs)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn prune_expired_sessions(&self, now_secs: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sessions WHERE expr IS NOT NULL AND expr <= ?")
            .bind(now_secs)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}
