//! Persisted-store contracts consumed by the pipeline
//!
//! The dedup middleware tracks content fingerprints and the budget
//! middleware tracks per-period spend through these traits. Every
//! persisted record carries the request's project tag (from
//! `X-Tokenman-Project`, default "default"). The SQLite implementation
//! is the production backing; the in-memory one backs tests and
//! ephemeral runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A fingerprint row as seen by the dedup middleware.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub hit_count: i64,
    pub last_seen: DateTime<Utc>,
}

/// Tracks SHA-256 fingerprints of static request content.
pub trait FingerprintStore: Send + Sync {
    /// Insert the hash or bump its hit count and last-seen time. The
    /// project tag records who last touched the content.
    fn upsert_fingerprint(
        &self,
        hash: &str,
        content_type: &str,
        token_count: i64,
        project: &str,
    ) -> StoreResult<()>;

    /// Fetch a fingerprint; `None` when the hash has never been seen.
    fn get_fingerprint(&self, hash: &str) -> StoreResult<Option<Fingerprint>>;
}

/// Tracks per-period spend against configured limits.
pub trait BudgetStore: Send + Sync {
    /// Returns (amount spent, configured limit) for the period bucket,
    /// aggregated across all projects: the caps are global.
    fn get_budget(&self, period: &str, period_start: &str) -> StoreResult<(f64, f64)>;

    /// Add spending to the period bucket under the given project tag,
    /// recording the limit alongside.
    fn add_spending(
        &self,
        period: &str,
        period_start: &str,
        amount: f64,
        limit: f64,
        project: &str,
    ) -> StoreResult<()>;
}

/// Optional audit sink for PII detections.
pub trait PiiLogger: Send + Sync {
    fn log_pii(
        &self,
        request_id: &str,
        pii_type: &str,
        action: &str,
        field_path: &str,
        context: &str,
        project: &str,
    );
}

// ============================================================================
// SQLite implementation
// ============================================================================

pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> StoreResult<Self> {
        let store = SqliteStore { path };
        let conn = store.conn()?;
        conn.execute(
            "create table if not exists fingerprints (
                hash text primary key,
                content_type text not null,
                token_count integer not null,
                hit_count integer not null,
                first_seen integer not null,
                last_seen integer not null,
                project text not null
            )",
            [],
        )?;
        conn.execute(
            "create table if not exists budgets (
                period text not null,
                period_start text not null,
                project text not null,
                amount real not null,
                budget_limit real not null,
                primary key (period, period_start, project)
            )",
            [],
        )?;
        conn.execute(
            "create table if not exists pii_log (
                id integer primary key autoincrement,
                timestamp integer not null,
                request_id text not null,
                pii_type text not null,
                action text not null,
                field_path text not null,
                context text not null,
                project text not null
            )",
            [],
        )?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }
}

impl FingerprintStore for SqliteStore {
    fn upsert_fingerprint(
        &self,
        hash: &str,
        content_type: &str,
        token_count: i64,
        project: &str,
    ) -> StoreResult<()> {
        let now = Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute(
            "insert into fingerprints (hash, content_type, token_count, hit_count, first_seen, last_seen, project)
             values (?1, ?2, ?3, 1, ?4, ?4, ?5)
             on conflict(hash) do update set
                 hit_count = hit_count + 1,
                 last_seen = ?4,
                 token_count = ?3,
                 project = ?5",
            params![hash, content_type, token_count, now, project],
        )?;
        Ok(())
    }

    fn get_fingerprint(&self, hash: &str) -> StoreResult<Option<Fingerprint>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "select hit_count, last_seen from fingerprints where hash = ?1",
                params![hash],
                |row| {
                    let hits: i64 = row.get(0)?;
                    let seen: i64 = row.get(1)?;
                    Ok((hits, seen))
                },
            )
            .optional()?;
        Ok(row.map(|(hit_count, seen)| Fingerprint {
            hit_count,
            last_seen: Utc
                .timestamp_opt(seen, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }))
    }
}

impl BudgetStore for SqliteStore {
    fn get_budget(&self, period: &str, period_start: &str) -> StoreResult<(f64, f64)> {
        let conn = self.conn()?;
        // spend rows are tagged per project but the cap is global
        let row = conn.query_row(
            "select ifnull(sum(amount), 0.0), ifnull(max(budget_limit), 0.0)
             from budgets where period = ?1 and period_start = ?2",
            params![period, period_start],
            |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
        )?;
        Ok(row)
    }

    fn add_spending(
        &self,
        period: &str,
        period_start: &str,
        amount: f64,
        limit: f64,
        project: &str,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "insert into budgets (period, period_start, project, amount, budget_limit)
             values (?1, ?2, ?3, ?4, ?5)
             on conflict(period, period_start, project) do update set
                 amount = amount + ?4,
                 budget_limit = ?5",
            params![period, period_start, project, amount, limit],
        )?;
        Ok(())
    }
}

impl PiiLogger for SqliteStore {
    fn log_pii(
        &self,
        request_id: &str,
        pii_type: &str,
        action: &str,
        field_path: &str,
        context: &str,
        project: &str,
    ) {
        let Ok(conn) = self.conn() else {
            return;
        };
        let _ = conn.execute(
            "insert into pii_log (timestamp, request_id, pii_type, action, field_path, context, project)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Utc::now().timestamp(),
                request_id,
                pii_type,
                action,
                field_path,
                context,
                project
            ],
        );
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryInner {
    fingerprints: HashMap<String, (i64, DateTime<Utc>, String)>,
    budgets: HashMap<(String, String, String), (f64, f64)>,
    pii_rows: Vec<(String, String, String)>,
}

/// Concurrent in-memory store for tests and ephemeral runs. Mirrors the
/// SQLite shape, project tags included.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Test helper: force a fingerprint's last-seen time.
    pub fn backdate_fingerprint(&self, hash: &str, last_seen: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(entry) = inner.fingerprints.get_mut(hash) {
            entry.1 = last_seen;
        }
    }

    /// Test helper: project tag on a stored fingerprint.
    pub fn fingerprint_project(&self, hash: &str) -> Option<String> {
        let inner = self.inner.lock().expect("store lock");
        inner.fingerprints.get(hash).map(|(_, _, p)| p.clone())
    }

    /// Test helper: (request_id, field_path, project) rows seen by the
    /// PII logger.
    pub fn pii_rows(&self) -> Vec<(String, String, String)> {
        self.inner.lock().expect("store lock").pii_rows.clone()
    }
}

impl FingerprintStore for MemoryStore {
    fn upsert_fingerprint(
        &self,
        hash: &str,
        _content_type: &str,
        _tokens: i64,
        project: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let entry = inner
            .fingerprints
            .entry(hash.to_string())
            .or_insert((0, Utc::now(), project.to_string()));
        entry.0 += 1;
        entry.1 = Utc::now();
        entry.2 = project.to_string();
        Ok(())
    }

    fn get_fingerprint(&self, hash: &str) -> StoreResult<Option<Fingerprint>> {
        let inner = self.inner.lock().expect("store lock");
        Ok(inner
            .fingerprints
            .get(hash)
            .map(|(hits, seen, _)| Fingerprint {
                hit_count: *hits,
                last_seen: *seen,
            }))
    }
}

impl BudgetStore for MemoryStore {
    fn get_budget(&self, period: &str, period_start: &str) -> StoreResult<(f64, f64)> {
        let inner = self.inner.lock().expect("store lock");
        let mut amount = 0.0;
        let mut limit = 0.0_f64;
        for ((p, start, _), (spent, row_limit)) in &inner.budgets {
            if p == period && start == period_start {
                amount += spent;
                limit = limit.max(*row_limit);
            }
        }
        Ok((amount, limit))
    }

    fn add_spending(
        &self,
        period: &str,
        period_start: &str,
        amount: f64,
        limit: f64,
        project: &str,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock");
        let entry = inner
            .budgets
            .entry((
                period.to_string(),
                period_start.to_string(),
                project.to_string(),
            ))
            .or_insert((0.0, limit));
        entry.0 += amount;
        entry.1 = limit;
        Ok(())
    }
}

impl PiiLogger for MemoryStore {
    fn log_pii(
        &self,
        request_id: &str,
        _pii_type: &str,
        _action: &str,
        field_path: &str,
        _context: &str,
        project: &str,
    ) {
        let mut inner = self.inner.lock().expect("store lock");
        inner.pii_rows.push((
            request_id.to_string(),
            field_path.to_string(),
            project.to_string(),
        ));
    }
}
