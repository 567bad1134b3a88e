//! SQLite ledger of settled zaps.
//!
//! One row per post id is the only idempotency guarantee: the primary key
//! rejects a second settlement for the same post regardless of which caller
//! gets there first. Budget totals are always recomputed from the table.
//!
//! ## Table
//!
//! - `zaps` - `event_id` (primary key), `author_pubkey`, `zapped_at`,
//!   `amount`, `event_created_at`, indexed by author and by `zapped_at`

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS zaps (
    event_id          TEXT PRIMARY KEY,
    author_pubkey     TEXT NOT NULL,
    zapped_at         INTEGER NOT NULL,
    amount            INTEGER NOT NULL,
    event_created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_zaps_author ON zaps(author_pubkey);
CREATE INDEX IF NOT EXISTS idx_zaps_zapped_at ON zaps(zapped_at);
";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("event {0} already settled")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A settled zap as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub event_id: String,
    pub author: String,
    pub amount_sats: u64,
    pub settled_at: i64,
    pub event_created_at: u64,
}

/// Aggregates shown by the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total_zaps: u64,
    pub total_sats: u64,
    pub today_sats: u64,
    pub distinct_authors: u64,
}

/// Durable settlement store.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open or create the ledger at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening ledger");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_schema(conn)
    }

    /// In-memory ledger for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        debug!("opening in-memory ledger");
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError>,
    {
        let conn = self.conn.lock().map_err(|_| LedgerError::Poisoned)?;
        f(&conn)
    }

    pub fn is_settled(&self, event_id: &str) -> Result<bool, LedgerError> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM zaps WHERE event_id = ?1",
                    params![event_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Record a settlement stamped with the current time. Fails with
    /// [`LedgerError::Conflict`] when the post already has an entry.
    pub fn record_settlement(
        &self,
        event_id: &str,
        author: &str,
        amount_sats: u64,
        event_created_at: u64,
    ) -> Result<(), LedgerError> {
        self.record_settlement_at(event_id, author, amount_sats, event_created_at, Utc::now().timestamp())
    }

    pub fn record_settlement_at(
        &self,
        event_id: &str,
        author: &str,
        amount_sats: u64,
        event_created_at: u64,
        settled_at: i64,
    ) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            let res = conn.execute(
                "INSERT INTO zaps (event_id, author_pubkey, zapped_at, amount, event_created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_id, author, settled_at, amount_sats as i64, event_created_at as i64],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                    Err(LedgerError::Conflict(event_id.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Sats settled since the start of the current UTC day.
    pub fn total_today(&self) -> Result<u64, LedgerError> {
        let since = utc_day_start();
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM zaps WHERE zapped_at >= ?1",
                params![since],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
    }

    /// Sats settled to `author` since the start of the current UTC day.
    pub fn total_today_for_author(&self, author: &str) -> Result<u64, LedgerError> {
        let since = utc_day_start();
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM zaps WHERE zapped_at >= ?1 AND author_pubkey = ?2",
                params![since, author],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
    }

    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let today_sats = self.total_today()?;
        self.with_conn(|conn| {
            let (count, sum, authors): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(amount), 0), COUNT(DISTINCT author_pubkey) FROM zaps",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(LedgerStats {
                total_zaps: count.max(0) as u64,
                total_sats: sum.max(0) as u64,
                today_sats,
                distinct_authors: authors.max(0) as u64,
            })
        })
    }

    /// Most recent settlements, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_id, author_pubkey, amount, zapped_at, event_created_at
                 FROM zaps ORDER BY zapped_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(LedgerEntry {
                    event_id: row.get(0)?,
                    author: row.get(1)?,
                    amount_sats: row.get::<_, i64>(2)?.max(0) as u64,
                    settled_at: row.get(3)?,
                    event_created_at: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?;
            let entries = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}

/// Unix timestamp of 00:00:00 UTC today.
pub fn utc_day_start() -> i64 {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(0, |midnight| midnight.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn records_and_detects_settlement() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(!ledger.is_settled("evt-1").unwrap());
        ledger.record_settlement("evt-1", "auth-1", 3, 100).unwrap();
        assert!(ledger.is_settled("evt-1").unwrap());
        assert_eq!(ledger.total_today().unwrap(), 3);
        assert_eq!(ledger.total_today_for_author("auth-1").unwrap(), 3);
        assert_eq!(ledger.total_today_for_author("auth-2").unwrap(), 0);
    }

    #[test]
    fn duplicate_settlement_conflicts() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.record_settlement("evt-1", "auth-1", 3, 100).unwrap();
        let err = ledger.record_settlement("evt-1", "auth-1", 3, 100).unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(id) if id == "evt-1"));
        assert_eq!(ledger.total_today().unwrap(), 3);
    }

    #[test]
    fn yesterday_does_not_count_toward_today() {
        let ledger = Ledger::open_in_memory().unwrap();
        let yesterday = utc_day_start() - 60;
        ledger.record_settlement_at("old", "auth-1", 50, 1, yesterday).unwrap();
        ledger.record_settlement("new", "auth-1", 5, 2).unwrap();
        assert_eq!(ledger.total_today().unwrap(), 5);
        assert_eq!(ledger.total_today_for_author("auth-1").unwrap(), 5);
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_zaps, 2);
        assert_eq!(stats.total_sats, 55);
        assert_eq!(stats.today_sats, 5);
        assert_eq!(stats.distinct_authors, 1);
    }

    #[test]
    fn concurrent_duplicates_leave_one_entry() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(Ledger::open(&dir.path().join("zaps.db")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.record_settlement("evt-x", "auth-1", 3, 1))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LedgerError::Conflict(_))));
        assert_eq!(ledger.stats().unwrap().total_zaps, 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("zaps.db");
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.record_settlement("evt-1", "auth-1", 3, 100).unwrap();
        }
        let ledger = Ledger::open(&path).unwrap();
        assert!(ledger.is_settled("evt-1").unwrap());
        let recent = ledger.recent(5).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event_id, "evt-1");
        assert_eq!(recent[0].amount_sats, 3);
        assert_eq!(recent[0].event_created_at, 100);
    }
}
