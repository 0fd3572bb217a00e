//! SQLite-backed election store
//!
//! Every elector opens the same database file. Coordination relies on two
//! properties of the engine: `INSERT OR IGNORE` on the primary key, and a
//! single-statement `UPDATE ... WHERE version = ?` whose affected row count
//! tells the caller whether its CAS won. `mtime` and lease checks use the
//! database clock (`julianday('now')`), never the caller's.
//!
//! Schema:
//! - `leader_election(elect_key TEXT PRIMARY KEY, leader TEXT, version INTEGER, ctime INTEGER, mtime INTEGER)`
//!   with timestamps in Unix milliseconds. A new row has `mtime = 0`: it
//!   carries no lease, so the first elector to tick may claim it.

use crate::common::{validate_key, Error, Result};
use crate::election::store::{ElectionRecord, ElectionStore, LeaseStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Unix milliseconds according to the database clock
const NOW_MS: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// How long a connection waits on a locked database before reporting busy
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteElectionStore {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteElectionStore {
    /// Open or create the election database at `path`
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS leader_election (
                elect_key TEXT PRIMARY KEY,
                leader TEXT NOT NULL DEFAULT '',
                version INTEGER NOT NULL DEFAULT 0,
                ctime INTEGER NOT NULL,
                mtime INTEGER NOT NULL
            )",
            [],
        )?;
        drop(conn);

        let manager =
            SqliteConnectionManager::file(&path).with_init(|c| c.busy_timeout(BUSY_TIMEOUT));
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        tracing::info!(path = %path.display(), pool_size, "election store opened");
        Ok(Self { pool, path })
    }

    /// Open an existing election database without creating anything.
    ///
    /// Fails with `NotFound` when there is no file at `path`.
    pub fn open_existing(path: impl AsRef<Path>, pool_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()));
        }

        let manager = SqliteConnectionManager::file(&path)
            .with_flags(OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .with_init(|c| c.busy_timeout(BUSY_TIMEOUT));
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        tracing::debug!(path = %path.display(), "existing election store opened");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection off the async runtime
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("store task failed: {}", e)))?
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl ElectionStore for SqliteElectionStore {
    async fn create(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT OR IGNORE INTO leader_election (elect_key, leader, version, ctime, mtime)
                 VALUES (?1, '', 0, {now}, 0)",
                now = NOW_MS
            );
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(&sql, params![key])?;
            tx.commit()?;
            if inserted == 1 {
                tracing::info!(key = %key, "election row created");
            }
            Ok(())
        })
        .await
    }

    async fn get_version(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT version FROM leader_election WHERE elect_key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(key.clone()))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        cur_version: i64,
        new_version: i64,
        host: &str,
    ) -> Result<bool> {
        validate_key(key)?;
        let key = key.to_string();
        let host = host.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE leader_election SET leader = ?1, version = ?2, mtime = {now}
                 WHERE elect_key = ?3 AND version = ?4",
                now = NOW_MS
            );
            // IMMEDIATE: a stale WAL read snapshot is not covered by busy_timeout
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(&sql, params![host, new_version, key, cur_version])?;
            tx.commit()?;
            Ok(updated == 1)
        })
        .await
    }

    async fn check_expired(&self, key: &str, lease_time: Duration) -> Result<LeaseStatus> {
        validate_key(key)?;
        let key = key.to_string();
        let lease_ms = lease_time.as_millis() as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT leader, version, ({now} - mtime) > ?2 FROM leader_election WHERE elect_key = ?1",
                now = NOW_MS
            );
            conn.query_row(&sql, params![key, lease_ms], |row| {
                Ok(LeaseStatus {
                    leader: row.get(0)?,
                    version: row.get(1)?,
                    expired: row.get(2)?,
                })
            })
            .optional()?
            .ok_or_else(|| Error::NotFound(key.clone()))
        })
        .await
    }

    async fn list_all(&self, lease_time: Duration) -> Result<Vec<ElectionRecord>> {
        let lease_ms = lease_time.as_millis() as i64;
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT elect_key, leader, version, ctime, mtime, ({now} - mtime) <= ?1
                 FROM leader_election ORDER BY elect_key",
                now = NOW_MS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![lease_ms], |row| {
                Ok(ElectionRecord {
                    key: row.get(0)?,
                    leader: row.get(1)?,
                    version: row.get(2)?,
                    ctime: millis_to_datetime(row.get(3)?),
                    mtime: millis_to_datetime(row.get(4)?),
                    valid: row.get(5)?,
                })
            })?;

            let mut records = Vec::new();
            for record in rows {
                records.push(record?);
            }
            Ok(records)
        })
        .await
    }
}
