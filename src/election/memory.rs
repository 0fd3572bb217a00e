//! In-process election store
//!
//! Same semantics as the SQL backend, with a mutex standing in for the
//! database's atomic update. Lease age is measured on the tokio clock so
//! tests can pause and advance time. Useful for single-process deployments
//! and for running several electors against one shared store in tests.

use crate::common::{validate_key, Error, Result};
use crate::election::store::{ElectionRecord, ElectionStore, LeaseStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Row {
    leader: String,
    version: i64,
    ctime: DateTime<Utc>,
    mtime: DateTime<Utc>,
    /// Last successful CAS; `None` until the first one
    touched: Option<Instant>,
}

impl Row {
    fn lease_age(&self) -> Option<Duration> {
        self.touched.map(|t| t.elapsed())
    }

    fn expired(&self, lease_time: Duration) -> bool {
        self.lease_age().map_or(true, |age| age > lease_time)
    }
}

#[derive(Debug, Default)]
pub struct MemoryElectionStore {
    rows: Mutex<BTreeMap<String, Row>>,
}

impl MemoryElectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Row>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ElectionStore for MemoryElectionStore {
    async fn create(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.rows().entry(key.to_string()).or_insert_with(|| Row {
            leader: String::new(),
            version: 0,
            ctime: Utc::now(),
            mtime: DateTime::<Utc>::default(),
            touched: None,
        });
        Ok(())
    }

    async fn get_version(&self, key: &str) -> Result<i64> {
        validate_key(key)?;
        self.rows()
            .get(key)
            .map(|row| row.version)
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        cur_version: i64,
        new_version: i64,
        host: &str,
    ) -> Result<bool> {
        validate_key(key)?;
        let mut rows = self.rows();
        match rows.get_mut(key) {
            Some(row) if row.version == cur_version => {
                row.leader = host.to_string();
                row.version = new_version;
                row.mtime = Utc::now();
                row.touched = Some(Instant::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn check_expired(&self, key: &str, lease_time: Duration) -> Result<LeaseStatus> {
        validate_key(key)?;
        let rows = self.rows();
        let row = rows
            .get(key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(LeaseStatus {
            leader: row.leader.clone(),
            version: row.version,
            expired: row.expired(lease_time),
        })
    }

    async fn list_all(&self, lease_time: Duration) -> Result<Vec<ElectionRecord>> {
        Ok(self
            .rows()
            .iter()
            .map(|(key, row)| ElectionRecord {
                key: key.clone(),
                leader: row.leader.clone(),
                version: row.version,
                ctime: row.ctime,
                mtime: row.mtime,
                valid: !row.expired(lease_time),
            })
            .collect())
    }
}
