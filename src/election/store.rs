//! Election store interface
//!
//! One row per election key. Every mutation goes through a compare-and-swap
//! on `version`; the store, not the caller, decides which of several racing
//! writers wins. Timestamps come from the store's own clock.

use crate::common::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Store operation names, used as metric labels
pub mod op {
    pub const CREATE: &str = "create";
    pub const GET_VERSION: &str = "get_version";
    pub const CAS: &str = "compare_and_swap";
    pub const CHECK_EXPIRED: &str = "check_expired";
    pub const LIST_ALL: &str = "list_all";
}

/// Durable state of one election key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionRecord {
    pub key: String,
    /// Empty when no leader is known
    pub leader: String,
    /// Fencing token, +1 per successful write
    pub version: i64,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    /// `now - mtime <= lease_time` at listing time
    pub valid: bool,
}

/// Outcome of a lease check, read from one consistent view of the row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub leader: String,
    /// Fencing token that goes with `leader`
    pub version: i64,
    pub expired: bool,
}

/// Persistence for election rows.
///
/// Implementations must be safe to call from many processes against the
/// same key at once.
#[async_trait]
pub trait ElectionStore: Send + Sync {
    /// Insert the row for `key` if absent. Never fails on duplicates and
    /// never resets an existing version.
    async fn create(&self, key: &str) -> Result<()>;

    /// Current fencing token for `key`
    async fn get_version(&self, key: &str) -> Result<i64>;

    /// Set `leader = host, version = new_version` iff the stored version
    /// equals `cur_version`. `Ok(false)` means another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        cur_version: i64,
        new_version: i64,
        host: &str,
    ) -> Result<bool>;

    /// Stored leader, its version and whether `now - mtime > lease_time`,
    /// all from the same read
    async fn check_expired(&self, key: &str, lease_time: Duration) -> Result<LeaseStatus>;

    /// Every election row, with `valid` evaluated against `lease_time`
    async fn list_all(&self, lease_time: Duration) -> Result<Vec<ElectionRecord>>;
}
