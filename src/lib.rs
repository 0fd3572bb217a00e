//! # leasehold
//!
//! Lease-based leader election for control-plane processes that share one
//! relational store:
//! - One row per election key, mutated only by compare-and-swap on a version
//! - Tick-driven state machine per key (follower / leader)
//! - Bounded retry of transient store failures
//! - Leadership change events on an in-process channel
//! - HTTP admin API for listing and releasing elections
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │ process A            │   │ process B            │
//! │  ElectionCoordinator │   │  ElectionCoordinator │
//! │   ├─ machine(job-x)  │   │   ├─ machine(job-x)  │
//! │   └─ machine(cache)  │   │   └─ machine(cache)  │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │ CAS(version)             │ CAS(version)
//!            └────────────┬─────────────┘
//!               ┌─────────▼──────────┐
//!               │ leader_election    │
//!               │ (shared SQL store) │
//!               └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run a node
//! ```bash
//! leasehold-node serve \
//!   --host node-a \
//!   --db ./leasehold.db \
//!   --bind 127.0.0.1:8090 \
//!   --key job-x,cache-refresh
//! ```
//!
//! ### Inspect the election table
//! ```bash
//! leasehold-node list --db ./leasehold.db
//! curl http://127.0.0.1:8090/maintain/v1/leaders
//! ```

pub mod admin;
pub mod common;
pub mod election;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use election::{ElectionCoordinator, LeaderChangeEvent};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
