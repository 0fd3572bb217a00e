//! Lease-based leader election
//!
//! Several processes sharing one election store agree on at most one leader
//! per key. The store's compare-and-swap on a per-key version is the only
//! coordination primitive:
//! - `store`: the persistence interface and record types
//! - `sqlite` / `memory`: store backends
//! - `executor`: bounded retry of transient store failures, with metrics
//! - `machine`: the per-key tick-driven state machine
//! - `coordinator`: registry of running machines, the public surface
//! - `notifier`: leadership change events

pub mod coordinator;
pub mod executor;
pub mod machine;
pub mod memory;
pub mod notifier;
pub mod sqlite;
pub mod store;

pub use coordinator::ElectionCoordinator;
pub use executor::{ResilientExecutor, RetryPolicy};
pub use machine::{ElectionStateMachine, MachineSnapshot};
pub use memory::MemoryElectionStore;
pub use notifier::{ChangeNotifier, LeaderChangeEvent, LEADER_CHANGE_TOPIC};
pub use sqlite::SqliteElectionStore;
pub use store::{ElectionRecord, ElectionStore, LeaseStatus};
