//! Per-key election state machine
//!
//! One machine per election key per process. Each tick re-evaluates the
//! key from the store and decides whether to hold, renew, acquire or give
//! up the lease:
//!
//! ```text
//!   cooldown > 0        -> consume one cooldown tick, nothing else
//!   Leader + release    -> Follower, start cooldown
//!   Leader              -> heartbeat CAS(v, v+1); failure -> Follower
//!   Follower, live      -> resume if the lease is ours, else track leader
//!   Follower, expired   -> election CAS(v, v+1); success -> Leader
//! ```
//!
//! Heartbeats and elections share the same CAS, so a leader that misses its
//! renewal window is indistinguishable from a dead one.

use crate::common::ElectionConfig;
use crate::election::executor::ResilientExecutor;
use crate::election::notifier::{ChangeNotifier, LeaderChangeEvent};
use crate::election::store::{op, ElectionStore};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Fields only the tick loop writes. Never locked across a store call.
#[derive(Debug, Default)]
struct LocalState {
    /// Last fencing token written or observed
    version: i64,
    /// Last known leader; may lag the store between ticks
    leader: String,
}

/// Point-in-time view of a machine, for admin listings and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub key: String,
    pub is_leader: bool,
    pub version: i64,
    pub leader: String,
    pub release_tick_limit: u32,
}

pub struct ElectionStateMachine {
    key: String,
    host: String,
    tick_interval: Duration,
    lease_time: Duration,
    release_ticks: u32,
    store: Arc<dyn ElectionStore>,
    exec: ResilientExecutor,
    notifier: ChangeNotifier,

    leader_flag: AtomicBool,
    release_signal: AtomicBool,
    release_tick_limit: AtomicU32,
    local: Mutex<LocalState>,
}

impl ElectionStateMachine {
    pub fn new(
        key: impl Into<String>,
        host: impl Into<String>,
        config: &ElectionConfig,
        store: Arc<dyn ElectionStore>,
        exec: ResilientExecutor,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            key: key.into(),
            host: host.into(),
            tick_interval: config.tick_interval(),
            lease_time: config.lease_time(),
            release_ticks: config.release_tick_limit(),
            store,
            exec,
            notifier,
            leader_flag: AtomicBool::new(false),
            release_signal: AtomicBool::new(false),
            release_tick_limit: AtomicU32::new(0),
            local: Mutex::new(LocalState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_leader(&self) -> bool {
        self.leader_flag.load(Ordering::Acquire)
    }

    /// Ask the machine to step down on its next tick
    pub fn release(&self) {
        self.release_signal.store(true, Ordering::Release);
    }

    /// Remaining cooldown ticks after a voluntary release
    pub fn release_tick_limit(&self) -> u32 {
        self.release_tick_limit.load(Ordering::Acquire)
    }

    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locally cached leader identity
    pub fn leader(&self) -> String {
        self.local().leader.clone()
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        let local = self.local();
        MachineSnapshot {
            key: self.key.clone(),
            is_leader: self.is_leader(),
            version: local.version,
            leader: local.leader.clone(),
            release_tick_limit: self.release_tick_limit(),
        }
    }

    /// Tick until `cancel` fires, then demote and notify.
    ///
    /// A tick that has started always runs to completion.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(key = %self.key, host = %self.host, "election loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.tick().await;
        }

        self.become_follower(String::new());
        tracing::info!(key = %self.key, "election loop stopped");
    }

    /// One evaluation of the election protocol
    pub async fn tick(&self) {
        if self
            .release_tick_limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::debug!(key = %self.key, remaining = self.release_tick_limit(), "release cooldown");
            return;
        }

        let should_release = self.release_signal.swap(false, Ordering::AcqRel);
        if self.is_leader() {
            self.tick_leader(should_release).await;
        } else {
            self.tick_follower().await;
        }
    }

    async fn tick_leader(&self, should_release: bool) {
        if should_release {
            tracing::info!(key = %self.key, cooldown = self.release_ticks, "releasing leadership");
            self.become_follower(String::new());
            self.release_tick_limit
                .store(self.release_ticks, Ordering::Release);
            return;
        }

        let (store, key, host) = (&self.store, self.key.as_str(), self.host.as_str());
        let cur = self.local().version;
        let next = cur + 1;
        match self
            .exec
            .run(op::CAS, move || store.compare_and_swap(key, cur, next, host))
            .await
        {
            Ok(true) => {
                self.local().version = next;
                tracing::debug!(key = %self.key, version = next, "lease renewed");
            }
            Ok(false) => {
                tracing::warn!(key = %self.key, version = cur, "heartbeat lost, another writer advanced the version");
                self.become_follower(String::new());
            }
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "heartbeat failed");
                self.become_follower(String::new());
            }
        }
    }

    async fn tick_follower(&self) {
        let (store, key, host) = (&self.store, self.key.as_str(), self.host.as_str());
        let lease_time = self.lease_time;

        let status = match self
            .exec
            .run(op::CHECK_EXPIRED, move || store.check_expired(key, lease_time))
            .await
        {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "lease check failed");
                return;
            }
        };

        if !status.expired {
            if status.leader == self.host {
                // Restarted while our lease is still live: keep the token
                // read with the lease, so a takeover since then fails our
                // next heartbeat
                tracing::info!(key = %self.key, version = status.version, "resuming live lease");
                self.become_leader(status.version);
            } else if self.observe_leader(&status.leader) {
                tracing::info!(key = %self.key, leader = %status.leader, "leader changed");
                self.publish(false, status.leader);
            }
            return;
        }

        let cur = match self
            .exec
            .run(op::GET_VERSION, move || store.get_version(key))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "read version failed");
                return;
            }
        };

        let next = cur + 1;
        match self
            .exec
            .run(op::CAS, move || store.compare_and_swap(key, cur, next, host))
            .await
        {
            Ok(true) => {
                tracing::info!(key = %self.key, version = next, "elected leader");
                self.become_leader(next);
            }
            Ok(false) => {
                tracing::debug!(key = %self.key, version = cur, "lost election race");
            }
            Err(e) => {
                tracing::error!(key = %self.key, error = %e, "election failed");
            }
        }
    }

    /// Cache `leader`; true if it differs from the cached value
    fn observe_leader(&self, leader: &str) -> bool {
        let mut local = self.local();
        if local.leader == leader {
            return false;
        }
        local.leader = leader.to_string();
        true
    }

    fn become_leader(&self, version: i64) {
        {
            let mut local = self.local();
            local.version = version;
            local.leader = self.host.clone();
        }
        if !self.leader_flag.swap(true, Ordering::AcqRel) {
            let metrics = self.exec.metrics();
            metrics.leaders_held.inc();
            metrics.leader_transitions.inc();
        }
        self.publish(true, self.host.clone());
    }

    fn become_follower(&self, leader: String) {
        self.local().leader = leader.clone();
        if self.leader_flag.swap(false, Ordering::AcqRel) {
            let metrics = self.exec.metrics();
            metrics.leaders_held.dec();
            metrics.leader_transitions.inc();
        }
        self.publish(false, leader);
    }

    fn publish(&self, is_leader: bool, leader_host: String) {
        self.notifier.publish(LeaderChangeEvent {
            key: self.key.clone(),
            is_leader,
            leader_host,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, MetricsRegistry, Result, TransientKind};
    use crate::election::executor::RetryPolicy;
    use crate::election::memory::MemoryElectionStore;
    use crate::election::store::{ElectionRecord, LeaseStatus};
    use async_trait::async_trait;
    use tokio::sync::broadcast::error::TryRecvError;

    fn config() -> ElectionConfig {
        ElectionConfig::default()
    }

    fn machine(
        host: &str,
        store: Arc<dyn ElectionStore>,
        notifier: &ChangeNotifier,
    ) -> ElectionStateMachine {
        let exec = ResilientExecutor::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
            },
            Arc::new(MetricsRegistry::new()),
        );
        ElectionStateMachine::new("job-x", host, &config(), store, exec, notifier.clone())
    }

    async fn shared_store() -> Arc<MemoryElectionStore> {
        let store = Arc::new(MemoryElectionStore::new());
        store.create("job-x").await.unwrap();
        store
    }

    /// Store whose writes can be switched off, to simulate a lost heartbeat
    struct Switchable {
        inner: Arc<MemoryElectionStore>,
        down: AtomicBool,
    }

    #[async_trait]
    impl ElectionStore for Switchable {
        async fn create(&self, key: &str) -> Result<()> {
            self.inner.create(key).await
        }
        async fn get_version(&self, key: &str) -> Result<i64> {
            self.inner.get_version(key).await
        }
        async fn compare_and_swap(&self, key: &str, cur: i64, new: i64, host: &str) -> Result<bool> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::Transient {
                    kind: TransientKind::BadConnection,
                    message: "connection reset".into(),
                });
            }
            self.inner.compare_and_swap(key, cur, new, host).await
        }
        async fn check_expired(&self, key: &str, lease: Duration) -> Result<LeaseStatus> {
            self.inner.check_expired(key, lease).await
        }
        async fn list_all(&self, lease: Duration) -> Result<Vec<ElectionRecord>> {
            self.inner.list_all(lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_won() {
        let store = shared_store().await;
        // Push the version to 42 so the fencing token is visible
        for v in 0..42 {
            store.compare_and_swap("job-x", v, v + 1, "old").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        let m = machine("node-a", store.clone(), &notifier);

        m.tick().await;

        assert!(m.is_leader());
        let snap = m.snapshot();
        assert_eq!(snap.version, 43);
        assert_eq!(snap.leader, "node-a");
        assert_eq!(store.get_version("job-x").await.unwrap(), 43);

        let event = rx.try_recv().unwrap();
        assert!(event.is_leader);
        assert_eq!(event.leader_host, "node-a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_renews_without_notification() {
        let store = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);
        m.tick().await;
        assert!(m.is_leader());

        let mut rx = notifier.subscribe();
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(2)).await;
            m.tick().await;
        }
        assert!(m.is_leader());
        assert_eq!(m.snapshot().version, 11);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        // Lease is kept fresh by the heartbeats
        let status = store
            .check_expired("job-x", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!status.expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_heartbeat_demotes() {
        let store = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);
        m.tick().await;
        assert_eq!(m.snapshot().version, 1);

        // Another writer advances the version behind our back
        assert!(store.compare_and_swap("job-x", 1, 2, "node-b").await.unwrap());

        let mut rx = notifier.subscribe();
        m.tick().await;
        assert!(!m.is_leader());
        let event = rx.try_recv().unwrap();
        assert!(!event.is_leader);

        // Next follower tick learns who leads now
        m.tick().await;
        assert_eq!(m.leader(), "node-b");
        let event = rx.try_recv().unwrap();
        assert!(!event.is_leader);
        assert_eq!(event.leader_host, "node-b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_error_on_heartbeat_demotes() {
        let inner = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let store = Arc::new(Switchable {
            inner,
            down: AtomicBool::new(false),
        });
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);
        m.tick().await;
        assert!(m.is_leader());

        store.down.store(true, Ordering::SeqCst);
        m.tick().await;
        assert!(!m.is_leader());
        assert_eq!(m.exec.metrics().operation(op::CAS).retries.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_tracks_live_leader() {
        let store = shared_store().await;
        store.compare_and_swap("job-x", 0, 1, "node-b").await.unwrap();

        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        let m = machine("node-a", store.clone(), &notifier);

        m.tick().await;
        assert!(!m.is_leader());
        assert_eq!(m.leader(), "node-b");
        assert_eq!(rx.try_recv().unwrap().leader_host, "node-b");

        // Same leader again: no new event
        m.tick().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(store.get_version("job-x").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_live_lease_without_election() {
        let store = shared_store().await;
        // A previous incarnation of node-a wrote the lease
        store.compare_and_swap("job-x", 0, 5, "node-a").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);
        m.tick().await;

        assert!(m.is_leader());
        assert_eq!(m.snapshot().version, 5);
        // No CAS happened
        assert_eq!(store.get_version("job-x").await.unwrap(), 5);
        assert_eq!(m.exec.metrics().operation(op::CAS).calls.get(), 0);

        // And the next heartbeat uses the resumed token
        m.tick().await;
        assert!(m.is_leader());
        assert_eq!(store.get_version("job-x").await.unwrap(), 6);
    }

    /// Store where another elector wins the key right after our lease read
    struct TakeoverAfterRead {
        inner: Arc<MemoryElectionStore>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl ElectionStore for TakeoverAfterRead {
        async fn create(&self, key: &str) -> Result<()> {
            self.inner.create(key).await
        }
        async fn get_version(&self, key: &str) -> Result<i64> {
            self.inner.get_version(key).await
        }
        async fn compare_and_swap(&self, key: &str, cur: i64, new: i64, host: &str) -> Result<bool> {
            self.inner.compare_and_swap(key, cur, new, host).await
        }
        async fn check_expired(&self, key: &str, lease: Duration) -> Result<LeaseStatus> {
            let status = self.inner.check_expired(key, lease).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let won = self
                    .inner
                    .compare_and_swap(key, status.version, status.version + 1, "node-b")
                    .await?;
                assert!(won);
            }
            Ok(status)
        }
        async fn list_all(&self, lease: Duration) -> Result<Vec<ElectionRecord>> {
            self.inner.list_all(lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_does_not_adopt_a_newer_token() {
        let inner = shared_store().await;
        inner.compare_and_swap("job-x", 0, 5, "node-a").await.unwrap();
        let store = Arc::new(TakeoverAfterRead {
            inner: inner.clone(),
            armed: AtomicBool::new(true),
        });
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store, &notifier);

        // Resumes with the token that came with the lease, not node-b's
        m.tick().await;
        assert!(m.is_leader());
        assert_eq!(m.snapshot().version, 5);
        assert_eq!(inner.get_version("job-x").await.unwrap(), 6);

        // So the heartbeat is fenced off and node-b keeps its lease
        m.tick().await;
        assert!(!m.is_leader());
        let status = inner
            .check_expired("job-x", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status.leader, "node-b");
        assert_eq!(status.version, 6);
    }

    /// Store whose lease checks block until the gate opens
    struct Gated {
        inner: Arc<MemoryElectionStore>,
        closed: AtomicBool,
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl ElectionStore for Gated {
        async fn create(&self, key: &str) -> Result<()> {
            self.inner.create(key).await
        }
        async fn get_version(&self, key: &str) -> Result<i64> {
            self.inner.get_version(key).await
        }
        async fn compare_and_swap(&self, key: &str, cur: i64, new: i64, host: &str) -> Result<bool> {
            self.inner.compare_and_swap(key, cur, new, host).await
        }
        async fn check_expired(&self, key: &str, lease: Duration) -> Result<LeaseStatus> {
            if self.closed.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner.check_expired(key, lease).await
        }
        async fn list_all(&self, lease: Duration) -> Result<Vec<ElectionRecord>> {
            self.inner.list_all(lease).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_readers_do_not_wait_on_a_stalled_tick() {
        let inner = shared_store().await;
        inner.compare_and_swap("job-x", 0, 1, "node-b").await.unwrap();
        let store = Arc::new(Gated {
            inner,
            closed: AtomicBool::new(false),
            gate: tokio::sync::Notify::new(),
        });
        let notifier = ChangeNotifier::new();
        let m = Arc::new(machine("node-a", store.clone(), &notifier));
        m.tick().await;
        assert_eq!(m.leader(), "node-b");

        store.closed.store(true, Ordering::SeqCst);
        let ticking = tokio::spawn({
            let m = m.clone();
            async move { m.tick().await }
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!ticking.is_finished());

        let snap = m.snapshot();
        assert!(!snap.is_leader);
        assert_eq!(snap.leader, "node-b");
        assert_eq!(m.leader(), "node-b");

        store.gate.notify_one();
        ticking.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_starts_cooldown() {
        let store = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);
        m.tick().await;
        assert!(m.is_leader());

        m.release();
        m.tick().await;
        assert!(!m.is_leader());
        assert_eq!(m.release_tick_limit(), 15);
        assert_eq!(m.leader(), "");

        // Lease expires and nobody else contends, yet the cooldown holds
        tokio::time::advance(Duration::from_secs(11)).await;
        for remaining in (0..15).rev() {
            m.tick().await;
            assert!(!m.is_leader());
            assert_eq!(m.release_tick_limit(), remaining);
        }

        m.tick().await;
        assert!(m.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortest_cooldown_ends_in_an_election() {
        let store = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let config = ElectionConfig {
            release_cooldown_factor: 1,
            ..ElectionConfig::default()
        };
        let exec = ResilientExecutor::new(RetryPolicy::default(), Arc::new(MetricsRegistry::new()));
        let m = ElectionStateMachine::new(
            "job-x",
            "node-a",
            &config,
            store.clone(),
            exec,
            ChangeNotifier::new(),
        );
        m.tick().await;
        assert_eq!(m.snapshot().version, 1);

        m.release();
        m.tick().await;
        assert_eq!(m.release_tick_limit(), 5);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            m.tick().await;
            assert!(!m.is_leader());
        }

        // Our released lease has lapsed: winning it back takes a CAS
        tokio::time::advance(Duration::from_secs(2)).await;
        m.tick().await;
        assert!(m.is_leader());
        assert_eq!(m.snapshot().version, 2);
        assert_eq!(store.get_version("job-x").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_while_follower_is_ignored() {
        let store = shared_store().await;
        store.compare_and_swap("job-x", 0, 1, "node-b").await.unwrap();
        let notifier = ChangeNotifier::new();
        let m = machine("node-a", store.clone(), &notifier);

        m.release();
        m.tick().await;
        assert_eq!(m.release_tick_limit(), 0);

        // The signal was consumed; winning later is not suppressed
        tokio::time::advance(Duration::from_secs(11)).await;
        m.tick().await;
        assert!(m.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_demotes_on_cancel() {
        let store = shared_store().await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let notifier = ChangeNotifier::new();
        let mut rx = notifier.subscribe();
        let m = Arc::new(machine("node-a", store.clone(), &notifier));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(m.clone().run(cancel.clone()));

        let event = rx.recv().await.unwrap();
        assert!(event.is_leader);
        assert!(m.is_leader());

        cancel.cancel();
        handle.await.unwrap();

        assert!(!m.is_leader());
        let event = rx.recv().await.unwrap();
        assert!(!event.is_leader);
        assert_eq!(event.leader_host, "");
    }
}
