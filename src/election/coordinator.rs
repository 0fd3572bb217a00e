//! Process-wide registry of election state machines
//!
//! The coordinator owns one background task per started key. It is an
//! ordinary object: build one per process and hand an `Arc` to whatever
//! needs leadership answers.

use crate::common::{validate_key, ElectionConfig, Error, Result};
use crate::election::executor::ResilientExecutor;
use crate::election::machine::{ElectionStateMachine, MachineSnapshot};
use crate::election::notifier::{ChangeNotifier, LeaderChangeEvent};
use crate::election::store::{op, ElectionRecord, ElectionStore};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningElection {
    machine: Arc<ElectionStateMachine>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ElectionCoordinator {
    host: String,
    config: ElectionConfig,
    store: Arc<dyn ElectionStore>,
    exec: ResilientExecutor,
    notifier: ChangeNotifier,

    /// Serializes start/stop so a key is never registered twice
    lifecycle: Mutex<()>,
    elections: RwLock<HashMap<String, RunningElection>>,
}

impl ElectionCoordinator {
    pub fn new(
        host: impl Into<String>,
        config: ElectionConfig,
        store: Arc<dyn ElectionStore>,
        exec: ResilientExecutor,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            host: host.into(),
            config,
            store,
            exec,
            notifier,
            lifecycle: Mutex::new(()),
            elections: RwLock::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaderChangeEvent> {
        self.notifier.subscribe()
    }

    fn machine(&self, key: &str) -> Option<Arc<ElectionStateMachine>> {
        self.elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.machine.clone())
    }

    /// Start contending for `key`. A no-op if it is already running.
    ///
    /// The election row is created first; if that fails nothing is
    /// registered and no task is spawned.
    pub async fn start_leader_election(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let _guard = self.lifecycle.lock().await;
        if self.machine(key).is_some() {
            tracing::debug!(key, "leader election already running");
            return Ok(());
        }

        let store = &self.store;
        self.exec
            .run(op::CREATE, move || store.create(key))
            .await?;

        let machine = Arc::new(ElectionStateMachine::new(
            key,
            self.host.clone(),
            &self.config,
            self.store.clone(),
            self.exec.clone(),
            self.notifier.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(machine.clone().run(cancel.clone()));

        self.elections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key.to_string(),
                RunningElection {
                    machine,
                    cancel,
                    handle,
                },
            );
        self.exec.metrics().running_elections.inc();
        tracing::info!(key, host = %self.host, "leader election started");
        Ok(())
    }

    /// Cancel every election loop and wait for each to demote itself
    pub async fn stop_leader_elections(&self) {
        let _guard = self.lifecycle.lock().await;
        let running: Vec<(String, RunningElection)> = self
            .elections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for (_, election) in &running {
            election.cancel.cancel();
        }
        for (key, election) in running {
            if let Err(e) = election.handle.await {
                tracing::error!(key = %key, error = %e, "election task ended abnormally");
            }
            self.exec.metrics().running_elections.dec();
        }
        tracing::info!("all leader elections stopped");
    }

    /// Ask the local machine for `key` to step down on its next tick
    pub fn release_leader_election(&self, key: &str) -> Result<()> {
        let machine = self
            .machine(key)
            .ok_or_else(|| Error::NotStarted(key.to_string()))?;
        machine.release();
        tracing::info!(key, "leader release requested");
        Ok(())
    }

    /// Whether this process currently leads `key`. Unknown keys are never led.
    pub fn is_leader(&self, key: &str) -> bool {
        self.machine(key).map(|m| m.is_leader()).unwrap_or(false)
    }

    /// Locally cached leader identity for a started key
    pub fn leader_of(&self, key: &str) -> Option<String> {
        self.machine(key).map(|m| m.leader())
    }

    pub fn snapshot(&self, key: &str) -> Option<MachineSnapshot> {
        self.machine(key).map(|m| m.snapshot())
    }

    /// Keys with a running election loop, sorted
    pub fn running_elections(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .elections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Every election row in the store
    pub async fn list_leader_elections(&self) -> Result<Vec<ElectionRecord>> {
        let store = &self.store;
        let lease_time = self.config.lease_time();
        self.exec
            .run(op::LIST_ALL, move || store.list_all(lease_time))
            .await
    }
}
