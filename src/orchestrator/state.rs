//! Build State Management and Stage Tracking
//!
//! This module provides the per-build record shared by every task of a build:
//!
//! - **Progress**: declared step count vs. completed steps (atomic, never clamped)
//! - **Stage**: human-readable name of the current phase, observability only
//! - **Artifacts**: key/value store passing data between phases and to later add-node runs
//! - **External**: the subset of results exposed to callers outside the engine
//! - **Deferred**: best-effort cleanup actions run once when the build concludes
//!
//! `BuildState` never fails. Contract violations such as more increments than
//! declared steps are observable through `overrun()` rather than rejected.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{BuildError, Result};

/// Conventional build stages every family walks through in order.
///
/// The engine does not enforce the ordering; it only names the stages so
/// families and observers agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStage {
    DeclaringSteps,
    DistributingSecrets,
    CreatingGenesis,
    InitializingDaemons,
    CollectingPeers,
    BroadcastingPeers,
    ExposingArtifacts,
    Completed,
    Failed,
}

impl BuildStage {
    /// Get the human-readable name for this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::DeclaringSteps => "Declaring build steps",
            BuildStage::DistributingSecrets => "Distributing secrets",
            BuildStage::CreatingGenesis => "Creating the genesis block",
            BuildStage::InitializingDaemons => "Initializing daemons",
            BuildStage::CollectingPeers => "Collecting peer addresses",
            BuildStage::BroadcastingPeers => "Peering the nodes",
            BuildStage::ExposingArtifacts => "Exposing artifacts",
            BuildStage::Completed => "Completed",
            BuildStage::Failed => "Failed",
        }
    }

    /// The stages of a successful build, in order.
    pub fn pipeline() -> &'static [BuildStage] {
        &[
            BuildStage::DeclaringSteps,
            BuildStage::DistributingSecrets,
            BuildStage::CreatingGenesis,
            BuildStage::InitializingDaemons,
            BuildStage::CollectingPeers,
            BuildStage::BroadcastingPeers,
            BuildStage::ExposingArtifacts,
        ]
    }

    pub fn from_name(name: &str) -> Option<BuildStage> {
        Self::pipeline()
            .iter()
            .chain([BuildStage::Completed, BuildStage::Failed].iter())
            .copied()
            .find(|s| s.as_str() == name)
    }
}

/// Events emitted while a build runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Progress { completed: u64, total: u64 },
    StageChanged(String),
}

/// Typed handle onto an artifact slot.
///
/// Pairs a string key with the type stored under it so reads and writes agree
/// at compile time, while the underlying store stays a dynamic map.
pub struct ArtifactKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ArtifactKey<T> {
    pub const fn new(name: &'static str) -> Self {
        ArtifactKey {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ArtifactKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArtifactKey<T> {}

/// Serializable view of build progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub build_id: String,
    pub stage: String,
    pub completed_steps: u64,
    pub total_steps: u64,
    pub progress_percent: u32,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

type DeferredAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Mutable record of one build or add-node operation.
pub struct BuildState {
    build_id: String,
    total_steps: AtomicU64,
    completed_steps: AtomicU64,
    stage: RwLock<String>,
    stage_history: Mutex<Vec<String>>,
    artifacts: RwLock<HashMap<String, Value>>,
    external: RwLock<HashMap<String, Value>>,
    deferred: Mutex<Vec<DeferredAction>>,
    error: RwLock<Option<String>>,
    started_at: DateTime<Utc>,
    events: Option<mpsc::Sender<BuildEvent>>,
}

impl BuildState {
    pub fn new(build_id: impl Into<String>) -> Self {
        BuildState {
            build_id: build_id.into(),
            total_steps: AtomicU64::new(0),
            completed_steps: AtomicU64::new(0),
            stage: RwLock::new(String::new()),
            stage_history: Mutex::new(Vec::new()),
            artifacts: RwLock::new(HashMap::new()),
            external: RwLock::new(HashMap::new()),
            deferred: Mutex::new(Vec::new()),
            error: RwLock::new(None),
            started_at: Utc::now(),
            events: None,
        }
    }

    /// Forward progress and stage changes to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<BuildEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// A fresh state for an add-node operation carrying a prior build's
    /// artifacts and external values.
    pub fn continuing(build_id: impl Into<String>, prior: &BuildState) -> Self {
        let state = BuildState::new(build_id);
        *write_lock(&state.artifacts) = read_lock(&prior.artifacts).clone();
        *write_lock(&state.external) = read_lock(&prior.external).clone();
        state
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Declare how many steps this operation will take.
    pub fn set_total_steps(&self, total: u64) {
        self.total_steps.store(total, Ordering::SeqCst);
        log::debug!("[{}] declared {} build steps", self.build_id, total);
        self.emit(BuildEvent::Progress {
            completed: self.completed_steps(),
            total,
        });
    }

    /// Record one completed step. Safe to call from any task.
    pub fn increment_progress(&self) {
        let completed = self.completed_steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(BuildEvent::Progress {
            completed,
            total: self.total_steps(),
        });
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps.load(Ordering::SeqCst)
    }

    pub fn completed_steps(&self) -> u64 {
        self.completed_steps.load(Ordering::SeqCst)
    }

    /// True when the completed steps match the declared steps exactly.
    pub fn is_complete(&self) -> bool {
        self.completed_steps() == self.total_steps()
    }

    /// Steps completed beyond the declared total, if any.
    pub fn overrun(&self) -> Option<u64> {
        let (completed, total) = (self.completed_steps(), self.total_steps());
        (completed > total).then(|| completed - total)
    }

    /// Progress percentage (0-100) for display.
    pub fn progress_percent(&self) -> u32 {
        let total = self.total_steps();
        if total == 0 {
            return 0;
        }
        ((self.completed_steps() * 100 / total).min(100)) as u32
    }

    /// Overwrite the current stage name.
    pub fn set_stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        log::info!(target: "stage", "[{}] {}", self.build_id, stage);
        *write_lock(&self.stage) = stage.clone();
        lock(&self.stage_history).push(stage.clone());
        self.emit(BuildEvent::StageChanged(stage));
    }

    /// Enter one of the conventional stages.
    pub fn enter(&self, stage: BuildStage) {
        self.set_stage(stage.as_str());
    }

    pub fn stage(&self) -> String {
        read_lock(&self.stage).clone()
    }

    /// Every stage name set so far, in order.
    pub fn stage_history(&self) -> Vec<String> {
        lock(&self.stage_history).clone()
    }

    pub fn record_error(&self, error: &BuildError) {
        *write_lock(&self.error) = Some(error.to_string());
    }

    pub fn error(&self) -> Option<String> {
        read_lock(&self.error).clone()
    }

    /// Store an artifact. Last writer wins.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        write_lock(&self.artifacts).insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read_lock(&self.artifacts).get(key).cloned()
    }

    /// Expose a value to callers outside the engine.
    pub fn set_external(&self, key: impl Into<String>, value: impl Into<Value>) {
        write_lock(&self.external).insert(key.into(), value.into());
    }

    pub fn get_external(&self, key: &str) -> Option<Value> {
        read_lock(&self.external).get(key).cloned()
    }

    /// Copy of every externally exposed value.
    pub fn external(&self) -> HashMap<String, Value> {
        read_lock(&self.external).clone()
    }

    pub fn put<T: Serialize>(&self, key: ArtifactKey<T>, value: &T) -> Result<()> {
        let value = to_value(key, value)?;
        self.set(key.name(), value);
        Ok(())
    }

    pub fn fetch<T: DeserializeOwned>(&self, key: ArtifactKey<T>) -> Result<Option<T>> {
        self.get(key.name()).map(|v| from_value(key, v)).transpose()
    }

    pub fn put_external<T: Serialize>(&self, key: ArtifactKey<T>, value: &T) -> Result<()> {
        let value = to_value(key, value)?;
        self.set_external(key.name(), value);
        Ok(())
    }

    pub fn fetch_external<T: DeserializeOwned>(&self, key: ArtifactKey<T>) -> Result<Option<T>> {
        self.get_external(key.name())
            .map(|v| from_value(key, v))
            .transpose()
    }

    /// Queue an action to run once when the build concludes.
    pub fn defer<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        lock(&self.deferred).push(Box::new(move || -> BoxFuture<'static, Result<()>> {
            Box::pin(action())
        }));
    }

    pub fn deferred_count(&self) -> usize {
        lock(&self.deferred).len()
    }

    /// Run every queued action in append order and empty the queue.
    ///
    /// Each action runs in its own task; its error or panic is logged and
    /// never reaches the caller or the remaining actions. Returns the number
    /// of actions that failed.
    pub async fn run_deferred(&self) -> usize {
        let actions: Vec<DeferredAction> = std::mem::take(&mut *lock(&self.deferred));
        let mut failed = 0;
        for (i, action) in actions.into_iter().enumerate() {
            match tokio::spawn(action()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    log::warn!("[{}] deferred action {} failed: {}", self.build_id, i, e);
                }
                Err(e) => {
                    failed += 1;
                    log::warn!("[{}] deferred action {} panicked: {}", self.build_id, i, e);
                }
            }
        }
        failed
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            build_id: self.build_id.clone(),
            stage: self.stage(),
            completed_steps: self.completed_steps(),
            total_steps: self.total_steps(),
            progress_percent: self.progress_percent(),
            started_at: self.started_at,
            error: self.error(),
        }
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(ref tx) = self.events {
            if let Err(e) = tx.try_send(event) {
                log::debug!("[{}] dropped build event: {}", self.build_id, e);
            }
        }
    }
}

fn to_value<T: Serialize>(key: ArtifactKey<T>, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BuildError::Artifact {
        key: key.name().to_string(),
        reason: e.to_string(),
    })
}

fn from_value<T: DeserializeOwned>(key: ArtifactKey<T>, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BuildError::Artifact {
        key: key.name().to_string(),
        reason: e.to_string(),
    })
}

// A poisoned lock only means another task panicked mid-write; the stores
// hold plain data, so keep serving them.
fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const PEERS: ArtifactKey<Vec<String>> = ArtifactKey::new("peers");

    #[test]
    fn test_stage_names_roundtrip() {
        for stage in BuildStage::pipeline() {
            assert_eq!(BuildStage::from_name(stage.as_str()), Some(*stage));
        }
        assert_eq!(BuildStage::from_name("whatever"), None);
    }

    #[test]
    fn test_progress_matches_declared_steps() {
        let state = BuildState::new("b1");
        state.set_total_steps(3);
        for _ in 0..3 {
            state.increment_progress();
        }
        assert!(state.is_complete());
        assert_eq!(state.progress_percent(), 100);
        assert_eq!(state.overrun(), None);
    }

    #[test]
    fn test_extra_increments_are_not_clamped() {
        let state = BuildState::new("b1");
        state.set_total_steps(2);
        for _ in 0..5 {
            state.increment_progress();
        }
        assert_eq!(state.completed_steps(), 5);
        assert!(!state.is_complete());
        assert_eq!(state.overrun(), Some(3));
        assert_eq!(state.progress_percent(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_all_counted() {
        let state = Arc::new(BuildState::new("b1"));
        state.set_total_steps(400);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    state.increment_progress();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(state.completed_steps(), 400);
        assert!(state.is_complete());
    }

    #[test]
    fn test_typed_artifacts() {
        let state = BuildState::new("b1");
        state
            .put(PEERS, &vec!["enode://a".to_string(), "enode://b".to_string()])
            .unwrap();
        assert_eq!(state.fetch(PEERS).unwrap().unwrap().len(), 2);

        // Same key written untyped with the wrong shape.
        state.set("peers", 42);
        assert!(matches!(
            state.fetch(PEERS),
            Err(BuildError::Artifact { .. })
        ));

        const MISSING: ArtifactKey<u64> = ArtifactKey::new("missing");
        assert_eq!(state.fetch(MISSING).unwrap(), None);
    }

    #[test]
    fn test_continuing_state_inherits_artifacts() {
        let prior = BuildState::new("b1");
        prior.set("alloc", serde_json::json!({"abc": {"balance": "1"}}));
        prior.set_external("port", 8545);
        prior.set_total_steps(10);

        let next = BuildState::continuing("b2", &prior);
        assert!(next.get("alloc").is_some());
        assert_eq!(next.get_external("port"), Some(Value::from(8545)));
        assert_eq!(next.total_steps(), 0);
        assert_eq!(next.completed_steps(), 0);
    }

    #[tokio::test]
    async fn test_stage_changes_are_emitted() {
        let (tx, mut rx) = mpsc::channel(16);
        let state = BuildState::new("b1").with_events(tx);
        state.enter(BuildStage::DistributingSecrets);
        state.set_total_steps(1);
        state.increment_progress();

        assert_eq!(
            rx.recv().await,
            Some(BuildEvent::StageChanged("Distributing secrets".to_string()))
        );
        assert_eq!(
            rx.recv().await,
            Some(BuildEvent::Progress {
                completed: 0,
                total: 1
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(BuildEvent::Progress {
                completed: 1,
                total: 1
            })
        );
        assert_eq!(state.stage_history(), vec!["Distributing secrets"]);
    }

    #[tokio::test]
    async fn test_full_or_closed_event_channel_never_blocks_the_build() {
        let (tx, mut rx) = mpsc::channel(1);
        let state = BuildState::new("b1").with_events(tx);
        state.set_stage("first");
        state.set_stage("second");

        assert_eq!(rx.recv().await, Some(BuildEvent::StageChanged("first".to_string())));
        assert!(rx.try_recv().is_err());
        assert_eq!(state.stage_history(), vec!["first", "second"]);

        drop(rx);
        state.set_stage("third");
        assert_eq!(state.stage(), "third");
    }

    #[tokio::test]
    async fn test_deferred_actions_run_in_order_and_isolate_failures() {
        let state = BuildState::new("b1");
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            state.defer(move || async move {
                order.lock().unwrap().push(name);
                if name == "B" {
                    return Err(BuildError::Config("B failed".to_string()));
                }
                Ok(())
            });
        }
        let panicking = Arc::clone(&order);
        state.defer(move || async move {
            panicking.lock().unwrap().push("D");
            if panicking.lock().unwrap().len() == 4 {
                panic!("deferred panic");
            }
            Ok(())
        });

        assert_eq!(state.run_deferred().await, 2);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C", "D"]);

        // The queue is drained: a second run invokes nothing.
        assert_eq!(state.run_deferred().await, 0);
        assert_eq!(order.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_snapshot_serializes() {
        let state = BuildState::new("b1");
        state.set_total_steps(4);
        state.increment_progress();
        state.enter(BuildStage::CreatingGenesis);
        let snap = state.snapshot();
        assert_eq!(snap.progress_percent, 25);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("Creating the genesis block"));
    }
}
