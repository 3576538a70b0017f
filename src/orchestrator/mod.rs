//! Build orchestration: the driver that runs a family's strategy against a
//! network, plus the engine primitives strategies are built from.
//!
//! A build goes through the same steps regardless of family:
//!
//! 1. Look up the family's strategy in the registry
//! 2. Merge the family defaults under the user parameters and validate them
//! 3. Create a `BuildState` for the operation
//! 4. Run the strategy, bounded by the optional deadline and the cancel signal
//! 5. On failure record the error and mark the build `Failed`
//! 6. Run every deferred action exactly once, success or failure
//!
//! Strategies receive a `BuildContext` that bundles the network with the
//! executor, retry and key-pool handles they need.

pub mod executor;
pub mod retry;
pub mod state;

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

pub use executor::{for_each_node, map_nodes, select_nodes, FailurePolicy, NodeSelection};
pub use retry::{exec_retrying, retry_until_success, run_retrying, RetryPolicy};
pub use state::{ArtifactKey, BuildEvent, BuildStage, BuildState, ProgressSnapshot};

use crate::config::EngineConfig;
use crate::error::{BuildError, Result};
use crate::keys::KeyPool;
use crate::models::{Network, Node, ParameterSet};
use crate::registry::{BuildStrategy, StrategyRegistry};
use crate::remote::RemoteExecutor;
use crate::render::{ConfigRenderer, TemplateRenderer};

static BUILD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Everything a strategy needs while building one network.
pub struct BuildContext<'a> {
    pub network: &'a Network,
    pub state: Arc<BuildState>,

    /// Family defaults merged under the user's parameters
    pub params: ParameterSet,

    pub retry: RetryPolicy,
    pub failure_policy: FailurePolicy,
    pub cancel: watch::Receiver<bool>,
    pub renderer: Arc<dyn ConfigRenderer>,

    /// Shared by every node task; lock it around each key-pool call
    pub key_pool: Arc<Mutex<KeyPool>>,

    pub peering_delay: Duration,
    pub container_prefix: String,
}

impl<'a> BuildContext<'a> {
    /// Run `work` on the selected nodes under this build's failure policy
    /// and cancel signal.
    pub async fn for_nodes<F, Fut>(&self, selection: NodeSelection, work: F) -> Result<()>
    where
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        for_each_node(self.network, selection, self.failure_policy, &self.cancel, work).await
    }

    /// Like `for_nodes`, collecting one value per node in absolute-index order.
    pub async fn map_selected<T, F, Fut>(&self, selection: NodeSelection, work: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        map_nodes(self.network, selection, self.failure_policy, &self.cancel, work).await
    }

    /// Run `work` on every node of the network.
    pub async fn all_nodes<F, Fut>(&self, work: F) -> Result<()>
    where
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.for_nodes(NodeSelection::All, work).await
    }

    /// Run `work` on the nodes the pending add-node operation introduced.
    pub async fn new_nodes<F, Fut>(&self, work: F) -> Result<()>
    where
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.for_nodes(NodeSelection::NewlyAdded, work).await
    }

    pub async fn map_all_nodes<T, F, Fut>(&self, work: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.map_selected(NodeSelection::All, work).await
    }

    pub async fn map_new_nodes<T, F, Fut>(&self, work: F) -> Result<Vec<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.map_selected(NodeSelection::NewlyAdded, work).await
    }

    pub async fn run_retrying(&self, host: &Arc<dyn RemoteExecutor>, command: &str) -> Result<String> {
        run_retrying(host, command, self.retry, &self.cancel).await
    }

    pub async fn exec_retrying(
        &self,
        host: &Arc<dyn RemoteExecutor>,
        node: &Node,
        command: &str,
    ) -> Result<String> {
        exec_retrying(host, node, command, self.retry, &self.cancel).await
    }

    /// Sleep for `duration` unless the build is cancelled first.
    pub async fn pause(&self, duration: Duration) -> Result<()> {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = retry::cancelled(&mut cancel) => Err(BuildError::Cancelled),
        }
    }
}

/// Result of a build or add-node operation together with its state.
///
/// The state is returned even on failure: its step counters and recorded
/// error describe how far the build got.
pub struct BuildOutcome {
    pub state: Arc<BuildState>,
    pub result: Result<()>,
}

impl BuildOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<Arc<BuildState>> {
        self.result.map(|_| self.state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Build,
    AddNodes,
}

/// Drives builds for every registered family.
pub struct BuildDriver {
    registry: Arc<StrategyRegistry>,
    config: EngineConfig,
    cancel_rx: watch::Receiver<bool>,
    events: Option<mpsc::Sender<BuildEvent>>,
    key_pool: Option<Arc<Mutex<KeyPool>>>,
    renderer: Arc<dyn ConfigRenderer>,
}

impl BuildDriver {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        config: EngineConfig,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        BuildDriver {
            registry,
            config,
            cancel_rx,
            events: None,
            key_pool: None,
            renderer: Arc::new(TemplateRenderer),
        }
    }

    /// Forward progress and stage events of every build to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<BuildEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Use `pool` for every build instead of loading one per family from
    /// the configured key-pool directory.
    pub fn with_key_pool(mut self, pool: KeyPool) -> Self {
        self.key_pool = Some(Arc::new(Mutex::new(pool)));
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Provision and configure a fresh network.
    pub async fn build(&self, network: &Network) -> BuildOutcome {
        let state = Arc::new(self.attach_events(BuildState::new(next_build_id(network.family()))));
        log::info!(
            "[{}] building {} network with {} nodes",
            state.build_id(),
            network.family(),
            network.node_count()
        );
        let result = self.drive(network, &state, Operation::Build).await;
        BuildOutcome { state, result }
    }

    /// Extend a network with its pending new nodes, reusing the artifacts
    /// of the build that produced `prior`.
    ///
    /// On success the pending nodes are committed, so the next add-node
    /// operation treats them as prior nodes. A failed operation leaves them
    /// pending for a retry.
    pub async fn add_nodes(&self, network: &mut Network, prior: &BuildState) -> BuildOutcome {
        let state = Arc::new(
            self.attach_events(BuildState::continuing(next_build_id(network.family()), prior)),
        );
        log::info!(
            "[{}] adding {} nodes to {} network (continuing {})",
            state.build_id(),
            network.new_nodes().len(),
            network.family(),
            prior.build_id()
        );
        let result = self.drive(network, &state, Operation::AddNodes).await;
        if result.is_ok() {
            network.commit_new_nodes();
        }
        BuildOutcome { state, result }
    }

    async fn drive(&self, network: &Network, state: &Arc<BuildState>, op: Operation) -> Result<()> {
        let result = self.dispatch(network, state, op).await;

        if let Err(ref e) = result {
            log::error!("[{}] {:?} failed: {}", state.build_id(), op, e);
            state.record_error(e);
            state.enter(BuildStage::Failed);
        }

        let failed = state.run_deferred().await;
        if failed > 0 {
            log::warn!("[{}] {} deferred actions failed", state.build_id(), failed);
        }

        if result.is_ok() {
            state.enter(BuildStage::Completed);
            if let Some(extra) = state.overrun() {
                log::warn!(
                    "[{}] completed {} more steps than the {} declared",
                    state.build_id(),
                    extra,
                    state.total_steps()
                );
            } else if !state.is_complete() {
                log::warn!(
                    "[{}] finished with {}/{} steps completed",
                    state.build_id(),
                    state.completed_steps(),
                    state.total_steps()
                );
            }
            log::info!("[{}] {:?} completed", state.build_id(), op);
        }
        result
    }

    async fn dispatch(&self, network: &Network, state: &Arc<BuildState>, op: Operation) -> Result<()> {
        let strategy = self.registry.require(network.family())?;
        let params = network.params().with_defaults(&strategy.defaults());
        strategy.params_schema().validate(&params)?;

        let ctx = BuildContext {
            network,
            state: Arc::clone(state),
            params,
            retry: self.config.retry,
            failure_policy: self.config.failure_policy,
            cancel: self.cancel_rx.clone(),
            renderer: Arc::clone(&self.renderer),
            key_pool: self.key_pool_for(network.family())?,
            peering_delay: self.config.peering_delay(),
            container_prefix: self.config.container_prefix.clone(),
        };

        let run = run_strategy(strategy.as_ref(), &ctx, op);
        let mut cancel = self.cancel_rx.clone();
        let guarded = async {
            tokio::select! {
                result = run => result,
                _ = retry::cancelled(&mut cancel) => Err(BuildError::Cancelled),
            }
        };

        match self.config.build_timeout() {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or(Err(BuildError::TimedOut(limit))),
            None => guarded.await,
        }
    }

    fn key_pool_for(&self, family: &str) -> Result<Arc<Mutex<KeyPool>>> {
        if let Some(ref pool) = self.key_pool {
            return Ok(Arc::clone(pool));
        }
        let pool = match self.config.key_pool_dir {
            Some(ref dir) => KeyPool::from_resource_dir(dir, family)?,
            None => KeyPool::empty(),
        };
        Ok(Arc::new(Mutex::new(pool)))
    }

    fn attach_events(&self, state: BuildState) -> BuildState {
        match self.events {
            Some(ref tx) => state.with_events(tx.clone()),
            None => state,
        }
    }
}

async fn run_strategy(strategy: &dyn BuildStrategy, ctx: &BuildContext<'_>, op: Operation) -> Result<()> {
    match op {
        Operation::Build => strategy.build(ctx).await,
        Operation::AddNodes => strategy.add_nodes(ctx).await,
    }
}

fn next_build_id(family: &str) -> String {
    format!(
        "{}-{}-{}",
        family,
        Utc::now().format("%Y%m%d%H%M%S"),
        BUILD_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HostId;
    use crate::registry::ParamSchema;
    use futures::future::BoxFuture;

    struct Steps(u64);

    impl BuildStrategy for Steps {
        fn name(&self) -> &str {
            "steps"
        }

        fn build<'a>(&'a self, ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                ctx.state.set_total_steps(self.0);
                ctx.state.enter(BuildStage::DeclaringSteps);
                ctx.state.increment_progress();
                Ok(())
            })
        }

        fn add_nodes<'a>(&'a self, _ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn defaults(&self) -> ParameterSet {
            ParameterSet::new("steps", 0)
        }

        fn params_schema(&self) -> ParamSchema {
            ParamSchema::default()
        }
    }

    fn driver(registry: StrategyRegistry) -> BuildDriver {
        let (_tx, rx) = watch::channel(false);
        BuildDriver::new(Arc::new(registry), EngineConfig::default(), rx)
    }

    #[tokio::test]
    async fn test_build_marks_completed() {
        let registry = StrategyRegistry::new();
        registry.register("steps", Arc::new(Steps(1)));
        let outcome = driver(registry).build(&Network::new(ParameterSet::new("steps", 0))).await;

        assert!(outcome.is_ok());
        assert_eq!(outcome.state.stage(), BuildStage::Completed.as_str());
        assert!(outcome.state.is_complete());
        assert!(outcome.state.build_id().starts_with("steps-"));
    }

    #[tokio::test]
    async fn test_step_shortfall_is_visible_not_fatal() {
        let registry = StrategyRegistry::new();
        registry.register("steps", Arc::new(Steps(5)));
        let outcome = driver(registry).build(&Network::new(ParameterSet::new("steps", 0))).await;

        assert!(outcome.is_ok());
        assert!(!outcome.state.is_complete());
        assert_eq!(outcome.state.completed_steps(), 1);
    }

    #[tokio::test]
    async fn test_unknown_family_fails_with_state() {
        let mut network = Network::new(ParameterSet::new("nope", 1));
        network.push_node("10.0.0.1", HostId::new("h"));
        let outcome = driver(StrategyRegistry::new()).build(&network).await;

        assert_eq!(outcome.state.stage(), BuildStage::Failed.as_str());
        assert!(outcome.state.error().unwrap().contains("nope"));
        assert!(matches!(
            outcome.into_result(),
            Err(BuildError::Registry(crate::error::RegistryError::UnknownFamily(_)))
        ));
    }

    #[test]
    fn test_build_ids_are_unique() {
        assert_ne!(next_build_id("x"), next_build_id("x"));
    }
}
