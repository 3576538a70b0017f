//! Concurrent node execution: one task per node, joined before returning.
//!
//! Two call shapes exist: every node of the network, or only the nodes a
//! pending add-node operation introduced. Within one call no ordering across
//! nodes is guaranteed; the call boundary itself is a barrier.
//!
//! Results are written into pre-sized slots, one per selected node, so work
//! functions never need a lock around a shared results collection.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::error::{BuildError, NodeFailure, Result};
use crate::models::{Network, Node};
use crate::orchestrator::retry::cancelled;
use crate::remote::RemoteExecutor;

/// What happens to sibling tasks once one node task fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Every dispatched task runs to completion before the call reports.
    #[default]
    RunToCompletion,
    /// Abort the remaining tasks on the first failure.
    FailFast,
}

/// Which nodes of the network a call runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSelection {
    All,
    /// Only nodes introduced by the pending add-node operation
    NewlyAdded,
}

/// The selected nodes, sorted by absolute index.
pub fn select_nodes(network: &Network, selection: NodeSelection) -> Vec<Node> {
    let mut nodes: Vec<Node> = match selection {
        NodeSelection::All => network.nodes().to_vec(),
        NodeSelection::NewlyAdded => network.new_nodes().into_iter().cloned().collect(),
    };
    nodes.sort_by_key(|n| n.absolute_index);
    nodes
}

/// Run `work` once per selected node and collect each node's result.
///
/// The returned vector holds one value per selected node in absolute-index
/// order; for `NodeSelection::All` position `i` is node `i`. If any task
/// fails the call returns `NodeTasksFailed` listing every failure.
pub async fn map_nodes<T, F, Fut>(
    network: &Network,
    selection: NodeSelection,
    policy: FailurePolicy,
    cancel: &watch::Receiver<bool>,
    work: F,
) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let nodes = select_nodes(network, selection);
    let total = nodes.len();
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    let mut failures = Vec::new();
    let mut spawned = Vec::with_capacity(total);

    log::debug!("dispatching {} node tasks ({:?})", total, selection);

    for (slot, node) in nodes.into_iter().enumerate() {
        let index = node.absolute_index;
        let Some(host) = network.host_for(&node) else {
            let error = BuildError::Config(format!(
                "node {} references unknown host {}",
                index, node.host
            ));
            log::error!("{}", error);
            failures.push(NodeFailure { index, error });
            if policy == FailurePolicy::FailFast {
                break;
            }
            continue;
        };

        let work = Arc::clone(&work);
        let mut cancel = cancel.clone();
        spawned.push((slot, index));
        tasks.spawn(async move {
            let run = AssertUnwindSafe(work(host, node)).catch_unwind();
            let result = tokio::select! {
                outcome = run => outcome.unwrap_or_else(|panic| Err(BuildError::TaskPanicked(panic_message(panic)))),
                _ = cancelled(&mut cancel) => Err(BuildError::Cancelled),
            };
            (slot, index, result)
        });
    }

    let mut slots: Vec<Option<T>> = (0..total).map(|_| None).collect();
    if policy == FailurePolicy::FailFast && !failures.is_empty() {
        tasks.abort_all();
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((slot, _, Ok(value))) => slots[slot] = Some(value),
            Ok((_, index, Err(error))) => {
                log::error!("node {} task failed: {}", index, error);
                failures.push(NodeFailure { index, error });
                if policy == FailurePolicy::FailFast {
                    tasks.abort_all();
                }
            }
            Err(e) if e.is_cancelled() && policy == FailurePolicy::FailFast => {
                log::debug!("node task aborted: {}", e)
            }
            Err(e) => log::error!("node task died before reporting: {}", e),
        }
    }

    // A task that died outside its own panic guard leaves an empty slot.
    // Aborted fail-fast siblings are already covered by the failure that
    // aborted them.
    if policy == FailurePolicy::RunToCompletion || failures.is_empty() {
        for &(slot, index) in &spawned {
            if slots[slot].is_none() && !failures.iter().any(|f| f.index == index) {
                let error = BuildError::TaskPanicked(format!("node {} task ended without a result", index));
                log::error!("{}", error);
                failures.push(NodeFailure { index, error });
            }
        }
    }

    if failures.is_empty() {
        return Ok(slots.into_iter().flatten().collect());
    }
    failures.sort_by_key(|f| f.index);
    let err = BuildError::NodeTasksFailed { total, failures };
    log::error!("{}", err);
    Err(err)
}

/// Run `work` once per selected node.
pub async fn for_each_node<F, Fut>(
    network: &Network,
    selection: NodeSelection,
    policy: FailurePolicy,
    cancel: &watch::Receiver<bool>,
    work: F,
) -> Result<()>
where
    F: Fn(Arc<dyn RemoteExecutor>, Node) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    map_nodes(network, selection, policy, cancel, work)
        .await
        .map(|_| ())
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
