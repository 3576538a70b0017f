//! Core data structures: networks, nodes, parameters and key pairs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{BuildError, Result};
use crate::remote::RemoteExecutor;

/// Identifier of a host connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(pub String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        HostId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One participant of a network.
///
/// The absolute index is assigned when the node joins the network and is never
/// reused or reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub absolute_index: usize,
    pub address: String,
    pub host: HostId,
}

impl Node {
    /// Container name for this node under the given prefix, e.g. `ledgerforge-node3`.
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.absolute_index)
    }
}

/// Per-family configuration values for a build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Network family identifier
    pub family: String,

    /// Number of nodes requested
    pub nodes: usize,

    /// Arbitrary per-family values
    #[serde(default)]
    pub values: Map<String, Value>,
}

impl ParameterSet {
    pub fn new(family: impl Into<String>, nodes: usize) -> Self {
        ParameterSet {
            family: family.into(),
            nodes,
            values: Map::new(),
        }
    }

    /// Builder-style setter for a single value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Fill in every default the user did not set.
    pub fn with_defaults(&self, defaults: &ParameterSet) -> ParameterSet {
        let mut merged = defaults.values.clone();
        for (key, value) in &self.values {
            merged.insert(key.clone(), value.clone());
        }
        ParameterSet {
            family: self.family.clone(),
            nodes: self.nodes,
            values: merged,
        }
    }

    /// Decode the values into a family's typed configuration.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.values.clone())).map_err(|e| {
            let err = BuildError::Config(format!(
                "invalid parameters for {}: {}",
                self.family, e
            ));
            log::error!("{}", err);
            err
        })
    }
}

/// A private/public key pair handed out by the key pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// The set of nodes under one build or add-node operation.
///
/// Owned by the driver; strategies only read it.
#[derive(Clone)]
pub struct Network {
    nodes: Vec<Node>,
    hosts: HashMap<HostId, Arc<dyn RemoteExecutor>>,
    params: ParameterSet,
    /// Absolute indices of nodes introduced by the pending add-node operation
    pending: Vec<usize>,
}

impl Network {
    pub fn new(params: ParameterSet) -> Self {
        Network {
            nodes: Vec::new(),
            hosts: HashMap::new(),
            params,
            pending: Vec::new(),
        }
    }

    /// Attach a host connection; nodes reference it by `executor.host()`.
    pub fn add_host(&mut self, executor: Arc<dyn RemoteExecutor>) {
        self.hosts.insert(executor.host().clone(), executor);
    }

    /// Append a node for the initial build and return its absolute index.
    pub fn push_node(&mut self, address: impl Into<String>, host: HostId) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            absolute_index: index,
            address: address.into(),
            host,
        });
        index
    }

    /// Append a node as part of a pending add-node operation.
    pub fn add_node(&mut self, address: impl Into<String>, host: HostId) -> usize {
        let index = self.push_node(address, host);
        self.pending.push(index);
        index
    }

    /// Mark the pending add-node operation as finished.
    pub fn commit_new_nodes(&mut self) {
        self.pending.clear();
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Nodes introduced by the pending add-node operation, by absolute index.
    pub fn new_nodes(&self) -> Vec<&Node> {
        self.pending.iter().map(|&i| &self.nodes[i]).collect()
    }

    /// Nodes that existed before the pending add-node operation.
    pub fn prior_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| !self.pending.contains(&n.absolute_index))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn host_for(&self, node: &Node) -> Option<Arc<dyn RemoteExecutor>> {
        self.hosts.get(&node.host).cloned()
    }

    pub fn host(&self, id: &HostId) -> Option<Arc<dyn RemoteExecutor>> {
        self.hosts.get(id).cloned()
    }

    /// Every connected host carrying at least one node, once each, ordered by id.
    pub fn node_hosts(&self) -> Vec<Arc<dyn RemoteExecutor>> {
        let mut ids: Vec<&HostId> = self.nodes.iter().map(|n| &n.host).collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().filter_map(|id| self.hosts.get(id).cloned()).collect()
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn set_params(&mut self, params: ParameterSet) {
        self.params = params;
    }

    pub fn family(&self) -> &str {
        &self.params.family
    }
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hosts: Vec<&HostId> = self.hosts.keys().collect();
        hosts.sort();
        f.debug_struct("Network")
            .field("family", &self.params.family)
            .field("nodes", &self.nodes)
            .field("hosts", &hosts)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Host entry of a network description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    pub id: HostId,
}

/// Node entry of a network description file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub address: String,
    pub host: HostId,
}

/// JSON description of a network for the command-line driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub family: String,
    pub hosts: Vec<HostSpec>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl NetworkSpec {
    pub fn parameter_set(&self) -> ParameterSet {
        ParameterSet {
            family: self.family.clone(),
            nodes: self.nodes.len(),
            values: self.params.clone(),
        }
    }
}
