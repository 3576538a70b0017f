//! Scripted in-memory `RemoteExecutor` shared by the integration tests.

#![allow(dead_code)]

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ledgerforge::{HostId, KeyPair, KeyPool, Network, Node, ParameterSet, RemoteError, RemoteExecutor};

/// One command seen by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    /// Absolute index of the node for `exec`, `None` for host-level `run`
    pub node: Option<usize>,
    pub command: String,
}

type Responder = Box<dyn Fn(Option<&Node>, u32) -> Result<String, RemoteError> + Send + Sync>;

/// Records every command and answers from scripted rules.
///
/// The first rule whose pattern occurs in the command decides the response;
/// it also receives how many times it matched before. Unmatched commands
/// succeed with empty output.
pub struct RecordingExecutor {
    host: HostId,
    rules: Vec<(String, Responder)>,
    hits: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<Recorded>>,
}

impl RecordingExecutor {
    pub fn new(host: &str) -> Self {
        RecordingExecutor {
            host: HostId::new(host),
            rules: Vec::new(),
            hits: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn respond<F>(mut self, pattern: &str, responder: F) -> Self
    where
        F: Fn(Option<&Node>, u32) -> Result<String, RemoteError> + Send + Sync + 'static,
    {
        self.rules.push((pattern.to_string(), Box::new(responder)));
        self
    }

    /// Answer geth's enode query with a distinct enode per node.
    pub fn with_geth(self) -> Self {
        self.respond("admin.nodeInfo.enode", |node, _| {
            let index = node.map(|n| n.absolute_index).unwrap_or_default();
            Ok(format!("\"enode://{:08x}@[::]:30303?discport=0\"\n", index + 1))
        })
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    pub fn matching(&self, pattern: &str) -> Vec<Recorded> {
        self.recorded()
            .into_iter()
            .filter(|r| r.command.contains(pattern))
            .collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }

    fn answer(&self, node: Option<&Node>, command: &str) -> Result<String, RemoteError> {
        self.log.lock().unwrap().push(Recorded {
            node: node.map(|n| n.absolute_index),
            command: command.to_string(),
        });
        for (pattern, responder) in &self.rules {
            if command.contains(pattern.as_str()) {
                let seen = {
                    let mut hits = self.hits.lock().unwrap();
                    let count = hits.entry(pattern.clone()).or_insert(0);
                    let seen = *count;
                    *count += 1;
                    seen
                };
                return responder(node, seen);
            }
        }
        Ok(String::new())
    }
}

impl RemoteExecutor for RecordingExecutor {
    fn host(&self) -> &HostId {
        &self.host
    }

    fn run<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<String, RemoteError>> {
        Box::pin(async move { self.answer(None, command) })
    }

    fn exec<'a>(&'a self, node: &'a Node, command: &'a str) -> BoxFuture<'a, Result<String, RemoteError>> {
        Box::pin(async move { self.answer(Some(node), command) })
    }
}

pub fn transport_error(reason: &str) -> RemoteError {
    RemoteError::Transport {
        host: "h0".to_string(),
        reason: reason.to_string(),
    }
}

/// A network of `n` nodes on one host, addressed 10.0.0.2 upwards.
pub fn network(family: &str, n: usize, host: Arc<RecordingExecutor>) -> Network {
    let mut network = Network::new(ParameterSet::new(family, n));
    let id = host.host().clone();
    network.add_host(host);
    for i in 0..n {
        network.push_node(format!("10.0.0.{}", i + 2), id.clone());
    }
    network
}

pub fn key_pool(size: usize) -> KeyPool {
    let pairs: Vec<KeyPair> = (0..size)
        .map(|i| KeyPair {
            private_key: format!("{:064x}", i + 1),
            public_key: format!("0x{:040x}", i + 1),
        })
        .collect();
    KeyPool::new(
        pairs.iter().map(|p| p.private_key.clone()).collect(),
        pairs.iter().map(|p| p.public_key.clone()).collect(),
    )
    .unwrap()
}
