//! Unified error type hierarchy for ledgerforge
//!
//! Provides structured error handling with RemoteError, KeyPoolError, RegistryError,
//! ConfigError and the umbrella BuildError every build phase returns.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Remote command execution errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Command '{command}' on host {host} exited with {status:?}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Transport failure on host {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("Remote command cancelled")]
    Cancelled,
}

/// Key pool errors.
#[derive(Error, Debug)]
pub enum KeyPoolError {
    #[error("Static key pool exhausted and no generator provided")]
    NoGenerator,

    #[error("Key pool sequences differ in length: {private} private keys, {public} public keys")]
    LengthMismatch { private: usize, public: usize },

    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Invalid key pool file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("IO error while loading key pool: {0}")]
    IoError(#[from] io::Error),
}

/// Build strategy registry errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown network family: {0}")]
    UnknownFamily(String),

    #[error("Cannot alias '{alias}': target family '{target}' is not registered")]
    AliasTargetMissing { alias: String, target: String },
}

/// Configuration file parsing and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in config: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid TOML in config: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("Could not serialize config as TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error during config operations: {0}")]
    IoError(#[from] io::Error),
}

/// One node task's failure inside an aggregated executor error.
#[derive(Debug)]
pub struct NodeFailure {
    /// Absolute index of the failing node
    pub index: usize,
    pub error: BuildError,
}

/// Build orchestration errors.
///
/// Every build phase returns this type. Node-level failures from a single
/// executor call are aggregated into `NodeTasksFailed`.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Malformed or unknown parameter
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Expected pattern absent from remote output
    #[error("Could not find {what} in output: {output}")]
    Parse { what: String, output: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryExhausted { attempts: u32, last: Box<BuildError> },

    #[error(transparent)]
    KeyPool(#[from] KeyPoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Template render failed: {0}")]
    Render(String),

    #[error("Artifact '{key}' has an unexpected type: {reason}")]
    Artifact { key: String, reason: String },

    #[error("{} of {total} node tasks failed (first: node {}: {})",
        .failures.len(),
        .failures.first().map(|f| f.index).unwrap_or_default(),
        .failures.first().map(|f| f.error.to_string()).unwrap_or_default())]
    NodeTasksFailed {
        total: usize,
        failures: Vec<NodeFailure>,
    },

    #[error("Node task panicked: {0}")]
    TaskPanicked(String),

    #[error("Build cancelled")]
    Cancelled,

    #[error("Build timed out after {0:?}")]
    TimedOut(Duration),
}

impl BuildError {
    /// Absolute indices of the nodes that failed, if this is an aggregated error.
    pub fn failed_nodes(&self) -> Vec<usize> {
        match self {
            BuildError::NodeTasksFailed { failures, .. } => {
                failures.iter().map(|f| f.index).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Whether this error (or every aggregated cause) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            BuildError::Cancelled | BuildError::Remote(RemoteError::Cancelled) => true,
            BuildError::NodeTasksFailed { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_cancelled())
            }
            _ => false,
        }
    }
}

/// Top-level result type for build operations.
pub type Result<T> = std::result::Result<T, BuildError>;
