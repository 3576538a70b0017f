//! ledgerforge
//!
//! Build orchestration for multi-node distributed-ledger test networks. The
//! engine drives each host through remote commands, tracks build progress and
//! dispatches to a pluggable strategy per network family.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Networks, nodes, parameters and key pairs
//! - **remote**: Remote command boundary and the local docker executor
//! - **keys**: Static key pool with a generator fallback
//! - **registry**: Family identifier to build strategy mapping
//! - **render**: Per-node configuration templating
//! - **services**: Auxiliary service declarations
//! - **orchestrator**: Build driver, node executor, retry and build state
//! - **families**: Bundled network families
//! - **config**: Engine configuration loading
//! - **log_collector**: Disk-backed `log` backend

// Core foundational modules
pub mod error;
pub mod models;

// Collaborator boundaries
pub mod remote;
pub mod render;
pub mod services;

pub mod keys;
pub mod registry;

// Build orchestration utilities and state management
pub mod orchestrator;

pub mod families;

pub mod config;

// Disk-backed logging backend
pub mod log_collector;

// Re-export the log crate for macro usage
pub use log;

pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use error::{BuildError, ConfigError, KeyPoolError, RegistryError, RemoteError, Result};

pub use models::{HostId, KeyPair, Network, NetworkSpec, Node, ParameterSet};

pub use remote::{LocalExecutor, RemoteExecutor};

pub use keys::KeyPool;

pub use registry::{BuildStrategy, ParamKind, ParamSchema, StrategyRegistry};

pub use render::{ConfigRenderer, TemplateRenderer};

pub use services::Service;

pub use config::EngineConfig;

pub use orchestrator::{
    ArtifactKey, BuildContext, BuildDriver, BuildEvent, BuildOutcome, BuildStage, BuildState,
    FailurePolicy, NodeSelection, RetryPolicy,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
