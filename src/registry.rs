//! Build strategy registry.
//!
//! Maps a network family identifier to the strategy that knows how to build
//! it. The registry is an owned value: the process entry point populates it
//! through explicit registration calls and hands it to the build driver.
//! Nothing is ever unregistered.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{BuildError, RegistryError, Result};
use crate::models::{Network, ParameterSet};
use crate::orchestrator::BuildContext;
use crate::services::Service;

/// The pluggable build logic of one network family.
pub trait BuildStrategy: Send + Sync {
    /// Canonical family identifier.
    fn name(&self) -> &str;

    /// Provision and configure a fresh network.
    fn build<'a>(&'a self, ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>>;

    /// Extend an existing network with its pending new nodes.
    fn add_nodes<'a>(&'a self, ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>>;

    /// Default parameter values.
    fn defaults(&self) -> ParameterSet;

    /// Accepted parameters and their types.
    fn params_schema(&self) -> ParamSchema;

    /// Auxiliary containers the deployment layer runs alongside the network.
    fn services(&self) -> Vec<Service> {
        Vec::new()
    }

    /// Families whose nodes should run as sidecars of this network.
    fn sidecars(&self, _network: &Network) -> Vec<String> {
        Vec::new()
    }
}

/// JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamField {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Parameters a family accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSchema {
    pub fields: Vec<ParamField>,
}

impl ParamSchema {
    pub fn field(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.fields.push(ParamField {
            name: name.to_string(),
            kind,
            description: description.to_string(),
        });
        self
    }

    /// Reject unknown parameters and values of the wrong type.
    pub fn validate(&self, params: &ParameterSet) -> Result<()> {
        for (key, value) in &params.values {
            let Some(field) = self.fields.iter().find(|f| &f.name == key) else {
                return Err(config_error(format!(
                    "unknown parameter '{}' for {}",
                    key, params.family
                )));
            };
            if !field.kind.matches(value) {
                return Err(config_error(format!(
                    "parameter '{}' must be {:?}, got {}",
                    key, field.kind, value
                )));
            }
        }
        Ok(())
    }
}

fn config_error(msg: String) -> BuildError {
    log::error!("{}", msg);
    BuildError::Config(msg)
}

/// Family identifier → build strategy.
#[derive(Default)]
pub struct StrategyRegistry {
    entries: RwLock<HashMap<String, Arc<dyn BuildStrategy>>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a strategy under `id`. Re-registering an id overwrites it.
    pub fn register(&self, id: impl Into<String>, strategy: Arc<dyn BuildStrategy>) {
        let id = id.into();
        log::debug!("registered build strategy '{}'", id);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, strategy);
    }

    /// Register `alias` as another name for the strategy behind `target`.
    pub fn register_alias(&self, alias: &str, target: &str) -> std::result::Result<(), RegistryError> {
        let strategy = self.lookup(target).ok_or_else(|| RegistryError::AliasTargetMissing {
            alias: alias.to_string(),
            target: target.to_string(),
        })?;
        self.register(alias, strategy);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<dyn BuildStrategy>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Like `lookup`, with an unknown id reported as an error.
    pub fn require(&self, id: &str) -> std::result::Result<Arc<dyn BuildStrategy>, RegistryError> {
        self.lookup(id).ok_or_else(|| {
            let err = RegistryError::UnknownFamily(id.to_string());
            log::error!("{}", err);
            err
        })
    }

    /// Every registered identifier, aliases included, sorted.
    pub fn families(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Noop;

    impl BuildStrategy for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn build<'a>(&'a self, _ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn add_nodes<'a>(&'a self, _ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn defaults(&self) -> ParameterSet {
            ParameterSet::new("noop", 0)
        }

        fn params_schema(&self) -> ParamSchema {
            ParamSchema::default()
                .field("networkId", ParamKind::Integer, "chain id")
                .field("consensus", ParamKind::String, "")
        }
    }

    #[test]
    fn test_alias_resolves_to_identical_strategy() {
        let registry = StrategyRegistry::new();
        let strategy: Arc<dyn BuildStrategy> = Arc::new(Noop);
        registry.register("X", Arc::clone(&strategy));
        registry.register("Y", Arc::clone(&strategy));

        let x = registry.lookup("X").unwrap();
        let y = registry.lookup("Y").unwrap();
        assert!(Arc::ptr_eq(&x, &y));
        assert!(Arc::ptr_eq(&x, &strategy));
    }

    #[test]
    fn test_register_alias_requires_target() {
        let registry = StrategyRegistry::new();
        assert!(matches!(
            registry.register_alias("etc", "ethclassic"),
            Err(RegistryError::AliasTargetMissing { .. })
        ));
        registry.register("ethclassic", Arc::new(Noop));
        registry.register_alias("etc", "ethclassic").unwrap();
        assert_eq!(registry.families(), vec!["etc", "ethclassic"]);
    }

    #[test]
    fn test_unknown_family_is_not_found() {
        let registry = StrategyRegistry::new();
        assert!(registry.lookup("nope").is_none());
        assert_eq!(
            registry.require("nope").err(),
            Some(RegistryError::UnknownFamily("nope".to_string()))
        );
    }

    #[test]
    fn test_reregistering_overwrites() {
        let registry = StrategyRegistry::new();
        let first: Arc<dyn BuildStrategy> = Arc::new(Noop);
        let second: Arc<dyn BuildStrategy> = Arc::new(Noop);
        registry.register("X", Arc::clone(&first));
        registry.register("X", Arc::clone(&second));
        assert!(Arc::ptr_eq(&registry.lookup("X").unwrap(), &second));
    }

    #[test]
    fn test_schema_validation() {
        let schema = Noop.params_schema();
        let ok = ParameterSet::new("noop", 1)
            .with("networkId", 7)
            .with("consensus", "poa");
        assert!(schema.validate(&ok).is_ok());

        let unknown = ParameterSet::new("noop", 1).with("gasPrice", 1);
        assert!(matches!(schema.validate(&unknown), Err(BuildError::Config(_))));

        let wrong_type = ParameterSet::new("noop", 1).with("networkId", json!("seven"));
        assert!(matches!(schema.validate(&wrong_type), Err(BuildError::Config(_))));
    }
}
