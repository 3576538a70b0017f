//! Network families known to this build of the engine.
//!
//! Families are registered by an explicit call at process start rather than
//! as a side effect of linking them in.

pub mod ethclassic;
pub mod helpers;

use std::sync::Arc;

use crate::error::RegistryError;
use crate::registry::StrategyRegistry;

/// Register every bundled family and its aliases.
pub fn register_all(registry: &StrategyRegistry) -> Result<(), RegistryError> {
    registry.register(ethclassic::FAMILY, Arc::new(ethclassic::EthClassic));
    registry.register_alias(ethclassic::ALIAS, ethclassic::FAMILY)?;
    log::info!("registered network families: {:?}", registry.families());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all_exposes_alias() {
        let registry = StrategyRegistry::new();
        register_all(&registry).unwrap();

        let canonical = registry.lookup("ethclassic").unwrap();
        let alias = registry.lookup("etc").unwrap();
        assert!(Arc::ptr_eq(&canonical, &alias));
        assert_eq!(alias.name(), "ethclassic");
    }
}
