//! Process-local registries for strategies and host components.
//!
//! Dynamic import from the wire becomes plugin activation here: user crates
//! link factories under a name at host startup, and the core's
//! `register_strategy {name, import_path}` activates the linked factory.
//! The `import_path` stays on the wire unchanged and is recorded as
//! provenance; only the loader differs from a dynamic-import runtime.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kuix_proto::{ErrorKind, KuixError};
use serde_json::Value;
use tracing::trace;

use crate::component::{HostComponent, HostComponentFactory};
use crate::strategy::{DebugStrategy, Strategy, StrategyFactory};

struct ActiveStrategy {
    factory: Arc<dyn StrategyFactory>,
    import_path: String,
}

/// Strategy factories: `linked` is what the binary compiled in, `active` is
/// what the core has registered for use.
#[derive(Default)]
pub struct StrategyRegistry {
    linked: RwLock<HashMap<String, Arc<dyn StrategyFactory>>>,
    active: RwLock<HashMap<String, ActiveStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a factory available for activation under `name`.
    pub fn link(&self, name: impl Into<String>, factory: impl StrategyFactory + 'static) {
        let name = name.into();
        trace!(strategy = %name, "strategy factory linked");
        self.linked.write().unwrap().insert(name, Arc::new(factory));
    }

    /// Activate a linked factory; the loader's equivalent of a dynamic
    /// import. Unknown names fail the way a missing module would.
    pub fn activate(&self, name: &str, import_path: &str) -> Result<(), KuixError> {
        let factory = self.linked.read().unwrap().get(name).cloned().ok_or_else(|| {
            KuixError::new(
                ErrorKind::StrategyImportError,
                format!("unable to load strategy '{name}' from '{import_path}': no such strategy is linked into this host"),
            )
        })?;
        self.active.write().unwrap().insert(
            name.to_owned(),
            ActiveStrategy {
                factory,
                import_path: import_path.to_owned(),
            },
        );
        trace!(strategy = %name, %import_path, "strategy registered");
        Ok(())
    }

    /// Build a worker's strategy instance from an active factory.
    pub fn build(
        &self,
        strategy_name: &str,
        worker_id: &str,
        config: Value,
    ) -> Result<Box<dyn Strategy>, KuixError> {
        let factory = {
            let active = self.active.read().unwrap();
            let entry = active.get(strategy_name).ok_or_else(|| {
                KuixError::new(
                    ErrorKind::StrategyNotFoundError,
                    format!("strategy '{strategy_name}' not found"),
                )
            })?;
            Arc::clone(&entry.factory)
        };
        factory.build(worker_id, config).map_err(|e| {
            KuixError::wrap(
                ErrorKind::WorkerInitError,
                format!("worker '{worker_id}' failed to init from strategy '{strategy_name}'"),
                e,
            )
        })
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.read().unwrap().contains_key(name)
    }

    pub fn import_path(&self, name: &str) -> Option<String> {
        self.active
            .read()
            .unwrap()
            .get(name)
            .map(|entry| entry.import_path.clone())
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active.read().unwrap().keys().cloned().collect()
    }
}

/// Host-component factories, linked the same way strategies are.
#[derive(Default)]
pub struct ComponentRegistry {
    linked: RwLock<HashMap<String, Arc<dyn HostComponentFactory>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, name: impl Into<String>, factory: impl HostComponentFactory + 'static) {
        let name = name.into();
        trace!(component = %name, "component factory linked");
        self.linked.write().unwrap().insert(name, Arc::new(factory));
    }

    /// Instantiate a linked component with its config.
    pub fn build(
        &self,
        name: &str,
        import_path: &str,
        config: Value,
    ) -> Result<Box<dyn HostComponent>, KuixError> {
        let factory = self.linked.read().unwrap().get(name).cloned().ok_or_else(|| {
            KuixError::new(
                ErrorKind::ComponentImportError,
                format!("unable to load component '{name}' from '{import_path}': no such component is linked into this host"),
            )
        })?;
        factory.build(config).map_err(|e| {
            KuixError::wrap(
                ErrorKind::ComponentInitError,
                format!("unable to init component '{name}'"),
                e,
            )
        })
    }
}

/// Link the built-in registrations every host starts with.
pub fn install_defaults(registry: &StrategyRegistry) {
    registry.link(
        DebugStrategy::NAME,
        |identifier: &str, config: Value| -> anyhow::Result<Box<dyn Strategy>> {
            Ok(Box::new(DebugStrategy::new(identifier, config)))
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_requires_a_linked_factory() {
        let registry = StrategyRegistry::new();
        let err = registry.activate("Ghost", "/path/Ghost.py").unwrap_err();
        assert!(err.is(ErrorKind::StrategyImportError));

        install_defaults(&registry);
        registry.activate("Debug", "/path/Debug.py").unwrap();
        assert!(registry.is_active("Debug"));
        assert_eq!(registry.import_path("Debug").as_deref(), Some("/path/Debug.py"));
    }

    #[test]
    fn build_requires_activation() {
        let registry = StrategyRegistry::new();
        install_defaults(&registry);

        let err = registry
            .build("Debug", "W1", serde_json::json!({}))
            .unwrap_err();
        assert!(err.is(ErrorKind::StrategyNotFoundError));

        registry.activate("Debug", "/path/Debug.py").unwrap();
        registry.build("Debug", "W1", serde_json::json!({})).unwrap();
    }

    #[test]
    fn factory_failure_becomes_worker_init_error() {
        let registry = StrategyRegistry::new();
        registry.link(
            "Broken",
            |_id: &str, _config: Value| -> anyhow::Result<Box<dyn Strategy>> {
                anyhow::bail!("ctor exploded")
            },
        );
        registry.activate("Broken", "/x").unwrap();

        let err = registry.build("Broken", "W1", serde_json::json!({})).unwrap_err();
        assert!(err.is(ErrorKind::WorkerInitError));
        assert!(err.chain_contains("ctor exploded"));
    }

    #[test]
    fn unknown_component_is_an_import_error() {
        let registry = ComponentRegistry::new();
        let err = registry
            .build("Ghost", "/x", serde_json::json!({}))
            .unwrap_err();
        assert!(err.is(ErrorKind::ComponentImportError));
    }
}
