//! Store registry for resolving a durable store from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::DurableStore;
use skysync_common::{Error, Result};

/// Factory function type for creating stores.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn DurableStore>> + Send + Sync>;

/// Registry for durable store factories.
///
/// Lets the application root pick a backend by name and configuration.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: StoreFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - Store not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn DurableStore>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered store names.
    pub fn stores(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in stores.
///
/// - `memory`: ignores its configuration.
/// - `local`: `{"root": "<dir>"}`, falling back to the platform data directory.
pub fn create_default_registry() -> StoreRegistry {
    let mut factories: HashMap<String, StoreFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    );

    factories.insert(
        "local".to_string(),
        Box::new(|config| {
            let root = match config.get("root") {
                Some(Value::String(root)) => std::path::PathBuf::from(root),
                Some(_) => {
                    return Err(Error::InvalidInput(
                        "Local store 'root' must be a string".to_string(),
                    ))
                }
                None => crate::local::LocalStore::default_root()?,
            };
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    );

    StoreRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let store = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryStore::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(registry.resolve("unknown", Value::Null).is_err());
    }

    #[test]
    fn test_default_registry_local_store() {
        let temp = tempfile::TempDir::new().unwrap();
        let registry = create_default_registry();
        assert!(registry.has_store("memory"));

        let store = registry
            .resolve("local", json!({ "root": temp.path().to_str().unwrap() }))
            .unwrap();
        assert_eq!(store.name(), "local");
    }

    #[test]
    fn test_local_store_rejects_non_string_root() {
        let registry = create_default_registry();
        assert!(registry.resolve("local", json!({ "root": 7 })).is_err());
    }
}
