use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;
use super::backends::StubBackend;
use crate::config::DetectorSettings;

/// Builds a fresh backend instance for one stream session.
pub type BackendFactory = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Thread-safe registry of detector backend factories.
///
/// Backends take `&mut self` in `detect`, so each stream gets its own instance
/// instead of sharing one behind a lock.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with the built-in backends, defaulting to the configured one.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));

        #[cfg(feature = "backend-tract")]
        {
            let model_path = settings.model_path.clone();
            let (width, height) = (settings.input_width, settings.input_height);
            registry.register("tract", move || {
                let backend = super::backends::TractBackend::new(&model_path, width, height)?;
                Ok(Box::new(backend))
            });
        }

        registry.set_default(&settings.backend)?;
        Ok(registry)
    }

    /// Register a factory. The first registered backend becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!(
                "detector backend '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Build a backend by name.
    pub fn create(&self, name: &str) -> Result<Box<dyn DetectorBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow!("detector backend '{}' not registered", name))?;
        let mut backend = factory()?;
        backend.warm_up()?;
        Ok(backend)
    }

    /// Build the default backend.
    pub fn create_default(&self) -> Result<Box<dyn DetectorBackend>> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        self.create(name)
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedBackend;

    #[test]
    fn first_registered_is_default() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register("scripted", || Ok(Box::new(ScriptedBackend::new(Vec::new()))));
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        assert_eq!(registry.default_name(), Some("scripted"));
        assert_eq!(registry.create_default()?.name(), "scripted");

        registry.set_default("stub")?;
        assert_eq!(registry.create_default()?.name(), "stub");
        Ok(())
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut registry = BackendRegistry::new();
        registry.register("stub", || Ok(Box::new(StubBackend::new())));
        assert!(registry.set_default("yolo").is_err());
        assert!(registry.create("yolo").is_err());
        assert_eq!(registry.list(), vec!["stub".to_string()]);
    }
}
