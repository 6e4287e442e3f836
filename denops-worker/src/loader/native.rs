//! Plugins linked into the host binary

use super::{LoaderError, ModuleLocator, ModuleLoader, PluginModule};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

type ModuleFactory = Arc<dyn Fn() -> Arc<dyn PluginModule> + Send + Sync>;

/// Loader resolving URLs to in-process module factories
///
/// The factory runs on every load, so each load gets a new instance.
#[derive(Default, Clone)]
pub struct StaticModuleLoader {
    factories: HashMap<String, ModuleFactory>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `url`
    pub fn with_module<F, M>(mut self, url: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: PluginModule + 'static,
    {
        self.factories.insert(
            url.into(),
            Arc::new(move || Arc::new(factory()) as Arc<dyn PluginModule>),
        );
        self
    }

    pub fn contains(&self, url: &str) -> bool {
        self.factories.contains_key(url)
    }
}

#[async_trait]
impl ModuleLoader for StaticModuleLoader {
    async fn load(&self, locator: &ModuleLocator) -> Result<Arc<dyn PluginModule>, LoaderError> {
        let factory = self
            .factories
            .get(&locator.url)
            .ok_or_else(|| LoaderError::UnknownModule(locator.url.clone()))?;
        Ok(factory())
    }
}
