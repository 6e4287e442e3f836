//! Plugin module loading
//!
//! There is no module cache. [`FreshLoader`] stamps every load with a new
//! generation, and every [`ModuleLoader`] must return a new instance for each
//! call, so a reload always runs the current source with a clean state.

mod native;
pub mod wasm;

pub use native::StaticModuleLoader;
pub use wasm::WasmModuleLoader;

use crate::denops::Denops;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while loading a plugin module
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

/// A loaded plugin, ready to run
#[async_trait]
pub trait PluginModule: Send + Sync {
    /// Plugin entry point
    async fn main(&self, denops: Arc<dyn Denops>) -> anyhow::Result<()>;
}

/// Produces plugin module instances
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Load a new instance of the module at `locator`
    async fn load(&self, locator: &ModuleLocator) -> Result<Arc<dyn PluginModule>, LoaderError>;
}

/// Module URL plus the generation that makes a load unique
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleLocator {
    pub url: String,
    pub generation: u64,
}

impl ModuleLocator {
    pub fn new(url: impl Into<String>, generation: u64) -> Self {
        Self {
            url: url.into(),
            generation,
        }
    }

    /// Local path of a `file://` URL (plain paths pass through)
    pub fn to_path(&self) -> PathBuf {
        PathBuf::from(self.url.strip_prefix("file://").unwrap_or(&self.url))
    }
}

impl fmt::Display for ModuleLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.url, self.generation)
    }
}

/// A loaded module together with the locator it was loaded from
#[derive(Clone)]
pub struct ModuleHandle {
    locator: ModuleLocator,
    module: Arc<dyn PluginModule>,
}

impl ModuleHandle {
    pub fn locator(&self) -> &ModuleLocator {
        &self.locator
    }

    pub fn module(&self) -> Arc<dyn PluginModule> {
        self.module.clone()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}

/// Loader front-end that never reuses a previous load
pub struct FreshLoader {
    loader: Arc<dyn ModuleLoader>,
    generation: AtomicU64,
}

impl FreshLoader {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            generation: AtomicU64::new(0),
        }
    }

    /// Load `url` under a new generation
    pub async fn load(&self, url: &str) -> Result<ModuleHandle, LoaderError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let locator = ModuleLocator::new(url, generation);

        let module = self.loader.load(&locator).await?;
        tracing::debug!(module = %locator, "Module loaded");
        Ok(ModuleHandle { locator, module })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_path() {
        assert_eq!(
            ModuleLocator::new("file:///plugins/foo.wasm", 1).to_path(),
            PathBuf::from("/plugins/foo.wasm")
        );
        assert_eq!(
            ModuleLocator::new("plugins/foo.wasm", 1).to_path(),
            PathBuf::from("plugins/foo.wasm")
        );
        assert_eq!(
            ModuleLocator::new("file:///p.wasm", 3).to_string(),
            "file:///p.wasm#3"
        );
    }

    #[tokio::test]
    async fn test_generations_are_unique() {
        let loader = FreshLoader::new(Arc::new(StaticModuleLoader::new()));
        let err = loader.load("static:missing").await.unwrap_err();
        assert!(matches!(err, LoaderError::UnknownModule(_)));

        // Failed loads still consume a generation
        assert_eq!(loader.generation.load(Ordering::SeqCst), 1);
    }
}
