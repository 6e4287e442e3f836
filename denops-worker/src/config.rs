//! Worker configuration

use crate::channel::DEFAULT_CHANNEL_CAPACITY;
use crate::loader::wasm::DEFAULT_FUEL_LIMIT;
use crate::loader::{FreshLoader, LoaderError, WasmModuleLoader};
use denops_worker_api::{DEFAULT_EVENT_NAMESPACE, RESPONSE_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by every worker of a host
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deadline for responses to outgoing RPC calls
    pub response_timeout: Duration,
    /// Prefix of lifecycle autocmds (`<namespace>PluginPre:<name>`)
    pub event_namespace: String,
    /// Frames buffered per direction on the worker channel
    pub channel_capacity: usize,
    /// Fuel given to a Wasm plugin's entry point
    pub fuel_limit: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
            event_namespace: DEFAULT_EVENT_NAMESPACE.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            fuel_limit: DEFAULT_FUEL_LIMIT,
        }
    }
}

impl WorkerConfig {
    /// Loader for Wasm plugins honoring `fuel_limit`
    ///
    /// Share the result between all workers of one plugin so reloads get new
    /// generations.
    pub fn wasm_loader(&self) -> Result<Arc<FreshLoader>, LoaderError> {
        let loader = WasmModuleLoader::new(self.fuel_limit)?;
        Ok(Arc::new(FreshLoader::new(Arc::new(loader))))
    }
}
