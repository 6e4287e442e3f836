//! Plugin loader using wasmtime
//!
//! Loads Wasm plugin modules from disk and runs their entry point in a
//! fuel-limited store.
//!
//! Guest contract:
//!
//! - export `memory`
//! - export `plugin_main() -> i32`, `0` meaning success
//! - may import `env.denops_cmd(ptr: i32, len: i32) -> i32` to run a UTF-8
//!   editor command stored at `ptr..ptr+len`; returns `0` on success

use super::{LoaderError, ModuleLocator, ModuleLoader, PluginModule};
use crate::denops::Denops;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::runtime::Handle;
use wasmtime::*;

/// Default fuel given to `plugin_main`
pub const DEFAULT_FUEL_LIMIT: u64 = 10_000_000;

const ENTRY: &str = "plugin_main";

/// Plugin loader with wasmtime engine
pub struct WasmModuleLoader {
    engine: Engine,
    fuel_limit: u64,
}

/// A compiled module; each [`PluginModule::main`] call gets its own store
struct WasmPlugin {
    engine: Engine,
    module: Module,
    locator: ModuleLocator,
    fuel_limit: u64,
}

/// Host state visible to imported functions
struct GuestState {
    denops: Arc<dyn Denops>,
    runtime: Handle,
}

impl WasmModuleLoader {
    /// Create a new loader
    pub fn new(fuel_limit: u64) -> Result<Self, LoaderError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(LoaderError::EngineCreation)?;

        Ok(Self { engine, fuel_limit })
    }

    /// Compile a module from Wasm bytes (or WAT text)
    pub fn compile(&self, bytes: &[u8]) -> Result<Module, LoaderError> {
        let module = Module::new(&self.engine, bytes).map_err(LoaderError::ModuleCompilation)?;

        let has_entry = module
            .exports()
            .any(|export| export.name() == ENTRY && export.ty().func().is_some());
        if !has_entry {
            return Err(LoaderError::FunctionNotFound(ENTRY.to_string()));
        }
        Ok(module)
    }
}

#[async_trait]
impl ModuleLoader for WasmModuleLoader {
    async fn load(&self, locator: &ModuleLocator) -> Result<Arc<dyn PluginModule>, LoaderError> {
        // Always read from disk so the current source is what runs
        let path = locator.to_path();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| LoaderError::Read { path, source })?;

        let module = self.compile(&bytes)?;
        Ok(Arc::new(WasmPlugin {
            engine: self.engine.clone(),
            module,
            locator: locator.clone(),
            fuel_limit: self.fuel_limit,
        }))
    }
}

#[async_trait]
impl PluginModule for WasmPlugin {
    async fn main(&self, denops: Arc<dyn Denops>) -> anyhow::Result<()> {
        let engine = self.engine.clone();
        let module = self.module.clone();
        let fuel_limit = self.fuel_limit;
        let state = GuestState {
            denops,
            runtime: Handle::current(),
        };

        // Guest code is synchronous; keep it off the worker's scheduler so the
        // session can still deliver responses to `denops_cmd`.
        let code =
            tokio::task::spawn_blocking(move || run_entry(&engine, &module, fuel_limit, state))
                .await??;

        if code != 0 {
            anyhow::bail!("{} of {} exited with code {}", ENTRY, self.locator, code);
        }
        Ok(())
    }
}

fn run_entry(
    engine: &Engine,
    module: &Module,
    fuel_limit: u64,
    state: GuestState,
) -> Result<i32, LoaderError> {
    // 1. Fresh store with fuel limit
    let mut store = Store::new(engine, state);
    store
        .set_fuel(fuel_limit)
        .map_err(LoaderError::EngineCreation)?;

    // 2. Host imports
    let mut linker: Linker<GuestState> = Linker::new(engine);
    linker
        .func_wrap("env", "denops_cmd", denops_cmd)
        .map_err(LoaderError::Instantiation)?;

    // 3. Instantiate
    let instance = linker
        .instantiate(&mut store, module)
        .map_err(LoaderError::Instantiation)?;

    // 4. Run entry point
    let entry = instance
        .get_typed_func::<(), i32>(&mut store, ENTRY)
        .map_err(|_| LoaderError::FunctionNotFound(ENTRY.to_string()))?;

    entry.call(&mut store, ()).map_err(|e| {
        if matches!(e.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
            LoaderError::FuelExhausted
        } else {
            LoaderError::FunctionCall {
                function: ENTRY,
                source: e,
            }
        }
    })
}

/// `env.denops_cmd(ptr, len) -> i32`
fn denops_cmd(mut caller: Caller<'_, GuestState>, ptr: i32, len: i32) -> i32 {
    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        tracing::warn!("denops_cmd called by a module without memory");
        return -1;
    };
    let bytes = match read_memory(memory.data(&caller), ptr as usize, len as usize) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "denops_cmd received an invalid buffer");
            return -1;
        }
    };
    let Ok(command) = String::from_utf8(bytes) else {
        return -1;
    };

    let state = caller.data();
    match state.runtime.block_on(state.denops.cmd(&command)) {
        Ok(()) => 0,
        Err(e) => {
            tracing::warn!(plugin = %state.denops.name(), error = %e, "denops_cmd failed");
            1
        }
    }
}

fn read_memory(data: &[u8], ptr: usize, len: usize) -> Result<Vec<u8>, LoaderError> {
    match ptr.checked_add(len) {
        Some(end) if end <= data.len() => Ok(data[ptr..end].to_vec()),
        _ => Err(LoaderError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data.len()
        ))),
    }
}
