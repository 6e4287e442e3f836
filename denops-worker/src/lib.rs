//! denops-worker: Runtime of an isolated plugin worker
//!
//! A worker hosts exactly one plugin. It waits for the host's init message,
//! opens an RPC session over its message channel, loads the plugin module
//! fresh, runs its entry point while announcing lifecycle events to the
//! editor, and ends once the host closes the session. Failures in plugin
//! background tasks ask the host to reload the worker instead of bringing
//! anything down.

pub mod channel;
pub mod config;
pub mod denops;
pub mod fault;
pub mod handshake;
pub mod lifecycle;
pub mod loader;
pub mod session;
pub mod tracing_support;
pub mod worker;

pub use channel::{worker_channel, HostPort, WorkerEndpoint, WorkerReader, WorkerWriter};
pub use config::WorkerConfig;
pub use denops::{Denops, DenopsImpl};
pub use fault::{BackgroundTask, FaultMonitor, TaskSpawner, UnhandledFailure};
pub use handshake::StartupError;
pub use lifecycle::{LifecycleState, PluginOutcome, RunReport};
pub use loader::{
    FreshLoader, LoaderError, ModuleHandle, ModuleLoader, ModuleLocator, PluginModule,
    StaticModuleLoader, WasmModuleLoader,
};
pub use session::{Dispatcher, Session, SessionError, SessionErrorKind, SessionOptions};
pub use worker::{run_worker, Worker, WorkerError, WorkerHandle};

pub use denops_worker_api::{Host, LifecycleEvent, Message, Meta, Mode, Platform, WorkerInitMessage};
