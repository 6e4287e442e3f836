//! Worker bootstrap
//!
//! [`run_worker`] is the whole life of a worker: handshake, session and fault
//! monitor, plugin lifecycle, drain. [`Worker::spawn`] runs it on a dedicated
//! thread with a single-threaded runtime; the thread ends when the run does.

use crate::channel::{worker_channel, HostPort, WorkerEndpoint};
use crate::config::WorkerConfig;
use crate::denops::{Denops, DenopsImpl};
use crate::fault::{FaultMonitor, UnhandledFailure};
use crate::handshake::{self, StartupError};
use crate::lifecycle::{PluginDriver, RunReport, TransitionError};
use crate::loader::FreshLoader;
use crate::session::{logging_error_callback, Session, SessionOptions};
use denops_worker_api::WorkerInitMessage;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Errors that end a worker run
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Startup failed: {0}")]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Lifecycle(#[from] TransitionError),

    #[error("Failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker thread panicked: {0}")]
    Panicked(String),
}

/// Run a worker over `endpoint` until its session drains
///
/// `loader` is meant to be shared by every worker a host spawns for a plugin,
/// so each reload runs under a new module generation.
pub async fn run_worker(
    endpoint: WorkerEndpoint,
    loader: Arc<FreshLoader>,
    config: WorkerConfig,
) -> Result<RunReport, WorkerError> {
    let (mut reader, writer) = endpoint.split();

    let init = match handshake::receive(&mut reader).await {
        Ok(init) => init,
        Err(e) => {
            tracing::error!(error = %e, "Worker startup failed: {}", e);
            return Err(e.into());
        }
    };
    let WorkerInitMessage {
        name,
        script_url,
        meta,
    } = init;

    let session = Session::new(
        reader,
        writer,
        SessionOptions {
            response_timeout: config.response_timeout,
            error_callback: Some(logging_error_callback(name.clone())),
        },
    );
    tracing::debug!(
        plugin = %name,
        response_timeout = ?session.response_timeout(),
        error_callback = session.has_error_callback(),
        "Session established"
    );
    let monitor = FaultMonitor::install(name.clone(), session.clone());

    let denops: Arc<dyn Denops> = Arc::new(DenopsImpl::new(
        name.clone(),
        meta,
        session.clone(),
        monitor.spawner(),
    ));

    match drive(denops, &session, &monitor, &loader, &script_url, &config).await {
        Ok(report) => {
            monitor.retire();
            session.close().await;
            tracing::info!(
                plugin = %report.plugin,
                outcome = ?report.outcome,
                reloads = report.reloads,
                "Worker finished"
            );
            Ok(report)
        }
        Err(e) => {
            tracing::error!(
                plugin = %name,
                "Unexpected error occurred in '{}' ({}): {}",
                name,
                script_url,
                e
            );
            monitor.retire();
            session.close().await;
            Err(e)
        }
    }
}

async fn drive(
    denops: Arc<dyn Denops>,
    session: &Session,
    monitor: &FaultMonitor,
    loader: &FreshLoader,
    script_url: &str,
    config: &WorkerConfig,
) -> Result<RunReport, WorkerError> {
    let mut driver = PluginDriver::new(denops, config.event_namespace.clone());
    let outcome = driver.run(loader, script_url).await?;
    driver.drain(session).await?;
    Ok(driver.finish(outcome, monitor.reload_count())?)
}

/// Spawns workers on dedicated threads
pub struct Worker;

impl Worker {
    /// Start a worker thread; the host talks to it through the returned port
    pub fn spawn(loader: Arc<FreshLoader>, config: WorkerConfig) -> Result<WorkerHandle, WorkerError> {
        let (port, endpoint) = worker_channel(config.channel_capacity);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(WorkerError::Spawn)?;

        let thread = thread::Builder::new()
            .name("denops-worker".to_string())
            .spawn(move || runtime.block_on(run_worker(endpoint, loader, config)))
            .map_err(WorkerError::Spawn)?;

        Ok(WorkerHandle { port, thread })
    }
}

/// Host-side handle of a running worker
pub struct WorkerHandle {
    port: HostPort,
    thread: thread::JoinHandle<Result<RunReport, WorkerError>>,
}

impl WorkerHandle {
    pub fn port(&mut self) -> &mut HostPort {
        &mut self.port
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Block until the worker thread ends
    ///
    /// Close the port first, or the worker keeps waiting for the host.
    pub fn join(self) -> Result<RunReport, WorkerError> {
        self.thread
            .join()
            .map_err(|payload| WorkerError::Panicked(UnhandledFailure::from_panic(payload).message))?
    }
}
