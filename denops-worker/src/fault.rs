//! Fault isolation for background work spawned by plugin code
//!
//! Plugin code may start tasks it never awaits. A failure in one of them has
//! nobody to report to, so the [`FaultMonitor`] supervising the session turns
//! it into a `reload` request to the host: the worker is disposable and a
//! fresh one is cheaper than an unknown state.
//!
//! A monitor is bound to one session. Retiring or dropping it aborts the
//! tasks it supervises, so monitors of different sessions never interact.
//! Only tasks started through `Denops::spawn` (or a [`TaskSpawner`]) are
//! supervised; a bare `tokio::spawn` from plugin code escapes the monitor.
//!
//! A task ending with a [`SessionError`] of an expected cancellation kind
//! (see [`crate::session::classify`]) is not a failure.

use crate::session::{classify, ErrorDisposition, Session, SessionError};
use denops_worker_api::RELOAD_METHOD;
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};

/// A background task started by plugin code
pub type BackgroundTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// A failure nobody awaited
#[derive(Debug, Clone)]
pub struct UnhandledFailure {
    /// One-line description
    pub message: String,
    /// Captured backtrace, when the failure carries one
    pub stack: Option<String>,
}

impl UnhandledFailure {
    pub fn from_error(error: &anyhow::Error) -> Self {
        let backtrace = error.backtrace();
        let stack = (backtrace.status() == BacktraceStatus::Captured)
            .then(|| format!("{:#}\n{}", error, backtrace));
        Self {
            message: format!("{:#}", error),
            stack,
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self {
            message,
            stack: None,
        }
    }

    /// Human readable description, the stack trace when available
    pub fn describe(&self) -> &str {
        self.stack.as_deref().unwrap_or(&self.message)
    }
}

/// Handle used to start supervised background tasks
#[derive(Clone)]
pub struct TaskSpawner {
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

impl TaskSpawner {
    /// Run `task` under supervision
    ///
    /// Returns `false` when the monitor has been retired; the task is dropped.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn_boxed(Box::pin(task))
    }

    pub fn spawn_boxed(&self, task: BackgroundTask) -> bool {
        self.tx.send(task).is_ok()
    }
}

/// Supervisor of one session's background tasks
pub struct FaultMonitor {
    spawner: TaskSpawner,
    supervisor: Option<JoinHandle<()>>,
    reloads: Arc<AtomicUsize>,
}

impl FaultMonitor {
    /// Install a monitor for `session`; must be called within a tokio runtime
    pub fn install(plugin: impl Into<String>, session: Session) -> Self {
        let plugin = plugin.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let reloads = Arc::new(AtomicUsize::new(0));

        let supervisor = tokio::spawn(supervise(plugin, session, rx, reloads.clone()));

        Self {
            spawner: TaskSpawner { tx },
            supervisor: Some(supervisor),
            reloads,
        }
    }

    pub fn spawner(&self) -> TaskSpawner {
        self.spawner.clone()
    }

    /// Number of reload requests sent so far
    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Stop supervising; running tasks are aborted
    pub fn retire(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
    }
}

impl Drop for FaultMonitor {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn supervise(
    plugin: String,
    session: Session,
    mut rx: mpsc::UnboundedReceiver<BackgroundTask>,
    reloads: Arc<AtomicUsize>,
) {
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            task = rx.recv(), if accepting => match task {
                Some(task) => {
                    tasks.spawn(task);
                }
                None => accepting = false,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(failure) = failure_of(joined) {
                    reloads.fetch_add(1, Ordering::SeqCst);
                    escalate(&plugin, &session, &failure).await;
                }
            }
            else => break,
        }
    }
}

fn failure_of(joined: Result<anyhow::Result<()>, JoinError>) -> Option<UnhandledFailure> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => match e.downcast_ref::<SessionError>() {
            Some(cancel) if classify(cancel) == ErrorDisposition::Suppress => {
                tracing::debug!(error = %cancel, "Background task cancelled");
                None
            }
            _ => Some(UnhandledFailure::from_error(&e)),
        },
        Err(e) if e.is_panic() => Some(UnhandledFailure::from_panic(e.into_panic())),
        // Cancelled
        Err(_) => None,
    }
}

async fn escalate(plugin: &str, session: &Session, failure: &UnhandledFailure) {
    tracing::error!(
        plugin = %plugin,
        "Unhandled failure is detected. Worker of '{}' will be reloaded: {}",
        plugin,
        failure.describe()
    );
    if let Err(e) = session.notify(RELOAD_METHOD, Vec::new()).await {
        tracing::warn!(plugin = %plugin, error = %e, "Failed to request reload");
    }
}
