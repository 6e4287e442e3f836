//! Plugin lifecycle driver
//!
//! ```text
//! Idle ─► Loading ─► Running ─► Succeeded ─┐
//!            │           └────► Failed ────┼─► Closing ─► Closed
//!            └─────────────────────────────┘
//! ```
//!
//! `Pre` is emitted between load and entry, `Post` or `Fail` after the entry
//! returns. Event delivery is best effort and never changes the outcome.

use crate::denops::Denops;
use crate::loader::FreshLoader;
use crate::session::{Session, SessionError};
use denops_worker_api::LifecycleEvent;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Loading,
    Running,
    Succeeded,
    Failed,
    Closing,
    Closed,
}

impl LifecycleState {
    pub fn can_advance_to(self, next: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Loading)
                | (Loading, Running)
                | (Loading, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, Closing)
                | (Failed, Closing)
                | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid lifecycle transition: {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// State machine with the list of visited states
#[derive(Debug, Clone)]
pub struct Lifecycle {
    history: Vec<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            history: vec![LifecycleState::Idle],
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> LifecycleState {
        self.history
            .last()
            .copied()
            .unwrap_or(LifecycleState::Idle)
    }

    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn advance(&mut self, next: LifecycleState) -> Result<(), TransitionError> {
        let from = self.state();
        if !from.can_advance_to(next) {
            return Err(TransitionError { from, to: next });
        }
        tracing::trace!(?from, to = ?next, "Lifecycle transition");
        self.history.push(next);
        Ok(())
    }
}

/// Result of running a plugin's entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOutcome {
    Succeeded,
    /// Load or entry failure, with its message
    Failed(String),
}

/// Summary of a finished worker run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plugin: String,
    pub outcome: PluginOutcome,
    /// Generation of the module that ran, if it loaded
    pub generation: Option<u64>,
    /// Visited lifecycle states, in order
    pub states: Vec<LifecycleState>,
    /// `reload` requests sent during the run
    pub reloads: usize,
}

/// Run an operation whose failure is tolerated
///
/// A failure is logged as a warning and becomes `None`. Callers are free to
/// discard the result.
pub async fn best_effort<T, F>(plugin: &str, what: &str, op: F) -> Option<T>
where
    F: Future<Output = Result<T, SessionError>>,
{
    match op.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(plugin = %plugin, error = %e, "Failed to {}: {}", what, e);
            None
        }
    }
}

/// Drives one plugin from load to close
pub struct PluginDriver {
    name: String,
    namespace: String,
    denops: Arc<dyn Denops>,
    lifecycle: Lifecycle,
    generation: Option<u64>,
}

impl PluginDriver {
    pub fn new(denops: Arc<dyn Denops>, namespace: impl Into<String>) -> Self {
        Self {
            name: denops.name().to_string(),
            namespace: namespace.into(),
            denops,
            lifecycle: Lifecycle::default(),
            generation: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Load the module and run its entry point
    pub async fn run(
        &mut self,
        loader: &FreshLoader,
        script_url: &str,
    ) -> Result<PluginOutcome, TransitionError> {
        self.lifecycle.advance(LifecycleState::Loading)?;

        let handle = match loader.load(script_url).await {
            Ok(handle) => handle,
            Err(e) => return self.fail(format!("{}", e)).await,
        };
        self.generation = Some(handle.locator().generation);

        self.emit(LifecycleEvent::Pre).await;
        self.lifecycle.advance(LifecycleState::Running)?;

        let module = handle.module();
        let denops = self.denops.clone();
        let entry = tokio::spawn(async move { module.main(denops).await });

        match entry.await {
            Ok(Ok(())) => {
                self.lifecycle.advance(LifecycleState::Succeeded)?;
                tracing::debug!(plugin = %self.name, "Plugin entry returned");
                self.emit(LifecycleEvent::Post).await;
                Ok(PluginOutcome::Succeeded)
            }
            Ok(Err(e)) => self.fail(format!("{:#}", e)).await,
            Err(e) if e.is_panic() => {
                let failure = crate::fault::UnhandledFailure::from_panic(e.into_panic());
                self.fail(format!("entry panicked: {}", failure.message))
                    .await
            }
            Err(e) => self.fail(format!("entry was cancelled: {}", e)).await,
        }
    }

    async fn fail(&mut self, message: String) -> Result<PluginOutcome, TransitionError> {
        self.lifecycle.advance(LifecycleState::Failed)?;
        tracing::error!(plugin = %self.name, "{}: {}", self.name, message);
        self.emit(LifecycleEvent::Fail).await;
        Ok(PluginOutcome::Failed(message))
    }

    async fn emit(&self, event: LifecycleEvent) {
        let command = event.command(&self.namespace, &self.name);
        let what = format!("emit {}", event.autocmd_name(&self.namespace, &self.name));
        let _ = best_effort(&self.name, &what, self.denops.cmd(&command)).await;
    }

    /// Wait until the session has drained
    pub async fn drain(&mut self, session: &Session) -> Result<(), TransitionError> {
        self.lifecycle.advance(LifecycleState::Closing)?;
        session.wait_closed().await;
        Ok(())
    }

    pub fn finish(
        mut self,
        outcome: PluginOutcome,
        reloads: usize,
    ) -> Result<RunReport, TransitionError> {
        self.lifecycle.advance(LifecycleState::Closed)?;
        Ok(RunReport {
            plugin: self.name,
            outcome,
            generation: self.generation,
            states: self.lifecycle.history,
            reloads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::BackgroundTask;
    use crate::loader::{PluginModule, StaticModuleLoader};
    use crate::session::{Dispatcher, SessionErrorKind};
    use async_trait::async_trait;
    use denops_worker_api::{Host, Meta, Mode, Platform};
    use serde_json::Value;
    use std::sync::Mutex;

    /// Denops double recording commands; fails commands containing `fail_on`
    struct Recorder {
        meta: Meta,
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                meta: Meta {
                    mode: Mode::Test,
                    host: Host::Vim,
                    version: "9.1".into(),
                    platform: Platform::Linux,
                },
                commands: Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn events(&self) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .filter_map(|c| c.strip_prefix("doautocmd <nomodeline> User "))
                .map(str::to_string)
                .collect()
        }
    }

    #[async_trait]
    impl Denops for Recorder {
        fn name(&self) -> &str {
            "foo"
        }

        fn meta(&self) -> &Meta {
            &self.meta
        }

        async fn call(&self, _func: &str, _args: Vec<Value>) -> Result<Value, SessionError> {
            Ok(Value::Null)
        }

        async fn cmd(&self, command: &str) -> Result<(), SessionError> {
            self.commands.lock().unwrap().push(command.to_string());
            match self.fail_on {
                Some(pattern) if command.contains(pattern) => {
                    Err(SessionError::new(SessionErrorKind::Remote, "E216"))
                }
                _ => Ok(()),
            }
        }

        async fn eval(&self, _expr: &str) -> Result<Value, SessionError> {
            Ok(Value::Null)
        }

        async fn dispatch(
            &self,
            _plugin: &str,
            _method: &str,
            _args: Vec<Value>,
        ) -> Result<Value, SessionError> {
            Ok(Value::Null)
        }

        async fn set_dispatcher(&self, _dispatcher: Arc<dyn Dispatcher>) {}

        fn spawn(&self, _task: BackgroundTask) -> bool {
            false
        }
    }

    struct Entry(fn() -> anyhow::Result<()>);

    #[async_trait]
    impl PluginModule for Entry {
        async fn main(&self, denops: Arc<dyn Denops>) -> anyhow::Result<()> {
            denops.cmd("echo 'main'").await?;
            (self.0)()
        }
    }

    fn loader_with(entry: fn() -> anyhow::Result<()>) -> FreshLoader {
        FreshLoader::new(Arc::new(
            StaticModuleLoader::new().with_module("file:///p.wasm", move || Entry(entry)),
        ))
    }

    #[test]
    fn test_transitions() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
        assert!(lifecycle.advance(LifecycleState::Running).is_err());
        lifecycle.advance(LifecycleState::Loading).unwrap();
        lifecycle.advance(LifecycleState::Failed).unwrap();
        assert!(lifecycle.advance(LifecycleState::Succeeded).is_err());
        lifecycle.advance(LifecycleState::Closing).unwrap();
        lifecycle.advance(LifecycleState::Closed).unwrap();
        assert_eq!(
            lifecycle.history(),
            &[
                LifecycleState::Idle,
                LifecycleState::Loading,
                LifecycleState::Failed,
                LifecycleState::Closing,
                LifecycleState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_success_emits_pre_then_post() {
        let denops = Recorder::new(None);
        let mut driver = PluginDriver::new(denops.clone(), "Denops");

        let outcome = driver
            .run(&loader_with(|| Ok(())), "file:///p.wasm")
            .await
            .unwrap();

        assert_eq!(outcome, PluginOutcome::Succeeded);
        assert_eq!(driver.state(), LifecycleState::Succeeded);
        assert_eq!(
            denops.events(),
            vec!["DenopsPluginPre:foo", "DenopsPluginPost:foo"]
        );
        // Pre strictly precedes the entry function
        assert_eq!(
            denops.commands.lock().unwrap()[..2],
            [
                "doautocmd <nomodeline> User DenopsPluginPre:foo".to_string(),
                "echo 'main'".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_emits_pre_then_fail() {
        let denops = Recorder::new(None);
        let mut driver = PluginDriver::new(denops.clone(), "Denops");

        let outcome = driver
            .run(
                &loader_with(|| Err(anyhow::anyhow!("bad config"))),
                "file:///p.wasm",
            )
            .await
            .unwrap();

        assert_eq!(outcome, PluginOutcome::Failed("bad config".into()));
        assert_eq!(
            denops.events(),
            vec!["DenopsPluginPre:foo", "DenopsPluginFail:foo"]
        );
    }

    #[tokio::test]
    async fn test_entry_panic_is_plugin_failure() {
        let denops = Recorder::new(None);
        let mut driver = PluginDriver::new(denops.clone(), "Denops");

        let outcome = driver
            .run(&loader_with(|| panic!("oops")), "file:///p.wasm")
            .await
            .unwrap();

        assert!(matches!(outcome, PluginOutcome::Failed(ref m) if m.contains("oops")));
        assert_eq!(
            denops.events(),
            vec!["DenopsPluginPre:foo", "DenopsPluginFail:foo"]
        );
    }

    #[tokio::test]
    async fn test_load_failure_skips_pre() {
        let denops = Recorder::new(None);
        let mut driver = PluginDriver::new(denops.clone(), "Denops");

        let outcome = driver
            .run(&loader_with(|| Ok(())), "file:///missing.wasm")
            .await
            .unwrap();

        assert!(matches!(outcome, PluginOutcome::Failed(_)));
        assert_eq!(denops.events(), vec!["DenopsPluginFail:foo"]);
    }

    #[tokio::test]
    async fn test_event_failure_does_not_change_outcome() {
        let denops = Recorder::new(Some("DenopsPlugin"));
        let mut driver = PluginDriver::new(denops.clone(), "Denops");

        let outcome = driver
            .run(&loader_with(|| Ok(())), "file:///p.wasm")
            .await
            .unwrap();

        assert_eq!(outcome, PluginOutcome::Succeeded);
        assert_eq!(
            denops.events(),
            vec!["DenopsPluginPre:foo", "DenopsPluginPost:foo"]
        );
    }

    #[tokio::test]
    async fn test_custom_namespace() {
        let denops = Recorder::new(None);
        let mut driver = PluginDriver::new(denops.clone(), "Acme");

        driver
            .run(&loader_with(|| Ok(())), "file:///p.wasm")
            .await
            .unwrap();

        assert_eq!(denops.events(), vec!["AcmePluginPre:foo", "AcmePluginPost:foo"]);
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let ok = best_effort("foo", "succeed", async { Ok::<_, SessionError>(1) }).await;
        assert_eq!(ok, Some(1));

        let failed = best_effort("foo", "fail", async {
            Err::<i32, _>(SessionError::closed())
        })
        .await;
        assert_eq!(failed, None);
    }
}
