//! Editor-facing API handed to plugin code

use crate::fault::{BackgroundTask, TaskSpawner};
use crate::session::{Dispatcher, Session, SessionError};
use async_trait::async_trait;
use denops_worker_api::{Meta, DISPATCH_METHOD, INVOKE_METHOD};
use serde_json::{json, Value};
use std::sync::Arc;

/// What a plugin can do with the editor
#[async_trait]
pub trait Denops: Send + Sync {
    /// Name of the running plugin
    fn name(&self) -> &str;

    /// Environment of the host editor
    fn meta(&self) -> &Meta;

    /// Call an editor function
    async fn call(&self, func: &str, args: Vec<Value>) -> Result<Value, SessionError>;

    /// Execute an editor command
    async fn cmd(&self, command: &str) -> Result<(), SessionError>;

    /// Evaluate an editor expression
    async fn eval(&self, expr: &str) -> Result<Value, SessionError>;

    /// Call a method of another plugin through the host
    async fn dispatch(
        &self,
        plugin: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, SessionError>;

    /// Replace the handler for requests addressed to this plugin
    async fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>);

    /// Start a background task nobody awaits
    ///
    /// A failure of the task makes the host reload the worker.
    fn spawn(&self, task: BackgroundTask) -> bool;
}

/// [`Denops`] backed by the worker's session
pub struct DenopsImpl {
    name: String,
    meta: Meta,
    session: Session,
    spawner: TaskSpawner,
}

impl DenopsImpl {
    pub fn new(name: impl Into<String>, meta: Meta, session: Session, spawner: TaskSpawner) -> Self {
        Self {
            name: name.into(),
            meta,
            session,
            spawner,
        }
    }

    async fn invoke(&self, op: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        self.session
            .call(INVOKE_METHOD, vec![json!(op), Value::Array(args)])
            .await
    }
}

#[async_trait]
impl Denops for DenopsImpl {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    async fn call(&self, func: &str, args: Vec<Value>) -> Result<Value, SessionError> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(json!(func));
        params.extend(args);
        self.invoke("call", params).await
    }

    async fn cmd(&self, command: &str) -> Result<(), SessionError> {
        self.invoke("cmd", vec![json!(command), json!({})]).await?;
        Ok(())
    }

    async fn eval(&self, expr: &str) -> Result<Value, SessionError> {
        self.invoke("eval", vec![json!(expr), json!({})]).await
    }

    async fn dispatch(
        &self,
        plugin: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, SessionError> {
        self.session
            .call(
                DISPATCH_METHOD,
                vec![json!(plugin), json!(method), Value::Array(args)],
            )
            .await
    }

    async fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        self.session.set_dispatcher(dispatcher).await;
    }

    fn spawn(&self, task: BackgroundTask) -> bool {
        self.spawner.spawn_boxed(task)
    }
}
