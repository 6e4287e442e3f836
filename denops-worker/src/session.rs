//! msgpack-rpc session over a worker channel
//!
//! A [`Session`] owns the worker's reader and writer. It matches responses to
//! outgoing calls, hands inbound requests and notifications to a
//! [`Dispatcher`], and reports every error it cannot return to a caller
//! through the configured error callback.

use crate::channel::{WorkerReader, WorkerWriter};
use async_trait::async_trait;
use denops_worker_api::{Message, INTERRUPTED, RESPONSE_TIMEOUT};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};

/// Kinds of session failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    /// The host cancelled the operation (e.g. user pressed Ctrl-C)
    Interrupted,
    /// No response arrived within the response timeout
    Timeout,
    /// The session or its channel is closed
    Closed,
    /// A frame could not be written
    Transport,
    /// An inbound frame could not be decoded
    Decode,
    /// The peer answered with an error
    Remote,
    /// Handling an inbound request failed
    Dispatch,
}

impl fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Interrupted => INTERRUPTED,
            Self::Timeout => "Timeout",
            Self::Closed => "Closed",
            Self::Transport => "Transport",
            Self::Decode => "Decode",
            Self::Remote => "Remote",
            Self::Dispatch => "Dispatch",
        };
        f.write_str(name)
    }
}

/// Error raised by a session operation or reported to the error callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Interrupted, message)
    }

    pub fn closed() -> Self {
        Self::new(SessionErrorKind::Closed, "session is closed")
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind == SessionErrorKind::Interrupted
    }

    /// Map the error object of a response
    ///
    /// Objects named `Interrupted` (or the bare string) become
    /// [`SessionErrorKind::Interrupted`]; anything else is `Remote`.
    pub fn from_remote(error: &Value) -> Self {
        let name = error
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| error.as_str());
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());

        if name == Some(INTERRUPTED) {
            Self::interrupted(message)
        } else {
            Self::new(SessionErrorKind::Remote, message)
        }
    }

    /// Error object sent back to the peer
    fn to_remote(&self) -> Value {
        json!({ "name": self.kind.to_string(), "message": self.message })
    }
}

/// Error kinds treated as expected cancellations
pub const EXPECTED_CANCELLATIONS: &[SessionErrorKind] = &[SessionErrorKind::Interrupted];

/// What the error callback does with a session error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    Suppress,
    Log,
}

pub fn classify(error: &SessionError) -> ErrorDisposition {
    if EXPECTED_CANCELLATIONS.contains(&error.kind) {
        ErrorDisposition::Suppress
    } else {
        ErrorDisposition::Log
    }
}

/// Callback receiving errors the session cannot return to a caller
pub type ErrorCallback = Arc<dyn Fn(&SessionError) + Send + Sync>;

/// Error callback that logs everything except expected cancellations
pub fn logging_error_callback(plugin: impl Into<String>) -> ErrorCallback {
    let plugin = plugin.into();
    Arc::new(move |error: &SessionError| {
        if classify(error) == ErrorDisposition::Log {
            tracing::error!(plugin = %plugin, error = %error, "Unexpected error occurred in '{}'", plugin);
        }
    })
}

/// Handles requests and notifications sent by the peer
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value, SessionError>;
}

/// Dispatcher that knows no methods
pub struct EmptyDispatcher;

#[async_trait]
impl Dispatcher for EmptyDispatcher {
    async fn dispatch(&self, method: &str, _params: Vec<Value>) -> Result<Value, SessionError> {
        Err(SessionError::new(
            SessionErrorKind::Dispatch,
            format!("No such method: {}", method),
        ))
    }
}

/// Session configuration
#[derive(Clone)]
pub struct SessionOptions {
    pub response_timeout: Duration,
    pub error_callback: Option<ErrorCallback>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: RESPONSE_TIMEOUT,
            error_callback: None,
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("response_timeout", &self.response_timeout)
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

type Pending = HashMap<u32, oneshot::Sender<Result<Value, SessionError>>>;

/// A msgpack-rpc session bound to one worker channel
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    writer: WorkerWriter,
    options: SessionOptions,
    next_msgid: AtomicU32,
    /// `None` once the session is closed
    pending: Mutex<Option<Pending>>,
    dispatcher: RwLock<Arc<dyn Dispatcher>>,
    closed: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session; must be called within a tokio runtime
    pub fn new(reader: WorkerReader, writer: WorkerWriter, options: SessionOptions) -> Self {
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            writer,
            options,
            next_msgid: AtomicU32::new(0),
            pending: Mutex::new(Some(HashMap::new())),
            dispatcher: RwLock::new(Arc::new(EmptyDispatcher)),
            closed,
            reader_task: Mutex::new(None),
        });

        let task = tokio::spawn(Inner::read_loop(inner.clone(), reader));
        // Nothing else holds the lock yet
        if let Ok(mut slot) = inner.reader_task.try_lock() {
            *slot = Some(task);
        }

        Self { inner }
    }

    pub fn response_timeout(&self) -> Duration {
        self.inner.options.response_timeout
    }

    pub fn has_error_callback(&self) -> bool {
        self.inner.options.error_callback.is_some()
    }

    pub async fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.inner.dispatcher.write().await = dispatcher;
    }

    /// Call a method on the peer and wait for its response
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, SessionError> {
        let msgid = self.inner.next_msgid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        match self.inner.pending.lock().await.as_mut() {
            Some(pending) => {
                pending.insert(msgid, tx);
            }
            None => return Err(SessionError::closed()),
        }

        let message = Message::Request {
            msgid,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.inner.send(&message).await {
            self.inner.forget(msgid).await;
            return Err(e);
        }

        match tokio::time::timeout(self.inner.options.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::closed()),
            Err(_) => {
                self.inner.forget(msgid).await;
                Err(SessionError::new(
                    SessionErrorKind::Timeout,
                    format!(
                        "No response for '{}' within {:?}",
                        method, self.inner.options.response_timeout
                    ),
                ))
            }
        }
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::closed());
        }
        self.inner
            .send(&Message::Notification {
                method: method.to_string(),
                params,
            })
            .await
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Wait until the inbound stream ends and in-flight requests are handled
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Stop reading and cancel every pending call
    pub async fn close(&self) {
        if let Some(task) = self.inner.reader_task.lock().await.take() {
            task.abort();
        }
        self.inner.shutdown().await;
    }
}

impl Inner {
    async fn read_loop(self: Arc<Self>, mut reader: WorkerReader) {
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                frame = reader.read_frame() => {
                    let Some(frame) = frame else { break };
                    match Message::decode(&frame) {
                        Ok(Message::Response { msgid, error, result }) => {
                            self.resolve(msgid, error, result).await;
                        }
                        Ok(Message::Request { msgid, method, params }) => {
                            handlers.spawn(self.clone().handle_request(msgid, method, params));
                        }
                        Ok(Message::Notification { method, params }) => {
                            handlers.spawn(self.clone().handle_notification(method, params));
                        }
                        Err(e) => {
                            self.report(&SessionError::new(SessionErrorKind::Decode, e.to_string()));
                        }
                    }
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    self.reap(joined);
                }
            }
        }

        while let Some(joined) = handlers.join_next().await {
            self.reap(joined);
        }
        tracing::debug!("Session input closed");
        self.shutdown().await;
    }

    fn reap(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                self.report(&SessionError::new(
                    SessionErrorKind::Dispatch,
                    "dispatcher panicked",
                ));
            }
        }
    }

    async fn handle_request(self: Arc<Self>, msgid: u32, method: String, params: Vec<Value>) {
        let dispatcher = self.dispatcher.read().await.clone();
        let reply = match dispatcher.dispatch(&method, params).await {
            Ok(result) => Message::ok(msgid, result),
            Err(e) => {
                self.report(&e);
                Message::err(msgid, e.to_remote())
            }
        };
        if let Err(e) = self.send(&reply).await {
            self.report(&e);
        }
    }

    async fn handle_notification(self: Arc<Self>, method: String, params: Vec<Value>) {
        let dispatcher = self.dispatcher.read().await.clone();
        if let Err(e) = dispatcher.dispatch(&method, params).await {
            self.report(&e);
        }
    }

    async fn resolve(&self, msgid: u32, error: Value, result: Value) {
        let waiter = self
            .pending
            .lock()
            .await
            .as_mut()
            .and_then(|pending| pending.remove(&msgid));

        let Some(waiter) = waiter else {
            self.report(&SessionError::new(
                SessionErrorKind::Decode,
                format!("Response for unknown msgid {}", msgid),
            ));
            return;
        };

        let outcome = if error.is_null() {
            Ok(result)
        } else {
            Err(SessionError::from_remote(&error))
        };
        // The caller may have timed out already
        let _ = waiter.send(outcome);
    }

    async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let frame = message
            .encode()
            .map_err(|e| SessionError::new(SessionErrorKind::Transport, e.to_string()))?;
        self.writer
            .write_frame(frame)
            .await
            .map_err(|e| SessionError::new(SessionErrorKind::Closed, e.to_string()))
    }

    async fn forget(&self, msgid: u32) {
        if let Some(pending) = self.pending.lock().await.as_mut() {
            pending.remove(&msgid);
        }
    }

    async fn shutdown(&self) {
        if let Some(pending) = self.pending.lock().await.take() {
            for (_, waiter) in pending {
                let _ = waiter.send(Err(SessionError::closed()));
            }
        }
        self.closed.send_replace(true);
    }

    fn report(&self, error: &SessionError) {
        if let Some(callback) = &self.options.error_callback {
            callback(error);
        }
    }
}
