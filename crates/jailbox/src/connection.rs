//! Request/reply operations on top of a [`Transport`].
//!
//! Each request registers a pending operation keyed by the resource it
//! concerns (the script url, or the single execute slot). The matching reply
//! resolves it; disconnect resolves every pending operation with
//! [`ConnectionError::Disconnected`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::{HostMessage, WorkerMessage};
use crate::transport::{Transport, TransportConfig, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to import {url}: {error}")]
    ImportFailed { url: String, error: String },

    #[error("execution failed: {0}")]
    ExecuteFailed(String),

    #[error("a request for {0} is already in flight")]
    AlreadyPending(String),

    #[error("worker disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Import(String),
    Execute,
}

impl std::fmt::Display for PendingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingKey::Import(url) => f.write_str(url),
            PendingKey::Execute => f.write_str("execute"),
        }
    }
}

type Reply = Result<(), ConnectionError>;
type MessageHandler = Box<dyn FnMut(Value) + Send>;
type ExceptionHandler = Box<dyn FnMut(String) + Send>;
type RejectionHandler = Box<dyn FnMut(String, Option<Value>) + Send>;
type DisconnectHandler = Box<dyn FnOnce() + Send>;

struct Routes {
    closed: AtomicBool,
    pending: DashMap<PendingKey, oneshot::Sender<Reply>>,
    on_message: StdMutex<MessageHandler>,
    on_exception: StdMutex<ExceptionHandler>,
    on_rejection: StdMutex<RejectionHandler>,
    on_disconnect: StdMutex<Option<DisconnectHandler>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn log_exception(error: String) {
    tracing::error!(
        target: "jailbox::sandbox",
        at = %chrono::Utc::now().to_rfc3339(),
        "Runtime exception: {error}"
    );
}

pub(crate) fn log_rejection(error: String, extras: Option<Value>) {
    tracing::error!(
        target: "jailbox::sandbox",
        at = %chrono::Utc::now().to_rfc3339(),
        extras = ?extras,
        "Runtime rejection: {error}"
    );
}

impl Routes {
    fn route(&self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Message { data } => (*lock(&self.on_message))(data),
            WorkerMessage::ImportSuccess { url } => self.resolve(PendingKey::Import(url), Ok(())),
            WorkerMessage::ImportFailure { url, error } => {
                let key = PendingKey::Import(url.clone());
                self.resolve(key, Err(ConnectionError::ImportFailed { url, error }))
            }
            WorkerMessage::ExecuteSuccess => self.resolve(PendingKey::Execute, Ok(())),
            WorkerMessage::ExecuteFailure { error } => {
                self.resolve(PendingKey::Execute, Err(ConnectionError::ExecuteFailed(error)))
            }
            WorkerMessage::RuntimeException { error } => (*lock(&self.on_exception))(error),
            WorkerMessage::RuntimeRejection { error, extras } => {
                (*lock(&self.on_rejection))(error, extras)
            }
        }
    }

    fn resolve(&self, key: PendingKey, reply: Reply) {
        match self.pending.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => tracing::warn!(request = %key, "Reply for a request that is not pending"),
        }
    }

    fn close(&self) {
        let handler = {
            let mut slot = lock(&self.on_disconnect);
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        // Dropping the senders wakes every waiter with Disconnected.
        self.pending.clear();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// An in-flight request. Dropping it before the reply arrived unregisters
/// the key, so a cancelled caller does not block later requests.
struct Pending {
    routes: Arc<Routes>,
    key: PendingKey,
    reply: oneshot::Receiver<Reply>,
}

impl Drop for Pending {
    fn drop(&mut self) {
        self.reply.close();
        // Only our own sender is closed; a newer request under the same key
        // keeps its entry.
        let abandoned = self
            .routes
            .pending
            .remove_if(&self.key, |_, tx| tx.is_closed());
        if abandoned.is_some() {
            tracing::debug!(request = %self.key, "Request abandoned before its reply");
        }
    }
}

/// Domain-level operations against one worker.
pub struct ProtocolConnection {
    transport: Transport,
    routes: Arc<Routes>,
}

impl ProtocolConnection {
    /// Spawn a worker and wrap it.
    pub fn connect(config: &TransportConfig) -> Result<Self, TransportError> {
        Ok(Self::over(Transport::spawn(config)?))
    }

    /// Take over `transport`, replacing its handlers.
    pub fn over(transport: Transport) -> Self {
        let routes = Arc::new(Routes {
            closed: AtomicBool::new(false),
            pending: DashMap::new(),
            on_message: StdMutex::new(Box::new(|data| {
                tracing::debug!(%data, "No application message handler, dropping");
            })),
            on_exception: StdMutex::new(Box::new(log_exception)),
            on_rejection: StdMutex::new(Box::new(log_rejection)),
            on_disconnect: StdMutex::new(None),
        });

        let r = Arc::clone(&routes);
        transport.on_message(move |msg| r.route(msg));
        let r = Arc::clone(&routes);
        transport.on_disconnect(move |_status| r.close());

        Self { transport, routes }
    }

    /// Load a script in the worker and run it unrestricted.
    pub async fn import_script(&self, path: &str) -> Result<(), ConnectionError> {
        self.request(
            PendingKey::Import(path.to_string()),
            HostMessage::Import {
                url: path.to_string(),
            },
        )
        .await
    }

    /// Load a script in the worker and run it in the sandboxed scope.
    pub async fn import_sandboxed_script(&self, path: &str) -> Result<(), ConnectionError> {
        self.request(
            PendingKey::Import(path.to_string()),
            HostMessage::ImportJailed {
                url: path.to_string(),
            },
        )
        .await
    }

    /// Run inline code in the sandboxed scope.
    pub async fn execute(&self, code: &str) -> Result<(), ConnectionError> {
        self.request(
            PendingKey::Execute,
            HostMessage::Execute {
                code: code.to_string(),
            },
        )
        .await
    }

    async fn request(&self, key: PendingKey, msg: HostMessage) -> Result<(), ConnectionError> {
        let mut pending = self.register(key)?;
        tracing::debug!(request = %pending.key, "Sending request");
        self.transport.send(msg);
        (&mut pending.reply)
            .await
            .unwrap_or(Err(ConnectionError::Disconnected))
    }

    fn register(&self, key: PendingKey) -> Result<Pending, ConnectionError> {
        if self.routes.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        match self.routes.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(ConnectionError::AlreadyPending(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }
        // close() may have run between the check above and the insert.
        if self.routes.closed.load(Ordering::SeqCst) {
            self.routes.pending.remove(&key);
            return Err(ConnectionError::Disconnected);
        }
        Ok(Pending {
            routes: Arc::clone(&self.routes),
            key,
            reply: rx,
        })
    }

    /// Send an application message. Dropped silently once disconnected.
    pub fn send(&self, data: Value) {
        self.transport.send(HostMessage::Message { data });
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(Value) + Send + 'static,
    {
        *lock(&self.routes.on_message) = Box::new(handler);
    }

    pub fn on_uncaught_exception<F>(&self, handler: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        *lock(&self.routes.on_exception) = Box::new(handler);
    }

    pub fn on_uncaught_rejection<F>(&self, handler: F)
    where
        F: FnMut(String, Option<Value>) + Send + 'static,
    {
        *lock(&self.routes.on_rejection) = Box::new(handler);
    }

    /// Runs once when the worker is gone, after pending requests failed.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = lock(&self.routes.on_disconnect);
        if self.routes.closed.load(Ordering::SeqCst) {
            drop(slot);
            handler();
            return;
        }
        *slot = Some(Box::new(handler));
    }

    pub fn disconnect(&self) {
        self.transport.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.transport.is_disconnected()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl Drop for ProtocolConnection {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}
