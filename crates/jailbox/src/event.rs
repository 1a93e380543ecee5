//! Single-emission lifecycle events.
//!
//! Handlers never run inside `emit` or `subscribe`: they are queued on an
//! [`EventQueue`] and run later by its drain task, so a handler can emit or
//! subscribe to other events without reentrancy. Events that share a queue
//! run their handlers one at a time, in the order they were scheduled.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};

type Handler<P> = Box<dyn FnOnce(P) + Send + 'static>;
type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("invalid subscriber for {event} event: {reason}")]
    InvalidSubscriber { event: &'static str, reason: String },
}

/// FIFO of handler batches, drained by a single task.
///
/// Created inside a Tokio runtime, the drain is a task on that runtime;
/// otherwise it is a plain thread.
#[derive(Clone)]
pub struct EventQueue {
    jobs: mpsc::UnboundedSender<Job>,
    runtime: Option<Handle>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = Handle::try_current().ok();
        match &runtime {
            Some(runtime) => {
                runtime.spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job();
                    }
                });
            }
            None => {
                std::thread::spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        job();
                    }
                });
            }
        }
        Self { jobs, runtime }
    }

    fn push(&self, job: Job) {
        if self.jobs.send(job).is_err() {
            tracing::debug!("Event queue stopped, dropping handlers");
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("on_runtime", &self.runtime.is_some())
            .finish()
    }
}

struct State<P> {
    payload: Option<P>,
    handlers: Vec<Handler<P>>,
}

struct Inner<P> {
    name: &'static str,
    state: StdMutex<State<P>>,
    notify: watch::Sender<Option<P>>,
    queue: EventQueue,
}

/// Fires at most once and replays its payload to late subscribers.
pub struct OneShotEvent<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for OneShotEvent<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> std::fmt::Debug for OneShotEvent<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneShotEvent")
            .field("name", &self.inner.name)
            .field("emitted", &self.inner.notify.borrow().is_some())
            .finish()
    }
}

impl<P: Clone + Send + Sync + 'static> OneShotEvent<P> {
    /// Create an event with a queue of its own.
    pub fn new(name: &'static str) -> Self {
        Self::on_queue(name, &EventQueue::new())
    }

    /// Create an event whose handlers run on `queue`, ordered with the
    /// handlers of every other event on it.
    pub fn on_queue(name: &'static str, queue: &EventQueue) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: StdMutex::new(State {
                    payload: None,
                    handlers: Vec::new(),
                }),
                notify: watch::Sender::new(None),
                queue: queue.clone(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Emit the event. Only the first call has any effect; returns whether
    /// this call was the one that emitted.
    pub fn emit(&self, payload: P) -> bool {
        let mut state = self.lock();
        if state.payload.is_some() {
            tracing::trace!(event = self.inner.name, "Ignoring repeated emit");
            return false;
        }
        state.payload = Some(payload.clone());
        let handlers = std::mem::take(&mut state.handlers);
        tracing::trace!(
            event = self.inner.name,
            handlers = handlers.len(),
            "Event emitted"
        );
        if !handlers.is_empty() {
            let name = self.inner.name;
            let payload = payload.clone();
            // Queued under the lock: a concurrent late subscriber lands
            // behind this batch.
            self.inner.queue.push(Box::new(move || {
                for handler in handlers {
                    invoke(name, handler, payload.clone());
                }
            }));
        }
        drop(state);
        self.inner.notify.send_replace(Some(payload));
        true
    }

    /// Register a handler. Before emission it is queued behind earlier
    /// handlers; after emission it is scheduled with the recorded payload.
    pub fn subscribe<F>(&self, handler: F) -> Result<(), EventError>
    where
        F: FnOnce(P) + Send + 'static,
    {
        if self.inner.queue.runtime.is_none() && Handle::try_current().is_err() {
            return Err(EventError::InvalidSubscriber {
                event: self.inner.name,
                reason: "no async runtime available to schedule the handler".to_string(),
            });
        }

        let mut state = self.lock();
        match &state.payload {
            Some(payload) => {
                let name = self.inner.name;
                let payload = payload.clone();
                self.inner
                    .queue
                    .push(Box::new(move || invoke(name, Box::new(handler), payload)));
            }
            None => state.handlers.push(Box::new(handler)),
        }
        Ok(())
    }

    pub fn is_emitted(&self) -> bool {
        self.inner.notify.borrow().is_some()
    }

    pub fn payload(&self) -> Option<P> {
        self.inner.notify.borrow().clone()
    }

    /// Wait until the event has been emitted and return its payload.
    pub async fn wait(&self) -> P {
        let mut rx = self.inner.notify.subscribe();
        loop {
            if let Some(payload) = rx.borrow_and_update().clone() {
                return payload;
            }
            // The sender lives in `self`, so `changed` only errors if the
            // event is being torn down underneath us.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<P>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn invoke<P>(event: &'static str, handler: Handler<P>, payload: P) {
    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
        tracing::error!(event, "Event handler panicked");
    }
}
