//! Capability exchange between host and worker.
//!
//! Each side advertises the names of the methods it exposes; the other side
//! builds a [`RemoteInterface`] from them. Calls and callbacks travel as
//! [`SiteMessage`]s inside application messages. All callbacks passed in one
//! call form a group, and invoking any of them consumes the whole group.

mod interface;
pub mod protocol;

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde_json::Value;
use tokio::sync::oneshot;

pub use interface::{Arg, Interface, LocalCallback, Method, Param};
pub use protocol::{SiteMessage, WireArg};

use crate::transport::panic_message;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SiteError {
    #[error("remote interface has no method {0:?}")]
    UnknownMethod(String),
    #[error("site is disconnected")]
    Disconnected,
}

type Outbound = Box<dyn Fn(Value) + Send + Sync>;

struct SiteShared {
    outbound: Outbound,
    closed: AtomicBool,
    local: StdMutex<Interface>,
    remote: StdMutex<Option<RemoteInterface>>,
    callbacks: StdMutex<HashMap<u64, Vec<LocalCallback>>>,
    next_callback: AtomicU64,
    interface_ack: StdMutex<Option<oneshot::Sender<()>>>,
    remote_waiter: StdMutex<Option<oneshot::Sender<RemoteInterface>>>,
    on_disconnect_request: StdMutex<Option<Box<dyn FnOnce() + Send>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SiteShared {
    fn send(&self, msg: SiteMessage) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::trace!(?msg, "Site closed, dropping message");
            return;
        }
        match serde_json::to_value(&msg) {
            Ok(data) => (self.outbound)(data),
            Err(e) => tracing::error!(error = %e, "Failed to encode site message"),
        }
    }

    /// Store the callbacks among `params` as one group.
    fn wrap(&self, params: Vec<Param>) -> (Vec<WireArg>, Option<u64>) {
        let mut group = Vec::new();
        let mut args = Vec::with_capacity(params.len());
        for param in params {
            match param {
                Param::Value(value) => args.push(WireArg::Argument { value }),
                Param::Callback(callback) => {
                    args.push(WireArg::Callback { num: group.len() });
                    group.push(callback);
                }
            }
        }
        if group.is_empty() {
            return (args, None);
        }
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.callbacks).insert(id, group);
        (args, Some(id))
    }

    fn unwrap(self: &Arc<Self>, args: Vec<WireArg>, callback_id: Option<u64>) -> Vec<Arg> {
        args.into_iter()
            .map(|arg| match (arg, callback_id) {
                (WireArg::Argument { value }, _) => Arg::Value(value),
                (WireArg::Callback { num }, Some(id)) => Arg::Callback(RemoteCallback {
                    site: Arc::downgrade(self),
                    id,
                    num,
                }),
                (WireArg::Callback { num }, None) => {
                    tracing::warn!(num, "Callback argument without a callback id");
                    Arg::Value(Value::Null)
                }
            })
            .collect()
    }
}

fn guarded(f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::error!(
            panic = panic_message(panic.as_ref()),
            "Interface function panicked"
        );
    }
}

/// Callback received from the other side. Calling any callback of a group
/// consumes the group on the other side.
#[derive(Clone)]
pub struct RemoteCallback {
    site: Weak<SiteShared>,
    id: u64,
    num: usize,
}

impl RemoteCallback {
    pub fn call(&self, params: Vec<Param>) -> Result<(), SiteError> {
        let site = live(&self.site)?;
        let (args, callback_id) = site.wrap(params);
        site.send(SiteMessage::Callback {
            id: self.id,
            num: self.num,
            args,
            callback_id,
        });
        Ok(())
    }
}

impl std::fmt::Debug for RemoteCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallback")
            .field("id", &self.id)
            .field("num", &self.num)
            .finish()
    }
}

fn live(site: &Weak<SiteShared>) -> Result<Arc<SiteShared>, SiteError> {
    site.upgrade()
        .filter(|site| !site.closed.load(Ordering::SeqCst))
        .ok_or(SiteError::Disconnected)
}

/// Methods the other side exposes.
#[derive(Clone)]
pub struct RemoteInterface {
    site: Weak<SiteShared>,
    methods: Arc<[String]>,
}

impl RemoteInterface {
    pub fn call(&self, name: &str, params: Vec<Param>) -> Result<(), SiteError> {
        if !self.has(name) {
            return Err(SiteError::UnknownMethod(name.to_string()));
        }
        let site = live(&self.site)?;
        let (args, callback_id) = site.wrap(params);
        site.send(SiteMessage::Method {
            name: name.to_string(),
            args,
            callback_id,
        });
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }
}

impl std::fmt::Debug for RemoteInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.methods.iter()).finish()
    }
}

/// One side of a capability exchange.
#[derive(Clone)]
pub struct Site {
    shared: Arc<SiteShared>,
}

impl Site {
    /// `outbound` delivers encoded site messages to the other side.
    pub fn new<F>(interface: Interface, outbound: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(SiteShared {
                outbound: Box::new(outbound),
                closed: AtomicBool::new(false),
                local: StdMutex::new(interface),
                remote: StdMutex::new(None),
                callbacks: StdMutex::new(HashMap::new()),
                next_callback: AtomicU64::new(0),
                interface_ack: StdMutex::new(None),
                remote_waiter: StdMutex::new(None),
                on_disconnect_request: StdMutex::new(None),
            }),
        }
    }

    /// Advertise the local interface. The message is sent immediately; the
    /// returned future resolves when the other side acknowledges it.
    pub fn send_interface(&self) -> impl Future<Output = Result<(), SiteError>> + use<> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.interface_ack) = Some(tx);
        let api = lock(&self.shared.local).names();
        self.shared.send(SiteMessage::SetInterface { api });
        async move { rx.await.map_err(|_| SiteError::Disconnected) }
    }

    /// Ask the other side for its interface. The request is sent immediately;
    /// the returned future resolves with the descriptor built from the answer.
    pub fn request_remote(
        &self,
    ) -> impl Future<Output = Result<RemoteInterface, SiteError>> + use<> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.remote_waiter) = Some(tx);
        self.shared.send(SiteMessage::GetInterface);
        async move { rx.await.map_err(|_| SiteError::Disconnected) }
    }

    /// Most recent descriptor of the other side's interface.
    pub fn remote(&self) -> Option<RemoteInterface> {
        lock(&self.shared.remote).clone()
    }

    /// Called when the other side announces it is disconnecting.
    pub fn on_disconnect_request<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.shared.on_disconnect_request) = Some(Box::new(handler));
    }

    /// Process one inbound site message.
    pub fn handle_message(&self, data: Value) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let msg = match serde_json::from_value::<SiteMessage>(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed site message");
                return;
            }
        };

        match msg {
            SiteMessage::Method {
                name,
                args,
                callback_id,
            } => {
                let method = lock(&self.shared.local).get(&name);
                let Some(method) = method else {
                    tracing::warn!(method = %name, "Call to a method this side does not expose");
                    return;
                };
                let args = self.shared.unwrap(args, callback_id);
                tracing::trace!(method = %name, "Invoking local method");
                guarded(|| method(args));
            }
            SiteMessage::Callback {
                id,
                num,
                args,
                callback_id,
            } => {
                let group = lock(&self.shared.callbacks).remove(&id);
                let Some(callback) = group.and_then(|group| group.into_iter().nth(num)) else {
                    tracing::warn!(id, num, "Callback already consumed or never issued");
                    return;
                };
                let args = self.shared.unwrap(args, callback_id);
                guarded(|| callback(args));
            }
            SiteMessage::SetInterface { api } => {
                let remote = RemoteInterface {
                    site: Arc::downgrade(&self.shared),
                    methods: api.into(),
                };
                tracing::debug!(methods = ?remote.methods(), "Remote interface updated");
                *lock(&self.shared.remote) = Some(remote.clone());
                if let Some(waiter) = lock(&self.shared.remote_waiter).take() {
                    let _ = waiter.send(remote);
                }
                self.shared.send(SiteMessage::InterfaceSetAsRemote);
            }
            SiteMessage::GetInterface => {
                let api = lock(&self.shared.local).names();
                self.shared.send(SiteMessage::SetInterface { api });
            }
            SiteMessage::InterfaceSetAsRemote => {
                if let Some(ack) = lock(&self.shared.interface_ack).take() {
                    let _ = ack.send(());
                }
            }
            SiteMessage::Disconnect => {
                let handler = lock(&self.shared.on_disconnect_request).take();
                if let Some(handler) = handler {
                    handler();
                }
            }
        }
    }

    /// Stop exchanging messages. Waiters resolve with
    /// [`SiteError::Disconnected`]; stored callbacks and the local interface
    /// are released.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.shared.callbacks).clear();
        lock(&self.shared.interface_ack).take();
        lock(&self.shared.remote_waiter).take();
        lock(&self.shared.on_disconnect_request).take();
        *lock(&self.shared.local) = Interface::new();
        lock(&self.shared.remote).take();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}
