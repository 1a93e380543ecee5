//! Plugin lifecycle: turns a worker process into a connected capability session.
//!
//! Handshake, driven by one task per plugin:
//! 1. Spawn the worker
//! 2. Import the bootstrap site script
//! 3. Import the runtime support script (arms the optional timeout)
//! 4. Send the host interface, wait for the worker to acknowledge it
//! 5. Run the plugin body, then request the worker's interface
//! 6. Connected once the worker answered
//!
//! Every fatal path converges on `fail`: fail event, teardown, disconnect
//! event, exactly once. The three events share one queue, so their handlers
//! run in that order too.

use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::protocol::{BOOTSTRAP_SCRIPT, PluginId, RUNTIME_SCRIPT};
use crate::connection::{ConnectionError, ProtocolConnection, log_exception, log_rejection};
use crate::event::{EventError, EventQueue, OneShotEvent};
use crate::site::{Interface, RemoteInterface, Site, SiteError};
use crate::transport::TransportConfig;

/// What the plugin runs once the worker runtime is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Path or http(s) url of a script, imported into the sandboxed scope.
    Script(String),
    /// Inline code, executed in the sandboxed scope.
    Code(String),
}

impl PluginSource {
    async fn load(&self, connection: &ProtocolConnection) -> Result<(), ConnectionError> {
        match self {
            PluginSource::Script(path) => connection.import_sandboxed_script(path).await,
            PluginSource::Code(code) => connection.execute(code).await,
        }
    }
}

pub type RejectionHandler = Arc<dyn Fn(&str, Option<&Value>) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PluginOptions {
    /// Deadline for the handshake, counted from the runtime import.
    pub timeout: Option<Duration>,
    /// Treat runtime exceptions and rejections as fatal.
    pub fail_on_runtime_error: bool,
    pub on_uncaught_rejection: Option<RejectionHandler>,
}

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero timeout means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_fail_on_runtime_error(mut self, fail: bool) -> Self {
        self.fail_on_runtime_error = fail;
        self
    }

    pub fn with_uncaught_rejection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, Option<&Value>) + Send + Sync + 'static,
    {
        self.on_uncaught_rejection = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginOptions")
            .field("timeout", &self.timeout)
            .field("fail_on_runtime_error", &self.fail_on_runtime_error)
            .field(
                "on_uncaught_rejection",
                &self.on_uncaught_rejection.is_some(),
            )
            .finish()
    }
}

/// Progress of a plugin's handshake, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    Connecting,
    BootstrapImported,
    RuntimeImported,
    InterfaceSent,
    RemoteRequested,
    Connected,
    Failed,
    Disconnected,
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Failed | HandshakeState::Disconnected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("failed to start worker: {0}")]
    Spawn(String),

    #[error("failed to import {url}: {error}")]
    Import { url: String, error: String },

    #[error("{0}")]
    Execute(String),

    #[error("runtime exception: {0}")]
    RuntimeException(String),

    #[error("runtime rejection: {0}")]
    RuntimeRejection(String),

    #[error("TimeoutError: Maximum execution time of {} ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker disconnected")]
    Disconnected,
}

impl From<ConnectionError> for PluginError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::ImportFailed { url, error } => PluginError::Import { url, error },
            ConnectionError::ExecuteFailed(error) => PluginError::Execute(error),
            ConnectionError::AlreadyPending(_) => PluginError::Protocol(err.to_string()),
            ConnectionError::Disconnected => PluginError::Disconnected,
        }
    }
}

impl From<SiteError> for PluginError {
    fn from(err: SiteError) -> Self {
        match err {
            SiteError::Disconnected => PluginError::Disconnected,
            SiteError::UnknownMethod(_) => PluginError::Protocol(err.to_string()),
        }
    }
}

struct Session {
    connection: ProtocolConnection,
    site: Site,
}

struct PluginInner {
    id: PluginId,
    options: PluginOptions,
    state: StdMutex<HandshakeState>,
    session: OnceLock<Session>,
    cancel: CancellationToken,
    connected: OneShotEvent<()>,
    failed: OneShotEvent<PluginError>,
    disconnected: OneShotEvent<()>,
}

impl PluginInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(
        self: Arc<Self>,
        source: PluginSource,
        interface: Interface,
        transport: TransportConfig,
    ) {
        let connection = match ProtocolConnection::connect(&transport) {
            Ok(connection) => connection,
            Err(e) => {
                self.fail(PluginError::Spawn(e.to_string()));
                return;
            }
        };
        let site = {
            let transport = connection.transport().clone();
            Site::new(interface, move |data| {
                transport.send(crate::bridge::protocol::HostMessage::Message { data })
            })
        };
        self.wire(&connection, &site);
        let _ = self.session.set(Session { connection, site });

        // disconnect() may have run before the session existed.
        if self.cancel.is_cancelled() {
            self.teardown();
            return;
        }
        let Some(session) = self.session.get() else {
            return;
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            outcome = self.handshake(session, &source) => outcome,
        };
        match outcome {
            Ok(()) => self.mark_connected(),
            Err(error) => self.fail(error),
        }
    }

    fn wire(self: &Arc<Self>, connection: &ProtocolConnection, site: &Site) {
        let s = site.clone();
        connection.on_message(move |data| s.handle_message(data));

        let weak = Arc::downgrade(self);
        connection.on_uncaught_exception(move |error| {
            if let Some(plugin) = weak.upgrade() {
                plugin.runtime_exception(error);
            }
        });
        let weak = Arc::downgrade(self);
        connection.on_uncaught_rejection(move |error, extras| {
            if let Some(plugin) = weak.upgrade() {
                plugin.runtime_rejection(error, extras);
            }
        });
        let weak = Arc::downgrade(self);
        connection.on_disconnect(move || {
            if let Some(plugin) = weak.upgrade() {
                plugin.worker_exited();
            }
        });
        let weak = Arc::downgrade(self);
        site.on_disconnect_request(move || {
            if let Some(plugin) = weak.upgrade() {
                tracing::info!("Plugin requested disconnect");
                plugin.shutdown();
            }
        });
    }

    async fn handshake(&self, session: &Session, source: &PluginSource) -> Result<(), PluginError> {
        session.connection.import_script(BOOTSTRAP_SCRIPT).await?;
        self.advance(HandshakeState::BootstrapImported)?;
        session.connection.import_script(RUNTIME_SCRIPT).await?;
        self.advance(HandshakeState::RuntimeImported)?;

        let exchange = self.exchange(session, source);
        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| PluginError::Timeout(limit))?,
            None => exchange.await,
        }
    }

    async fn exchange(&self, session: &Session, source: &PluginSource) -> Result<(), PluginError> {
        let acknowledged = session.site.send_interface();
        self.advance(HandshakeState::InterfaceSent)?;
        acknowledged.await?;

        source.load(&session.connection).await?;

        let remote = session.site.request_remote();
        self.advance(HandshakeState::RemoteRequested)?;
        let remote = remote.await?;
        tracing::debug!(methods = ?remote.methods(), "Received plugin interface");
        Ok(())
    }

    /// Move forward unless a terminal state was reached in the meantime.
    fn advance(&self, next: HandshakeState) -> Result<(), PluginError> {
        let mut state = self.lock_state();
        if state.is_terminal() {
            return Err(PluginError::Disconnected);
        }
        if next > *state {
            tracing::trace!(from = ?*state, to = ?next, "Handshake step");
            *state = next;
        }
        Ok(())
    }

    fn mark_connected(&self) {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                return;
            }
            *state = HandshakeState::Connected;
        }
        tracing::info!("Plugin connected");
        self.connected.emit(());
    }

    fn fail(&self, error: PluginError) {
        {
            let mut state = self.lock_state();
            if state.is_terminal() {
                tracing::debug!(%error, "Ignoring failure after teardown");
                return;
            }
            *state = HandshakeState::Failed;
            tracing::warn!(%error, "Plugin failed");
            // Emitted under the lock so no disconnect can be announced first.
            self.failed.emit(error);
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if *state == HandshakeState::Disconnected {
                return;
            }
            *state = HandshakeState::Disconnected;
        }
        self.cancel.cancel();
        self.teardown();
        tracing::info!("Plugin disconnected");
        self.disconnected.emit(());
    }

    fn teardown(&self) {
        if let Some(session) = self.session.get() {
            session.site.close();
            session.connection.disconnect();
        }
    }

    fn worker_exited(&self) {
        if *self.lock_state() < HandshakeState::Connected {
            self.fail(PluginError::Disconnected);
        } else {
            self.shutdown();
        }
    }

    fn runtime_exception(&self, error: String) {
        if self.options.fail_on_runtime_error {
            self.fail(PluginError::RuntimeException(error));
        } else {
            log_exception(error);
        }
    }

    fn runtime_rejection(&self, error: String, extras: Option<Value>) {
        match &self.options.on_uncaught_rejection {
            Some(handler) => handler(&error, extras.as_ref()),
            None => log_rejection(error.clone(), extras),
        }
        if self.options.fail_on_runtime_error {
            self.fail(PluginError::RuntimeRejection(error));
        }
    }
}

/// Last user handle going away tears the plugin down.
struct Owner(Arc<PluginInner>);

impl Drop for Owner {
    fn drop(&mut self) {
        self.0.shutdown();
    }
}

/// A plugin running in its own worker process.
#[derive(Clone)]
pub struct Plugin {
    owner: Arc<Owner>,
}

impl Plugin {
    /// Start a plugin with the worker resolved from the environment.
    /// Must be called within a Tokio runtime.
    pub fn new(source: PluginSource, interface: Interface, options: PluginOptions) -> Self {
        Self::with_transport(source, interface, options, TransportConfig::from_env())
    }

    pub fn script(path: impl Into<String>, interface: Interface, options: PluginOptions) -> Self {
        Self::new(PluginSource::Script(path.into()), interface, options)
    }

    pub fn dynamic(code: impl Into<String>, interface: Interface, options: PluginOptions) -> Self {
        Self::new(PluginSource::Code(code.into()), interface, options)
    }

    pub fn with_transport(
        source: PluginSource,
        interface: Interface,
        options: PluginOptions,
        transport: TransportConfig,
    ) -> Self {
        let events = EventQueue::new();
        let inner = Arc::new(PluginInner {
            id: PluginId::new(),
            options,
            state: StdMutex::new(HandshakeState::Connecting),
            session: OnceLock::new(),
            cancel: CancellationToken::new(),
            connected: OneShotEvent::on_queue("connect", &events),
            failed: OneShotEvent::on_queue("fail", &events),
            disconnected: OneShotEvent::on_queue("disconnect", &events),
        });
        let span = tracing::info_span!("plugin", id = %inner.id);
        tokio::spawn(
            Arc::clone(&inner)
                .run(source, interface, transport)
                .instrument(span),
        );
        Self {
            owner: Arc::new(Owner(inner)),
        }
    }

    fn inner(&self) -> &PluginInner {
        &self.owner.0
    }

    pub fn id(&self) -> PluginId {
        self.inner().id
    }

    pub fn state(&self) -> HandshakeState {
        *self.inner().lock_state()
    }

    /// The plugin's interface, while connected.
    pub fn remote(&self) -> Option<RemoteInterface> {
        if self.state() != HandshakeState::Connected {
            return None;
        }
        self.inner().session.get().and_then(|s| s.site.remote())
    }

    pub fn when_connected<F>(&self, handler: F) -> Result<(), EventError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner().connected.subscribe(move |()| handler())
    }

    pub fn when_failed<F>(&self, handler: F) -> Result<(), EventError>
    where
        F: FnOnce(PluginError) + Send + 'static,
    {
        self.inner().failed.subscribe(handler)
    }

    pub fn when_disconnected<F>(&self, handler: F) -> Result<(), EventError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner().disconnected.subscribe(move |()| handler())
    }

    /// Wait for the handshake to finish.
    pub async fn connected(&self) -> Result<RemoteInterface, PluginError> {
        let inner = self.inner();
        tokio::select! {
            biased;
            error = inner.failed.wait() => Err(error),
            () = inner.connected.wait() => self.remote().ok_or(PluginError::Disconnected),
            () = inner.disconnected.wait() => Err(PluginError::Disconnected),
        }
    }

    /// Wait until the plugin is disconnected.
    pub async fn disconnected(&self) {
        self.inner().disconnected.wait().await
    }

    /// Kill the worker. Idempotent; safe at any point of the handshake.
    pub fn disconnect(&self) {
        self.inner().shutdown();
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::FrameCodec;
    use crate::bridge::protocol::{HostMessage, WorkerMessage};
    use crate::site::Param;
    use crate::transport::{SpawnError, WorkerProcess, WorkerSpawner};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{DuplexStream, duplex};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[derive(Clone, Copy, Default)]
    enum Body {
        #[default]
        Succeeds,
        Throws(&'static str),
        Hangs,
        KillsWorker,
    }

    #[derive(Clone, Default)]
    struct FakeWorker {
        fail_import: Option<&'static str>,
        body: Body,
    }

    impl WorkerSpawner for FakeWorker {
        fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
            let (host_out, worker_in) = duplex(64 * 1024);
            let (worker_out, host_in) = duplex(64 * 1024);
            tokio::spawn(self.clone().serve(
                FramedRead::new(worker_in, FrameCodec::new()),
                FramedWrite::new(worker_out, FrameCodec::new()),
            ));
            Ok(WorkerProcess::from_streams(host_in, host_out))
        }
    }

    impl FakeWorker {
        async fn serve(
            self,
            mut from_host: FramedRead<DuplexStream, FrameCodec<HostMessage>>,
            mut to_host: FramedWrite<DuplexStream, FrameCodec<WorkerMessage>>,
        ) {
            while let Some(Ok(msg)) = from_host.next().await {
                let replies = match msg {
                    HostMessage::Heartbeat => vec![],
                    HostMessage::Import { url } | HostMessage::ImportJailed { url } => {
                        if self.fail_import == Some(url.as_str()) {
                            vec![WorkerMessage::ImportFailure {
                                url,
                                error: "Failed to load script".into(),
                            }]
                        } else {
                            vec![WorkerMessage::ImportSuccess { url }]
                        }
                    }
                    HostMessage::Execute { .. } => match self.body {
                        Body::Succeeds => vec![WorkerMessage::ExecuteSuccess],
                        Body::Throws(error) => vec![WorkerMessage::ExecuteFailure {
                            error: error.into(),
                        }],
                        Body::Hangs => vec![],
                        Body::KillsWorker => return,
                    },
                    HostMessage::Message { data } => site_reply(&data),
                };
                for reply in replies {
                    if to_host.send(reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn site_reply(data: &Value) -> Vec<WorkerMessage> {
        let message = |data| vec![WorkerMessage::Message { data }];
        match (data["type"].as_str(), data["name"].as_str()) {
            (Some("setInterface"), _) => message(json!({"type": "interfaceSetAsRemote"})),
            (Some("getInterface"), _) => {
                message(json!({"type": "setInterface", "api": ["explode", "reject", "leave"]}))
            }
            (Some("method"), Some("explode")) => vec![WorkerMessage::RuntimeException {
                error: "Error: boom".into(),
            }],
            (Some("method"), Some("reject")) => vec![WorkerMessage::RuntimeRejection {
                error: "job failed".into(),
                extras: Some(json!({"job": 1})),
            }],
            (Some("method"), Some("leave")) => message(json!({"type": "disconnect"})),
            _ => vec![],
        }
    }

    fn start(worker: FakeWorker, options: PluginOptions) -> Plugin {
        Plugin::with_transport(
            PluginSource::Code("application.setInterface({});".into()),
            Interface::new().method("report", |_| {}),
            options,
            TransportConfig::new(Arc::new(worker)),
        )
    }

    #[derive(Clone, Default)]
    struct Counts {
        connected: Arc<AtomicUsize>,
        failed: Arc<StdMutex<Vec<PluginError>>>,
        disconnected: Arc<AtomicUsize>,
    }

    impl Counts {
        fn watch(plugin: &Plugin) -> Self {
            let counts = Self::default();
            let c = counts.connected.clone();
            plugin
                .when_connected(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            let f = counts.failed.clone();
            plugin
                .when_failed(move |e| f.lock().unwrap().push(e))
                .unwrap();
            let d = counts.disconnected.clone();
            plugin
                .when_disconnected(move || {
                    d.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            counts
        }

        fn snapshot(&self) -> (usize, Vec<PluginError>, usize) {
            (
                self.connected.load(Ordering::SeqCst),
                self.failed.lock().unwrap().clone(),
                self.disconnected.load(Ordering::SeqCst),
            )
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn successful_handshake_connects_once() {
        let plugin = start(FakeWorker::default(), PluginOptions::new());
        let counts = Counts::watch(&plugin);

        let remote = plugin.connected().await.unwrap();
        assert_eq!(remote.methods(), ["explode", "reject", "leave"]);
        assert_eq!(plugin.state(), HandshakeState::Connected);
        settle().await;

        assert_eq!(counts.snapshot(), (1, vec![], 0));

        let late = Arc::new(AtomicUsize::new(0));
        let l = late.clone();
        plugin
            .when_connected(move || {
                l.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        settle().await;
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn body_failure_fails_then_disconnects() {
        let worker = FakeWorker {
            body: Body::Throws("SyntaxError: unexpected token"),
            ..Default::default()
        };
        let plugin = start(worker, PluginOptions::new());
        let counts = Counts::watch(&plugin);

        let err = plugin.connected().await.unwrap_err();
        assert_eq!(
            err,
            PluginError::Execute("SyntaxError: unexpected token".into())
        );
        plugin.disconnected().await;
        settle().await;

        assert_eq!(counts.snapshot(), (0, vec![err], 1));
        assert_eq!(plugin.state(), HandshakeState::Disconnected);
        assert!(plugin.remote().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fail_handlers_finish_before_disconnect_handlers() {
        for _ in 0..20 {
            let worker = FakeWorker {
                body: Body::Throws("Error: boom"),
                ..Default::default()
            };
            let plugin = start(worker, PluginOptions::new());
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

            let t = tx.clone();
            plugin
                .when_failed(move |_| {
                    std::thread::sleep(Duration::from_millis(2));
                    let _ = t.send("fail");
                })
                .unwrap();
            plugin
                .when_disconnected(move || {
                    let _ = tx.send("disconnect");
                })
                .unwrap();

            assert_eq!(rx.recv().await, Some("fail"));
            assert_eq!(rx.recv().await, Some("disconnect"));
        }
    }

    #[tokio::test]
    async fn bootstrap_import_failure_is_fatal() {
        let worker = FakeWorker {
            fail_import: Some(BOOTSTRAP_SCRIPT),
            ..Default::default()
        };
        let plugin = start(worker, PluginOptions::new());

        let err = plugin.connected().await.unwrap_err();
        assert_eq!(
            err,
            PluginError::Import {
                url: BOOTSTRAP_SCRIPT.into(),
                error: "Failed to load script".into(),
            }
        );
    }

    #[tokio::test]
    async fn disconnect_before_connected_suppresses_connect() {
        let worker = FakeWorker {
            body: Body::Hangs,
            ..Default::default()
        };
        let plugin = start(worker, PluginOptions::new());
        let counts = Counts::watch(&plugin);

        plugin.disconnect();
        plugin.disconnect();
        plugin.disconnected().await;
        settle().await;

        assert_eq!(counts.snapshot(), (0, vec![], 1));
        assert_eq!(
            plugin.connected().await.unwrap_err(),
            PluginError::Disconnected
        );
    }

    #[tokio::test]
    async fn hanging_body_times_out() {
        let worker = FakeWorker {
            body: Body::Hangs,
            ..Default::default()
        };
        let options = PluginOptions::new().with_timeout(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let plugin = start(worker, options);
        let counts = Counts::watch(&plugin);

        let err = plugin.connected().await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(err, PluginError::Timeout(Duration::from_millis(100)));
        assert_eq!(
            err.to_string(),
            "TimeoutError: Maximum execution time of 100 ms exceeded"
        );
        plugin.disconnected().await;
        settle().await;
        assert_eq!(counts.snapshot(), (0, vec![err], 1));
    }

    #[tokio::test]
    async fn generous_timeout_does_not_fire() {
        let options = PluginOptions::new().with_timeout(Duration::from_secs(30));
        let plugin = start(FakeWorker::default(), options);
        plugin.connected().await.unwrap();
        assert_eq!(plugin.state(), HandshakeState::Connected);
    }

    #[tokio::test]
    async fn worker_exit_during_handshake_is_a_failure() {
        let worker = FakeWorker {
            body: Body::KillsWorker,
            ..Default::default()
        };
        let plugin = start(worker, PluginOptions::new());
        let counts = Counts::watch(&plugin);

        assert_eq!(
            plugin.connected().await.unwrap_err(),
            PluginError::Disconnected
        );
        plugin.disconnected().await;
        settle().await;
        assert_eq!(counts.snapshot(), (0, vec![PluginError::Disconnected], 1));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        struct Broken;
        impl WorkerSpawner for Broken {
            fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
                Err(SpawnError::Other("no worker binary".into()))
            }
        }
        let plugin = Plugin::with_transport(
            PluginSource::Script("plugin.js".into()),
            Interface::new(),
            PluginOptions::new(),
            TransportConfig::new(Arc::new(Broken)),
        );

        let err = plugin.connected().await.unwrap_err();
        assert_eq!(err, PluginError::Spawn("no worker binary".into()));
        plugin.disconnected().await;
    }

    #[tokio::test]
    async fn runtime_exception_is_diagnostic_by_default() {
        let plugin = start(FakeWorker::default(), PluginOptions::new());
        let remote = plugin.connected().await.unwrap();

        remote.call("explode", vec![]).unwrap();
        settle().await;
        assert_eq!(plugin.state(), HandshakeState::Connected);
    }

    #[tokio::test]
    async fn runtime_exception_is_fatal_when_configured() {
        let options = PluginOptions::new().with_fail_on_runtime_error(true);
        let plugin = start(FakeWorker::default(), options);
        let counts = Counts::watch(&plugin);
        let remote = plugin.connected().await.unwrap();

        remote.call("explode", vec![Param::value(1)]).unwrap();
        plugin.disconnected().await;
        settle().await;

        assert_eq!(
            counts.snapshot(),
            (
                1,
                vec![PluginError::RuntimeException("Error: boom".into())],
                1
            )
        );
    }

    #[tokio::test]
    async fn rejection_handler_receives_rejections() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let options = PluginOptions::new().with_uncaught_rejection_handler(move |error, extras| {
            let _ = tx.send((error.to_string(), extras.cloned()));
        });
        let plugin = start(FakeWorker::default(), options);
        let remote = plugin.connected().await.unwrap();

        remote.call("reject", vec![]).unwrap();
        let (error, extras) = rx.recv().await.unwrap();
        assert_eq!(error, "job failed");
        assert_eq!(extras, Some(json!({"job": 1})));
        assert_eq!(plugin.state(), HandshakeState::Connected);
    }

    #[tokio::test]
    async fn plugin_side_disconnect_is_not_a_failure() {
        let plugin = start(FakeWorker::default(), PluginOptions::new());
        let counts = Counts::watch(&plugin);
        let remote = plugin.connected().await.unwrap();

        remote.call("leave", vec![]).unwrap();
        plugin.disconnected().await;
        settle().await;

        assert_eq!(counts.snapshot(), (1, vec![], 1));
        assert!(remote.call("leave", vec![]).is_err());
    }
}
