//! Physical channel to one worker process.
//!
//! Owns the child, frames outbound [`HostMessage`]s onto its stdin, decodes
//! [`WorkerMessage`]s from its stdout, sends heartbeats, and announces exit
//! exactly once.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{HostMessage, WorkerMessage};

/// Default interval between heartbeat messages.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Name of the worker executable looked up next to the host binary and on PATH.
pub const WORKER_BIN: &str = "jailbox-worker";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Io(#[from] io::Error),
    #[error("worker process is missing its {0} pipe")]
    MissingPipe(&'static str),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A started worker: its byte channel plus the process, when there is one.
pub struct WorkerProcess {
    child: Option<Child>,
    reader: BoxedReader,
    writer: BoxedWriter,
}

impl WorkerProcess {
    /// Take the piped stdin/stdout of a spawned child.
    pub fn from_child(mut child: Child) -> Result<Self, SpawnError> {
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        Ok(Self {
            child: Some(child),
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        })
    }

    /// A worker reached over an arbitrary stream pair, with no process to
    /// supervise. End of stream counts as exit.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            child: None,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Starts worker processes.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError>;
}

/// Spawns the worker executable with piped stdin/stdout; stderr is inherited
/// so worker logs land next to the host's.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            envs: Vec::new(),
        }
    }

    /// Resolve the worker executable: `JAILBOX_WORKER`, then a sibling of the
    /// current executable, then PATH.
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("JAILBOX_WORKER") {
            return Self::new(path);
        }
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
            .filter(|path| path.is_file());
        Self::new(sibling.unwrap_or_else(|| PathBuf::from(WORKER_BIN)))
    }

    /// Extra environment for the worker, e.g. `JAILBOX_JS_MEMORY_LIMIT`.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self) -> Result<WorkerProcess, SpawnError> {
        let child = Command::new(&self.program)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(program = %self.program.display(), pid = ?child.id(), "Spawned worker");
        WorkerProcess::from_child(child)
    }
}

/// How to start and supervise a worker.
#[derive(Clone)]
pub struct TransportConfig {
    pub spawner: Arc<dyn WorkerSpawner>,
    pub heartbeat_interval: Duration,
}

impl TransportConfig {
    pub fn new(spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            spawner,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// `CommandSpawner::from_env()` plus `JAILBOX_HEARTBEAT_MS`.
    pub fn from_env() -> Self {
        let config = Self::new(Arc::new(CommandSpawner::from_env()));
        match std::env::var("JAILBOX_HEARTBEAT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
        {
            Some(ms) => config.with_heartbeat_interval(Duration::from_millis(ms)),
            None => config,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

type MessageHandler = Box<dyn FnMut(WorkerMessage) + Send>;
type DisconnectHandler = Box<dyn FnOnce(Option<ExitStatus>) + Send>;

enum ExitSlot {
    Running(Option<DisconnectHandler>),
    Exited(Option<ExitStatus>),
}

struct Shared {
    disconnected: AtomicBool,
    outbound: mpsc::UnboundedSender<HostMessage>,
    kill: CancellationToken,
    on_message: StdMutex<MessageHandler>,
    on_disconnect: StdMutex<ExitSlot>,
}

impl Shared {
    fn dispatch(&self, msg: WorkerMessage) {
        let mut handler = self
            .on_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (*handler)(msg))) {
            tracing::error!(
                panic = panic_message(panic.as_ref()),
                "Worker message handler panicked"
            );
        }
    }

    /// Runs once, from the supervisor task, after the worker is gone.
    fn finish(&self, status: Option<ExitStatus>) {
        self.disconnected.store(true, Ordering::SeqCst);
        *self
            .on_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Box::new(|_| {});
        let slot = std::mem::replace(
            &mut *self
                .on_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            ExitSlot::Exited(status),
        );
        if let ExitSlot::Running(Some(handler)) = slot {
            run_disconnect_handler(handler, status);
        }
    }
}

fn run_disconnect_handler(handler: DisconnectHandler, status: Option<ExitStatus>) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(status))) {
        tracing::error!(
            panic = panic_message(panic.as_ref()),
            "Worker disconnect handler panicked"
        );
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Live channel to one worker. Cheap to clone; all clones share one endpoint.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
    pid: Option<u32>,
}

impl Transport {
    /// Spawn a worker with `config` and start supervising it.
    pub fn spawn(config: &TransportConfig) -> Result<Self, TransportError> {
        let process = config.spawner.spawn()?;
        Ok(Self::start(process, config.heartbeat_interval))
    }

    /// Run the channel over an already-started worker.
    pub fn start(process: WorkerProcess, heartbeat_interval: Duration) -> Self {
        let WorkerProcess {
            child,
            reader,
            writer,
        } = process;
        let pid = child.as_ref().and_then(Child::id);

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            disconnected: AtomicBool::new(false),
            outbound: tx,
            kill: CancellationToken::new(),
            on_message: StdMutex::new(Box::new(|msg| {
                tracing::debug!(?msg, "No message handler installed, dropping");
            })),
            on_disconnect: StdMutex::new(ExitSlot::Running(None)),
        });

        let writer_task = tokio::spawn(run_writer(FramedWrite::new(writer, FrameCodec::new()), rx));
        tokio::spawn(supervise(
            Arc::clone(&shared),
            child,
            FramedRead::new(reader, FrameCodec::new()),
            heartbeat_interval,
            writer_task,
        ));

        Self { shared, pid }
    }

    /// Deliver a message unless the endpoint is disconnected, in which case
    /// it is dropped without error.
    pub fn send(&self, msg: HostMessage) {
        if self.is_disconnected() {
            tracing::trace!(?msg, "Dropping message for disconnected worker");
            return;
        }
        if self.shared.outbound.send(msg).is_err() {
            tracing::trace!("Writer gone, dropping message");
        }
    }

    /// Replace the inbound message handler. The handler runs on the
    /// supervisor task and must not call back into `on_message`.
    pub fn on_message<F>(&self, handler: F)
    where
        F: FnMut(WorkerMessage) + Send + 'static,
    {
        *self
            .shared
            .on_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Box::new(handler);
    }

    /// Replace the disconnect handler. It runs once, after the worker exited;
    /// installed after exit, it runs right away.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: FnOnce(Option<ExitStatus>) + Send + 'static,
    {
        let mut slot = self
            .shared
            .on_disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match &mut *slot {
            ExitSlot::Running(current) => *current = Some(Box::new(handler)),
            ExitSlot::Exited(status) => {
                let status = *status;
                drop(slot);
                run_disconnect_handler(Box::new(handler), status);
            }
        }
    }

    /// Kill the worker and mark the endpoint disconnected. Idempotent.
    pub fn disconnect(&self) {
        if !self.shared.disconnected.swap(true, Ordering::SeqCst) {
            tracing::debug!(pid = ?self.pid, "Disconnecting worker");
        }
        self.shared.kill.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::SeqCst)
    }
}

async fn run_writer(
    mut sink: FramedWrite<BoxedWriter, FrameCodec<HostMessage>>,
    mut rx: mpsc::UnboundedReceiver<HostMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            tracing::debug!(error = %e, "Worker stdin closed");
            break;
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    mut child: Option<Child>,
    mut frames: FramedRead<BoxedReader, FrameCodec<WorkerMessage>>,
    heartbeat_interval: Duration,
    writer_task: tokio::task::JoinHandle<()>,
) {
    let start = tokio::time::Instant::now() + heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shared.kill.cancelled() => {
                tracing::debug!("Kill requested");
                break;
            }

            frame = frames.next() => match frame {
                Some(Ok(msg)) => shared.dispatch(msg),
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Undecodable frame from worker, killing it");
                    break;
                }
                None => {
                    tracing::debug!("Worker closed its output");
                    break;
                }
            },

            _ = heartbeat.tick() => {
                if !shared.disconnected.load(Ordering::SeqCst) {
                    let _ = shared.outbound.send(HostMessage::Heartbeat);
                }
            }
        }
    }

    shared.disconnected.store(true, Ordering::SeqCst);
    writer_task.abort();

    let status = match child.as_mut() {
        Some(child) => {
            if let Err(e) = child.start_kill() {
                tracing::trace!(error = %e, "Worker already exited");
            }
            match child.wait().await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to reap worker");
                    None
                }
            }
        }
        None => None,
    };
    tracing::info!(?status, "Worker disconnected");
    shared.finish(status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    type PeerRead = FramedRead<DuplexStream, FrameCodec<HostMessage>>;
    type PeerWrite = FramedWrite<DuplexStream, FrameCodec<WorkerMessage>>;

    fn connected(heartbeat: Duration) -> (Transport, PeerRead, PeerWrite) {
        let (host_out, worker_in) = duplex(64 * 1024);
        let (worker_out, host_in) = duplex(64 * 1024);
        let transport = Transport::start(WorkerProcess::from_streams(host_in, host_out), heartbeat);
        (
            transport,
            FramedRead::new(worker_in, FrameCodec::new()),
            FramedWrite::new(worker_out, FrameCodec::new()),
        )
    }

    #[tokio::test]
    async fn delivers_in_both_directions() {
        let (transport, mut from_host, mut to_host) = connected(HEARTBEAT_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_message(move |msg| {
            let _ = tx.send(msg);
        });

        transport.send(HostMessage::Import {
            url: "builtin:site.js".into(),
        });
        let got = from_host.next().await.unwrap().unwrap();
        assert_eq!(
            got,
            HostMessage::Import {
                url: "builtin:site.js".into()
            }
        );

        to_host
            .send(WorkerMessage::ImportSuccess {
                url: "builtin:site.js".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerMessage::ImportSuccess {
                url: "builtin:site.js".into()
            }
        );
    }

    #[tokio::test]
    async fn heartbeat_ticks_on_interval() {
        let (_transport, mut from_host, _to_host) = connected(Duration::from_millis(20));

        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), from_host.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(msg, HostMessage::Heartbeat);
        }
    }

    #[tokio::test]
    async fn send_after_disconnect_is_dropped() {
        let (transport, mut from_host, _to_host) = connected(HEARTBEAT_INTERVAL);
        transport.disconnect();
        transport.send(HostMessage::Execute {
            code: "1 + 1".into(),
        });

        // The writer is aborted on disconnect, so the peer only sees EOF.
        let next = tokio::time::timeout(Duration::from_secs(2), from_host.next())
            .await
            .unwrap();
        assert!(next.is_none());
        assert!(transport.is_disconnected());
    }

    #[tokio::test]
    async fn disconnect_handler_fires_once_on_worker_exit() {
        let (transport, from_host, to_host) = connected(HEARTBEAT_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_disconnect(move |status| {
            let _ = tx.send(status);
        });

        drop(to_host);
        drop(from_host);

        assert_eq!(rx.recv().await, Some(None));
        transport.disconnect();
        transport.disconnect();
        assert!(rx.recv().await.is_none());
        assert!(transport.is_disconnected());
    }

    #[tokio::test]
    async fn handler_panic_does_not_close_channel() {
        let (transport, _from_host, mut to_host) = connected(HEARTBEAT_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut first = true;
        transport.on_message(move |msg| {
            if std::mem::take(&mut first) {
                panic!("handler bug");
            }
            let _ = tx.send(msg);
        });

        to_host.send(WorkerMessage::ExecuteSuccess).await.unwrap();
        to_host
            .send(WorkerMessage::RuntimeException {
                error: "late".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            WorkerMessage::RuntimeException {
                error: "late".into()
            }
        );
        assert!(!transport.is_disconnected());
    }

    #[tokio::test]
    async fn garbage_from_worker_disconnects() {
        use tokio::io::AsyncWriteExt;

        let (host_out, _worker_in) = duplex(1024);
        let (mut worker_out, host_in) = duplex(1024);
        let transport = Transport::start(
            WorkerProcess::from_streams(host_in, host_out),
            HEARTBEAT_INTERVAL,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.on_disconnect(move |_| {
            let _ = tx.send(());
        });

        let body = br#"{"kind":"nope"}"#;
        worker_out
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        worker_out.write_all(body).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(transport.is_disconnected());
    }

    #[tokio::test]
    async fn spawner_reports_missing_binary() {
        let spawner = CommandSpawner::new("/nonexistent/jailbox-worker");
        let err = Transport::spawn(&TransportConfig::new(Arc::new(spawner))).err();
        assert!(matches!(
            err,
            Some(TransportError::Spawn(SpawnError::Io(_)))
        ));
    }
}
