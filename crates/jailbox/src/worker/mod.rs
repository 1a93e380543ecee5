//! Worker side of the channel.
//!
//! Runs inside the worker process on a current-thread runtime. The dispatch
//! loop owns the executor; script natives talk back through the
//! [`WorkerContext`] outbox, which is flushed after every executor call and
//! before the reply to the request that triggered it.

mod context;
mod executor;
mod source;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::time::{DelayQueue, delay_queue};

pub use context::{Outbound, WorkerContext};
pub use executor::{Capability, ScriptError, ScriptExecutor};
pub use source::{DefaultScriptSource, ScriptSource, SourceError, is_remote};

use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{DYNAMIC_PLUGIN_LABEL, HostMessage, WorkerMessage};

type Fetch = BoxFuture<'static, (String, Capability, Result<String, SourceError>)>;

/// Script timers, keyed by the id the script chose.
#[derive(Default)]
struct Timers {
    queue: DelayQueue<u64>,
    keys: HashMap<u64, delay_queue::Key>,
}

impl Timers {
    fn set(&mut self, id: u64, delay: std::time::Duration) {
        self.clear(id);
        let key = self.queue.insert(id, delay);
        self.keys.insert(id, key);
    }

    fn clear(&mut self, id: u64) {
        if let Some(key) = self.keys.remove(&id) {
            self.queue.remove(&key);
        }
    }

    fn expired(&mut self, id: u64) {
        self.keys.remove(&id);
    }
}

/// Drives a [`ScriptExecutor`] from host requests.
pub struct WorkerDispatch<E> {
    executor: E,
    context: WorkerContext,
    source: Arc<dyn ScriptSource>,
    timers: Timers,
}

enum Flow {
    Continue,
    Exit,
}

impl<E: ScriptExecutor> WorkerDispatch<E> {
    /// `context` must be the one the executor's natives write to.
    pub fn new(executor: E, context: WorkerContext, source: Arc<dyn ScriptSource>) -> Self {
        Self {
            executor,
            context,
            source,
            timers: Timers::default(),
        }
    }

    /// Serve the host over this process's stdin/stdout.
    pub async fn run_stdio(self) -> io::Result<()> {
        self.run(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve the host until it goes away or the script asks to exit.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut requests = FramedRead::new(reader, FrameCodec::<HostMessage>::new());
        let mut replies = FramedWrite::new(writer, FrameCodec::<WorkerMessage>::new());
        let mut fetches: FuturesUnordered<Fetch> = FuturesUnordered::new();

        tracing::info!("Worker ready");
        loop {
            let flow = tokio::select! {
                biased;

                frame = requests.next() => match frame {
                    Some(Ok(msg)) => self.handle(msg, &mut fetches, &mut replies).await?,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Undecodable frame from host");
                        return Err(e);
                    }
                    None => {
                        tracing::info!("Host channel closed, exiting");
                        return Ok(());
                    }
                },

                Some((url, capability, fetched)) = fetches.next() => {
                    self.import(url, capability, fetched, &mut replies).await?
                }

                Some(expired) = self.timers.queue.next() => {
                    let id = expired.into_inner();
                    self.timers.expired(id);
                    if let Err(e) = self.executor.fire_timer(id) {
                        replies
                            .send(WorkerMessage::RuntimeException { error: e.to_string() })
                            .await?;
                    }
                    Flow::Continue
                }
            };

            let flow = match flow {
                Flow::Continue => self.settle(&mut replies).await?,
                Flow::Exit => Flow::Exit,
            };
            if let Flow::Exit = flow {
                tracing::info!("Script requested exit");
                return Ok(());
            }
        }
    }

    async fn handle<W>(
        &mut self,
        msg: HostMessage,
        fetches: &mut FuturesUnordered<Fetch>,
        replies: &mut FramedWrite<W, FrameCodec<WorkerMessage>>,
    ) -> io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        match msg {
            HostMessage::Heartbeat => {
                tracing::trace!("Heartbeat");
                Ok(Flow::Continue)
            }
            HostMessage::Import { url } => {
                fetches.push(self.fetch(url, Capability::Unrestricted));
                Ok(Flow::Continue)
            }
            HostMessage::ImportJailed { url } => {
                fetches.push(self.fetch(url, Capability::Sandboxed));
                Ok(Flow::Continue)
            }
            HostMessage::Execute { code } => {
                let result = self
                    .executor
                    .run(&code, DYNAMIC_PLUGIN_LABEL, Capability::Sandboxed);
                if let Flow::Exit = self.settle(replies).await? {
                    return Ok(Flow::Exit);
                }
                let reply = match result {
                    Ok(()) => WorkerMessage::ExecuteSuccess,
                    Err(e) => {
                        tracing::warn!(error = %e, "Plugin code failed");
                        WorkerMessage::ExecuteFailure {
                            error: e.to_string(),
                        }
                    }
                };
                replies.send(reply).await?;
                Ok(Flow::Continue)
            }
            HostMessage::Message { data } => {
                if let Err(e) = self.executor.deliver_message(data) {
                    replies
                        .send(WorkerMessage::RuntimeException {
                            error: e.to_string(),
                        })
                        .await?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn fetch(&self, url: String, capability: Capability) -> Fetch {
        let source = Arc::clone(&self.source);
        async move {
            let fetched = source.fetch(&url).await;
            (url, capability, fetched)
        }
        .boxed()
    }

    async fn import<W>(
        &mut self,
        url: String,
        capability: Capability,
        fetched: Result<String, SourceError>,
        replies: &mut FramedWrite<W, FrameCodec<WorkerMessage>>,
    ) -> io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        let result = match fetched {
            Ok(code) => self
                .executor
                .run(&code, &url, capability)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Flow::Exit = self.settle(replies).await? {
            return Ok(Flow::Exit);
        }
        let reply = match result {
            Ok(()) => {
                tracing::debug!(%url, ?capability, "Imported script");
                WorkerMessage::ImportSuccess { url }
            }
            Err(error) => {
                tracing::error!(%url, %error, "Import failed");
                WorkerMessage::ImportFailure { url, error }
            }
        };
        replies.send(reply).await?;
        Ok(Flow::Continue)
    }

    /// Run pending script jobs, then flush everything the script queued.
    async fn settle<W>(
        &mut self,
        replies: &mut FramedWrite<W, FrameCodec<WorkerMessage>>,
    ) -> io::Result<Flow>
    where
        W: AsyncWrite + Unpin,
    {
        let rejections = self.executor.run_pending_jobs();
        for cmd in self.context.drain() {
            match cmd {
                Outbound::Send(data) => replies.feed(WorkerMessage::Message { data }).await?,
                Outbound::SetTimer { id, delay } => self.timers.set(id, delay),
                Outbound::ClearTimer { id } => self.timers.clear(id),
                Outbound::Exit => {
                    replies.flush().await?;
                    return Ok(Flow::Exit);
                }
            }
        }
        for rejection in rejections {
            replies
                .feed(WorkerMessage::RuntimeRejection {
                    error: rejection.to_string(),
                    extras: None,
                })
                .await?;
        }
        replies.flush().await?;
        Ok(Flow::Continue)
    }
}
