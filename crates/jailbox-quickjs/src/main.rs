//! jailbox-worker: serves one plugin over stdin/stdout.

use std::sync::Arc;

use anyhow::Context as _;
use jailbox::worker::{WorkerContext, WorkerDispatch};
use jailbox_quickjs::{JsExecutor, JsExecutorConfig, script_source};

fn main() -> anyhow::Result<()> {
    jailbox::init_tracing();
    tracing::info!("jailbox-worker {}", jailbox::JAILBOX_VERSION);

    // The executor is not Send, so everything stays on this thread.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build worker runtime")?;
    let result = runtime.block_on(serve());
    // A blocked stdin read must not hold the process open.
    runtime.shutdown_background();
    result
}

async fn serve() -> anyhow::Result<()> {
    let context = WorkerContext::new();
    let executor = JsExecutor::new(JsExecutorConfig::from_env(), context.clone())?;
    let source = Arc::new(script_source().context("failed to set up script source")?);
    WorkerDispatch::new(executor, context, source)
        .run_stdio()
        .await
        .context("host channel failed")
}
