//! QuickJS implementation of [`ScriptExecutor`].

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use jailbox::worker::{Capability, ScriptError, ScriptExecutor, WorkerContext};
use rquickjs::convert::Coerced;
use rquickjs::{
    CatchResultExt, CaughtError, Context, Ctx, Function, Object, Persistent, Runtime,
    Value as JsValue,
};
use serde_json::Value;

const DISPATCH_HOOK: &str = "__jailboxDispatch";
const TIMER_HOOK: &str = "__jailboxFireTimer";
const SANDBOX_API: &str = "__jailboxSandbox";

/// Names the sandbox global receives from `__jailboxSandbox`.
const PROVIDED: &[&str] = &[
    "application",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
    "console",
];

#[derive(Debug, thiserror::Error)]
pub enum JsError {
    #[error("failed to set up QuickJS: {0}")]
    Engine(#[from] rquickjs::Error),
}

/// Engine limits.
#[derive(Debug, Clone, Default)]
pub struct JsExecutorConfig {
    pub memory_limit: Option<usize>,
    pub max_stack_size: Option<usize>,
}

impl JsExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `JAILBOX_JS_MEMORY_LIMIT` and `JAILBOX_JS_STACK_SIZE` (bytes).
    pub fn from_env() -> Self {
        let bytes = |var: &str| {
            let raw = std::env::var(var).ok()?;
            match raw.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    tracing::warn!(var, value = %raw, "Ignoring invalid byte count");
                    None
                }
            }
        };
        Self {
            memory_limit: bytes("JAILBOX_JS_MEMORY_LIMIT"),
            max_stack_size: bytes("JAILBOX_JS_STACK_SIZE"),
        }
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = Some(bytes);
        self
    }
}

/// Entry points the bundled scripts leave behind, held outside any global.
#[derive(Default)]
struct Hooks {
    dispatch: Option<Persistent<Function<'static>>>,
    fire_timer: Option<Persistent<Function<'static>>>,
    sandbox_api: Option<Persistent<Object<'static>>>,
}

/// One QuickJS runtime for the life of the worker: a main context for the
/// bundled scripts and, once needed, a sandbox context for plugin code.
pub struct JsExecutor {
    // Handles into the runtime go first so they drop before it.
    hooks: Hooks,
    sandbox: Option<Context>,
    context: Context,
    runtime: Runtime,
    rejections: Rc<RefCell<Vec<ScriptError>>>,
}

impl JsExecutor {
    /// Natives write into `worker`; hand the same context to the dispatch loop.
    pub fn new(config: JsExecutorConfig, worker: WorkerContext) -> Result<Self, JsError> {
        let runtime = Runtime::new()?;
        if let Some(limit) = config.memory_limit {
            runtime.set_memory_limit(limit);
        }
        if let Some(size) = config.max_stack_size {
            runtime.set_max_stack_size(size);
        }
        let context = Context::full(&runtime)?;
        let rejections = Rc::new(RefCell::new(Vec::new()));
        context.with(|ctx| install_natives(&ctx, &worker, &rejections))?;
        tracing::debug!(?config, "QuickJS ready");
        Ok(Self {
            hooks: Hooks::default(),
            sandbox: None,
            context,
            runtime,
            rejections,
        })
    }

    /// Move the hooks a bundled script published off the main global.
    fn collect_hooks(&mut self) -> Result<(), ScriptError> {
        let hooks = &mut self.hooks;
        self.context
            .with(|ctx| -> rquickjs::Result<()> {
                let globals = ctx.globals();
                if let Some(f) = globals.get::<_, Option<Function>>(DISPATCH_HOOK)? {
                    hooks.dispatch = Some(Persistent::save(&ctx, f));
                    globals.remove(DISPATCH_HOOK)?;
                }
                if let Some(f) = globals.get::<_, Option<Function>>(TIMER_HOOK)? {
                    hooks.fire_timer = Some(Persistent::save(&ctx, f));
                    globals.remove(TIMER_HOOK)?;
                }
                if let Some(api) = globals.get::<_, Option<Object>>(SANDBOX_API)? {
                    hooks.sandbox_api = Some(Persistent::save(&ctx, api));
                    globals.remove(SANDBOX_API)?;
                }
                Ok(())
            })
            .map_err(engine_error)
    }

    /// The sandbox context, created on first use with only the plugin API
    /// on its global.
    fn sandbox(&mut self) -> Result<Context, ScriptError> {
        if let Some(sandbox) = &self.sandbox {
            return Ok(sandbox.clone());
        }
        let api = self
            .hooks
            .sandbox_api
            .clone()
            .ok_or_else(|| ScriptError::new("Error: plugin runtime is not loaded"))?;

        let members = self
            .context
            .with(|ctx| -> rquickjs::Result<Vec<(&'static str, Persistent<JsValue<'static>>)>> {
                let api = api.restore(&ctx)?;
                PROVIDED
                    .iter()
                    .map(|&name| -> rquickjs::Result<_> {
                        let value: JsValue = api.get(name)?;
                        Ok((name, Persistent::save(&ctx, value)))
                    })
                    .collect()
            })
            .map_err(engine_error)?;

        let sandbox = Context::full(&self.runtime).map_err(engine_error)?;
        sandbox
            .with(|ctx| -> rquickjs::Result<()> {
                let globals = ctx.globals();
                for (name, value) in members {
                    globals.set(name, value.restore(&ctx)?)?;
                }
                Ok(())
            })
            .map_err(engine_error)?;
        tracing::debug!("Sandbox context ready");
        self.sandbox = Some(sandbox.clone());
        Ok(sandbox)
    }

    fn call_hook(
        &self,
        hook: Option<&Persistent<Function<'static>>>,
        arg: CallArg,
    ) -> Result<(), ScriptError> {
        let hook = hook
            .cloned()
            .ok_or_else(|| ScriptError::new("Error: site script is not loaded"))?;
        self.context.with(|ctx| {
            let call = || -> rquickjs::Result<()> {
                let f = hook.restore(&ctx)?;
                match arg {
                    CallArg::Json(json) => f.call((json,)),
                    CallArg::Number(n) => f.call((n,)),
                }
            };
            call().catch(&ctx).map_err(describe)
        })
    }
}

fn engine_error(error: rquickjs::Error) -> ScriptError {
    ScriptError::new(format!("Error: {error}"))
}

enum CallArg {
    Json(String),
    Number(f64),
}

fn install_natives(
    ctx: &Ctx<'_>,
    worker: &WorkerContext,
    rejections: &Rc<RefCell<Vec<ScriptError>>>,
) -> rquickjs::Result<()> {
    let natives = Object::new(ctx.clone())?;

    let w = worker.clone();
    natives.set(
        "send",
        Function::new(ctx.clone(), move |json: String| {
            match serde_json::from_str::<Value>(&json) {
                Ok(data) => w.send(data),
                Err(e) => tracing::warn!(error = %e, "Script sent malformed JSON"),
            }
        })?,
    )?;

    let w = worker.clone();
    natives.set(
        "setTimer",
        Function::new(ctx.clone(), move |id: f64, ms: f64| {
            w.set_timer(id as u64, Duration::from_millis(ms.max(0.0) as u64));
        })?,
    )?;

    let w = worker.clone();
    natives.set(
        "clearTimer",
        Function::new(ctx.clone(), move |id: f64| w.clear_timer(id as u64))?,
    )?;

    let w = worker.clone();
    natives.set(
        "exit",
        Function::new(ctx.clone(), move || w.request_exit())?,
    )?;

    let r = Rc::clone(rejections);
    natives.set(
        "reject",
        Function::new(ctx.clone(), move |error: String| {
            r.borrow_mut().push(ScriptError::new(error));
        })?,
    )?;

    natives.set(
        "log",
        Function::new(ctx.clone(), |level: String, message: String| {
            match level.as_str() {
                "error" => tracing::error!(target: "jailbox::script", "{message}"),
                "warn" => tracing::warn!(target: "jailbox::script", "{message}"),
                "debug" => tracing::debug!(target: "jailbox::script", "{message}"),
                _ => tracing::info!(target: "jailbox::script", "{message}"),
            }
        })?,
    )?;

    ctx.globals().set("__jailbox", natives)
}

/// Render a caught JS error as text.
fn describe(error: CaughtError<'_>) -> ScriptError {
    match error {
        CaughtError::Exception(ex) => {
            let name = ex
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let mut text = match ex.message() {
                Some(message) if !message.is_empty() => format!("{name}: {message}"),
                _ => name,
            };
            if let Some(stack) = ex.stack()
                && !stack.trim().is_empty()
            {
                text.push('\n');
                text.push_str(stack.trim_end());
            }
            ScriptError::new(text)
        }
        CaughtError::Value(value) => ScriptError::new(
            value
                .get::<Coerced<String>>()
                .map(|s| s.0)
                .unwrap_or_else(|_| "uncaught non-error value".to_string()),
        ),
        CaughtError::Error(e) => ScriptError::new(e.to_string()),
    }
}

impl ScriptExecutor for JsExecutor {
    fn run(&mut self, code: &str, label: &str, capability: Capability) -> Result<(), ScriptError> {
        tracing::debug!(label, ?capability, "Running script");
        let eval = |ctx: Ctx<'_>| ctx.eval::<(), _>(code).catch(&ctx).map_err(describe);
        match capability {
            Capability::Unrestricted => {
                let result = self.context.with(eval);
                self.collect_hooks()?;
                result
            }
            Capability::Sandboxed => self.sandbox()?.with(eval),
        }
    }

    fn deliver_message(&mut self, data: Value) -> Result<(), ScriptError> {
        self.call_hook(self.hooks.dispatch.as_ref(), CallArg::Json(data.to_string()))
    }

    fn fire_timer(&mut self, id: u64) -> Result<(), ScriptError> {
        self.call_hook(self.hooks.fire_timer.as_ref(), CallArg::Number(id as f64))
    }

    fn run_pending_jobs(&mut self) -> Vec<ScriptError> {
        let mut failures = Vec::new();
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => failures.push(ScriptError::new(format!("Error: {e}"))),
            }
        }
        failures.append(&mut self.rejections.borrow_mut());
        failures
    }
}
