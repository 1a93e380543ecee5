//! Seam between the dispatch loop and a script engine.

use serde_json::Value;

/// How much of the worker a script may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Global scope: the bootstrap and runtime scripts.
    Unrestricted,
    /// A separate global holding only the plugin API.
    Sandboxed,
}

/// A script error rendered as text (message plus stack when available).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Runs code inside the worker. Called only from the dispatch loop, so
/// implementations need not be `Send`.
pub trait ScriptExecutor {
    /// Run `code`; `label` names it in diagnostics.
    fn run(&mut self, code: &str, label: &str, capability: Capability) -> Result<(), ScriptError>;

    /// Hand an application message from the host to the script side.
    fn deliver_message(&mut self, data: Value) -> Result<(), ScriptError>;

    /// Timer `id` is due.
    fn fire_timer(&mut self, id: u64) -> Result<(), ScriptError>;

    /// Run queued jobs (promise reactions); returns the ones that failed.
    fn run_pending_jobs(&mut self) -> Vec<ScriptError> {
        Vec::new()
    }
}
