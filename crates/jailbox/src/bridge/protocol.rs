//! Wire protocol between the host and a worker process.
//!
//! One channel (worker stdin/stdout) carries both directions. Requests are
//! correlated with replies by resource (script url, or the single execute
//! slot) rather than by sequence number.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Script that installs the worker-side capability site.
pub const BOOTSTRAP_SCRIPT: &str = "builtin:site.js";

/// Script that builds the `application` object plugin code talks to.
pub const RUNTIME_SCRIPT: &str = "builtin:core.js";

/// Label inline plugin code runs under, shown in worker diagnostics.
pub const DYNAMIC_PLUGIN_LABEL: &str = "dynamic plugin";

/// Unique identifier for a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(uuid::Uuid);

impl PluginId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for PluginId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages from host to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HostMessage {
    /// Liveness keep-alive. No reply.
    Heartbeat,

    /// Load a script and run it with full worker capabilities.
    Import { url: String },

    /// Load a script and run it in the sandboxed scope.
    ImportJailed { url: String },

    /// Run inline code in the sandboxed scope.
    Execute { code: String },

    /// Application payload for the worker-side site.
    Message { data: Value },
}

/// Messages from worker to host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Message {
        data: Value,
    },

    ImportSuccess {
        url: String,
    },

    ImportFailure {
        url: String,
        error: String,
    },

    ExecuteSuccess,

    ExecuteFailure {
        error: String,
    },

    /// Script error outside any pending request (timer or message handler).
    RuntimeException {
        error: String,
    },

    /// Failure surfaced while draining the script's job queue.
    RuntimeRejection {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extras: Option<Value>,
    },
}
