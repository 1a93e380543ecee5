//! QuickJS worker for jailbox.
//!
//! Provides the [`JsExecutor`] script engine, the bundled bootstrap and
//! runtime scripts, and the `jailbox-worker` binary the host spawns.

mod executor;

use jailbox::bridge::protocol::{BOOTSTRAP_SCRIPT, RUNTIME_SCRIPT};
use jailbox::worker::{DefaultScriptSource, SourceError};

pub use executor::{JsError, JsExecutor, JsExecutorConfig};

/// Worker half of the capability exchange, served as `builtin:site.js`.
pub const SITE_SCRIPT: &str = include_str!("js/site.js");

/// The `application` object, served as `builtin:core.js`.
pub const CORE_SCRIPT: &str = include_str!("js/core.js");

/// Script source with the bundled scripts registered.
pub fn script_source() -> Result<DefaultScriptSource, SourceError> {
    Ok(DefaultScriptSource::new()?
        .with_builtin(BOOTSTRAP_SCRIPT, SITE_SCRIPT)
        .with_builtin(RUNTIME_SCRIPT, CORE_SCRIPT))
}
