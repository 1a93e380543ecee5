//! jailbox: run untrusted plugin code in a supervised worker process.
//!
//! The host side ([`Plugin`]) spawns a worker, loads the plugin into a
//! restricted scope and exchanges interfaces with it. Each side can then
//! call the other's methods, passing plain data and callbacks.

pub mod bridge;
pub mod connection;
pub mod event;
pub mod logging;
pub mod plugin;
pub mod site;
pub mod transport;
mod version;
pub mod worker;

pub use bridge::protocol::PluginId;
pub use connection::{ConnectionError, ProtocolConnection};
pub use event::{EventError, EventQueue, OneShotEvent};
pub use logging::init_tracing;
pub use plugin::{HandshakeState, Plugin, PluginError, PluginOptions, PluginSource};
pub use site::{Arg, Interface, Param, RemoteCallback, RemoteInterface, SiteError};
pub use transport::{CommandSpawner, Transport, TransportConfig, WorkerSpawner};
pub use version::JAILBOX_VERSION;
pub use worker::{ScriptExecutor, WorkerContext, WorkerDispatch};
