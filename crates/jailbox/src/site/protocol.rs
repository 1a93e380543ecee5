//! Capability-exchange messages, carried as the `data` of application messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SiteMessage {
    /// Invoke a method of the receiver's local interface.
    Method {
        name: String,
        #[serde(default)]
        args: Vec<WireArg>,
        #[serde(rename = "callbackId", default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<u64>,
    },

    /// Invoke callback `num` of the group the receiver stored under `id`.
    Callback {
        id: u64,
        num: usize,
        #[serde(default)]
        args: Vec<WireArg>,
        #[serde(rename = "callbackId", default, skip_serializing_if = "Option::is_none")]
        callback_id: Option<u64>,
    },

    /// The sender's method names; the receiver rebuilds its remote descriptor.
    SetInterface { api: Vec<String> },

    /// Ask the receiver to answer with `SetInterface`.
    GetInterface,

    /// Acknowledges a `SetInterface`.
    InterfaceSetAsRemote,

    /// The sender is going away.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireArg {
    Argument {
        #[serde(default)]
        value: Value,
    },
    /// Position within the call's callback group.
    Callback { num: usize },
}
