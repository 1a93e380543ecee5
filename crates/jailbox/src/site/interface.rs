//! Values exchanged with interface methods.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use super::RemoteCallback;

/// A locally implemented method exposed to the other side.
pub type Method = Arc<dyn Fn(Vec<Arg>) + Send + Sync>;

/// Local function handed to the other side as a one-shot callback.
pub type LocalCallback = Box<dyn FnOnce(Vec<Arg>) + Send>;

/// Named methods one side exposes to the other.
#[derive(Clone, Default)]
pub struct Interface {
    methods: BTreeMap<String, Method>,
}

impl Interface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Arg>) + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(f));
        self
    }

    pub fn get(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

/// Argument received from the other side.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Callback(RemoteCallback),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Callback(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_value().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn as_callback(&self) -> Option<&RemoteCallback> {
        match self {
            Arg::Callback(cb) => Some(cb),
            Arg::Value(_) => None,
        }
    }
}

/// Argument sent to the other side.
pub enum Param {
    Value(Value),
    Callback(LocalCallback),
}

impl Param {
    pub fn value(value: impl Into<Value>) -> Self {
        Param::Value(value.into())
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce(Vec<Arg>) + Send + 'static,
    {
        Param::Callback(Box::new(f))
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Param::Value(value)
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Param::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Param::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}
