//! Per-process context shared between the dispatch loop and the executor.
//!
//! Script natives cannot await, so they queue [`Outbound`] commands here and
//! the dispatch loop drains them after every executor call.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Application message for the host.
    Send(Value),
    /// (Re)arm timer `id`.
    SetTimer { id: u64, delay: Duration },
    ClearTimer { id: u64 },
    /// Script asked to end the worker.
    Exit,
}

/// One per worker process. Cheap to clone; clones share the outbox.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    outbox: Rc<RefCell<VecDeque<Outbound>>>,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, data: Value) {
        self.push(Outbound::Send(data));
    }

    pub fn set_timer(&self, id: u64, delay: Duration) {
        self.push(Outbound::SetTimer { id, delay });
    }

    pub fn clear_timer(&self, id: u64) {
        self.push(Outbound::ClearTimer { id });
    }

    pub fn request_exit(&self) {
        self.push(Outbound::Exit);
    }

    pub fn drain(&self) -> Vec<Outbound> {
        self.outbox.borrow_mut().drain(..).collect()
    }

    fn push(&self, cmd: Outbound) {
        self.outbox.borrow_mut().push_back(cmd);
    }
}
