//! Per-CPU message channel handles.
//!
//! Messages are peeked, dispatched, then consumed, so a crashed dispatch
//! never loses a message. Association moves a task's future messages onto
//! this channel and is validated against the task's newest barrier token.

use std::sync::Arc;

use crate::enclave::Shared;
use crate::message::Message;
use crate::types::{BarrierToken, CpuId, TaskId};

/// Result of a channel association attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssocResult {
    Ok,
    /// The presented barrier is not the task's newest seqnum; the caller
    /// holds a stale view and should refresh and retry.
    Stale,
}

/// Handle to one CPU's message channel. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    cpu: CpuId,
}

impl Channel {
    pub(crate) fn new(shared: Arc<Shared>, cpu: CpuId) -> Self {
        Channel { shared, cpu }
    }

    /// The CPU this channel belongs to.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Look at the oldest undelivered message without consuming it.
    pub fn peek(&self) -> Option<Message> {
        self.shared.state.lock().unwrap().channel_front(self.cpu)
    }

    /// Consume a message previously returned by [`peek`](Self::peek).
    pub fn consume(&self, msg: &Message) {
        self.shared.state.lock().unwrap().channel_pop(self.cpu, msg);
    }

    /// Associate a task with this channel at the given barrier.
    #[must_use]
    pub fn associate_task(&self, id: TaskId, barrier: BarrierToken) -> AssocResult {
        let mut st = self.shared.state.lock().unwrap();
        if st.associate(self.cpu, id, barrier) {
            AssocResult::Ok
        } else {
            AssocResult::Stale
        }
    }
}
