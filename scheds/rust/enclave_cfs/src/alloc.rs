// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Thread-safe task pool.
//!
//! Task records are owned by the run queue of the CPU they are assigned
//! to; records for tasks with no CPU yet live here. The pool also keeps
//! the id -> location index the dispatcher uses to route messages, since
//! records have no stable address to compare against.

use std::collections::HashMap;
use std::sync::Mutex;

use log::warn;

use enclave_core::{BarrierToken, CpuId, TaskId};

use crate::task::CfsTask;

/// Where a live task's record currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLoc {
    /// Not yet assigned a CPU; the record is in the pool.
    Pending,
    /// Assigned; the record is owned by that CPU's run queue.
    OnCpu(CpuId),
}

#[derive(Default)]
struct PoolInner {
    pending: HashMap<TaskId, CfsTask>,
    index: HashMap<TaskId, TaskLoc>,
}

/// Allocator capability: create, locate and free task records from any
/// agent thread. The mutex is a leaf lock; no other lock is taken while
/// it is held.
#[derive(Default)]
pub struct TaskPool {
    inner: Mutex<PoolInner>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record for a new task. Returns false if the id is already
    /// live.
    pub fn allocate(&self, id: TaskId, seqnum: BarrierToken) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.index.contains_key(&id) {
            warn!("allocate of already-live task {id}");
            return false;
        }
        inner.index.insert(id, TaskLoc::Pending);
        inner.pending.insert(id, CfsTask::new(id, seqnum));
        true
    }

    pub fn location(&self, id: TaskId) -> Option<TaskLoc> {
        self.inner.lock().unwrap().index.get(&id).copied()
    }

    /// Hand a pending record over to a CPU, updating the index.
    pub fn take_for_migration(&self, id: TaskId, cpu: CpuId) -> Option<CfsTask> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner.pending.remove(&id)?;
        inner.index.insert(id, TaskLoc::OnCpu(cpu));
        Some(task)
    }

    /// Mutate a pending record in place.
    pub fn update_pending<R>(&self, id: TaskId, f: impl FnOnce(&mut CfsTask) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.get_mut(&id).map(f)
    }

    /// Release a task: drops the pending record if the pool still owns it
    /// and removes the task from the index.
    pub fn free(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.remove(&id);
        if inner.index.remove(&id).is_none() {
            warn!("free of unknown task {id}");
        }
    }

    /// Number of live tasks (pending and CPU-owned).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live task's location, in task-id order.
    pub fn for_each(&self, mut f: impl FnMut(TaskId, TaskLoc)) {
        let inner = self.inner.lock().unwrap();
        let mut ids: Vec<_> = inner.index.keys().copied().collect();
        ids.sort();
        for id in ids {
            f(id, inner.index[&id]);
        }
    }
}
