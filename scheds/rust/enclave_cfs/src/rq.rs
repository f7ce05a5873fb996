// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU run queue ordered by virtual runtime.
//!
//! One `CfsRq` holds everything that is per-CPU mutable state: the task
//! records owned by this CPU, the timeline ordered by `(vruntime, id)`,
//! the cached `min_vruntime`, the currently on-CPU task and the
//! preempt-current flag. Callers access it through one mutex per CPU.
//!
//! Invariants:
//! - a task is in the timeline iff it is Runnable and not `current`;
//! - `current` is never in the timeline;
//! - `min_vruntime` never decreases;
//! - a task's vruntime is at least `min_vruntime` at enqueue time.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use enclave_core::{CpuId, TaskId, TimeNs};

use crate::alloc::TaskPool;
use crate::task::{CfsTask, TaskState};

pub struct CfsRq {
    cpu: CpuId,
    /// Records owned by this CPU (queued, running or blocked-on-this-CPU).
    tasks: HashMap<TaskId, CfsTask>,
    /// Runnable timeline, ordered by vruntime with the task id as a
    /// stable tiebreak so equal vruntimes FIFO by id.
    tree: BTreeSet<(TimeNs, TaskId)>,
    min_vruntime: TimeNs,
    min_granularity: TimeNs,
    latency: TimeNs,
    current: Option<TaskId>,
    preempt_curr: bool,
}

impl CfsRq {
    pub fn new(cpu: CpuId, min_granularity: TimeNs, latency: TimeNs) -> Self {
        CfsRq {
            cpu,
            tasks: HashMap::new(),
            tree: BTreeSet::new(),
            min_vruntime: 0,
            min_granularity,
            latency,
            current: None,
            preempt_curr: false,
        }
    }

    /// Take ownership of a migrated task record.
    pub fn insert_record(&mut self, task: CfsTask) {
        debug_assert_eq!(task.cpu, self.cpu.0 as i32);
        self.tasks.insert(task.id, task);
    }

    pub fn task(&self, id: TaskId) -> Option<&CfsTask> {
        self.tasks.get(&id)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut CfsTask> {
        self.tasks.get_mut(&id)
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn preempt_curr(&self) -> bool {
        self.preempt_curr
    }

    pub fn set_preempt_curr(&mut self) {
        self.preempt_curr = true;
    }

    pub fn min_vruntime(&self) -> TimeNs {
        self.min_vruntime
    }

    /// Number of queued (not current) runnable tasks.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Number of task records owned by this CPU.
    pub fn nr_records(&self) -> usize {
        self.tasks.len()
    }

    pub fn in_tree(&self, id: TaskId) -> bool {
        self.task(id)
            .is_some_and(|t| self.tree.contains(&(t.vruntime, id)))
    }

    /// Visit every record owned by this CPU.
    pub fn for_each_record(&self, mut f: impl FnMut(&CfsTask)) {
        let mut ids: Vec<_> = self.tasks.keys().copied().collect();
        ids.sort();
        for id in ids {
            f(&self.tasks[&id]);
        }
    }

    /// Make a task runnable on this CPU.
    ///
    /// The vruntime is clamped up to `min_vruntime` so a task that slept
    /// cannot hoard the CPU catching up to everyone else.
    pub fn enqueue(&mut self, id: TaskId) {
        let min_vruntime = self.min_vruntime;
        let Some(task) = self.tasks.get_mut(&id) else {
            debug_assert!(false, "enqueue of unowned task {id}");
            return;
        };
        debug_assert!(task.cpu >= 0);
        task.vruntime = task.vruntime.max(min_vruntime);
        task.state.set(id, TaskState::Runnable);
        self.insert_into_tree(id);
    }

    /// Put a task that was just running back on the timeline. Its
    /// accumulated vruntime is authoritative, so no clamping.
    pub fn put_prev(&mut self, id: TaskId) {
        debug_assert!(self.tasks.get(&id).is_some_and(|t| t.cpu >= 0));
        self.insert_into_tree(id);
    }

    fn insert_into_tree(&mut self, id: TaskId) {
        let vruntime = self.tasks[&id].vruntime;
        self.tree.insert((vruntime, id));
        if let Some(&(leftmost, _)) = self.tree.first() {
            self.min_vruntime = self.min_vruntime.max(leftmost);
        }
    }

    /// Remove a task from the timeline if it is there.
    ///
    /// Absence is tolerated: a TaskDeparted can race a wakeup that never
    /// got enqueued, and erasing nothing is the right outcome.
    pub fn erase(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            self.tree.remove(&(task.vruntime, id));
        }
    }

    /// Drop a task record owned by this CPU and release its pool slot.
    pub fn free(&mut self, id: TaskId, pool: &TaskPool) {
        self.tasks.remove(&id);
        pool.free(id);
    }

    /// Reconcile the previous current task according to what the messages
    /// made of it, then drop it from `current`.
    fn reconcile_prev(&mut self, pool: &TaskPool) {
        let Some(prev) = self.current.take() else {
            return;
        };
        let state = match self.tasks.get(&prev) {
            Some(t) => t.state.get(),
            None => {
                debug_assert!(false, "current {prev} has no record");
                return;
            }
        };
        match state {
            TaskState::Blocked => {}
            TaskState::Done => {
                self.erase(prev);
                self.free(prev, pool);
            }
            // A yield: the task set itself Runnable and wants back on the
            // timeline with its vruntime intact.
            TaskState::Runnable => self.put_prev(prev),
            // Still Running means a preemption was requested; requeue.
            TaskState::Running => {
                self.put_prev(prev);
                if let Some(t) = self.tasks.get_mut(&prev) {
                    t.state.set(prev, TaskState::Runnable);
                }
            }
        }
    }

    /// The prio-boost path: put the current task back by its state and go
    /// idle without picking.
    pub fn put_prev_current(&mut self, pool: &TaskPool) {
        if self.current.is_none() {
            return;
        }
        self.reconcile_prev(pool);
        self.preempt_curr = false;
        self.update_min_vruntime();
    }

    /// Pick the next task to run.
    ///
    /// Fast path: the current task keeps the CPU while it is Running and
    /// no preemption was requested. Otherwise the previous task is
    /// reconciled by its state and the leftmost timeline entry (smallest
    /// `(vruntime, id)`) becomes current.
    pub fn pick_next(
        &mut self,
        pool: &TaskPool,
        runtime_of: impl Fn(TaskId) -> TimeNs,
    ) -> Option<TaskId> {
        if let Some(prev) = self.current {
            let keep = self
                .tasks
                .get(&prev)
                .is_some_and(|t| t.state.get() == TaskState::Running);
            if keep && !self.preempt_curr {
                return Some(prev);
            }
        }

        self.preempt_curr = false;
        self.reconcile_prev(pool);

        let Some(&(_, id)) = self.tree.first() else {
            self.update_min_vruntime();
            return None;
        };
        self.tree.pop_first();

        let task = self
            .tasks
            .get_mut(&id)
            .expect("timeline entry has a record");
        task.state.set(id, TaskState::Running);
        task.runtime_at_first_pick = runtime_of(id);
        self.current = Some(id);

        // New tasks are placed no earlier than the present; cache the
        // floor so enqueue can clamp cheaply.
        self.update_min_vruntime();
        debug!("{}: picked {id}", self.cpu);
        Some(id)
    }

    /// Advance the cached `min_vruntime` to the smaller of the current
    /// task's vruntime and the leftmost timeline entry, never backwards.
    pub fn update_min_vruntime(&mut self) {
        let curr = self.current.filter(|c| {
            self.tasks.get(c).is_some_and(|t| {
                matches!(t.state.get(), TaskState::Runnable | TaskState::Running)
            })
        });
        let leftmost = self.tree.first().map(|&(vruntime, _)| vruntime);

        let mut vruntime = self.min_vruntime;
        if let Some(c) = curr {
            vruntime = self.tasks[&c].vruntime;
        }
        match (curr, leftmost) {
            (None, Some(l)) => vruntime = l,
            (Some(_), Some(l)) => vruntime = vruntime.min(l),
            _ => {}
        }

        self.min_vruntime = self.min_vruntime.max(vruntime);
    }

    /// How long the current task may stay on-CPU before a tick flags it
    /// for preemption, given the tasks this CPU is handling.
    pub fn preemption_granularity(&self) -> TimeNs {
        let tasks = (self.tree.len() + 1) as u64;
        if tasks * self.min_granularity > self.latency {
            // Hitting the latency target would give slices below the
            // granularity floor, so the floor wins.
            return self.min_granularity;
        }
        // ceil(latency / tasks), so the slice never dips below the floor
        // in the edge case.
        (self.latency + (tasks - 1)) / tasks
    }
}
