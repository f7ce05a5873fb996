// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-task scheduling state.
//!
//! The state machine is driven entirely by enclave messages and the pick
//! path. Transition legality is checked against an explicit map: illegal
//! transitions abort in debug builds and log-and-continue in release
//! builds, with a short ring of recent states for the post-mortem.

use std::collections::VecDeque;
use std::fmt;

use log::error;

use enclave_core::{BarrierToken, TaskId, TimeNs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Blocked,
    Runnable,
    Running,
    Done,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Blocked => "Blocked",
            TaskState::Runnable => "Runnable",
            TaskState::Running => "Running",
            TaskState::Done => "Done",
        };
        write!(f, "{name}")
    }
}

const fn mask(state: TaskState) -> u8 {
    1 << state as u8
}

/// For each destination state, the set of states it may be entered from.
const fn valid_from(next: TaskState) -> u8 {
    match next {
        // Block and switchto take a running task off-CPU.
        TaskState::Blocked => mask(TaskState::Running),
        // Wakeup, yield, or the preempt-requeue in pick-next.
        TaskState::Runnable => mask(TaskState::Blocked) | mask(TaskState::Running),
        // Only a pick can put a task on-CPU.
        TaskState::Running => mask(TaskState::Runnable),
        // Departure and death are legal from anywhere.
        TaskState::Done => {
            mask(TaskState::Blocked) | mask(TaskState::Runnable) | mask(TaskState::Running)
        }
    }
}

const STATE_RING_CAP: usize = 8;

/// A task's lifecycle state plus a bounded ring of recent states.
#[derive(Debug)]
pub struct RunState {
    state: TaskState,
    recent: VecDeque<TaskState>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            state: TaskState::Blocked,
            recent: VecDeque::with_capacity(STATE_RING_CAP),
        }
    }

    pub fn get(&self) -> TaskState {
        self.state
    }

    pub fn set(&mut self, id: TaskId, next: TaskState) {
        if valid_from(next) & mask(self.state) == 0 {
            error!(
                "{id}: illegal transition {} -> {} (recent: {:?})",
                self.state, next, self.recent
            );
            debug_assert!(false, "illegal task state transition");
        }
        if self.recent.len() == STATE_RING_CAP {
            self.recent.pop_front();
        }
        self.recent.push_back(self.state);
        self.state = next;
    }
}

/// One schedulable task as the agent sees it.
#[derive(Debug)]
pub struct CfsTask {
    pub id: TaskId,
    pub state: RunState,
    /// Owning CPU, or -1 while the task has not been assigned one.
    pub cpu: i32,
    /// Accumulated virtual runtime; the run-queue ordering key.
    pub vruntime: TimeNs,
    /// Barrier token of the last message consumed for this task.
    pub seqnum: BarrierToken,
    /// Enclave-reported cumulative runtime snapshotted when the task was
    /// last picked; used to compute on-CPU residency at tick time.
    pub runtime_at_first_pick: TimeNs,
}

impl CfsTask {
    pub fn new(id: TaskId, seqnum: BarrierToken) -> Self {
        CfsTask {
            id,
            state: RunState::new(),
            cpu: -1,
            vruntime: 0,
            seqnum,
            runtime_at_first_pick: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_starts_blocked_unassigned() {
        let t = CfsTask::new(TaskId(1), 1);
        assert_eq!(t.state.get(), TaskState::Blocked);
        assert_eq!(t.cpu, -1);
        assert_eq!(t.vruntime, 0);
    }

    #[test]
    fn test_legal_lifecycle() {
        let mut t = CfsTask::new(TaskId(1), 1);
        t.state.set(t.id, TaskState::Runnable);
        t.state.set(t.id, TaskState::Running);
        t.state.set(t.id, TaskState::Runnable);
        t.state.set(t.id, TaskState::Running);
        t.state.set(t.id, TaskState::Blocked);
        assert_eq!(t.state.get(), TaskState::Blocked);
        t.state.set(t.id, TaskState::Done);
        assert_eq!(t.state.get(), TaskState::Done);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal task state transition")]
    fn test_blocked_cannot_run_directly() {
        let mut t = CfsTask::new(TaskId(1), 1);
        t.state.set(t.id, TaskState::Running);
    }

    #[test]
    fn test_done_from_any_state() {
        for setup in 0..3 {
            let mut t = CfsTask::new(TaskId(1), 1);
            if setup >= 1 {
                t.state.set(t.id, TaskState::Runnable);
            }
            if setup >= 2 {
                t.state.set(t.id, TaskState::Running);
            }
            t.state.set(t.id, TaskState::Done);
            assert_eq!(t.state.get(), TaskState::Done);
        }
    }
}
