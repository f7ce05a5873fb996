//! Typed task-lifecycle messages delivered over per-CPU channels.
//!
//! Every task-scoped message carries the task's `seqnum`, a per-task
//! monotonic barrier token. The agent records the seqnum of each message
//! it consumes and presents it back as `target_barrier` when committing a
//! run transaction; the enclave rejects commits against a stale view.
//!
//! `CpuTick` is CPU-scoped and carries no seqnum.

use crate::types::{BarrierToken, CpuId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A task entered the enclave. `runnable` tells the agent whether it
    /// wants a CPU right away or is still blocked.
    TaskNew {
        id: TaskId,
        seqnum: BarrierToken,
        runnable: bool,
    },
    /// A blocked task woke up.
    TaskRunnable { id: TaskId, seqnum: BarrierToken },
    /// A task left the enclave (still alive, no longer ours to schedule).
    TaskDeparted {
        id: TaskId,
        seqnum: BarrierToken,
        cpu: CpuId,
        from_switchto: bool,
    },
    /// A task exited.
    TaskDead { id: TaskId, seqnum: BarrierToken },
    /// A running task called yield.
    TaskYield {
        id: TaskId,
        seqnum: BarrierToken,
        cpu: CpuId,
        from_switchto: bool,
    },
    /// A running task blocked.
    TaskBlocked {
        id: TaskId,
        seqnum: BarrierToken,
        cpu: CpuId,
        from_switchto: bool,
    },
    /// A running task was preempted off its CPU.
    TaskPreempted {
        id: TaskId,
        seqnum: BarrierToken,
        cpu: CpuId,
        from_switchto: bool,
    },
    /// A running task handed its CPU directly to another task.
    TaskSwitchto { id: TaskId, seqnum: BarrierToken },
    /// Periodic timer tick on a busy CPU.
    CpuTick { cpu: CpuId },
}

impl Message {
    /// The task this message is about, if it is task-scoped.
    pub fn task(&self) -> Option<TaskId> {
        match *self {
            Message::TaskNew { id, .. }
            | Message::TaskRunnable { id, .. }
            | Message::TaskDeparted { id, .. }
            | Message::TaskDead { id, .. }
            | Message::TaskYield { id, .. }
            | Message::TaskBlocked { id, .. }
            | Message::TaskPreempted { id, .. }
            | Message::TaskSwitchto { id, .. } => Some(id),
            Message::CpuTick { .. } => None,
        }
    }

    /// The per-task seqnum, if task-scoped.
    pub fn seqnum(&self) -> Option<BarrierToken> {
        match *self {
            Message::TaskNew { seqnum, .. }
            | Message::TaskRunnable { seqnum, .. }
            | Message::TaskDeparted { seqnum, .. }
            | Message::TaskDead { seqnum, .. }
            | Message::TaskYield { seqnum, .. }
            | Message::TaskBlocked { seqnum, .. }
            | Message::TaskPreempted { seqnum, .. }
            | Message::TaskSwitchto { seqnum, .. } => Some(seqnum),
            Message::CpuTick { .. } => None,
        }
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TaskNew { .. } => "TaskNew",
            Message::TaskRunnable { .. } => "TaskRunnable",
            Message::TaskDeparted { .. } => "TaskDeparted",
            Message::TaskDead { .. } => "TaskDead",
            Message::TaskYield { .. } => "TaskYield",
            Message::TaskBlocked { .. } => "TaskBlocked",
            Message::TaskPreempted { .. } => "TaskPreempted",
            Message::TaskSwitchto { .. } => "TaskSwitchto",
            Message::CpuTick { .. } => "CpuTick",
        }
    }
}
