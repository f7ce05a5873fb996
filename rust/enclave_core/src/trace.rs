//! Trace event recording for enclave runs.
//!
//! Every kernel-side scheduling action (task placed on a CPU, preempted,
//! blocked, woke, exited, CPU went idle) is recorded with a virtual
//! timestamp so tests and the CLI can reconstruct what happened.

use crate::types::{CpuId, TaskId, TimeNs};

/// A single trace event.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Virtual time in nanoseconds when this event occurred.
    pub time_ns: TimeNs,
    /// The CPU on which this event occurred.
    pub cpu: CpuId,
    /// The kind of event.
    pub kind: TraceKind,
}

/// The type of scheduling event recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// A task was placed on this CPU (committed transaction or handoff).
    TaskScheduled { id: TaskId },
    /// A task was taken off this CPU involuntarily.
    TaskPreempted { id: TaskId },
    /// A task blocked on this CPU.
    TaskBlocked { id: TaskId },
    /// A task yielded on this CPU.
    TaskYielded { id: TaskId },
    /// A task woke up.
    TaskWoke { id: TaskId },
    /// A task exited.
    TaskDead { id: TaskId },
    /// A task left the enclave.
    TaskDeparted { id: TaskId },
    /// The CPU went idle with nothing to run.
    CpuIdle,
}

/// A complete run trace, events in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    /// All events in chronological order.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Total on-CPU time (virtual ns) for a task: the sum of intervals
    /// between each `TaskScheduled` and the next off-CPU event for it.
    pub fn total_runtime(&self, id: TaskId) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running_since: Option<TimeNs> = None;

        for event in &self.events {
            match event.kind {
                TraceKind::TaskScheduled { id: t } if t == id => {
                    // A re-commit of the task already on the CPU does not
                    // restart the interval.
                    if running_since.is_none() {
                        running_since = Some(event.time_ns);
                    }
                }
                TraceKind::TaskPreempted { id: t }
                | TraceKind::TaskBlocked { id: t }
                | TraceKind::TaskYielded { id: t }
                | TraceKind::TaskDead { id: t }
                | TraceKind::TaskDeparted { id: t }
                    if t == id =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                _ => {}
            }
        }

        total
    }

    /// Number of times a task was placed on a CPU.
    pub fn schedule_count(&self, id: TaskId) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { id: t } if t == id))
            .count()
    }

    /// Number of times a CPU went idle.
    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu && matches!(e.kind, TraceKind::CpuIdle))
            .count()
    }

    /// Events of a given kind for a task, as (time, cpu) pairs.
    pub fn task_events(&self, id: TaskId) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| {
                matches!(
                    e.kind,
                    TraceKind::TaskScheduled { id: t }
                    | TraceKind::TaskPreempted { id: t }
                    | TraceKind::TaskBlocked { id: t }
                    | TraceKind::TaskYielded { id: t }
                    | TraceKind::TaskWoke { id: t }
                    | TraceKind::TaskDead { id: t }
                    | TraceKind::TaskDeparted { id: t }
                        if t == id
                )
            })
            .collect()
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match event.kind {
                TraceKind::TaskScheduled { id } => format!("SCHED    {id}"),
                TraceKind::TaskPreempted { id } => format!("PREEMPT  {id}"),
                TraceKind::TaskBlocked { id } => format!("BLOCK    {id}"),
                TraceKind::TaskYielded { id } => format!("YIELD    {id}"),
                TraceKind::TaskWoke { id } => format!("WAKE     {id}"),
                TraceKind::TaskDead { id } => format!("DEAD     {id}"),
                TraceKind::TaskDeparted { id } => format!("DEPART   {id}"),
                TraceKind::CpuIdle => "IDLE".to_string(),
            };
            eprintln!("[{:>12} ns] {:<6} {}", event.time_ns, event.cpu.0, desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_runtime_sums_intervals() {
        let mut trace = Trace::default();
        let t = TaskId(1);
        let c = CpuId(0);
        trace.record(0, c, TraceKind::TaskScheduled { id: t });
        trace.record(100, c, TraceKind::TaskPreempted { id: t });
        trace.record(200, c, TraceKind::TaskScheduled { id: t });
        trace.record(250, c, TraceKind::TaskBlocked { id: t });
        assert_eq!(trace.total_runtime(t), 150);
        assert_eq!(trace.schedule_count(t), 2);
    }

    #[test]
    fn test_recommit_does_not_restart_interval() {
        let mut trace = Trace::default();
        let t = TaskId(1);
        let c = CpuId(0);
        trace.record(0, c, TraceKind::TaskScheduled { id: t });
        trace.record(50, c, TraceKind::TaskScheduled { id: t });
        trace.record(100, c, TraceKind::TaskDead { id: t });
        assert_eq!(trace.total_runtime(t), 100);
    }
}
