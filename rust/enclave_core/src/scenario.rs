//! Scripted workload definition and builder API.
//!
//! A scenario describes the kernel-side behavior the enclave will produce:
//! which tasks exist, how they alternate between running, sleeping,
//! yielding and handing off, and when the kernel briefly outranks the
//! agents (priority-boost windows).

use crate::types::{CpuId, TaskId, TimeNs};

/// A phase in a task's scripted behavior.
#[derive(Debug, Clone)]
pub enum Phase {
    /// Consume CPU for the given number of virtual nanoseconds.
    Run(TimeNs),
    /// Block for the given number of virtual nanoseconds.
    Sleep(TimeNs),
    /// Go off-CPU voluntarily, stay runnable.
    Yield,
    /// Wake another task (instantaneous).
    Wake(TaskId),
    /// Hand the CPU directly to another task without an agent transaction.
    Switchto(TaskId),
}

/// The scripted behavior for a task: a sequence of phases, optionally
/// repeating until the end of the run.
#[derive(Debug, Clone)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: bool,
}

impl TaskBehavior {
    /// A task that runs forever.
    pub fn spin(slice_ns: TimeNs) -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(slice_ns)],
            repeat: true,
        }
    }

    /// A task that alternates running and sleeping forever.
    pub fn interactive(run_ns: TimeNs, sleep_ns: TimeNs) -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(run_ns), Phase::Sleep(sleep_ns)],
            repeat: true,
        }
    }
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub id: TaskId,
    pub behavior: TaskBehavior,
    /// When the task enters the enclave (virtual ns).
    pub start_time_ns: TimeNs,
}

/// A scripted priority-boost window: the kernel temporarily outranks the
/// agent on one CPU.
#[derive(Debug, Clone)]
pub struct BoostDef {
    pub cpu: CpuId,
    pub at_ns: TimeNs,
    pub duration_ns: TimeNs,
}

/// A complete scenario: tasks, boost windows, and run duration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub tasks: Vec<TaskDef>,
    pub boosts: Vec<BoostDef>,
    pub duration_ns: TimeNs,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            tasks: Vec::new(),
            boosts: Vec::new(),
            duration_ns: 100_000_000, // 100ms default
            next_id: TaskId(1),
        }
    }
}

/// Builder for constructing scenarios.
pub struct ScenarioBuilder {
    tasks: Vec<TaskDef>,
    boosts: Vec<BoostDef>,
    duration_ns: TimeNs,
    next_id: TaskId,
}

impl ScenarioBuilder {
    /// Add a task with a full TaskDef.
    pub fn task(mut self, def: TaskDef) -> Self {
        self.tasks.push(def);
        self
    }

    /// Convenience: add a task with an auto-assigned id starting at 0 ns.
    pub fn add_task(mut self, name: &str, behavior: TaskBehavior) -> Self {
        let id = self.next_id;
        self.next_id = TaskId(id.0 + 1);
        self.tasks.push(TaskDef {
            name: name.to_string(),
            id,
            behavior,
            start_time_ns: 0,
        });
        self
    }

    /// Add a priority-boost window.
    pub fn boost(mut self, cpu: CpuId, at_ns: TimeNs, duration_ns: TimeNs) -> Self {
        self.boosts.push(BoostDef {
            cpu,
            at_ns,
            duration_ns,
        });
        self
    }

    /// Set the run duration in nanoseconds.
    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    /// Set the run duration in milliseconds.
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * 1_000_000;
        self
    }

    /// Build the scenario, validating the scripts.
    pub fn build(self) -> Scenario {
        assert!(
            !self.tasks.is_empty(),
            "scenario must have at least one task"
        );
        let mut seen = std::collections::HashSet::new();
        for def in &self.tasks {
            assert!(seen.insert(def.id), "duplicate task id {}", def.id);
            validate_behavior(def);
        }
        Scenario {
            tasks: self.tasks,
            boosts: self.boosts,
            duration_ns: self.duration_ns,
        }
    }
}

fn validate_behavior(def: &TaskDef) {
    let phases = &def.behavior.phases;
    assert!(!phases.is_empty(), "task {} has an empty script", def.name);
    assert!(
        matches!(phases[0], Phase::Run(_) | Phase::Sleep(_)),
        "task {} must start with Run or Sleep",
        def.name
    );
    for (i, phase) in phases.iter().enumerate() {
        match phase {
            // Yield and Switchto only make sense while on-CPU.
            Phase::Yield | Phase::Switchto(_) => {
                let prev = if i == 0 { None } else { phases.get(i - 1) };
                assert!(
                    matches!(prev, Some(Phase::Run(_))),
                    "task {}: phase {} must directly follow a Run phase",
                    def.name,
                    i
                );
            }
            Phase::Wake(target) => {
                assert!(*target != def.id, "task {} cannot wake itself", def.name);
            }
            Phase::Run(_) | Phase::Sleep(_) => {}
        }
    }
}
