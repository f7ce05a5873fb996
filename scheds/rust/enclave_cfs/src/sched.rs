// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler facade: message dispatch, the per-CPU scheduling pass
//! and the agent loop.
//!
//! One agent thread runs per delegated CPU. Each iteration drains that
//! CPU's channel, applying the task state machine under the CPU's
//! run-queue mutex, then either commits a run transaction for the pick or
//! yields the CPU back to the enclave. Messages for tasks with no CPU yet
//! arrive on the default channel, whose agent also runs CPU selection and
//! migration; that is the only path that takes another CPU's run-queue
//! mutex, and it never holds two at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, trace, warn};

use enclave_core::{
    AssocResult, BarrierToken, Channel, CommitState, CpuId, Enclave, Message, RunArgs, TaskId,
    ALLOW_TASK_ONCPU, COMMIT_AT_TXN_COMMIT, RTLA_ON_IDLE,
};

use crate::alloc::{TaskLoc, TaskPool};
use crate::rq::CfsRq;
use crate::stats::{inc, Metrics, Stats};
use crate::task::TaskState;

struct CpuState {
    rq: Mutex<CfsRq>,
    channel: Channel,
}

pub struct CfsScheduler {
    enclave: Arc<Enclave>,
    cpus: Vec<CpuId>,
    states: HashMap<CpuId, CpuState>,
    pool: TaskPool,
    /// Round-robin cursor for placing new and waking tasks. Only the
    /// default-channel agent advances it.
    rr_next: AtomicUsize,
    stats: Stats,
}

impl CfsScheduler {
    pub fn new(enclave: Arc<Enclave>, min_granularity: u64, latency: u64) -> Self {
        let cpus = enclave.cpus().to_vec();
        let states = cpus
            .iter()
            .map(|&cpu| {
                let state = CpuState {
                    rq: Mutex::new(CfsRq::new(cpu, min_granularity, latency)),
                    channel: enclave.channel(cpu),
                };
                (cpu, state)
            })
            .collect();
        CfsScheduler {
            enclave,
            cpus,
            states,
            pool: TaskPool::new(),
            rr_next: AtomicUsize::new(0),
            stats: Stats::default(),
        }
    }

    fn cpu_state(&self, cpu: CpuId) -> &CpuState {
        self.states.get(&cpu).expect("unknown cpu")
    }

    fn lock_rq(&self, cpu: CpuId) -> MutexGuard<'_, CfsRq> {
        self.cpu_state(cpu).rq.lock().unwrap()
    }

    /// The per-CPU agent: signal ready, wait for the enclave, then drain
    /// and schedule until the run is over and this CPU has nothing left.
    pub fn agent_loop(&self, cpu: CpuId) -> Result<()> {
        let result = self.agent_run(cpu);
        // Tell the enclave this CPU is unserviced so the virtual clock
        // does not wait on a dead agent.
        self.enclave.agent_detach(cpu);
        result
    }

    fn agent_run(&self, cpu: CpuId) -> Result<()> {
        self.enclave.signal_agent_ready(cpu);
        self.enclave.wait_enclave_ready();
        debug!("{cpu}: agent running");

        loop {
            self.schedule(cpu)?;
            if self.enclave.finished() && self.cpu_quiesced(cpu) {
                break;
            }
        }

        debug!("{cpu}: agent exiting");
        Ok(())
    }

    /// One agent iteration: drain this CPU's channel, then run the
    /// scheduling decision.
    pub fn schedule(&self, cpu: CpuId) -> Result<()> {
        let sw = self.enclave.status_word(cpu);
        let channel = &self.cpu_state(cpu).channel;

        while let Some(msg) = channel.peek() {
            self.dispatch(&msg)?;
            channel.consume(&msg);
            inc(&self.stats.nr_messages);
        }

        self.cfs_schedule(cpu, sw.barrier(), sw.boosted_priority())
    }

    fn dispatch(&self, msg: &Message) -> Result<()> {
        trace!("dispatch {}: {msg:?}", msg.kind());
        match *msg {
            Message::TaskNew {
                id,
                seqnum,
                runnable,
            } => self.task_new(id, seqnum, runnable),
            Message::TaskRunnable { id, seqnum } => self.task_runnable(id, seqnum),
            Message::TaskDeparted {
                id,
                seqnum,
                cpu,
                from_switchto,
            } => {
                self.task_done(id, seqnum)?;
                self.ping_switchto_origin(cpu, from_switchto);
                Ok(())
            }
            Message::TaskDead { id, seqnum } => self.task_done(id, seqnum),
            Message::TaskYield {
                id,
                seqnum,
                cpu,
                from_switchto,
            } => {
                self.task_offcpu(id, seqnum, cpu, from_switchto, TaskState::Runnable)?;
                self.ping_switchto_origin(cpu, from_switchto);
                Ok(())
            }
            Message::TaskBlocked {
                id,
                seqnum,
                cpu,
                from_switchto,
            } => {
                self.task_offcpu(id, seqnum, cpu, from_switchto, TaskState::Blocked)?;
                self.ping_switchto_origin(cpu, from_switchto);
                Ok(())
            }
            Message::TaskPreempted {
                id,
                seqnum,
                cpu,
                from_switchto,
            } => {
                self.task_preempted(id, seqnum, cpu, from_switchto)?;
                self.ping_switchto_origin(cpu, from_switchto);
                Ok(())
            }
            Message::TaskSwitchto { id, seqnum } => self.task_switchto(id, seqnum),
            Message::CpuTick { cpu } => {
                self.check_preempt_tick(cpu);
                Ok(())
            }
        }
    }

    /// Wake the CPU a switchto chain originated on so its agent notices
    /// the CPU is back in its hands.
    fn ping_switchto_origin(&self, cpu: CpuId, from_switchto: bool) {
        if from_switchto {
            self.enclave.ping(cpu);
            inc(&self.stats.nr_switchto_pings);
        }
    }

    fn task_new(&self, id: TaskId, seqnum: BarrierToken, runnable: bool) -> Result<()> {
        if !self.pool.allocate(id, seqnum) {
            return Ok(());
        }
        inc(&self.stats.nr_tasks_created);

        if runnable {
            let target = self.select_task_rq();
            self.migrate(id, target, seqnum)?;
        }
        // Not runnable: leave the task unassigned until its wakeup shows
        // up, avoiding a race between migration and the wakeup landing on
        // the default channel.
        Ok(())
    }

    fn task_runnable(&self, id: TaskId, seqnum: BarrierToken) -> Result<()> {
        match self.pool.location(id) {
            None => {
                warn!("TaskRunnable for unknown task {id}");
                Ok(())
            }
            Some(TaskLoc::Pending) => {
                // No more messages can be in flight for this task until it
                // runs again, so it is safe to migrate now.
                self.pool.update_pending(id, |t| t.seqnum = seqnum);
                let target = self.select_task_rq();
                self.migrate(id, target, seqnum)
            }
            Some(TaskLoc::OnCpu(cpu)) => {
                let mut rq = self.lock_rq(cpu);
                if rq.task(id).is_none() {
                    warn!("{cpu}: TaskRunnable for {id} not owned here");
                    return Ok(());
                }
                if let Some(t) = rq.task_mut(id) {
                    t.seqnum = seqnum;
                }
                if rq.current() == Some(id) {
                    // Woke before we reconciled its block; the next pick
                    // will put_prev it.
                    if let Some(t) = rq.task_mut(id) {
                        t.state.set(id, TaskState::Runnable);
                    }
                } else {
                    rq.enqueue(id);
                }
                Ok(())
            }
        }
    }

    /// TaskDeparted / TaskDead: erase if queued and free the record. If
    /// the task is current, the next pick reconciles it instead.
    fn task_done(&self, id: TaskId, seqnum: BarrierToken) -> Result<()> {
        match self.pool.location(id) {
            None => {
                warn!("done message for unknown task {id}");
                Ok(())
            }
            Some(TaskLoc::Pending) => {
                self.pool.free(id);
                inc(&self.stats.nr_tasks_done);
                Ok(())
            }
            Some(TaskLoc::OnCpu(cpu)) => {
                let mut rq = self.lock_rq(cpu);
                let Some(t) = rq.task_mut(id) else {
                    warn!("{cpu}: done message for {id} not owned here");
                    return Ok(());
                };
                t.seqnum = seqnum;
                t.state.set(id, TaskState::Done);
                if rq.current() != Some(id) {
                    rq.erase(id);
                    rq.free(id, &self.pool);
                    rq.update_min_vruntime();
                }
                inc(&self.stats.nr_tasks_done);
                Ok(())
            }
        }
    }

    /// TaskYield / TaskBlocked: the task went off-CPU voluntarily; record
    /// the new state and let the next pick reconcile.
    fn task_offcpu(
        &self,
        id: TaskId,
        seqnum: BarrierToken,
        msg_cpu: CpuId,
        from_switchto: bool,
        next: TaskState,
    ) -> Result<()> {
        match self.pool.location(id) {
            None => {
                warn!("off-cpu message for unknown task {id}");
                Ok(())
            }
            Some(TaskLoc::Pending) => {
                // A handoff target we never placed; just track the barrier.
                self.pool.update_pending(id, |t| t.seqnum = seqnum);
                Ok(())
            }
            Some(TaskLoc::OnCpu(cpu)) => {
                let mut rq = self.lock_rq(cpu);
                let is_current = rq.current() == Some(id);
                if !from_switchto && (!is_current || cpu != msg_cpu) {
                    error!(
                        "{cpu}: current diverges from {} message for {id} on {msg_cpu}",
                        if next == TaskState::Runnable {
                            "yield"
                        } else {
                            "block"
                        }
                    );
                    debug_assert!(false, "current/message divergence");
                }
                let Some(t) = rq.task_mut(id) else {
                    return Ok(());
                };
                t.seqnum = seqnum;
                if from_switchto && t.state.get() == next {
                    // The whole excursion happened inside a handoff chain;
                    // nothing changed from our point of view.
                    return Ok(());
                }
                t.state.set(id, next);
                Ok(())
            }
        }
    }

    /// TaskPreempted: no state change; the re-pick does the work.
    fn task_preempted(
        &self,
        id: TaskId,
        seqnum: BarrierToken,
        msg_cpu: CpuId,
        from_switchto: bool,
    ) -> Result<()> {
        match self.pool.location(id) {
            None => {
                warn!("TaskPreempted for unknown task {id}");
                Ok(())
            }
            Some(TaskLoc::Pending) => {
                self.pool.update_pending(id, |t| t.seqnum = seqnum);
                Ok(())
            }
            Some(TaskLoc::OnCpu(cpu)) => {
                let mut rq = self.lock_rq(cpu);
                let is_current = rq.current() == Some(id);
                if !from_switchto && (!is_current || cpu != msg_cpu) {
                    error!("{cpu}: current diverges from preempt message for {id} on {msg_cpu}");
                    debug_assert!(false, "current/message divergence");
                }
                if let Some(t) = rq.task_mut(id) {
                    t.seqnum = seqnum;
                }
                Ok(())
            }
        }
    }

    /// TaskSwitchto: the task handed its CPU away; treat as a voluntary
    /// block.
    fn task_switchto(&self, id: TaskId, seqnum: BarrierToken) -> Result<()> {
        match self.pool.location(id) {
            None => {
                warn!("TaskSwitchto for unknown task {id}");
                Ok(())
            }
            Some(TaskLoc::Pending) => {
                self.pool.update_pending(id, |t| t.seqnum = seqnum);
                Ok(())
            }
            Some(TaskLoc::OnCpu(cpu)) => {
                let mut rq = self.lock_rq(cpu);
                if let Some(t) = rq.task_mut(id) {
                    t.seqnum = seqnum;
                    t.state.set(id, TaskState::Blocked);
                }
                Ok(())
            }
        }
    }

    /// On a tick, flag the current task for preemption once its on-CPU
    /// residency exceeds the preemption granularity.
    fn check_preempt_tick(&self, cpu: CpuId) {
        let mut rq = self.lock_rq(cpu);
        let Some(curr) = rq.current() else {
            return;
        };
        let Some(first_pick) = rq.task(curr).map(|t| t.runtime_at_first_pick) else {
            return;
        };
        let residency = self
            .enclave
            .task_runtime(curr)
            .saturating_sub(first_pick);
        if residency > rq.preemption_granularity() {
            rq.set_preempt_curr();
            inc(&self.stats.nr_preempt_ticks);
        }
    }

    /// Round-robin over the delegated CPUs. Only invoked from the
    /// default-channel agent, which serializes all placements.
    fn select_task_rq(&self) -> CpuId {
        let next = self.rr_next.fetch_add(1, Ordering::Relaxed);
        self.cpus[next % self.cpus.len()]
    }

    /// Move an unassigned task to its first CPU: associate its channel at
    /// the message barrier (retrying stale views), hand the record to the
    /// target run queue, and ping the target agent.
    fn migrate(&self, id: TaskId, target: CpuId, barrier: BarrierToken) -> Result<()> {
        let channel = &self.cpu_state(target).channel;
        let mut barrier = barrier;
        loop {
            match channel.associate_task(id, barrier) {
                AssocResult::Ok => break,
                AssocResult::Stale => {
                    inc(&self.stats.nr_assoc_retries);
                    barrier = self
                        .enclave
                        .task_barrier(id)
                        .context("stale association for a vanished task")?;
                }
            }
        }

        let Some(mut task) = self.pool.take_for_migration(id, target) else {
            bail!("migration of {id} which is not pending");
        };
        debug_assert_eq!(task.cpu, -1);
        task.cpu = target.0 as i32;

        {
            let mut rq = self.lock_rq(target);
            rq.insert_record(task);
            rq.enqueue(id);
        }
        inc(&self.stats.nr_migrations);
        debug!("migrated {id} to {target}");

        // Get the agent's attention so it notices the new task.
        self.enclave.ping(target);
        Ok(())
    }

    /// The scheduling decision for one CPU.
    fn cfs_schedule(&self, cpu: CpuId, agent_barrier: BarrierToken, prio_boost: bool) -> Result<()> {
        if prio_boost {
            // The kernel outranks us; put the current task back according
            // to its state and sleep until the CPU actually idles. No run
            // transaction.
            {
                let mut rq = self.lock_rq(cpu);
                rq.put_prev_current(&self.pool);
            }
            inc(&self.stats.nr_local_yields);
            self.enclave.local_yield(cpu, agent_barrier, RTLA_ON_IDLE);
            return Ok(());
        }

        let picked = {
            let mut rq = self.lock_rq(cpu);
            let next = rq.pick_next(&self.pool, |id| self.enclave.task_runtime(id));
            next.map(|id| {
                let seqnum = rq.task(id).expect("picked task has a record").seqnum;
                (id, seqnum)
            })
        };

        let Some((next, target_barrier)) = picked else {
            inc(&self.stats.nr_local_yields);
            self.enclave.local_yield(cpu, agent_barrier, 0);
            return Ok(());
        };

        let mut req = self.enclave.open(
            cpu,
            RunArgs {
                target: next,
                target_barrier,
                agent_barrier,
                commit_flags: COMMIT_AT_TXN_COMMIT | ALLOW_TASK_ONCPU,
            },
        );

        let before = self.enclave.task_runtime(next);
        if req.commit() {
            let after = self.enclave.task_runtime(next);
            let mut rq = self.lock_rq(cpu);
            if let Some(t) = rq.task_mut(next) {
                t.vruntime += after - before;
            }
            inc(&self.stats.nr_commits);
        } else {
            // A stale barrier: messages arrived between our drain and the
            // commit. Processing them brings our view up to date, and only
            // the last value of current matters, so keep the pick.
            debug!("{cpu}: commit of {next} failed ({:?})", req.state());
            debug_assert!(
                !matches!(req.state(), CommitState::Open),
                "commit left the request open"
            );
            inc(&self.stats.nr_commit_fails);
        }
        Ok(())
    }

    /// Whether this CPU has no current task, an empty timeline, and no
    /// owned records left.
    fn cpu_quiesced(&self, cpu: CpuId) -> bool {
        let rq = self.lock_rq(cpu);
        rq.current().is_none() && rq.is_empty() && rq.nr_records() == 0
    }

    /// Every run queue must be empty once the run is over; anything else
    /// is a scheduler bug.
    pub fn validate_pre_exit(&self) {
        let mut clean = true;
        for &cpu in &self.cpus {
            let rq = self.lock_rq(cpu);
            if rq.current().is_some() || !rq.is_empty() || rq.nr_records() != 0 {
                error!(
                    "{cpu}: run queue not empty at exit (current={:?} queued={} records={})",
                    rq.current(),
                    rq.len(),
                    rq.nr_records()
                );
                clean = false;
            }
        }
        if !self.pool.is_empty() {
            error!("{} tasks still live at exit", self.pool.len());
            clean = false;
        }
        if !clean {
            self.dump_all_tasks();
            debug_assert!(false, "pre-exit validation failed");
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.stats.snapshot()
    }

    /// Test and debug introspection.
    pub fn current_task(&self, cpu: CpuId) -> Option<TaskId> {
        self.lock_rq(cpu).current()
    }

    pub fn queued_len(&self, cpu: CpuId) -> usize {
        self.lock_rq(cpu).len()
    }

    pub fn nr_live_tasks(&self) -> usize {
        self.pool.len()
    }

    pub fn dump_state(&self, cpu: CpuId) {
        let rq = self.lock_rq(cpu);
        info!(
            "SchedState[{}]: current={} rq_len={} min_vruntime={}",
            cpu.0,
            rq.current()
                .map_or_else(|| "none".to_string(), |t| t.to_string()),
            rq.len(),
            rq.min_vruntime()
        );
    }

    pub fn dump_all_tasks(&self) {
        info!("task         state     cpu");
        for &cpu in &self.cpus {
            let rq = self.lock_rq(cpu);
            rq.for_each_record(|t| {
                info!("{:<12} {:<9} {}", t.id.to_string(), t.state.get().to_string(), t.cpu);
            });
        }
        self.pool.for_each(|id, loc| {
            if loc == TaskLoc::Pending {
                info!("{:<12} {:<9} -1", id.to_string(), "Pending");
            }
        });
    }
}
