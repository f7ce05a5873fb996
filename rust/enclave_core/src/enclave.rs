//! The in-process enclave.
//!
//! Reproduces the contract a kernel scheduling-delegation facility gives a
//! user-space agent: per-CPU message channels, barrier-validated run
//! transactions, local yield, ping, status words and per-task runtime
//! accounting. Kernel-side behavior is produced from a scripted
//! [`Scenario`](crate::scenario::Scenario) by a conservative discrete-event
//! engine on a virtual clock.
//!
//! Agents are real OS threads. They interact with the enclave exactly the
//! way they would with the kernel facility:
//!
//! - A successful [`RunRequest::commit`] places the target task on the CPU
//!   and parks the calling agent until the agent next regains the CPU
//!   (message arrival, ping, or end of run). Reading the target's runtime
//!   after `commit` returns therefore observes its on-CPU residency.
//! - [`Enclave::local_yield`] parks the agent until a message arrives, a
//!   ping is delivered, the run finishes, or (with [`RTLA_ON_IDLE`]) the
//!   CPU becomes idle with no boost pending.
//!
//! Virtual time only advances while every agent is parked and none has a
//! pending wake condition, so each scheduling decision happens at a fixed
//! virtual instant while agents still run truly in parallel against their
//! per-CPU locks.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use anyhow::{bail, Result};
use log::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::message::Message;
use crate::scenario::{Phase, Scenario, TaskDef};
use crate::trace::{Trace, TraceKind};
use crate::types::{BarrierToken, CpuId, TaskId, TimeNs};

/// Commit at transaction-commit time (as opposed to a group commit).
pub const COMMIT_AT_TXN_COMMIT: u32 = 1 << 0;
/// Allow the transaction to target a task already on the CPU.
pub const ALLOW_TASK_ONCPU: u32 = 1 << 1;

/// Local-yield flag: return to the agent only once the CPU goes idle.
pub const RTLA_ON_IDLE: u32 = 1 << 0;

/// Default tick period.
pub const DEFAULT_TICK_NS: TimeNs = 1_000_000;

/// Agent status word snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AgentStatus {
    barrier: BarrierToken,
    boosted: bool,
}

impl AgentStatus {
    /// The agent barrier at the time of the snapshot.
    pub fn barrier(&self) -> BarrierToken {
        self.barrier
    }

    /// Whether the kernel currently outranks the agent on this CPU.
    pub fn boosted_priority(&self) -> bool {
        self.boosted
    }
}

/// Arguments for opening a run transaction.
#[derive(Debug, Clone, Copy)]
pub struct RunArgs {
    pub target: TaskId,
    pub target_barrier: BarrierToken,
    pub agent_barrier: BarrierToken,
    pub commit_flags: u32,
}

/// Outcome of a run transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Open,
    Committed,
    StaleAgentBarrier,
    StaleTargetBarrier,
    TargetGone,
}

/// An open run transaction for one CPU.
pub struct RunRequest {
    shared: Arc<Shared>,
    cpu: CpuId,
    args: RunArgs,
    state: CommitState,
}

impl RunRequest {
    /// Commit the transaction.
    ///
    /// On success the target is on the CPU and the call returns only once
    /// the agent regains it. On a stale barrier the call returns `false`
    /// immediately with no side effects; draining the channel brings the
    /// agent's view back up to date.
    pub fn commit(&mut self) -> bool {
        self.state = commit_txn(&self.shared, self.cpu, &self.args);
        self.state == CommitState::Committed
    }

    pub fn state(&self) -> CommitState {
        self.state
    }
}

/// Kernel-side view of a scripted task.
struct SimTask {
    name: String,
    phases: Vec<Phase>,
    repeat: bool,
    phase_idx: usize,
    /// Remaining ns in the current Run phase.
    run_remaining: TimeNs,
    kstate: KState,
    /// Channel the task is associated with.
    channel: CpuId,
    /// Seqnum of the newest message generated for this task.
    seqnum: BarrierToken,
    /// Accrued on-CPU virtual ns.
    runtime: TimeNs,
    oncpu: Option<CpuId>,
    oncpu_since: TimeNs,
    /// Bumped on every on/off-CPU transition; stale PhaseEnd events are
    /// dropped by comparing against it.
    epoch: u64,
    /// Bumped on every block; stale wake events are dropped.
    sleep_seq: u64,
    /// Set while the task runs via a switchto handoff; names the CPU whose
    /// agent must be pinged when the task goes off-CPU.
    switchto_origin: Option<CpuId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KState {
    Blocked,
    Runnable,
    Running,
    Dead,
}

/// Kernel-side view of one CPU and its agent.
struct SimCpu {
    queue: VecDeque<Message>,
    agent_barrier: BarrierToken,
    oncpu: Option<TaskId>,
    boosted: bool,
    ping: bool,
    parked: bool,
    idle_wake: bool,
    tick_armed: bool,
    /// The agent gave up on this CPU (exit or error); never wake it again
    /// and never wait for it.
    detached: bool,
}

impl SimCpu {
    fn new() -> Self {
        SimCpu {
            queue: VecDeque::new(),
            agent_barrier: 0,
            oncpu: None,
            boosted: false,
            ping: false,
            parked: false,
            idle_wake: false,
            tick_armed: false,
            detached: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Event {
    time: TimeNs,
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum EventKind {
    TaskStart(TaskId),
    TaskWake { task: TaskId, sleep_seq: u64 },
    PhaseEnd { task: TaskId, epoch: u64 },
    Tick(CpuId),
    BoostOn(CpuId),
    BoostOff(CpuId),
    Cutoff,
}

pub(crate) struct SimState {
    clock: TimeNs,
    next_seq: u64,
    events: BinaryHeap<Reverse<Event>>,
    tasks: HashMap<TaskId, SimTask>,
    defs: HashMap<TaskId, TaskDef>,
    cpus: HashMap<CpuId, SimCpu>,
    default_cpu: CpuId,
    tick_ns: TimeNs,
    finished: bool,
    started: bool,
    shutdown_requested: bool,
    nr_agents_ready: usize,
    nr_cpus: usize,
    trace: Trace,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<SimState>,
    pub(crate) cv: Condvar,
}

/// The in-process enclave handle.
pub struct Enclave {
    shared: Arc<Shared>,
    cpus: Vec<CpuId>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Enclave {
    /// Build an enclave over the given CPUs running the given scenario.
    pub fn new(cpus: Vec<CpuId>, scenario: Scenario, tick_ns: TimeNs) -> Result<Arc<Enclave>> {
        if cpus.is_empty() {
            bail!("enclave needs at least one CPU");
        }
        let mut uniq = cpus.clone();
        uniq.sort();
        uniq.dedup();
        if uniq.len() != cpus.len() {
            bail!("duplicate CPU ids in cpulist");
        }
        if tick_ns == 0 {
            bail!("tick period must be non-zero");
        }

        let mut state = SimState {
            clock: 0,
            next_seq: 0,
            events: BinaryHeap::new(),
            tasks: HashMap::new(),
            defs: HashMap::new(),
            cpus: cpus.iter().map(|&c| (c, SimCpu::new())).collect(),
            default_cpu: cpus[0],
            tick_ns,
            finished: false,
            started: false,
            shutdown_requested: false,
            nr_agents_ready: 0,
            nr_cpus: cpus.len(),
            trace: Trace::default(),
        };

        for def in &scenario.tasks {
            state.defs.insert(def.id, def.clone());
            let time = def.start_time_ns;
            state.schedule_event(time, EventKind::TaskStart(def.id));
        }
        for boost in &scenario.boosts {
            if !state.cpus.contains_key(&boost.cpu) {
                bail!("boost references unknown {}", boost.cpu);
            }
            state.schedule_event(boost.at_ns, EventKind::BoostOn(boost.cpu));
            state.schedule_event(
                boost.at_ns + boost.duration_ns,
                EventKind::BoostOff(boost.cpu),
            );
        }
        state.schedule_event(scenario.duration_ns, EventKind::Cutoff);

        let shared = Arc::new(Shared {
            state: Mutex::new(state),
            cv: Condvar::new(),
        });

        let driver_shared = shared.clone();
        let driver = thread::Builder::new()
            .name("enclave-driver".into())
            .spawn(move || driver_loop(driver_shared))?;

        Ok(Arc::new(Enclave {
            shared,
            cpus,
            driver: Mutex::new(Some(driver)),
        }))
    }

    /// The CPUs delegated to this enclave, in cpulist order.
    pub fn cpus(&self) -> &[CpuId] {
        &self.cpus
    }

    /// The CPU whose channel receives messages for unassociated tasks.
    pub fn default_channel_cpu(&self) -> CpuId {
        self.cpus[0]
    }

    /// A handle to one CPU's message channel.
    pub fn channel(self: &Arc<Self>, cpu: CpuId) -> Channel {
        Channel::new(self.shared.clone(), cpu)
    }

    /// Snapshot the agent status word for a CPU.
    pub fn status_word(&self, cpu: CpuId) -> AgentStatus {
        let st = self.lock();
        let c = st.cpu(cpu);
        AgentStatus {
            barrier: c.agent_barrier,
            boosted: c.boosted,
        }
    }

    /// Monotone on-CPU virtual nanoseconds for a task.
    pub fn task_runtime(&self, id: TaskId) -> TimeNs {
        let st = self.lock();
        match st.tasks.get(&id) {
            Some(t) if t.oncpu.is_some() => t.runtime + (st.clock - t.oncpu_since),
            Some(t) => t.runtime,
            None => 0,
        }
    }

    /// The newest barrier token generated for a task.
    pub fn task_barrier(&self, id: TaskId) -> Option<BarrierToken> {
        self.lock().tasks.get(&id).map(|t| t.seqnum)
    }

    /// Called by each agent once it is set up. The enclave becomes ready
    /// when every CPU's agent has signaled.
    pub fn signal_agent_ready(&self, _cpu: CpuId) {
        let mut st = self.lock();
        st.nr_agents_ready += 1;
        if st.nr_agents_ready == st.nr_cpus {
            st.started = true;
        }
        self.shared.cv.notify_all();
    }

    /// Block until every agent has signaled ready.
    pub fn wait_enclave_ready(&self) {
        let mut st = self.lock();
        while !st.started && !st.shutdown_requested {
            st = self.shared.cv.wait(st).unwrap();
        }
    }

    /// Open a run transaction targeting `args.target` on `cpu`.
    pub fn open(self: &Arc<Self>, cpu: CpuId, args: RunArgs) -> RunRequest {
        RunRequest {
            shared: self.shared.clone(),
            cpu,
            args,
            state: CommitState::Open,
        }
    }

    /// Yield the agent's CPU back to the enclave. Returns when the agent
    /// has something to do again. A stale `agent_barrier` returns
    /// immediately: messages are already pending.
    pub fn local_yield(&self, cpu: CpuId, agent_barrier: BarrierToken, flags: u32) {
        let mut st = self.lock();
        if st.cpu(cpu).agent_barrier != agent_barrier {
            return;
        }
        if flags & RTLA_ON_IDLE != 0 {
            st.cpu_mut(cpu).idle_wake = true;
        }
        if st.cpu(cpu).oncpu.is_none() && !st.finished {
            let now = st.clock;
            st.trace.record(now, cpu, TraceKind::CpuIdle);
        }
        let _st = park_agent(&self.shared, st, cpu);
    }

    /// Wake the agent bound to `cpu`.
    pub fn ping(&self, cpu: CpuId) {
        let mut st = self.lock();
        let c = st.cpu_mut(cpu);
        c.ping = true;
        c.agent_barrier += 1;
        self.shared.cv.notify_all();
    }

    /// Whether the run is over. Agents drain and exit once this is set.
    pub fn finished(&self) -> bool {
        self.lock().finished
    }

    /// Called by an agent that will never service its CPU again, so the
    /// virtual clock does not wait on it.
    pub fn agent_detach(&self, cpu: CpuId) {
        let mut st = self.lock();
        let c = st.cpu_mut(cpu);
        c.parked = true;
        c.detached = true;
        self.shared.cv.notify_all();
    }

    /// Stop the driver and return the run trace. Call after joining the
    /// agent threads.
    pub fn shutdown(&self) -> Trace {
        {
            let mut st = self.lock();
            st.shutdown_requested = true;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.driver.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("enclave driver panicked");
            }
        }
        self.lock().trace.clone()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.state.lock().unwrap()
    }
}

impl Drop for Enclave {
    fn drop(&mut self) {
        // Make sure the driver is not left running against a dead handle.
        if let Ok(mut st) = self.shared.state.lock() {
            st.shutdown_requested = true;
        }
        self.shared.cv.notify_all();
    }
}

fn wake_ready(c: &SimCpu, finished: bool) -> bool {
    finished
        || c.ping
        || !c.queue.is_empty()
        || (c.idle_wake && c.oncpu.is_none() && !c.boosted)
}

/// Park the calling agent until it has a wake condition.
fn park_agent<'a>(
    shared: &'a Shared,
    mut st: MutexGuard<'a, SimState>,
    cpu: CpuId,
) -> MutexGuard<'a, SimState> {
    st.cpu_mut(cpu).parked = true;
    shared.cv.notify_all();
    loop {
        let finished = st.finished || st.shutdown_requested;
        if wake_ready(st.cpu(cpu), finished) {
            break;
        }
        st = shared.cv.wait(st).unwrap();
    }
    let c = st.cpu_mut(cpu);
    c.parked = false;
    c.ping = false;
    c.idle_wake = false;
    st
}

fn commit_txn(shared: &Shared, cpu: CpuId, args: &RunArgs) -> CommitState {
    let mut st = shared.state.lock().unwrap();

    if st.cpu(cpu).agent_barrier != args.agent_barrier {
        return CommitState::StaleAgentBarrier;
    }
    let Some(t) = st.tasks.get(&args.target) else {
        return CommitState::TargetGone;
    };
    if t.kstate == KState::Dead {
        return CommitState::TargetGone;
    }
    if t.seqnum != args.target_barrier {
        return CommitState::StaleTargetBarrier;
    }

    if t.oncpu == Some(cpu) {
        // Keep-running commit: the target already owns the CPU.
        debug_assert!(args.commit_flags & ALLOW_TASK_ONCPU != 0);
    } else {
        debug_assert_eq!(t.kstate, KState::Runnable, "commit of unrunnable task");
        debug_assert!(t.oncpu.is_none());
        st.preempt_oncpu(cpu, true);
        st.place_oncpu(args.target, cpu);
    }

    let _st = park_agent(shared, st, cpu);
    CommitState::Committed
}

fn driver_loop(shared: Arc<Shared>) {
    let mut st = shared.state.lock().unwrap();
    while !st.started && !st.shutdown_requested {
        st = shared.cv.wait(st).unwrap();
    }

    loop {
        if st.shutdown_requested || st.finished {
            break;
        }

        let any_ready = st
            .cpus
            .values()
            .any(|c| c.parked && !c.detached && wake_ready(c, st.finished));
        if any_ready {
            shared.cv.notify_all();
            st = shared.cv.wait(st).unwrap();
            continue;
        }

        if !st.cpus.values().all(|c| c.parked) {
            st = shared.cv.wait(st).unwrap();
            continue;
        }

        // Quiescent: advance virtual time to the next event.
        let Some(Reverse(ev)) = st.events.pop() else {
            error!("enclave: event queue drained before cutoff");
            break;
        };
        debug_assert!(ev.time >= st.clock);
        st.clock = st.clock.max(ev.time);
        st.process_event(ev);
        shared.cv.notify_all();
    }

    shared.cv.notify_all();
}

impl SimState {
    fn cpu(&self, cpu: CpuId) -> &SimCpu {
        self.cpus.get(&cpu).expect("unknown cpu")
    }

    fn cpu_mut(&mut self, cpu: CpuId) -> &mut SimCpu {
        self.cpus.get_mut(&cpu).expect("unknown cpu")
    }

    fn task_mut(&mut self, id: TaskId) -> &mut SimTask {
        self.tasks.get_mut(&id).expect("unknown task")
    }

    pub(crate) fn channel_front(&self, cpu: CpuId) -> Option<Message> {
        self.cpu(cpu).queue.front().cloned()
    }

    pub(crate) fn channel_pop(&mut self, cpu: CpuId, expected: &Message) {
        let popped = self.cpu_mut(cpu).queue.pop_front();
        debug_assert_eq!(popped.as_ref(), Some(expected), "consume out of order");
    }

    pub(crate) fn associate(&mut self, cpu: CpuId, id: TaskId, barrier: BarrierToken) -> bool {
        let Some(t) = self.tasks.get_mut(&id) else {
            debug_assert!(false, "associate of unknown task {id}");
            return false;
        };
        if t.seqnum != barrier {
            return false;
        }
        t.channel = cpu;
        true
    }

    fn schedule_event(&mut self, time: TimeNs, kind: EventKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Reverse(Event { time, seq, kind }));
    }

    fn push_msg(&mut self, cpu: CpuId, msg: Message) {
        trace!("[{}] {} -> {}", self.clock, msg.kind(), cpu);
        let c = self.cpu_mut(cpu);
        c.queue.push_back(msg);
        c.agent_barrier += 1;
    }

    fn next_task_seqnum(&mut self, id: TaskId) -> BarrierToken {
        let t = self.task_mut(id);
        t.seqnum += 1;
        t.seqnum
    }

    fn arm_tick(&mut self, cpu: CpuId) {
        if !self.cpu(cpu).tick_armed {
            self.cpu_mut(cpu).tick_armed = true;
            let at = self.clock + self.tick_ns;
            self.schedule_event(at, EventKind::Tick(cpu));
        }
    }

    /// Put a runnable task on a CPU and schedule the end of its Run phase.
    fn place_oncpu(&mut self, id: TaskId, cpu: CpuId) {
        let now = self.clock;
        let remaining = {
            let t = self.task_mut(id);
            t.oncpu = Some(cpu);
            t.oncpu_since = now;
            t.epoch += 1;
            t.kstate = KState::Running;
            t.run_remaining
        };
        self.cpu_mut(cpu).oncpu = Some(id);
        self.trace.record(now, cpu, TraceKind::TaskScheduled { id });
        let epoch = self.tasks[&id].epoch;
        self.schedule_event(now + remaining, EventKind::PhaseEnd { task: id, epoch });
        self.arm_tick(cpu);
    }

    /// Take a running task off its CPU, accounting its residency.
    /// Returns (cpu it ran on, whether it ran via a switchto handoff).
    fn deschedule(&mut self, id: TaskId) -> (CpuId, bool) {
        let now = self.clock;
        let (cpu, from_switchto) = {
            let t = self.task_mut(id);
            let cpu = t.oncpu.expect("deschedule of off-cpu task");
            let elapsed = now - t.oncpu_since;
            t.runtime += elapsed;
            t.run_remaining = t.run_remaining.saturating_sub(elapsed);
            t.oncpu = None;
            t.epoch += 1;
            let from_switchto = t.switchto_origin.is_some();
            t.switchto_origin = None;
            (cpu, from_switchto)
        };
        self.cpu_mut(cpu).oncpu = None;
        (cpu, from_switchto)
    }

    /// Kick whatever currently owns `cpu` off it. `by_agent` tells whether
    /// the preemption is the agent's own transaction replacing the task
    /// (which the agent already reconciled, so no message is due) or a
    /// kernel-side preemption the agent has to be told about.
    fn preempt_oncpu(&mut self, cpu: CpuId, by_agent: bool) {
        let Some(prev) = self.cpu(cpu).oncpu else {
            return;
        };
        let now = self.clock;
        let (ran_on, from_switchto) = self.deschedule(prev);
        debug_assert_eq!(ran_on, cpu);
        self.trace
            .record(now, cpu, TraceKind::TaskPreempted { id: prev });
        self.task_mut(prev).kstate = KState::Runnable;
        let channel = self.tasks[&prev].channel;
        if from_switchto {
            // The agent never placed this task; sever the handoff chain by
            // reporting a block immediately followed by a wakeup.
            let seqnum = self.next_task_seqnum(prev);
            self.push_msg(
                channel,
                Message::TaskBlocked {
                    id: prev,
                    seqnum,
                    cpu,
                    from_switchto: true,
                },
            );
            let seqnum = self.next_task_seqnum(prev);
            self.push_msg(channel, Message::TaskRunnable { id: prev, seqnum });
        } else if !by_agent {
            let seqnum = self.next_task_seqnum(prev);
            self.push_msg(
                channel,
                Message::TaskPreempted {
                    id: prev,
                    seqnum,
                    cpu,
                    from_switchto: false,
                },
            );
        }
    }

    /// Move to the next phase index. Returns false when the script is over.
    fn advance_phase(&mut self, id: TaskId) -> bool {
        let t = self.task_mut(id);
        t.phase_idx += 1;
        if t.phase_idx >= t.phases.len() {
            if !t.repeat {
                return false;
            }
            t.phase_idx = 0;
        }
        true
    }

    fn current_phase(&self, id: TaskId) -> Phase {
        let t = &self.tasks[&id];
        t.phases[t.phase_idx].clone()
    }

    /// A running task exhausted its Run phase; walk the script forward.
    fn advance_script_running(&mut self, id: TaskId) {
        let now = self.clock;
        loop {
            if !self.advance_phase(id) {
                let (cpu, _) = self.deschedule(id);
                self.task_mut(id).kstate = KState::Dead;
                self.trace.record(now, cpu, TraceKind::TaskDead { id });
                let seqnum = self.next_task_seqnum(id);
                let channel = self.tasks[&id].channel;
                self.push_msg(channel, Message::TaskDead { id, seqnum });
                return;
            }
            match self.current_phase(id) {
                Phase::Run(ns) => {
                    // The task keeps the CPU; the kernel only notices the
                    // next off-CPU transition.
                    self.task_mut(id).run_remaining = ns;
                    let epoch = self.tasks[&id].epoch;
                    self.schedule_event(now + ns, EventKind::PhaseEnd { task: id, epoch });
                    return;
                }
                Phase::Sleep(ns) => {
                    let (cpu, from_switchto) = self.deschedule(id);
                    self.trace.record(now, cpu, TraceKind::TaskBlocked { id });
                    let t = self.task_mut(id);
                    t.kstate = KState::Blocked;
                    t.sleep_seq += 1;
                    let sleep_seq = t.sleep_seq;
                    self.schedule_event(now + ns, EventKind::TaskWake { task: id, sleep_seq });
                    let seqnum = self.next_task_seqnum(id);
                    let channel = self.tasks[&id].channel;
                    self.push_msg(
                        channel,
                        Message::TaskBlocked {
                            id,
                            seqnum,
                            cpu,
                            from_switchto,
                        },
                    );
                    return;
                }
                Phase::Yield => {
                    // Move past the Yield so the next placement resumes at
                    // the following Run phase.
                    if !self.advance_phase(id) {
                        // Yield as the last phase: the task is done.
                        continue;
                    }
                    match self.current_phase(id) {
                        Phase::Run(ns) => self.task_mut(id).run_remaining = ns,
                        other => {
                            warn!("{id}: phase after Yield is {other:?}, expected Run");
                        }
                    }
                    let (cpu, from_switchto) = self.deschedule(id);
                    self.trace.record(now, cpu, TraceKind::TaskYielded { id });
                    self.task_mut(id).kstate = KState::Runnable;
                    let channel = self.tasks[&id].channel;
                    if from_switchto {
                        // The agent never placed this task; report the end
                        // of the handoff as a block plus an instant wakeup
                        // so it re-enters through the normal path.
                        let seqnum = self.next_task_seqnum(id);
                        self.push_msg(
                            channel,
                            Message::TaskBlocked {
                                id,
                                seqnum,
                                cpu,
                                from_switchto: true,
                            },
                        );
                        let seqnum = self.next_task_seqnum(id);
                        self.push_msg(channel, Message::TaskRunnable { id, seqnum });
                    } else {
                        let seqnum = self.next_task_seqnum(id);
                        self.push_msg(
                            channel,
                            Message::TaskYield {
                                id,
                                seqnum,
                                cpu,
                                from_switchto: false,
                            },
                        );
                    }
                    return;
                }
                Phase::Wake(other) => {
                    self.wake_task(other);
                    // Instantaneous; keep walking this task's script.
                    continue;
                }
                Phase::Switchto(target) => {
                    self.do_switchto(id, target);
                    return;
                }
            }
        }
    }

    /// Wake a blocked task: walk its script to the next Run phase and
    /// deliver TaskRunnable.
    fn wake_task(&mut self, id: TaskId) {
        let now = self.clock;
        let Some(t) = self.tasks.get(&id) else {
            debug!("wake of unknown task {id}");
            return;
        };
        if t.kstate != KState::Blocked {
            debug!("wake of non-blocked task {id}, ignored");
            return;
        }
        self.task_mut(id).sleep_seq += 1;
        loop {
            if !self.advance_phase(id) {
                // Script over while blocked; the task never runs again.
                self.task_mut(id).kstate = KState::Dead;
                let channel = self.tasks[&id].channel;
                self.trace.record(now, channel, TraceKind::TaskDead { id });
                let seqnum = self.next_task_seqnum(id);
                self.push_msg(channel, Message::TaskDead { id, seqnum });
                return;
            }
            match self.current_phase(id) {
                Phase::Run(ns) => {
                    let t = self.task_mut(id);
                    t.run_remaining = ns;
                    t.kstate = KState::Runnable;
                    let channel = t.channel;
                    self.trace.record(now, channel, TraceKind::TaskWoke { id });
                    let seqnum = self.next_task_seqnum(id);
                    self.push_msg(channel, Message::TaskRunnable { id, seqnum });
                    return;
                }
                Phase::Sleep(ns) => {
                    let t = self.task_mut(id);
                    t.sleep_seq += 1;
                    let sleep_seq = t.sleep_seq;
                    self.schedule_event(now + ns, EventKind::TaskWake { task: id, sleep_seq });
                    return;
                }
                Phase::Wake(other) => {
                    self.wake_task(other);
                    continue;
                }
                other => {
                    warn!("{id}: woke into {other:?}, skipping");
                    continue;
                }
            }
        }
    }

    /// In-kernel task-to-task handoff: the source blocks, the target takes
    /// the CPU without an agent transaction.
    fn do_switchto(&mut self, src: TaskId, target: TaskId) {
        let now = self.clock;
        let target_ok = matches!(
            self.tasks.get(&target),
            Some(t) if t.kstate == KState::Blocked
        );
        if !target_ok {
            warn!("{src}: switchto target {target} not blocked, yielding instead");
            let (cpu, from_switchto) = self.deschedule(src);
            self.trace
                .record(now, cpu, TraceKind::TaskYielded { id: src });
            self.task_mut(src).kstate = KState::Runnable;
            let seqnum = self.next_task_seqnum(src);
            let channel = self.tasks[&src].channel;
            self.push_msg(
                channel,
                Message::TaskYield {
                    id: src,
                    seqnum,
                    cpu,
                    from_switchto,
                },
            );
            return;
        }

        let (cpu, _) = self.deschedule(src);
        self.trace
            .record(now, cpu, TraceKind::TaskBlocked { id: src });
        // The source resumes at its next phase when somebody wakes it.
        self.task_mut(src).kstate = KState::Blocked;
        let seqnum = self.next_task_seqnum(src);
        let channel = self.tasks[&src].channel;
        self.push_msg(channel, Message::TaskSwitchto { id: src, seqnum });

        // Bring the target's script to its next Run phase and hand it the
        // CPU directly.
        self.task_mut(target).sleep_seq += 1;
        loop {
            if !self.advance_phase(target) {
                self.task_mut(target).kstate = KState::Dead;
                let tchan = self.tasks[&target].channel;
                self.trace
                    .record(now, tchan, TraceKind::TaskDead { id: target });
                let seqnum = self.next_task_seqnum(target);
                self.push_msg(tchan, Message::TaskDead { id: target, seqnum });
                return;
            }
            match self.current_phase(target) {
                Phase::Run(ns) => {
                    self.task_mut(target).run_remaining = ns;
                    break;
                }
                Phase::Wake(other) => {
                    self.wake_task(other);
                    continue;
                }
                other => {
                    warn!("{target}: switchto into {other:?}, skipping");
                    continue;
                }
            }
        }
        self.place_oncpu(target, cpu);
        self.task_mut(target).switchto_origin = Some(cpu);
    }

    fn process_event(&mut self, ev: Event) {
        let now = self.clock;
        match ev.kind {
            EventKind::TaskStart(id) => {
                let def = self.defs.get(&id).expect("start of undefined task").clone();
                let first_runnable = matches!(def.behavior.phases[0], Phase::Run(_));
                let run_remaining = match def.behavior.phases[0] {
                    Phase::Run(ns) => ns,
                    _ => 0,
                };
                let default_cpu = self.default_cpu;
                let task = SimTask {
                    name: def.name.clone(),
                    phases: def.behavior.phases.clone(),
                    repeat: def.behavior.repeat,
                    phase_idx: 0,
                    run_remaining,
                    kstate: if first_runnable {
                        KState::Runnable
                    } else {
                        KState::Blocked
                    },
                    channel: default_cpu,
                    seqnum: 1,
                    runtime: 0,
                    oncpu: None,
                    oncpu_since: 0,
                    epoch: 0,
                    sleep_seq: 0,
                    switchto_origin: None,
                };
                debug!("[{now}] task {id} ({}) enters, runnable={first_runnable}", task.name);
                if let Phase::Sleep(ns) = def.behavior.phases[0] {
                    let sleep_seq = task.sleep_seq;
                    self.tasks.insert(id, task);
                    self.schedule_event(
                        now + ns,
                        EventKind::TaskWake {
                            task: id,
                            sleep_seq,
                        },
                    );
                } else {
                    self.tasks.insert(id, task);
                }
                self.push_msg(
                    default_cpu,
                    Message::TaskNew {
                        id,
                        seqnum: 1,
                        runnable: first_runnable,
                    },
                );
            }
            EventKind::TaskWake { task, sleep_seq } => {
                let valid = matches!(
                    self.tasks.get(&task),
                    Some(t) if t.kstate == KState::Blocked && t.sleep_seq == sleep_seq
                );
                if valid {
                    self.wake_task(task);
                }
            }
            EventKind::PhaseEnd { task, epoch } => {
                let valid = matches!(
                    self.tasks.get(&task),
                    Some(t) if t.kstate == KState::Running && t.epoch == epoch
                );
                if valid {
                    let t = self.task_mut(task);
                    let since = t.oncpu_since;
                    t.runtime += now - since;
                    t.oncpu_since = now;
                    t.run_remaining = 0;
                    self.advance_script_running(task);
                }
            }
            EventKind::Tick(cpu) => {
                if self.cpu(cpu).oncpu.is_some() {
                    self.push_msg(cpu, Message::CpuTick { cpu });
                    let at = now + self.tick_ns;
                    self.schedule_event(at, EventKind::Tick(cpu));
                } else {
                    self.cpu_mut(cpu).tick_armed = false;
                }
            }
            EventKind::BoostOn(cpu) => {
                debug!("[{now}] boost on {cpu}");
                self.cpu_mut(cpu).boosted = true;
                self.preempt_oncpu(cpu, false);
            }
            EventKind::BoostOff(cpu) => {
                debug!("[{now}] boost off {cpu}");
                self.cpu_mut(cpu).boosted = false;
            }
            EventKind::Cutoff => {
                debug!("[{now}] cutoff, departing all live tasks");
                self.finished = true;
                self.events.clear();
                let mut ids: Vec<TaskId> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| t.kstate != KState::Dead)
                    .map(|(&id, _)| id)
                    .collect();
                ids.sort();
                for id in ids {
                    let (cpu, from_switchto) = if self.tasks[&id].oncpu.is_some() {
                        self.deschedule(id)
                    } else {
                        (self.tasks[&id].channel, false)
                    };
                    self.task_mut(id).kstate = KState::Dead;
                    self.trace.record(now, cpu, TraceKind::TaskDeparted { id });
                    let seqnum = self.next_task_seqnum(id);
                    let channel = self.tasks[&id].channel;
                    self.push_msg(
                        channel,
                        Message::TaskDeparted {
                            id,
                            seqnum,
                            cpu,
                            from_switchto,
                        },
                    );
                }
            }
        }
    }
}
