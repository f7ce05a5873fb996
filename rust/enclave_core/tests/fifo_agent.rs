//! Drive the substrate with a deliberately tiny FIFO agent: no
//! preemption, no fairness, just the raw channel/transaction contract.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

use enclave_core::{
    AssocResult, CpuId, Enclave, Message, Phase, RunArgs, Scenario, TaskBehavior, TaskId,
    ALLOW_TASK_ONCPU, COMMIT_AT_TXN_COMMIT, DEFAULT_TICK_NS,
};

fn fifo_agent(enclave: Arc<Enclave>, cpu: CpuId) {
    let channel = enclave.channel(cpu);
    let mut queue: VecDeque<TaskId> = VecDeque::new();
    let mut seqnums: HashMap<TaskId, u64> = HashMap::new();
    let mut current: Option<TaskId> = None;

    enclave.signal_agent_ready(cpu);
    enclave.wait_enclave_ready();

    loop {
        let sw = enclave.status_word(cpu);

        while let Some(msg) = channel.peek() {
            match msg {
                Message::TaskNew { id, seqnum, runnable } => {
                    while channel.associate_task(id, seqnum) == AssocResult::Stale {}
                    seqnums.insert(id, seqnum);
                    if runnable {
                        queue.push_back(id);
                    }
                }
                Message::TaskRunnable { id, seqnum } => {
                    seqnums.insert(id, seqnum);
                    if current != Some(id) {
                        queue.push_back(id);
                    }
                }
                Message::TaskBlocked { id, seqnum, .. }
                | Message::TaskSwitchto { id, seqnum } => {
                    seqnums.insert(id, seqnum);
                    if current == Some(id) {
                        current = None;
                    }
                }
                Message::TaskYield { id, seqnum, .. }
                | Message::TaskPreempted { id, seqnum, .. } => {
                    seqnums.insert(id, seqnum);
                    if current == Some(id) {
                        current = None;
                        queue.push_back(id);
                    }
                }
                Message::TaskDead { id, .. } | Message::TaskDeparted { id, .. } => {
                    seqnums.remove(&id);
                    queue.retain(|&q| q != id);
                    if current == Some(id) {
                        current = None;
                    }
                }
                Message::CpuTick { .. } => {}
            }
            channel.consume(&msg);
        }

        if enclave.finished() && queue.is_empty() && current.is_none() {
            break;
        }

        if let Some(next) = current.or_else(|| queue.pop_front()) {
            let mut req = enclave.open(
                cpu,
                RunArgs {
                    target: next,
                    target_barrier: seqnums[&next],
                    agent_barrier: sw.barrier(),
                    commit_flags: COMMIT_AT_TXN_COMMIT | ALLOW_TASK_ONCPU,
                },
            );
            if req.commit() {
                current = Some(next);
            } else if current != Some(next) {
                // Stale view; retry after the next drain.
                queue.push_front(next);
            }
        } else {
            enclave.local_yield(cpu, sw.barrier(), 0);
        }
    }
}

/// FIFO semantics over the substrate: the first task runs to its block,
/// the second then owns the CPU (FIFO never preempts), and the first
/// task's wakeup sits queued behind it until the cutoff.
#[test]
fn test_fifo_agent_runs_scenario() {
    let scenario = Scenario::builder()
        .add_task(
            "burst",
            TaskBehavior {
                phases: vec![
                    Phase::Run(3_000_000),
                    Phase::Sleep(2_000_000),
                    Phase::Run(1_000_000),
                ],
                repeat: false,
            },
        )
        .add_task("hog", TaskBehavior::spin(4_000_000))
        .duration_ms(20)
        .build();

    let cpu = CpuId(0);
    let enclave = Enclave::new(vec![cpu], scenario, DEFAULT_TICK_NS).unwrap();
    let agent = {
        let enclave = enclave.clone();
        thread::spawn(move || fifo_agent(enclave, cpu))
    };
    agent.join().expect("agent thread");

    let trace = enclave.shutdown();
    // burst ran its first 3 ms, then the hog took over and never let go.
    assert_eq!(trace.total_runtime(TaskId(1)), 3_000_000);
    assert_eq!(trace.total_runtime(TaskId(2)), 17_000_000);
    assert_eq!(trace.schedule_count(TaskId(2)), 1);
}
