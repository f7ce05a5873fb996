// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Property tests for the run queue invariants: random, well-formed op
//! sequences must preserve tree membership, min_vruntime monotonicity,
//! the enqueue clamp, per-task vruntime monotonicity, and minimal-key
//! picking, at every observation point.

use std::collections::HashMap;

use proptest::prelude::*;

use enclave_cfs::alloc::TaskPool;
use enclave_cfs::rq::CfsRq;
use enclave_cfs::task::TaskState;
use enclave_core::{CpuId, TaskId, TimeNs};

const MIN_GRAN: TimeNs = 1_000_000;
const LATENCY: TimeNs = 6_000_000;

#[derive(Debug, Clone)]
enum Op {
    /// New task arrives with some prior vruntime.
    Spawn(u16),
    /// Wake one of the blocked tasks owned by this CPU.
    WakeOne(u8),
    /// The current task accrues vruntime (a commit returned).
    RunFor(u16),
    /// Message outcomes for the current task.
    BlockCurrent,
    YieldCurrent,
    RequestPreempt,
    DepartCurrent,
    /// A queued (non-current) task departs.
    DepartQueued(u8),
    Pick,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u16..10_000).prop_map(Op::Spawn),
        (0u8..8).prop_map(Op::WakeOne),
        (1u16..5_000).prop_map(Op::RunFor),
        Just(Op::BlockCurrent),
        Just(Op::YieldCurrent),
        Just(Op::RequestPreempt),
        Just(Op::DepartCurrent),
        (0u8..8).prop_map(Op::DepartQueued),
        Just(Op::Pick),
    ]
}

fn records(rq: &CfsRq) -> Vec<(TaskId, TaskState, TimeNs)> {
    let mut out = Vec::new();
    rq.for_each_record(|t| out.push((t.id, t.state.get(), t.vruntime)));
    out
}

/// Invariants that must hold at every observation point.
fn check_invariants(rq: &CfsRq, last_min: &mut TimeNs, last_vr: &mut HashMap<TaskId, TimeNs>) {
    assert!(
        rq.min_vruntime() >= *last_min,
        "min_vruntime went backwards: {} -> {}",
        last_min,
        rq.min_vruntime()
    );
    *last_min = rq.min_vruntime();

    for (id, state, vruntime) in records(rq) {
        let prev = last_vr.entry(id).or_insert(vruntime);
        assert!(vruntime >= *prev, "{id}: vruntime went backwards");
        *prev = vruntime;

        let in_tree = rq.in_tree(id);
        let should_be = state == TaskState::Runnable && rq.current() != Some(id);
        assert_eq!(
            in_tree, should_be,
            "{id}: state {state:?} current={:?} in_tree={in_tree}",
            rq.current()
        );
    }
}

fn spawn(rq: &mut CfsRq, pool: &TaskPool, id: TaskId, vruntime: TimeNs) -> TimeNs {
    assert!(pool.allocate(id, 1));
    let mut task = pool.take_for_migration(id, CpuId(0)).unwrap();
    task.cpu = 0;
    task.vruntime = vruntime;
    let min_before = rq.min_vruntime();
    rq.insert_record(task);
    rq.enqueue(id);
    min_before
}

proptest! {
    #[test]
    fn rq_invariants_hold(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let pool = TaskPool::new();
        let mut rq = CfsRq::new(CpuId(0), MIN_GRAN, LATENCY);
        let mut next_id = 1u64;
        let mut last_min: TimeNs = 0;
        let mut last_vr: HashMap<TaskId, TimeNs> = HashMap::new();

        for op in ops {
            match op {
                Op::Spawn(seed) => {
                    let id = TaskId(next_id);
                    next_id += 1;
                    let min_before = spawn(&mut rq, &pool, id, seed as TimeNs * 1_000);
                    // The clamp: never enqueued below the queue's present.
                    prop_assert!(rq.task(id).unwrap().vruntime >= min_before);
                }
                Op::WakeOne(i) => {
                    let blocked: Vec<TaskId> = records(&rq)
                        .into_iter()
                        .filter(|&(id, state, _)| {
                            state == TaskState::Blocked && rq.current() != Some(id)
                        })
                        .map(|(id, _, _)| id)
                        .collect();
                    if !blocked.is_empty() {
                        rq.enqueue(blocked[i as usize % blocked.len()]);
                    }
                }
                Op::RunFor(d) => {
                    if let Some(curr) = rq.current() {
                        if rq.task(curr).unwrap().state.get() == TaskState::Running {
                            rq.task_mut(curr).unwrap().vruntime += d as TimeNs * 1_000;
                        }
                    }
                }
                Op::BlockCurrent => {
                    if let Some(curr) = rq.current() {
                        if rq.task(curr).unwrap().state.get() == TaskState::Running {
                            rq.task_mut(curr).unwrap().state.set(curr, TaskState::Blocked);
                        }
                    }
                }
                Op::YieldCurrent => {
                    if let Some(curr) = rq.current() {
                        if rq.task(curr).unwrap().state.get() == TaskState::Running {
                            rq.task_mut(curr).unwrap().state.set(curr, TaskState::Runnable);
                        }
                    }
                }
                Op::RequestPreempt => {
                    if rq.current().is_some() {
                        rq.set_preempt_curr();
                    }
                }
                Op::DepartCurrent => {
                    if let Some(curr) = rq.current() {
                        rq.task_mut(curr).unwrap().state.set(curr, TaskState::Done);
                    }
                }
                Op::DepartQueued(i) => {
                    let queued: Vec<TaskId> = records(&rq)
                        .into_iter()
                        .filter(|&(id, _, _)| rq.in_tree(id))
                        .map(|(id, _, _)| id)
                        .collect();
                    if !queued.is_empty() {
                        let id = queued[i as usize % queued.len()];
                        rq.task_mut(id).unwrap().state.set(id, TaskState::Done);
                        rq.erase(id);
                        rq.free(id, &pool);
                        rq.update_min_vruntime();
                        last_vr.remove(&id);
                    }
                }
                Op::Pick => {
                    // Predict the outcome before picking.
                    let prev = rq.current();
                    let prev_state = prev.map(|p| rq.task(p).unwrap().state.get());
                    let fast_path =
                        prev_state == Some(TaskState::Running) && !rq.preempt_curr();

                    let mut candidates: Vec<(TimeNs, TaskId)> = records(&rq)
                        .into_iter()
                        .filter(|&(id, _, _)| rq.in_tree(id))
                        .map(|(id, _, vr)| (vr, id))
                        .collect();
                    // A runnable or preempted prev goes back on the
                    // timeline before the pick.
                    if let (Some(p), Some(state)) = (prev, prev_state) {
                        if state == TaskState::Runnable || state == TaskState::Running {
                            candidates.push((rq.task(p).unwrap().vruntime, p));
                        }
                    }
                    candidates.sort();

                    let picked = rq.pick_next(&pool, |_| 0);
                    if fast_path {
                        prop_assert_eq!(picked, prev, "fast path must keep current");
                    } else {
                        let expected = candidates.first().map(|&(_, id)| id);
                        prop_assert_eq!(picked, expected, "pick is not the minimal key");
                        if let (Some(p), Some(TaskState::Done)) = (prev, prev_state) {
                            prop_assert!(rq.task(p).is_none(), "done prev not freed");
                            last_vr.remove(&p);
                        }
                    }
                }
            }
            check_invariants(&rq, &mut last_min, &mut last_vr);
        }
    }

    /// The preemption slice honors both bounds: never below the
    /// granularity floor, and meeting the latency target whenever the
    /// floor allows it.
    #[test]
    fn slice_bounds_hold(
        nr_queued in 0usize..32,
        min_gran in 100_000u64..5_000_000,
        latency in 1_000_000u64..30_000_000,
    ) {
        let pool = TaskPool::new();
        let mut rq = CfsRq::new(CpuId(0), min_gran, latency);
        for i in 0..nr_queued {
            spawn(&mut rq, &pool, TaskId(i as u64 + 1), 0);
        }
        let n = (nr_queued + 1) as u64;
        let slice = rq.preemption_granularity();
        prop_assert!(slice >= min_gran);
        if n * min_gran <= latency {
            prop_assert!(n * slice >= latency);
        }
    }
}
