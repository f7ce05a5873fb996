// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::HashMap;

use enclave_core::{CpuId, Scenario, TaskBehavior, TaskId, TraceKind};

mod common;
use common::{run_scenario, MS};

/// Round-robin placement: four spinners over two CPUs land two per CPU,
/// in arrival order, and never move afterwards.
#[test]
fn test_round_robin_placement() {
    let mut builder = Scenario::builder();
    for i in 0..4 {
        builder = builder.add_task(&format!("spin-{i}"), TaskBehavior::spin(100 * MS));
    }
    let scenario = builder.duration_ms(20).build();
    let result = run_scenario(&[0, 1], scenario, MS, 4 * MS, MS);

    // Task i goes to CPU i % 2.
    let mut placements: HashMap<TaskId, CpuId> = HashMap::new();
    for e in result.trace.events() {
        if let TraceKind::TaskScheduled { id } = e.kind {
            if let Some(&prev) = placements.get(&id) {
                assert_eq!(prev, e.cpu, "{id} moved between CPUs");
            } else {
                placements.insert(id, e.cpu);
            }
        }
    }
    assert_eq!(placements[&TaskId(1)], CpuId(0));
    assert_eq!(placements[&TaskId(2)], CpuId(1));
    assert_eq!(placements[&TaskId(3)], CpuId(0));
    assert_eq!(placements[&TaskId(4)], CpuId(1));

    // Both CPUs were fully busy, and the pairs split their CPU evenly.
    // Preemption lags the 2 ms slice by up to one tick, so the effective
    // rotation is 3 ms and the split can be off by one rotation.
    let rts: Vec<u64> = (1..=4)
        .map(|i| result.trace.total_runtime(TaskId(i)))
        .collect();
    assert_eq!(rts.iter().sum::<u64>(), 2 * 20 * MS);
    assert!(rts[0].abs_diff(rts[2]) <= 3 * MS, "cpu0 pair uneven: {rts:?}");
    assert!(rts[1].abs_diff(rts[3]) <= 3 * MS, "cpu1 pair uneven: {rts:?}");
}

/// Each CPU preempts on its own tick cadence; queues on one CPU do not
/// leak work onto the other (no load balancing by design).
#[test]
fn test_no_cross_cpu_migration_under_imbalance() {
    let scenario = Scenario::builder()
        .add_task("a", TaskBehavior::spin(100 * MS))
        .add_task("b", TaskBehavior::spin(100 * MS))
        .add_task("c", TaskBehavior::spin(100 * MS))
        .duration_ms(20)
        .build();
    let result = run_scenario(&[0, 1], scenario, MS, 4 * MS, MS);

    // RR puts a and c on CPU 0, b alone on CPU 1.
    let rt_a = result.trace.total_runtime(TaskId(1));
    let rt_b = result.trace.total_runtime(TaskId(2));
    let rt_c = result.trace.total_runtime(TaskId(3));

    assert_eq!(rt_b, 20 * MS, "the lone task owns its CPU");
    assert_eq!(rt_a + rt_c, 20 * MS, "the pair shares theirs");
    // One migration per task, all at ingestion.
    assert_eq!(result.metrics.nr_migrations, 3);
}
