// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared harness: build an enclave for a scenario, run one agent thread
//! per CPU to completion, and hand the trace and metrics back for
//! assertions.

use std::sync::Arc;
use std::thread;

use enclave_cfs::{CfsScheduler, Metrics};
use enclave_core::{CpuId, Enclave, Scenario, TimeNs, Trace};

pub struct RunResult {
    pub trace: Trace,
    pub metrics: Metrics,
}

#[allow(dead_code)]
pub fn setup_test() {
    let _ = simplelog::TermLogger::init(
        simplelog::LevelFilter::Warn,
        simplelog::Config::default(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    );
}

/// Run a scenario to completion and validate the post-conditions every
/// run must satisfy: agents exit cleanly, queues drain, no task leaks.
#[allow(dead_code)]
pub fn run_scenario(
    cpus: &[u32],
    scenario: Scenario,
    min_granularity: TimeNs,
    latency: TimeNs,
    tick_ns: TimeNs,
) -> RunResult {
    setup_test();

    let cpu_ids: Vec<CpuId> = cpus.iter().map(|&c| CpuId(c)).collect();
    let enclave = Enclave::new(cpu_ids, scenario, tick_ns).expect("enclave setup");
    let sched = Arc::new(CfsScheduler::new(enclave.clone(), min_granularity, latency));

    let mut agents = Vec::new();
    for &cpu in enclave.cpus() {
        let sched = sched.clone();
        agents.push(
            thread::Builder::new()
                .name(format!("agent-{}", cpu.0))
                .spawn(move || sched.agent_loop(cpu))
                .expect("spawn agent"),
        );
    }
    for agent in agents {
        agent
            .join()
            .expect("agent thread panicked")
            .expect("agent loop failed");
    }

    sched.validate_pre_exit();
    assert_eq!(sched.nr_live_tasks(), 0, "tasks leaked past the drain");
    for &cpu in enclave.cpus() {
        assert_eq!(sched.current_task(cpu), None);
        assert_eq!(sched.queued_len(cpu), 0);
    }

    let trace = enclave.shutdown();
    RunResult {
        trace,
        metrics: sched.metrics(),
    }
}

pub const MS: TimeNs = 1_000_000;
