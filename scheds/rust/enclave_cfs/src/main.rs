// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! enclave_cfs: a fair user-space scheduler driven by an in-process
//! enclave.
//!
//! The `run` subcommand builds a scripted workload, delegates the chosen
//! CPUs to an in-process enclave, and schedules the workload with one
//! pinned agent thread per CPU. The `loadgen` subcommand runs the
//! dispatcher/worker load experiment on the host scheduler.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use enclave_core::{CpuId, Enclave, Phase, Scenario, TaskBehavior, TaskId};

use enclave_cfs::loadgen::{self, LoadgenConfig};
use enclave_cfs::CfsScheduler;

/// enclave_cfs: fair, weight-free scheduling in user space.
///
/// Tasks accumulate virtual runtime while on-CPU; each CPU runs the task
/// with the least vruntime in its queue, and a periodic tick bounds
/// on-CPU residency as a function of queue occupancy. The kernel side is
/// an in-process enclave driving a scripted workload on a virtual clock,
/// so runs are reproducible on any machine.
#[derive(Debug, Parser)]
struct Opts {
    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Schedule a scripted workload over the in-process enclave.
    Run(RunOpts),
    /// Run the dispatcher/worker load experiment on the host scheduler.
    Loadgen(LoadgenOpts),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Workload {
    /// CPU-bound spinners, two per CPU.
    Batch,
    /// Half spinners, half interactive sleep/run tasks.
    Mixed,
    /// Short runs with frequent yields.
    YieldHeavy,
    /// Server-like request workers waking on a staggered cadence.
    Server,
}

#[derive(Debug, clap::Args)]
struct RunOpts {
    /// CPUs to delegate, as a cpulist (e.g. "0-3" or "0,2,4").
    #[clap(short = 'c', long, default_value = "0-1")]
    cpus: String,

    /// Minimum on-CPU slice before a task may be preempted, in
    /// microseconds.
    #[clap(long, default_value = "1000")]
    min_granularity_us: u64,

    /// Target period within which every runnable task should run once,
    /// in microseconds.
    #[clap(long, default_value = "6000")]
    latency_us: u64,

    /// Tick period in microseconds.
    #[clap(long, default_value = "1000")]
    tick_us: u64,

    /// Virtual run duration in milliseconds.
    #[clap(short = 'd', long, default_value = "500")]
    duration_ms: u64,

    /// Workload preset to schedule.
    #[clap(short = 'w', long, value_enum, default_value = "batch")]
    workload: Workload,

    /// Do not pin agent threads to their CPUs.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_pin: bool,

    /// Dump the full scheduling trace at exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_trace: bool,
}

#[derive(Debug, clap::Args)]
struct LoadgenOpts {
    /// Number of worker threads.
    #[clap(short = 'w', long, default_value = "4")]
    workers: usize,

    /// Total number of requests to serve.
    #[clap(short = 'n', long, default_value = "20000")]
    requests: usize,

    /// Maximum requests handed to a worker at once.
    #[clap(short = 'b', long, default_value = "8")]
    batch: usize,

    /// Per-request service time in microseconds.
    #[clap(short = 's', long, default_value = "50")]
    service_us: u64,
}

/// Parse a cpulist like "0-3,5" into CPU ids.
fn parse_cpulist(cpulist: &str) -> Result<Vec<CpuId>> {
    let mut cpus = Vec::new();
    for part in cpulist.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().context("bad cpulist range start")?;
                let hi: u32 = hi.trim().parse().context("bad cpulist range end")?;
                if hi < lo {
                    bail!("cpulist range {part} is backwards");
                }
                cpus.extend((lo..=hi).map(CpuId));
            }
            None => cpus.push(CpuId(part.parse().context("bad cpulist entry")?)),
        }
    }
    if cpus.is_empty() {
        bail!("cpulist {cpulist:?} names no CPUs");
    }
    Ok(cpus)
}

/// Best-effort pinning of the calling thread to one CPU.
fn pin_to_cpu(cpu: CpuId) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu.0 as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            bail!("sched_setaffinity: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn build_scenario(opts: &RunOpts, nr_cpus: usize) -> Scenario {
    let mut builder = Scenario::builder().duration_ms(opts.duration_ms);
    match opts.workload {
        Workload::Batch => {
            for i in 0..nr_cpus * 2 {
                builder = builder.add_task(&format!("spin-{i}"), TaskBehavior::spin(5_000_000));
            }
        }
        Workload::Mixed => {
            for i in 0..nr_cpus {
                builder = builder.add_task(&format!("spin-{i}"), TaskBehavior::spin(5_000_000));
            }
            for i in 0..nr_cpus {
                builder = builder.add_task(
                    &format!("inter-{i}"),
                    TaskBehavior::interactive(1_000_000, 2_000_000),
                );
            }
        }
        Workload::YieldHeavy => {
            for i in 0..nr_cpus * 2 {
                builder = builder.add_task(
                    &format!("yield-{i}"),
                    TaskBehavior {
                        phases: vec![Phase::Run(500_000), Phase::Yield],
                        repeat: true,
                    },
                );
            }
        }
        Workload::Server => {
            // Staggered request workers: sleep, then serve a burst.
            for i in 0..nr_cpus * 4 {
                let offset = (i as u64 % 4) * 500_000;
                builder = builder.task(enclave_core::TaskDef {
                    name: format!("worker-{i}"),
                    id: TaskId(i as u64 + 1),
                    behavior: TaskBehavior {
                        phases: vec![Phase::Sleep(1_000_000 + offset), Phase::Run(750_000)],
                        repeat: true,
                    },
                    start_time_ns: 0,
                });
            }
        }
    }
    builder.build()
}

fn cmd_run(opts: &RunOpts, verbose: u8) -> Result<()> {
    let cpus = parse_cpulist(&opts.cpus)?;
    let scenario = build_scenario(opts, cpus.len());
    let task_ids: Vec<TaskId> = scenario.tasks.iter().map(|t| t.id).collect();
    let task_names: Vec<String> = scenario.tasks.iter().map(|t| t.name.clone()).collect();

    info!(
        "run: {} cpus, {} tasks, {:?} for {} ms (virtual)",
        cpus.len(),
        task_ids.len(),
        opts.workload,
        opts.duration_ms
    );

    let enclave = Enclave::new(cpus.clone(), scenario, opts.tick_us * 1_000)?;
    let sched = Arc::new(CfsScheduler::new(
        enclave.clone(),
        opts.min_granularity_us * 1_000,
        opts.latency_us * 1_000,
    ));

    let mut agents = Vec::with_capacity(cpus.len());
    for &cpu in enclave.cpus() {
        let sched = sched.clone();
        let pin = !opts.no_pin;
        agents.push(
            thread::Builder::new()
                .name(format!("agent-{}", cpu.0))
                .spawn(move || -> Result<()> {
                    if pin {
                        if let Err(err) = pin_to_cpu(cpu) {
                            warn!("{cpu}: not pinned: {err}");
                        }
                    }
                    sched.agent_loop(cpu)
                })?,
        );
    }

    for agent in agents {
        agent.join().map_err(|_| anyhow!("agent thread panicked"))??;
    }
    if verbose > 1 {
        for &cpu in enclave.cpus() {
            sched.dump_state(cpu);
        }
    }
    sched.validate_pre_exit();

    let trace = enclave.shutdown();
    sched.metrics().log_summary();
    for (id, name) in task_ids.iter().zip(task_names.iter()) {
        info!(
            "{name}: ran {:.3} ms over {} placements",
            trace.total_runtime(*id) as f64 / 1_000_000.0,
            trace.schedule_count(*id)
        );
    }
    if opts.dump_trace {
        trace.dump();
    }
    Ok(())
}

fn cmd_loadgen(opts: &LoadgenOpts) -> Result<()> {
    let report = loadgen::run(&LoadgenConfig {
        num_workers: opts.workers,
        total_requests: opts.requests,
        batch: opts.batch,
        service_time: Duration::from_micros(opts.service_us),
    })?;
    report.log_summary();
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let loglevel = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    match &opts.command {
        Command::Run(run_opts) => cmd_run(run_opts, opts.verbose),
        Command::Loadgen(loadgen_opts) => cmd_loadgen(loadgen_opts),
    }
}
