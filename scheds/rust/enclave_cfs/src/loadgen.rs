// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dispatcher/worker load experiment.
//!
//! One dispatcher thread hands batches of synthetic requests to a pool of
//! worker threads through per-worker shared records, then reports request
//! latency percentiles. The handshake is the part that matters:
//!
//! - `num_requests` is written by the dispatcher with release ordering,
//!   and only when the worker last published 0; workers read it with
//!   acquire ordering. The `requests` buffer is only written while
//!   `num_requests == 0`.
//! - The dispatcher never marks a worker runnable unless it observed it
//!   idle.
//! - A worker marks itself idle *before* publishing `num_requests = 0`,
//!   so `wait_until_runnable` observes the dispatcher's wakeup edge and
//!   cannot sleep through a batch assigned in the window between the two
//!   stores.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam::channel;
use log::{debug, info};

/// One synthetic request; timestamps capture queueing and service time.
#[derive(Debug, Clone, Copy)]
struct Request {
    assigned: Instant,
}

/// Per-worker wait primitive: runnable/idle flags with a wakeup edge.
struct WaitCell {
    runnable: Mutex<bool>,
    cv: Condvar,
}

/// Per-thread wait state for the worker pool.
pub struct ThreadWait {
    cells: Vec<WaitCell>,
}

impl ThreadWait {
    pub fn new(num_threads: usize) -> Self {
        ThreadWait {
            cells: (0..num_threads)
                .map(|_| WaitCell {
                    runnable: Mutex::new(false),
                    cv: Condvar::new(),
                })
                .collect(),
        }
    }

    pub fn mark_runnable(&self, sid: usize) {
        let mut runnable = self.cells[sid].runnable.lock().unwrap();
        *runnable = true;
        self.cells[sid].cv.notify_one();
    }

    pub fn mark_idle(&self, sid: usize) {
        let mut runnable = self.cells[sid].runnable.lock().unwrap();
        *runnable = false;
    }

    pub fn wait_until_runnable(&self, sid: usize) {
        let mut runnable = self.cells[sid].runnable.lock().unwrap();
        while !*runnable {
            runnable = self.cells[sid].cv.wait(runnable).unwrap();
        }
    }
}

/// The shared record the dispatcher and one worker exchange work through.
struct WorkerWork {
    /// Number of requests in `requests`. Dispatcher stores with release
    /// (only after observing 0); worker loads with acquire and publishes
    /// 0 with release when done.
    num_requests: AtomicUsize,
    /// Written by the dispatcher only while `num_requests == 0`.
    requests: Mutex<Vec<Request>>,
}

/// Load experiment parameters.
#[derive(Debug, Clone)]
pub struct LoadgenConfig {
    pub num_workers: usize,
    pub total_requests: usize,
    pub batch: usize,
    pub service_time: Duration,
}

/// What the experiment measured.
#[derive(Debug)]
pub struct LoadgenReport {
    pub processed: usize,
    pub elapsed: Duration,
    latencies_us: Vec<u64>,
}

impl LoadgenReport {
    pub fn percentile(&self, p: f64) -> u64 {
        percentile(&self.latencies_us, p)
    }

    pub fn log_summary(&self) {
        let throughput = self.processed as f64 / self.elapsed.as_secs_f64();
        info!(
            "processed {} requests in {:.2?} ({:.0} req/s)",
            self.processed, self.elapsed, throughput
        );
        info!(
            "latency us: p50={} p95={} p99={} max={}",
            self.percentile(50.0),
            self.percentile(95.0),
            self.percentile(99.0),
            self.latencies_us.last().copied().unwrap_or(0)
        );
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Spin for the request's service time. Burning CPU rather than sleeping
/// keeps the workers runnable the whole time, like the database workload
/// this models.
fn serve(service_time: Duration) {
    let start = Instant::now();
    while start.elapsed() < service_time {
        std::hint::spin_loop();
    }
}

fn worker_loop(
    sid: usize,
    work: Arc<WorkerWork>,
    wait: Arc<ThreadWait>,
    exit: Arc<AtomicBool>,
    service_time: Duration,
) -> Vec<u64> {
    let mut latencies_us = Vec::new();
    debug!("worker {sid} up");
    wait.wait_until_runnable(sid);

    loop {
        let num_requests = work.num_requests.load(Ordering::Acquire);
        if num_requests > 0 {
            let batch: Vec<Request> = work.requests.lock().unwrap().drain(..).collect();
            debug_assert_eq!(batch.len(), num_requests);
            for request in batch {
                // Latency spans assignment to completion: the wait to be
                // scheduled plus the service time.
                serve(service_time);
                latencies_us.push(request.assigned.elapsed().as_micros() as u64);
            }

            // Idle first, then publish 0 with release. Doing it the other
            // way around lets the dispatcher assign a batch and mark us
            // runnable in the gap, after which our own mark_idle would
            // swallow the wakeup and strand the batch.
            wait.mark_idle(sid);
            work.num_requests.store(0, Ordering::Release);
        } else if exit.load(Ordering::Acquire) {
            break;
        } else {
            // Woken with nothing to do; go idle again, but re-check for a
            // batch that landed in the meantime so marking idle cannot
            // swallow its wakeup.
            wait.mark_idle(sid);
            if work.num_requests.load(Ordering::Acquire) != 0 {
                continue;
            }
        }
        wait.wait_until_runnable(sid);
    }

    debug!("worker {sid} done ({} requests)", latencies_us.len());
    latencies_us
}

/// Run the experiment: spawn the workers, feed them every request, wait
/// for the pool to drain, and collect latencies.
pub fn run(config: &LoadgenConfig) -> Result<LoadgenReport> {
    if config.num_workers == 0 || config.batch == 0 {
        return Err(anyhow!("loadgen needs at least one worker and batch >= 1"));
    }
    info!(
        "loadgen: {} workers, {} requests, batch {}, service {:?}",
        config.num_workers, config.total_requests, config.batch, config.service_time
    );

    let wait = Arc::new(ThreadWait::new(config.num_workers));
    let exit = Arc::new(AtomicBool::new(false));
    let works: Vec<Arc<WorkerWork>> = (0..config.num_workers)
        .map(|_| {
            Arc::new(WorkerWork {
                num_requests: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        })
        .collect();

    // Ingress queue: all requests exist up front; the dispatcher drains
    // it into worker batches as workers go idle.
    let (tx, rx) = channel::unbounded::<()>();
    for _ in 0..config.total_requests {
        tx.send(()).expect("ingress queue");
    }
    drop(tx);

    let started = Instant::now();
    let service_time = config.service_time;
    let mut handles = Vec::with_capacity(config.num_workers);
    for sid in 0..config.num_workers {
        let work = works[sid].clone();
        let wait = wait.clone();
        let exit = exit.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("loadgen-worker-{sid}"))
                .spawn(move || worker_loop(sid, work, wait, exit, service_time))?,
        );
    }

    // Dispatcher: batch requests onto idle workers until the ingress
    // queue is drained and every worker has gone idle again.
    let mut remaining = config.total_requests;
    loop {
        let mut all_idle = true;
        for sid in 0..config.num_workers {
            // Acquire pairs with the worker's release store of 0; only an
            // idle worker may be handed a batch.
            if works[sid].num_requests.load(Ordering::Acquire) != 0 {
                all_idle = false;
                continue;
            }
            if remaining == 0 {
                continue;
            }

            let mut batch = Vec::with_capacity(config.batch);
            while batch.len() < config.batch {
                match rx.try_recv() {
                    Ok(()) => batch.push(Request {
                        assigned: Instant::now(),
                    }),
                    Err(_) => break,
                }
            }
            if batch.is_empty() {
                continue;
            }

            remaining -= batch.len();
            let len = batch.len();
            *works[sid].requests.lock().unwrap() = batch;
            works[sid].num_requests.store(len, Ordering::Release);
            wait.mark_runnable(sid);
            all_idle = false;
        }

        if remaining == 0 && all_idle {
            break;
        }
        thread::yield_now();
    }

    // Shut the pool down: exit flag first, then wake everyone so they
    // observe it.
    exit.store(true, Ordering::Release);
    for sid in 0..config.num_workers {
        wait.mark_runnable(sid);
    }

    let mut latencies_us = Vec::with_capacity(config.total_requests);
    for handle in handles {
        let worker_lat = handle
            .join()
            .map_err(|_| anyhow!("loadgen worker panicked"))?;
        latencies_us.extend(worker_lat);
    }
    latencies_us.sort_unstable();

    Ok(LoadgenReport {
        processed: latencies_us.len(),
        elapsed: started.elapsed(),
        latencies_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_requests_processed_exactly_once() {
        let config = LoadgenConfig {
            num_workers: 3,
            total_requests: 200,
            batch: 7,
            service_time: Duration::from_micros(5),
        };
        let report = run(&config).unwrap();
        assert_eq!(report.processed, 200);
    }

    #[test]
    fn test_single_worker_drains_queue() {
        let config = LoadgenConfig {
            num_workers: 1,
            total_requests: 50,
            batch: 50,
            service_time: Duration::from_micros(1),
        };
        let report = run(&config).unwrap();
        assert_eq!(report.processed, 50);
        assert!(report.percentile(50.0) <= report.percentile(99.0));
    }

    #[test]
    fn test_percentile_bounds() {
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[10], 99.0), 10);
        let v: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&v, 0.0), 1);
        assert_eq!(percentile(&v, 100.0), 100);
    }
}
