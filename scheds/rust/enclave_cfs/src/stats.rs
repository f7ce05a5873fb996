// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler counters.
//!
//! Bumped from the agent threads with relaxed atomics and folded into a
//! `Metrics` snapshot for the exit report.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

#[derive(Debug, Default)]
pub struct Stats {
    pub nr_messages: AtomicU64,
    pub nr_commits: AtomicU64,
    pub nr_commit_fails: AtomicU64,
    pub nr_local_yields: AtomicU64,
    pub nr_migrations: AtomicU64,
    pub nr_assoc_retries: AtomicU64,
    pub nr_preempt_ticks: AtomicU64,
    pub nr_switchto_pings: AtomicU64,
    pub nr_tasks_created: AtomicU64,
    pub nr_tasks_done: AtomicU64,
}

pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Stats {
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            nr_messages: self.nr_messages.load(Ordering::Relaxed),
            nr_commits: self.nr_commits.load(Ordering::Relaxed),
            nr_commit_fails: self.nr_commit_fails.load(Ordering::Relaxed),
            nr_local_yields: self.nr_local_yields.load(Ordering::Relaxed),
            nr_migrations: self.nr_migrations.load(Ordering::Relaxed),
            nr_assoc_retries: self.nr_assoc_retries.load(Ordering::Relaxed),
            nr_preempt_ticks: self.nr_preempt_ticks.load(Ordering::Relaxed),
            nr_switchto_pings: self.nr_switchto_pings.load(Ordering::Relaxed),
            nr_tasks_created: self.nr_tasks_created.load(Ordering::Relaxed),
            nr_tasks_done: self.nr_tasks_done.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub nr_messages: u64,
    pub nr_commits: u64,
    pub nr_commit_fails: u64,
    pub nr_local_yields: u64,
    pub nr_migrations: u64,
    pub nr_assoc_retries: u64,
    pub nr_preempt_ticks: u64,
    pub nr_switchto_pings: u64,
    pub nr_tasks_created: u64,
    pub nr_tasks_done: u64,
}

impl Metrics {
    pub fn log_summary(&self) {
        info!(
            "tasks created/done: {}/{}  messages: {}",
            self.nr_tasks_created, self.nr_tasks_done, self.nr_messages
        );
        info!(
            "commits: {} (failed: {})  local yields: {}",
            self.nr_commits, self.nr_commit_fails, self.nr_local_yields
        );
        info!(
            "migrations: {} (assoc retries: {})  tick preemptions: {}  switchto pings: {}",
            self.nr_migrations, self.nr_assoc_retries, self.nr_preempt_ticks,
            self.nr_switchto_pings
        );
    }
}
