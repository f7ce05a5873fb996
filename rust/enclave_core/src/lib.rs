//! enclave_core - In-process enclave substrate for user-space schedulers.
//!
//! An "enclave" is a kernel facility that delegates scheduling authority
//! over a set of CPUs and tasks to user-space agents: the kernel streams
//! task lifecycle messages over per-CPU channels and the agents answer
//! with run transactions naming the task to place on each CPU.
//!
//! This crate reproduces that contract entirely in-process so scheduling
//! policies can be developed, exercised and regression-tested without a
//! patched kernel. Kernel-side behavior is generated from scripted task
//! scenarios by a deterministic event engine on a virtual clock, while the
//! agents stay real OS threads talking to the same API they would use
//! against the kernel:
//!
//! - [`Channel`]: peek/consume message delivery, barrier-validated task
//!   association.
//! - [`RunRequest`]: open/commit run transactions; commits against a stale
//!   barrier fail cleanly.
//! - [`Enclave::local_yield`] / [`Enclave::ping`] / [`Enclave::status_word`]:
//!   the agent-side suspension and wakeup primitives.
//! - [`Trace`]: per-run record of every scheduling action for assertions.
//!
//! # Example
//!
//! ```no_run
//! use enclave_core::{CpuId, Enclave, Scenario, TaskBehavior, DEFAULT_TICK_NS};
//!
//! let scenario = Scenario::builder()
//!     .add_task("worker", TaskBehavior::spin(10_000_000))
//!     .duration_ms(100)
//!     .build();
//! let enclave = Enclave::new(vec![CpuId(0)], scenario, DEFAULT_TICK_NS).unwrap();
//! // ... spawn one agent thread per CPU driving the scheduling loop ...
//! let trace = enclave.shutdown();
//! trace.dump();
//! ```

pub mod channel;
pub mod enclave;
pub mod message;
pub mod scenario;
pub mod trace;
pub mod types;

pub use channel::{AssocResult, Channel};
pub use enclave::{
    AgentStatus, CommitState, Enclave, RunArgs, RunRequest, ALLOW_TASK_ONCPU,
    COMMIT_AT_TXN_COMMIT, DEFAULT_TICK_NS, RTLA_ON_IDLE,
};
pub use message::Message;
pub use scenario::{BoostDef, Phase, Scenario, ScenarioBuilder, TaskBehavior, TaskDef};
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{BarrierToken, CpuId, TaskId, TimeNs};
