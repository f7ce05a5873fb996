//! Newtype wrappers and type aliases for scheduling domain concepts.
//!
//! Newtypes for identifiers (task ids, CPU ids) prevent silent type
//! confusion. Type aliases for quantities (timestamps, barrier tokens)
//! keep signatures readable without arithmetic-trait boilerplate.

use std::fmt;

/// Global task identifier assigned by the enclave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

/// Virtual time in nanoseconds.
pub type TimeNs = u64;

/// Monotonic barrier token: a per-task message seqnum or a per-CPU agent
/// barrier. Commits and channel associations that reference a stale token
/// fail cleanly.
pub type BarrierToken = u64;

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}
