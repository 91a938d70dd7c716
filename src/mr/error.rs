//! Typed failures for `Master::task_done`. `GetTask` and `Register` never
//! fail by design (spec.md §4.1); only a completion report can be rejected.

use serde::{Deserialize, Serialize};

use crate::mr::rpc::{Op, TaskId, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TaskError {
    /// `task_done` was called with an op other than Map/Reduce.
    #[error("{0:?} is not a valid completion op")]
    InvalidOp(Op),

    /// `task_id` does not index a task in the current phase's table.
    #[error("task {0} does not exist in the current phase")]
    UnknownTask(TaskId),

    /// The caller does not hold the current lease for this task.
    #[error("worker {worker} does not hold the lease for task {task}")]
    NotLeaseholder { worker: WorkerId, task: TaskId },

    /// The lease for this task expired before the report arrived; the
    /// reaper, not this call, now owns the slot.
    #[error("lease for task {0} has expired")]
    LeaseExpired(TaskId),
}
