//! Wire types and the RPC surface shared by the coordinator and the worker.
//!
//! Three methods, all synchronous request/reply over a `tarpc` channel:
//! `register`, `get_task`, `task_done`. See `coordinator.rs` for the
//! implementation and `error.rs` for the failure modes of `task_done`.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::mr::error::TaskError;

/// Identity of a registered worker process, assigned by the coordinator.
pub type WorkerId = u64;

/// Index of a task within the current phase's task table.
pub type TaskId = u64;

/// The kind of work a task performs. `Wait` and `Shutdown` are directives
/// returned by `get_task` only; `task_done` only ever reports `Map` or
/// `Reduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Wait,
    Map,
    Reduce,
    Shutdown,
}

/// Reply to `get_task`. Exactly one directive, matching spec.md §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GetTaskReply {
    Map {
        task_id: TaskId,
        filename: String,
        buckets: u32,
        lease_expiry: SystemTime,
    },
    Reduce {
        task_id: TaskId,
        lease_expiry: SystemTime,
    },
    Wait,
    Shutdown,
}

impl GetTaskReply {
    pub fn op(&self) -> Op {
        match self {
            GetTaskReply::Map { .. } => Op::Map,
            GetTaskReply::Reduce { .. } => Op::Reduce,
            GetTaskReply::Wait => Op::Wait,
            GetTaskReply::Shutdown => Op::Shutdown,
        }
    }
}

/// A key/value pair as produced by a map invocation and consumed by a reduce
/// invocation. Serialized as a JSON array into each intermediate file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// RPC surface exposed by the coordinator. Register never fails; get_task
/// always returns a directive; task_done can be rejected per `TaskError`.
#[tarpc::service]
pub trait Master {
    async fn register() -> WorkerId;
    async fn get_task(worker_id: WorkerId) -> GetTaskReply;
    async fn task_done(worker_id: WorkerId, task_id: TaskId, op: Op) -> Result<(), TaskError>;
}

/// Per-user rendezvous name for the coordinator's Unix-domain socket,
/// placed in the process's current directory (spec.md §6). Multiple
/// concurrent jobs by the same user are unsupported — exactly one name per
/// uid.
pub fn socket_path() -> String {
    let uid = unsafe { libc::getuid() };
    format!("824-mr-{uid}")
}
