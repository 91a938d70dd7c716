use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use futures::future::{ready, Ready};
use tarpc::context;

use crate::mr::{
    error::TaskError,
    rpc::{GetTaskReply, Master, Op, TaskId, WorkerId},
};

/// Lease lifetime handed out on assignment. A silent worker vacates its
/// task within at most this long.
pub const LEASE_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Map,
    Reduce,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Pending,
    Started,
    Finished,
}

#[derive(Debug, Clone)]
struct Lease {
    state: LeaseState,
    worker_id: Option<WorkerId>,
    expiry: Option<SystemTime>,
    /// Bumped every Pending->Started transition. A reaper captures this at
    /// arm time and is a no-op if the lease has since moved on — reassigned,
    /// finished, or the phase was rebuilt underneath it.
    generation: u64,
}

impl Lease {
    fn pending() -> Self {
        Self {
            state: LeaseState::Pending,
            worker_id: None,
            expiry: None,
            generation: 0,
        }
    }
}

struct Inner {
    phase: Phase,
    /// Bumped every time the task table is rebuilt (Map->Reduce). Lets
    /// reapers armed against the old table recognize it is gone.
    phase_generation: u64,
    input_files: Vec<String>,
    reduce_n: u32,
    map_leases: Vec<Lease>,
    reduce_leases: Vec<Lease>,
    next_worker_id: WorkerId,
    lease_duration: Duration,
}

impl Inner {
    /// Map->Reduce->Done, as many steps as are vacuously satisfied (an
    /// empty task table is trivially "all Finished"). Handles M=0 and R=0
    /// boundary inputs without special-casing them elsewhere.
    fn advance_if_complete(&mut self) {
        loop {
            match self.phase {
                Phase::Map => {
                    if self.map_leases.iter().all(|l| l.state == LeaseState::Finished) {
                        self.phase = Phase::Reduce;
                        self.phase_generation += 1;
                        self.reduce_leases = (0..self.reduce_n).map(|_| Lease::pending()).collect();
                        println!("[Map] all map tasks finished, entering reduce phase");
                    } else {
                        break;
                    }
                }
                Phase::Reduce => {
                    if self.reduce_leases.iter().all(|l| l.state == LeaseState::Finished) {
                        self.phase = Phase::Done;
                        self.phase_generation += 1;
                        println!("[Reduce] all reduce tasks finished, job done");
                    } else {
                        break;
                    }
                }
                Phase::Done => break,
            }
        }
    }
}

/// The master. Owns the authoritative task table and phase state behind a
/// single mutex, per spec.md §3 invariant 5 / §5 ("single global mutex").
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Mutex<Inner>>,
}

impl Coordinator {
    pub fn new(input_files: Vec<String>, reduce_n: u32) -> Self {
        Self::with_lease_duration(input_files, reduce_n, LEASE_DURATION)
    }

    pub fn with_lease_duration(
        input_files: Vec<String>,
        reduce_n: u32,
        lease_duration: Duration,
    ) -> Self {
        let map_leases = input_files.iter().map(|_| Lease::pending()).collect();
        let mut inner = Inner {
            phase: Phase::Map,
            phase_generation: 0,
            input_files,
            reduce_n,
            map_leases,
            reduce_leases: Vec::new(),
            next_worker_id: 0,
            lease_duration,
        };
        // M=0 (and, transitively, R=0) must resolve to Done before the
        // first GetTask is ever served.
        inner.advance_if_complete();
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// True once the job has reached the Done phase.
    pub fn done(&self) -> bool {
        self.inner.lock().unwrap().phase == Phase::Done
    }

    fn assign_task(&self, worker_id: WorkerId) -> GetTaskReply {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Map => {
                if let Some(idx) = inner
                    .map_leases
                    .iter()
                    .position(|l| l.state == LeaseState::Pending)
                {
                    let expiry = SystemTime::now() + inner.lease_duration;
                    let generation = inner.map_leases[idx].generation + 1;
                    inner.map_leases[idx] = Lease {
                        state: LeaseState::Started,
                        worker_id: Some(worker_id),
                        expiry: Some(expiry),
                        generation,
                    };
                    let filename = inner.input_files[idx].clone();
                    let buckets = inner.reduce_n;
                    let phase_generation = inner.phase_generation;
                    drop(inner);
                    self.arm_reaper(Phase::Map, phase_generation, idx as TaskId, generation, expiry);
                    println!(
                        "[Map] assigned map task #{} ({}) to worker #{}",
                        idx, filename, worker_id
                    );
                    GetTaskReply::Map {
                        task_id: idx as TaskId,
                        filename,
                        buckets,
                        lease_expiry: expiry,
                    }
                } else if inner
                    .map_leases
                    .iter()
                    .any(|l| l.state == LeaseState::Started)
                {
                    GetTaskReply::Wait
                } else {
                    // All Finished but the phase hasn't advanced yet under
                    // this same lock acquisition — the caller that finishes
                    // the last task always advances inline, so in practice
                    // this is unreachable; fail safe to Wait.
                    GetTaskReply::Wait
                }
            }
            Phase::Reduce => {
                if let Some(idx) = inner
                    .reduce_leases
                    .iter()
                    .position(|l| l.state == LeaseState::Pending)
                {
                    let expiry = SystemTime::now() + inner.lease_duration;
                    let generation = inner.reduce_leases[idx].generation + 1;
                    inner.reduce_leases[idx] = Lease {
                        state: LeaseState::Started,
                        worker_id: Some(worker_id),
                        expiry: Some(expiry),
                        generation,
                    };
                    let phase_generation = inner.phase_generation;
                    drop(inner);
                    self.arm_reaper(
                        Phase::Reduce,
                        phase_generation,
                        idx as TaskId,
                        generation,
                        expiry,
                    );
                    println!("[Reduce] assigned reduce task #{} to worker #{}", idx, worker_id);
                    GetTaskReply::Reduce {
                        task_id: idx as TaskId,
                        lease_expiry: expiry,
                    }
                } else if inner
                    .reduce_leases
                    .iter()
                    .any(|l| l.state == LeaseState::Started)
                {
                    GetTaskReply::Wait
                } else {
                    GetTaskReply::Wait
                }
            }
            Phase::Done => GetTaskReply::Shutdown,
        }
    }

    fn accept_completion(&self, worker_id: WorkerId, task_id: TaskId, op: Op) -> Result<(), TaskError> {
        if op != Op::Map && op != Op::Reduce {
            return Err(TaskError::InvalidOp(op));
        }
        let mut inner = self.inner.lock().unwrap();
        let phase_matches = matches!(
            (inner.phase, op),
            (Phase::Map, Op::Map) | (Phase::Reduce, Op::Reduce)
        );
        if !phase_matches {
            return Err(TaskError::UnknownTask(task_id));
        }
        let leases = match inner.phase {
            Phase::Map => &mut inner.map_leases,
            Phase::Reduce => &mut inner.reduce_leases,
            Phase::Done => unreachable!("Done phase rejected above"),
        };
        let lease = leases
            .get_mut(task_id as usize)
            .ok_or(TaskError::UnknownTask(task_id))?;

        if lease.state == LeaseState::Finished {
            // Duplicate success report for an already-committed task is
            // harmless: Finished is terminal and never reverts (spec.md §3
            // invariant 2) — but only for the worker that actually held the
            // lease. A report from anyone else is not a duplicate, it is a
            // stale or forged claim and must still be rejected.
            return if lease.worker_id == Some(worker_id) {
                Ok(())
            } else {
                Err(TaskError::NotLeaseholder {
                    worker: worker_id,
                    task: task_id,
                })
            };
        }
        if lease.state != LeaseState::Started || lease.worker_id != Some(worker_id) {
            return Err(TaskError::NotLeaseholder {
                worker: worker_id,
                task: task_id,
            });
        }
        let expiry = lease.expiry.expect("Started lease always carries an expiry");
        if SystemTime::now() > expiry {
            return Err(TaskError::LeaseExpired(task_id));
        }

        lease.state = LeaseState::Finished;
        println!("[{:?}] task #{} finished by worker #{}", op, task_id, worker_id);
        inner.advance_if_complete();
        Ok(())
    }

    /// Schedule a reaper that fires at `expiry` and, if nothing has changed
    /// underneath it, reclaims the lease back to Pending.
    fn arm_reaper(
        &self,
        phase_tag: Phase,
        phase_generation: u64,
        task_id: TaskId,
        generation: u64,
        expiry: SystemTime,
    ) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let sleep_for = expiry.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO);
            tokio::time::sleep(sleep_for).await;

            let mut guard = inner.lock().unwrap();
            if guard.phase_generation != phase_generation || guard.phase != phase_tag {
                // The phase moved on before this reaper fired; its table no
                // longer exists (or is a different one). Nothing to do.
                return;
            }
            let leases = match phase_tag {
                Phase::Map => &mut guard.map_leases,
                Phase::Reduce => &mut guard.reduce_leases,
                Phase::Done => return,
            };
            if let Some(lease) = leases.get_mut(task_id as usize) {
                if lease.state == LeaseState::Started && lease.generation == generation {
                    println!("[Lease] task #{} lease expired, reclaiming for reassignment", task_id);
                    lease.state = LeaseState::Pending;
                    lease.worker_id = None;
                    lease.expiry = None;
                }
            }
        });
    }
}

#[tarpc::server]
impl Master for Coordinator {
    type RegisterFut = Ready<WorkerId>;
    type GetTaskFut = Ready<GetTaskReply>;
    type TaskDoneFut = Ready<Result<(), TaskError>>;

    fn register(self, _: context::Context) -> Self::RegisterFut {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_worker_id;
        inner.next_worker_id += 1;
        println!("[Preparation] worker #{} registered", id);
        ready(id)
    }

    fn get_task(self, _: context::Context, worker_id: WorkerId) -> Self::GetTaskFut {
        ready(self.assign_task(worker_id))
    }

    fn task_done(
        self,
        _: context::Context,
        worker_id: WorkerId,
        task_id: TaskId,
        op: Op,
    ) -> Self::TaskDoneFut {
        ready(self.accept_completion(worker_id, task_id, op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator(m: usize, r: u32) -> Coordinator {
        let files = (0..m).map(|i| format!("input-{i}.txt")).collect();
        Coordinator::with_lease_duration(files, r, Duration::from_millis(50))
    }

    #[test]
    fn register_allocates_increasing_ids() {
        let c = coordinator(1, 1);
        assert_eq!(c.register_sync(), 0);
        assert_eq!(c.register_sync(), 1);
        assert_eq!(c.register_sync(), 2);
    }

    #[test]
    fn m_zero_reaches_done_immediately() {
        let c = coordinator(0, 4);
        assert!(c.done());
        assert!(matches!(c.assign_task(0), GetTaskReply::Shutdown));
    }

    #[test]
    fn single_map_task_lifecycle() {
        let c = coordinator(1, 1);
        assert!(!c.done());
        let reply = c.assign_task(7);
        let task_id = match reply {
            GetTaskReply::Map { task_id, filename, buckets, .. } => {
                assert_eq!(filename, "input-0.txt");
                assert_eq!(buckets, 1);
                task_id
            }
            other => panic!("expected Map, got {other:?}"),
        };
        // No more map tasks to assign; some other worker must wait.
        assert!(matches!(c.assign_task(8), GetTaskReply::Wait));
        // A non-owning worker cannot complete it.
        assert_eq!(
            c.accept_completion(8, task_id, Op::Map),
            Err(TaskError::NotLeaseholder { worker: 8, task: task_id })
        );
        // The owner can.
        assert_eq!(c.accept_completion(7, task_id, Op::Map), Ok(()));
        // Reduce phase now open.
        assert!(matches!(
            c.assign_task(7),
            GetTaskReply::Reduce { task_id: 0, .. }
        ));
    }

    #[test]
    fn task_done_rejects_invalid_op() {
        let c = coordinator(1, 1);
        let reply = c.assign_task(1);
        let task_id = match reply {
            GetTaskReply::Map { task_id, .. } => task_id,
            _ => unreachable!(),
        };
        assert_eq!(
            c.accept_completion(1, task_id, Op::Wait),
            Err(TaskError::InvalidOp(Op::Wait))
        );
    }

    #[test]
    fn task_done_rejects_unknown_task() {
        let c = coordinator(1, 1);
        assert_eq!(
            c.accept_completion(1, 99, Op::Map),
            Err(TaskError::UnknownTask(99))
        );
    }

    #[test]
    fn duplicate_completion_from_owner_is_idempotent() {
        let c = coordinator(1, 1);
        let task_id = match c.assign_task(1) {
            GetTaskReply::Map { task_id, .. } => task_id,
            _ => unreachable!(),
        };
        assert_eq!(c.accept_completion(1, task_id, Op::Map), Ok(()));
        assert_eq!(c.accept_completion(1, task_id, Op::Map), Ok(()));
    }

    #[test]
    fn completion_report_from_non_owner_against_finished_task_is_rejected() {
        let c = coordinator(1, 1);
        let task_id = match c.assign_task(1) {
            GetTaskReply::Map { task_id, .. } => task_id,
            _ => unreachable!(),
        };
        assert_eq!(c.accept_completion(1, task_id, Op::Map), Ok(()));
        // Worker 2 never held this task's lease; a late/stale/forged report
        // against the now-Finished task must not be treated as a harmless
        // duplicate.
        assert_eq!(
            c.accept_completion(2, task_id, Op::Map),
            Err(TaskError::NotLeaseholder { worker: 2, task: task_id })
        );
    }

    #[tokio::test]
    async fn expired_lease_is_reassigned_and_original_report_rejected() {
        let c = coordinator(1, 1);
        let task_id = match c.assign_task(1) {
            GetTaskReply::Map { task_id, .. } => task_id,
            _ => unreachable!(),
        };
        // Wait past the (50ms, in test config) lease duration.
        tokio::time::sleep(Duration::from_millis(150)).await;
        // Reassigned to a second worker.
        let reassigned = match c.assign_task(2) {
            GetTaskReply::Map { task_id: t, .. } => t,
            other => panic!("expected reassignment, got {other:?}"),
        };
        assert_eq!(reassigned, task_id);
        // The original worker's report is now rejected.
        assert_eq!(
            c.accept_completion(1, task_id, Op::Map),
            Err(TaskError::NotLeaseholder { worker: 1, task: task_id })
        );
        // The new worker's report succeeds.
        assert_eq!(c.accept_completion(2, task_id, Op::Map), Ok(()));
    }

    #[tokio::test]
    async fn reaper_does_not_resurrect_finished_task_across_phase_change() {
        let c = coordinator(1, 1);
        let task_id = match c.assign_task(1) {
            GetTaskReply::Map { task_id, .. } => task_id,
            _ => unreachable!(),
        };
        // Finish promptly, well within the lease window.
        assert_eq!(c.accept_completion(1, task_id, Op::Map), Ok(()));
        assert!(matches!(c.assign_task(1), GetTaskReply::Reduce { .. }));
        // Let the original map lease's reaper fire; it must be a no-op.
        tokio::time::sleep(Duration::from_millis(150)).await;
        // The reduce task assigned above must still be Started, not reset.
        assert_eq!(
            c.accept_completion(99, 0, Op::Reduce),
            Err(TaskError::NotLeaseholder { worker: 99, task: 0 })
        );
    }

    #[test]
    fn r_equals_one_routes_every_key_to_bucket_zero() {
        let c = coordinator(2, 1);
        let reply = c.assign_task(1);
        match reply {
            GetTaskReply::Map { buckets, .. } => assert_eq!(buckets, 1),
            other => panic!("expected Map, got {other:?}"),
        }
    }

    impl Coordinator {
        fn register_sync(&self) -> WorkerId {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_worker_id;
            inner.next_worker_id += 1;
            id
        }
    }
}
