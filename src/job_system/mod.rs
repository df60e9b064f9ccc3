//! Work-stealing job system
//!
//! Each worker owns a fixed pool of [`JobHandle`]-addressed job records and a
//! Chase-Lev deque. Jobs are pushed onto the calling worker's deque, popped
//! LIFO by their owner and stolen FIFO by idle workers. Parent/child
//! dependencies are tracked with an atomic counter per job, and
//! [`JobSystem::wait_for_job`] keeps the waiting thread busy with other jobs
//! until the awaited one completes.
//!
//! The thread that constructs the [`JobSystem`] is registered as its last
//! worker; every other worker runs on a background thread.

mod job;
mod queue;
mod system;
mod worker;

use std::sync::{Arc, OnceLock};

use thiserror::Error;

pub use job::{JobHandle, JOB_PAYLOAD_ALIGN, JOB_PAYLOAD_SIZE};
pub use system::{JobContext, JobSystem, Scheduler};

/// Job system error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job system used from a thread that is not a registered worker")]
    UnregisteredThread,
    #[error("Job pool of worker {worker} exhausted (capacity {capacity})")]
    PoolExhausted { worker: usize, capacity: usize },
    #[error("Job queue of worker {worker} is full")]
    QueueFull { worker: usize },
    #[error("Job system is shutting down")]
    ShuttingDown,
    #[error("Job handle {0:?} does not refer to a pending job")]
    StaleHandle(JobHandle),
    #[error("Invalid job system configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawn(String),
}

pub type JobResult<T> = Result<T, JobError>;

static GLOBAL_JOB_SYSTEM: OnceLock<Arc<JobSystem>> = OnceLock::new();

impl JobSystem {
    /// Install the process-wide job system. Only meant for application wiring;
    /// library code takes a `&JobSystem` or `&Scheduler` instead.
    ///
    /// Returns the system back if one is already installed.
    pub fn install_global(system: Arc<JobSystem>) -> Result<(), Arc<JobSystem>> {
        GLOBAL_JOB_SYSTEM.set(system)
    }

    pub fn global() -> Option<&'static Arc<JobSystem>> {
        GLOBAL_JOB_SYSTEM.get()
    }
}
