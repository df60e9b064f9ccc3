//! Job system worker: one deque plus the job pool it allocates from.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::job::{Job, JobHandle};
use super::queue::JobQueue;
use super::{JobContext, JobError, JobResult};

pub(crate) struct Worker {
    index: usize,
    queue: JobQueue,
    pool: Box<[Job]>,
    /// Ring cursor into `pool`; only the owning thread advances it.
    next_slot: AtomicUsize,
    active: AtomicBool,
}

impl Worker {
    pub(crate) fn new(index: usize, capacity: usize) -> Self {
        Self {
            index,
            queue: JobQueue::new(capacity),
            pool: (0..capacity).map(|_| Job::new()).collect(),
            next_slot: AtomicUsize::new(0),
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn job(&self, slot: usize) -> Option<&Job> {
        self.pool.get(slot)
    }

    /// Pool slot of `job` if it lives in this worker's pool.
    pub(crate) fn slot_of(&self, job: *const Job) -> Option<usize> {
        let base = self.pool.as_ptr() as usize;
        let offset = (job as usize).checked_sub(base)?;
        let slot = offset / std::mem::size_of::<Job>();
        (slot < self.pool.len()).then_some(slot)
    }

    /// Allocate the next ring slot for `task`.
    ///
    /// Must be called from the thread that owns this worker. Fails instead of
    /// overwriting a slot whose previous job has not finished.
    pub(crate) fn allocate<F>(&self, task: F, parent: Option<&Job>) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let capacity = self.pool.len();
        let cursor = self.next_slot.load(Ordering::Relaxed);
        let slot = cursor & (capacity - 1);
        let job = &self.pool[slot];
        if !job.is_idle() {
            log::error!(
                "Job pool of worker {} exhausted: slot {} still in flight (capacity {})",
                self.index,
                slot,
                capacity
            );
            return Err(JobError::PoolExhausted {
                worker: self.index,
                capacity,
            });
        }
        self.next_slot.store(cursor.wrapping_add(1), Ordering::Relaxed);

        let parent_ptr = match parent {
            Some(parent) => {
                // Counted before the child exists so the parent can never be
                // observed complete while the child is pending.
                parent.add_child();
                parent as *const Job as *mut Job
            }
            None => std::ptr::null_mut(),
        };

        // SAFETY: owner thread, and the slot was just checked to be idle.
        let generation = unsafe { job.prepare(task, parent_ptr) };
        log::trace!(
            "Worker {} allocated job slot {} (generation {})",
            self.index,
            slot,
            generation
        );
        Ok(JobHandle {
            worker: self.index as u32,
            slot: slot as u32,
            generation,
        })
    }

    /// Number of slots that currently hold an unfinished job.
    pub(crate) fn jobs_in_flight(&self) -> usize {
        self.pool.iter().filter(|job| !job.is_idle()).count()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut leaked = 0;
        for job in self.pool.iter() {
            if job.has_task() {
                leaked += 1;
            }
            // SAFETY: `&mut self` means no other thread can reach the pool.
            unsafe { job.drop_pending() };
        }
        if leaked > 0 {
            log::warn!(
                "Worker {} dropped {} jobs that were never executed",
                self.index,
                leaked
            );
        }
    }
}
