//! Per-worker work-stealing deque.
//!
//! A fixed-capacity Chase-Lev deque over job pointers. The owning worker
//! pushes and pops at `bottom`; any other worker steals at `top` and races
//! through a compare-and-swap. `top <= bottom` always holds between
//! operations and the deque is empty when `top >= bottom`.

use std::ptr;
use std::sync::atomic::{fence, AtomicIsize, AtomicPtr, Ordering};

use super::job::Job;

pub(crate) struct JobQueue {
    buffer: Box<[AtomicPtr<Job>]>,
    mask: isize,
    bottom: AtomicIsize,
    top: AtomicIsize,
}

impl JobQueue {
    /// `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        Self {
            buffer: (0..capacity)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            mask: capacity as isize - 1,
            bottom: AtomicIsize::new(0),
            top: AtomicIsize::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buffer.len()
    }

    fn slot(&self, index: isize) -> &AtomicPtr<Job> {
        &self.buffer[(index & self.mask) as usize]
    }

    /// Owner only. Hands the job back when the deque is full.
    pub(crate) fn push(&self, job: *mut Job) -> Result<(), *mut Job> {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        if bottom - top >= self.buffer.len() as isize {
            return Err(job);
        }
        self.slot(bottom).store(job, Ordering::Relaxed);
        // Publishes the slot (and the job it points to) to thieves.
        self.bottom.store(bottom + 1, Ordering::Release);
        Ok(())
    }

    /// Owner only. Takes the most recently pushed job.
    pub(crate) fn pop(&self) -> Option<*mut Job> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        self.bottom.store(bottom, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        if top > bottom {
            // Already empty.
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        let job = self.slot(bottom).load(Ordering::Relaxed);
        if top != bottom {
            return Some(job);
        }

        // Last job: race any thief for it.
        let won = self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(bottom + 1, Ordering::Relaxed);
        won.then_some(job)
    }

    /// Any thread. Takes the oldest job.
    pub(crate) fn steal(&self) -> Option<*mut Job> {
        let top = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);
        if top >= bottom {
            return None;
        }

        let job = self.slot(top).load(Ordering::Relaxed);
        self.top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| job)
    }

    /// Snapshot of the number of queued jobs; exact only on the owner thread
    /// with no concurrent thieves.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        (bottom - top).max(0) as usize
    }
}
