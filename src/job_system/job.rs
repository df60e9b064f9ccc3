//! Fixed-size job records.
//!
//! A [`Job`] is one cache line: a type-erased task, a parent link and the
//! `unfinished_jobs` counter that drives completion. The task closure is moved
//! into an inline payload, so allocating a job never touches the heap.

use std::cell::UnsafeCell;
use std::mem::{align_of, size_of, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};

use static_assertions::const_assert_eq;

use super::JobContext;

const PAYLOAD_WORDS: usize = 5;

/// Bytes available for a job's captured state.
pub const JOB_PAYLOAD_SIZE: usize = PAYLOAD_WORDS * size_of::<u64>();

/// Alignment guaranteed for a job's captured state.
pub const JOB_PAYLOAD_ALIGN: usize = align_of::<u64>();

/// Public reference to a job living in some worker's pool.
///
/// Handles stay cheap to copy and can be sent to any thread. A handle whose
/// slot was reused by a later allocation reports its job as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobHandle {
    pub(crate) worker: u32,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl JobHandle {
    /// Index of the worker whose pool holds the job.
    pub fn worker(&self) -> usize {
        self.worker as usize
    }

    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Type-erased operations on the payload of a job.
pub(crate) struct JobVTable {
    call: unsafe fn(*mut u8, &JobContext<'_>),
    drop: unsafe fn(*mut u8),
}

trait TaskVTable {
    const VTABLE: JobVTable;
}

impl<F> TaskVTable for F
where
    F: FnOnce(&JobContext<'_>) + Send + 'static,
{
    const VTABLE: JobVTable = JobVTable {
        call: call_task::<F>,
        drop: drop_task::<F>,
    };
}

unsafe fn call_task<F: FnOnce(&JobContext<'_>)>(payload: *mut u8, ctx: &JobContext<'_>) {
    let task = ptr::read(payload.cast::<F>());
    task(ctx);
}

unsafe fn drop_task<F>(payload: *mut u8) {
    ptr::drop_in_place(payload.cast::<F>());
}

/// A schedulable unit of work.
///
/// Lifecycle of a slot: idle (`unfinished_jobs == 0`, no task) → prepared by
/// its owning worker (`unfinished_jobs == 1`, task stored) → task taken by
/// exactly one executor → finished once every child has finished too.
#[repr(C, align(64))]
pub(crate) struct Job {
    /// Non-null while a task is stored and has not been taken yet.
    vtable: AtomicPtr<JobVTable>,
    parent: AtomicPtr<Job>,
    unfinished_jobs: AtomicI32,
    generation: AtomicU32,
    payload: UnsafeCell<[MaybeUninit<u64>; PAYLOAD_WORDS]>,
}

const_assert_eq!(size_of::<Job>(), 64);
const_assert_eq!(align_of::<Job>(), 64);

// SAFETY: the payload is written only by the owning worker while the slot is
// idle, and read only by the executor that won the `vtable` swap. The deque's
// release/acquire pair orders the write before the read; the counter's
// release/acquire pair orders the read before the next reuse.
unsafe impl Send for Job {}
unsafe impl Sync for Job {}

impl Job {
    pub(crate) fn new() -> Self {
        Self {
            vtable: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
            unfinished_jobs: AtomicI32::new(0),
            generation: AtomicU32::new(0),
            payload: UnsafeCell::new([MaybeUninit::uninit(); PAYLOAD_WORDS]),
        }
    }

    /// Whether the slot can take a new task.
    pub(crate) fn is_idle(&self) -> bool {
        self.unfinished_jobs.load(Ordering::Acquire) == 0
            && self.vtable.load(Ordering::Acquire).is_null()
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn unfinished_jobs(&self) -> i32 {
        self.unfinished_jobs.load(Ordering::Acquire)
    }

    /// Complete when the counter reached zero, or when the slot has since been
    /// handed to a newer job.
    pub(crate) fn is_complete(&self, generation: u32) -> bool {
        // Counter first: the generation only moves after completion.
        let unfinished = self.unfinished_jobs.load(Ordering::Acquire);
        unfinished == 0 || self.generation() != generation
    }

    pub(crate) fn has_task(&self) -> bool {
        !self.vtable.load(Ordering::Acquire).is_null()
    }

    /// Store `task` in this slot and return the new generation.
    ///
    /// # Safety
    /// The caller must be the owning worker and the slot must be idle.
    pub(crate) unsafe fn prepare<F>(&self, task: F, parent: *mut Job) -> u32
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        const {
            assert!(
                size_of::<F>() <= JOB_PAYLOAD_SIZE,
                "job closure captures more state than fits in a job record"
            );
            assert!(
                align_of::<F>() <= JOB_PAYLOAD_ALIGN,
                "job closure captures over-aligned state"
            );
        }
        ptr::write(self.payload.get().cast::<F>(), task);
        self.parent.store(parent, Ordering::Relaxed);
        self.unfinished_jobs.store(1, Ordering::Relaxed);
        let generation = self.generation.fetch_add(1, Ordering::Release).wrapping_add(1);
        let vtable = &<F as TaskVTable>::VTABLE as *const JobVTable;
        self.vtable.store(vtable.cast_mut(), Ordering::Release);
        generation
    }

    /// Register one more child that must finish before this job completes.
    pub(crate) fn add_child(&self) {
        self.unfinished_jobs.fetch_add(1, Ordering::AcqRel);
    }

    /// Run the stored task. Returns `false` if the task was already taken.
    ///
    /// # Safety
    /// `ctx` must describe the calling worker.
    pub(crate) unsafe fn execute(&self, ctx: &JobContext<'_>) -> bool {
        let vtable = self.vtable.swap(ptr::null_mut(), Ordering::AcqRel);
        if vtable.is_null() {
            return false;
        }
        ((*vtable).call)(self.payload.get().cast::<u8>(), ctx);
        true
    }

    /// Decrement the counter, propagating completion up the parent chain.
    ///
    /// # Safety
    /// Every parent pointer in the chain must point into a live job pool.
    pub(crate) unsafe fn finish(&self) {
        let mut job: *const Job = self;
        loop {
            // The parent link is read before the decrement: at zero the
            // owning worker may reuse the slot immediately.
            let parent = (*job).parent.load(Ordering::Acquire);
            let previous = (*job).unfinished_jobs.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "job finished more often than started");
            if previous != 1 || parent.is_null() {
                return;
            }
            job = parent;
        }
    }

    /// Drop a task that was never executed.
    ///
    /// # Safety
    /// No other thread may access the slot concurrently.
    pub(crate) unsafe fn drop_pending(&self) {
        let vtable = self.vtable.swap(ptr::null_mut(), Ordering::AcqRel);
        if !vtable.is_null() {
            ((*vtable).drop)(self.payload.get().cast::<u8>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_record_is_one_cache_line() {
        assert_eq!(size_of::<Job>(), 64);
        assert_eq!(align_of::<Job>(), 64);
        assert_eq!(JOB_PAYLOAD_SIZE, 40);
    }

    #[test]
    fn test_new_slot_is_idle() {
        let job = Job::new();
        assert!(job.is_idle());
        assert!(!job.has_task());
        assert_eq!(job.unfinished_jobs(), 0);
    }

    #[test]
    fn test_finish_propagates_to_parent() {
        let parent = Job::new();
        let child = Job::new();
        unsafe {
            parent.prepare(|_ctx: &JobContext<'_>| {}, ptr::null_mut());
            let parent_ptr = &parent as *const Job as *mut Job;
            parent.add_child();
            child.prepare(|_ctx: &JobContext<'_>| {}, parent_ptr);

            // Parent's own task "ran"; the child is still outstanding.
            parent.finish();
            assert_eq!(parent.unfinished_jobs(), 1);

            child.finish();
            assert_eq!(child.unfinished_jobs(), 0);
            assert_eq!(parent.unfinished_jobs(), 0);

            parent.drop_pending();
            child.drop_pending();
        }
        assert!(parent.is_idle());
        assert!(child.is_idle());
    }

    #[test]
    fn test_stale_generation_reads_complete() {
        let job = Job::new();
        let generation = unsafe { job.prepare(|_ctx: &JobContext<'_>| {}, ptr::null_mut()) };
        assert!(!job.is_complete(generation));
        assert!(job.is_complete(generation.wrapping_sub(1)));
        unsafe {
            job.drop_pending();
            job.finish();
        }
        assert!(job.is_complete(generation));
    }

    #[test]
    fn test_pending_task_is_dropped() {
        use std::sync::Arc;

        let marker = Arc::new(());
        let captured = Arc::clone(&marker);
        let job = Job::new();
        unsafe {
            job.prepare(
                move |_ctx: &JobContext<'_>| {
                    let _keep = &captured;
                },
                ptr::null_mut(),
            );
        }
        assert_eq!(Arc::strong_count(&marker), 2);
        unsafe { job.drop_pending() };
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
