//! Scheduler core and the thread-owning job system.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::job::{Job, JobHandle};
use super::worker::Worker;
use super::{JobError, JobResult};
use crate::config::JobSystemConfig;

/// Workers never drop below this count, whatever the configured maximum.
pub(crate) const MIN_WORKERS: usize = 2;

const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) fn clamp_worker_count(hardware_threads: usize, max_worker_count: usize) -> usize {
    hardware_threads.clamp(MIN_WORKERS, max_worker_count.max(MIN_WORKERS))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Execution context handed to every job.
///
/// The context is bound to the worker thread running the job, whose pool and
/// deque it allocates and pushes into. It is neither `Send` nor `Sync`:
///
/// ```compile_fail
/// fn shared_across_threads<T: Sync>() {}
/// shared_across_threads::<render_graph_engine::job_system::JobContext<'static>>();
/// ```
///
/// Other threads go through [`JobContext::scheduler`], which resolves the
/// calling worker on every call.
pub struct JobContext<'a> {
    scheduler: &'a Scheduler,
    job: JobHandle,
    worker: usize,
    _worker_bound: PhantomData<*const ()>,
}

impl<'a> JobContext<'a> {
    pub fn scheduler(&self) -> &'a Scheduler {
        self.scheduler
    }

    /// Handle of the job being executed
    pub fn job(&self) -> JobHandle {
        self.job
    }

    /// Index of the worker executing the job
    pub fn worker_index(&self) -> usize {
        self.worker
    }

    /// Allocate a child of the running job without scheduling it.
    pub fn allocate_child<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.scheduler.allocate_on(self.worker, Some(self.job), task)
    }

    /// Allocate a child of the running job and push it onto this worker's deque.
    pub fn spawn_child<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let handle = self.allocate_child(task)?;
        self.scheduler.push_on(self.worker, &[handle])?;
        Ok(handle)
    }

    /// Wait for `handle`, executing other jobs on this worker meanwhile.
    pub fn wait_for_job(&self, handle: JobHandle) {
        self.scheduler.wait_on(handle, Some(self.worker));
    }
}

/// State shared between all workers.
///
/// Everything a running job can reach goes through the scheduler, so jobs and
/// the owning [`JobSystem`] see the same API.
pub struct Scheduler {
    workers: Box<[Worker]>,
    thread_map: OnceLock<HashMap<ThreadId, usize>>,
    /// Hint of queued jobs; may briefly disagree with the deques.
    available_jobs: AtomicUsize,
    idle_lock: Mutex<()>,
    idle_signal: Condvar,
    shutting_down: AtomicBool,
    idle_wait: Duration,
}

impl Scheduler {
    fn new(worker_count: usize, config: &JobSystemConfig) -> Self {
        Self {
            workers: (0..worker_count)
                .map(|index| Worker::new(index, config.job_pool_capacity))
                .collect(),
            thread_map: OnceLock::new(),
            available_jobs: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle_signal: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            idle_wait: config.idle_wait,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn job_pool_capacity(&self) -> usize {
        self.workers.first().map_or(0, |w| w.queue().capacity())
    }

    /// Worker index of the calling thread, if it is registered.
    pub fn current_worker_index(&self) -> Option<usize> {
        self.thread_map
            .get()?
            .get(&thread::current().id())
            .copied()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Hint of how many jobs are queued across all workers.
    pub fn available_jobs(&self) -> usize {
        self.available_jobs.load(Ordering::Relaxed)
    }

    /// Jobs allocated but not yet finished, across all pools.
    pub fn jobs_in_flight(&self) -> usize {
        self.workers.iter().map(Worker::jobs_in_flight).sum()
    }

    fn calling_worker(&self, operation: &str) -> JobResult<usize> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        self.current_worker_index().ok_or_else(|| {
            log::error!(
                "{} called from thread {:?} which is not a job system worker",
                operation,
                thread::current().id()
            );
            JobError::UnregisteredThread
        })
    }

    fn resolve(&self, handle: JobHandle) -> Option<&Job> {
        self.workers.get(handle.worker())?.job(handle.slot())
    }

    fn handle_of(&self, job: *const Job) -> Option<JobHandle> {
        self.workers.iter().find_map(|worker| {
            let slot = worker.slot_of(job)?;
            // SAFETY: `slot_of` only accepts pointers into the pool.
            let generation = unsafe { (*job).generation() };
            Some(JobHandle {
                worker: worker.index() as u32,
                slot: slot as u32,
                generation,
            })
        })
    }

    /// Allocate a job on the calling worker.
    pub fn allocate_job<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let worker = self.calling_worker("allocate_job")?;
        self.allocate_on(worker, None, task)
    }

    /// Allocate a job on the calling worker that `parent` waits for.
    ///
    /// The parent's counter is raised before the child handle is returned.
    pub fn allocate_job_as_child<F>(&self, parent: JobHandle, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let worker = self.calling_worker("allocate_job_as_child")?;
        self.allocate_on(worker, Some(parent), task)
    }

    pub(crate) fn allocate_on<F>(
        &self,
        worker: usize,
        parent: Option<JobHandle>,
        task: F,
    ) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        let parent_job = match parent {
            Some(handle) => {
                let job = self
                    .resolve(handle)
                    .filter(|job| !job.is_complete(handle.generation))
                    .ok_or_else(|| {
                        log::error!("Child allocated for completed parent {:?}", handle);
                        JobError::StaleHandle(handle)
                    })?;
                Some(job)
            }
            None => None,
        };
        self.workers[worker].allocate(task, parent_job)
    }

    /// Allocate a job and push it onto the calling worker's deque.
    pub fn spawn<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        let worker = self.calling_worker("spawn")?;
        let handle = self.allocate_on(worker, None, task)?;
        self.push_on(worker, &[handle])?;
        Ok(handle)
    }

    /// Push a job onto the calling worker's deque and wake idle workers.
    pub fn run_job(&self, handle: JobHandle) -> JobResult<()> {
        self.run_jobs(&[handle])
    }

    /// Push several jobs onto the calling worker's deque, waking idle workers once.
    pub fn run_jobs(&self, handles: &[JobHandle]) -> JobResult<()> {
        let worker = self.calling_worker("run_jobs")?;
        self.push_on(worker, handles)
    }

    pub(crate) fn push_on(&self, worker: usize, handles: &[JobHandle]) -> JobResult<()> {
        let mut result = Ok(());
        let mut pushed = 0;
        for &handle in handles {
            let job = match self.resolve(handle) {
                Some(job) if job.generation() == handle.generation && job.has_task() => job,
                _ => {
                    log::error!("run_job called with stale handle {:?}", handle);
                    result = Err(JobError::StaleHandle(handle));
                    break;
                }
            };
            self.available_jobs.fetch_add(1, Ordering::Relaxed);
            let job_ptr = job as *const Job as *mut Job;
            if self.workers[worker].queue().push(job_ptr).is_err() {
                self.release_available();
                log::error!("Job queue of worker {} is full", worker);
                result = Err(JobError::QueueFull { worker });
                break;
            }
            pushed += 1;
        }
        if pushed > 0 {
            self.idle_signal.notify_all();
        }
        result
    }

    pub fn is_job_complete(&self, handle: JobHandle) -> bool {
        self.resolve(handle)
            .map_or(true, |job| job.is_complete(handle.generation))
    }

    /// Block until `handle` completed.
    ///
    /// With `do_work_while_waiting` on a registered worker thread the wait
    /// executes other jobs (own deque first, then stolen ones) instead of
    /// spinning idle.
    pub fn wait_for_job(&self, handle: JobHandle, do_work_while_waiting: bool) {
        let helper = if do_work_while_waiting {
            self.current_worker_index()
        } else {
            None
        };
        self.wait_on(handle, helper);
    }

    fn wait_on(&self, handle: JobHandle, helper: Option<usize>) {
        let Some(job) = self.resolve(handle) else {
            log::warn!("wait_for_job called with unknown handle {:?}", handle);
            return;
        };
        let mut spins = 0;
        while !job.is_complete(handle.generation) {
            if let Some(worker) = helper {
                if self.execute_next(worker) {
                    spins = 0;
                    continue;
                }
            }
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    /// Pop from the worker's own deque, else steal round-robin from the others.
    fn find_job(&self, worker: usize) -> Option<*mut Job> {
        if let Some(job) = self.workers[worker].queue().pop() {
            return Some(job);
        }
        let count = self.workers.len();
        (1..count)
            .map(|offset| (worker + offset) % count)
            .find_map(|victim| self.workers[victim].queue().steal())
    }

    /// Execute one job if any is available. Returns whether one ran.
    fn execute_next(&self, worker: usize) -> bool {
        match self.find_job(worker) {
            Some(job) => {
                self.execute(worker, job);
                true
            }
            None => false,
        }
    }

    fn execute(&self, worker: usize, job_ptr: *mut Job) {
        self.release_available();
        let Some(handle) = self.handle_of(job_ptr) else {
            log::error!("Dequeued job {:p} does not belong to any pool", job_ptr);
            return;
        };
        // SAFETY: pools live as long as the scheduler.
        let job = unsafe { &*job_ptr };
        let ctx = JobContext {
            scheduler: self,
            job: handle,
            worker,
            _worker_bound: PhantomData,
        };

        // SAFETY: `ctx` describes the calling worker.
        match catch_unwind(AssertUnwindSafe(|| unsafe { job.execute(&ctx) })) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Job {:?} was scheduled more than once", handle);
                return;
            }
            Err(payload) => {
                log::error!(
                    "Job {:?} panicked on worker {}: {}",
                    handle,
                    worker,
                    panic_message(&*payload)
                );
            }
        }
        log::trace!("Worker {} finished job {:?}", worker, handle);
        // SAFETY: parent links only ever point into this scheduler's pools.
        unsafe { job.finish() };
    }

    fn release_available(&self) {
        let _ = self
            .available_jobs
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    fn idle(&self, worker: usize) {
        let mut guard = self.idle_lock.lock();
        if self.is_shutting_down()
            || !self.workers[worker].is_active()
            || self.available_jobs.load(Ordering::Relaxed) > 0
        {
            return;
        }
        self.idle_signal.wait_for(&mut guard, self.idle_wait);
    }

    fn run_worker(&self, worker: usize) {
        log::debug!("Job worker {} started", worker);
        while self.workers[worker].is_active() {
            if !self.execute_next(worker) {
                self.idle(worker);
            }
        }
        log::debug!("Job worker {} stopped", worker);
    }
}

/// Owns the worker threads of a [`Scheduler`].
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use render_graph_engine::config::JobSystemConfig;
/// use render_graph_engine::job_system::JobSystem;
///
/// let system = JobSystem::new(JobSystemConfig::default())?;
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let shared = Arc::clone(&counter);
/// let root = system.allocate_job(move |ctx| {
///     for _ in 0..8 {
///         let shared = Arc::clone(&shared);
///         ctx.spawn_child(move |_| {
///             shared.fetch_add(1, Ordering::Relaxed);
///         })
///         .unwrap();
///     }
/// })?;
/// system.run_job(root)?;
/// system.wait_for_job(root, true);
///
/// assert_eq!(counter.load(Ordering::Relaxed), 8);
/// # Ok::<(), render_graph_engine::job_system::JobError>(())
/// ```
pub struct JobSystem {
    scheduler: Arc<Scheduler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl JobSystem {
    /// Spawn the background workers and register the calling thread as the
    /// last worker.
    pub fn new(config: JobSystemConfig) -> JobResult<Self> {
        if !config.job_pool_capacity.is_power_of_two() {
            return Err(JobError::InvalidConfig(format!(
                "job pool capacity {} is not a power of two",
                config.job_pool_capacity
            )));
        }
        let hardware_threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS);
        let worker_count = clamp_worker_count(hardware_threads, config.max_worker_count);
        let scheduler = Arc::new(Scheduler::new(worker_count, &config));

        let mut threads = Vec::with_capacity(worker_count - 1);
        for index in 0..worker_count - 1 {
            let shared = Arc::clone(&scheduler);
            let spawned = thread::Builder::new()
                .name(format!("job-worker-{index}"))
                .spawn(move || shared.run_worker(index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    log::error!("Failed to spawn job worker {}: {}", index, e);
                    let partial = Self {
                        scheduler,
                        threads: Mutex::new(threads),
                    };
                    partial.shutdown();
                    return Err(JobError::ThreadSpawn(e.to_string()));
                }
            }
        }

        let mut thread_map: HashMap<ThreadId, usize> = threads
            .iter()
            .enumerate()
            .map(|(index, handle)| (handle.thread().id(), index))
            .collect();
        thread_map.insert(thread::current().id(), worker_count - 1);
        // Freshly created, so the map cannot be set yet.
        let _ = scheduler.thread_map.set(thread_map);

        log::info!(
            "Job system started with {} workers ({} hardware threads, {} jobs per pool)",
            worker_count,
            hardware_threads,
            config.job_pool_capacity
        );

        Ok(Self {
            scheduler,
            threads: Mutex::new(threads),
        })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn worker_count(&self) -> usize {
        self.scheduler.worker_count()
    }

    pub fn current_worker_index(&self) -> Option<usize> {
        self.scheduler.current_worker_index()
    }

    pub fn allocate_job<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.scheduler.allocate_job(task)
    }

    pub fn allocate_job_as_child<F>(&self, parent: JobHandle, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.scheduler.allocate_job_as_child(parent, task)
    }

    pub fn spawn<F>(&self, task: F) -> JobResult<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) + Send + 'static,
    {
        self.scheduler.spawn(task)
    }

    pub fn run_job(&self, handle: JobHandle) -> JobResult<()> {
        self.scheduler.run_job(handle)
    }

    pub fn run_jobs(&self, handles: &[JobHandle]) -> JobResult<()> {
        self.scheduler.run_jobs(handles)
    }

    pub fn wait_for_job(&self, handle: JobHandle, do_work_while_waiting: bool) {
        self.scheduler.wait_for_job(handle, do_work_while_waiting)
    }

    pub fn is_job_complete(&self, handle: JobHandle) -> bool {
        self.scheduler.is_job_complete(handle)
    }

    /// Stop all workers and join the background threads.
    ///
    /// Jobs already executing run to completion; queued jobs are dropped with
    /// the pools. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if self.scheduler.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down job system");
        for worker in self.scheduler.workers.iter() {
            worker.deactivate();
        }
        {
            let _guard = self.scheduler.idle_lock.lock();
            self.scheduler.idle_signal.notify_all();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let name = handle.thread().name().map(str::to_owned);
            if let Err(payload) = handle.join() {
                log::error!(
                    "Job worker {:?} panicked: {}",
                    name,
                    panic_message(&*payload)
                );
            }
        }
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_config() -> JobSystemConfig {
        JobSystemConfig::default()
            .with_max_worker_count(4)
            .with_job_pool_capacity(256)
    }

    #[test]
    fn test_worker_count_clamp() {
        assert_eq!(clamp_worker_count(1, 1), 2);
        assert_eq!(clamp_worker_count(16, 1), 2);
        assert_eq!(clamp_worker_count(16, 4), 4);
        assert_eq!(clamp_worker_count(3, 8), 3);
    }

    #[test]
    fn test_constructing_thread_is_last_worker() {
        let system = JobSystem::new(small_config()).unwrap();
        assert_eq!(
            system.current_worker_index(),
            Some(system.worker_count() - 1)
        );
    }

    #[test]
    fn test_non_power_of_two_capacity_rejected() {
        let result = JobSystem::new(JobSystemConfig::default().with_job_pool_capacity(100));
        assert!(matches!(result, Err(JobError::InvalidConfig(_))));
    }

    #[test]
    fn test_unregistered_thread_is_rejected() {
        let system = Arc::new(JobSystem::new(small_config()).unwrap());
        let shared = Arc::clone(&system);
        let result = thread::spawn(move || shared.allocate_job(|_| {}).err())
            .join()
            .unwrap();
        assert_eq!(result, Some(JobError::UnregisteredThread));
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let config = JobSystemConfig::default()
            .with_max_worker_count(2)
            .with_job_pool_capacity(4);
        let system = JobSystem::new(config).unwrap();

        // Allocated but never run: every slot stays in flight.
        for _ in 0..4 {
            system.allocate_job(|_| {}).unwrap();
        }
        let err = system.allocate_job(|_| {}).unwrap_err();
        assert_eq!(
            err,
            JobError::PoolExhausted {
                worker: system.worker_count() - 1,
                capacity: 4
            }
        );
    }

    #[test]
    fn test_slots_are_reused_after_completion() {
        let config = JobSystemConfig::default()
            .with_max_worker_count(2)
            .with_job_pool_capacity(4);
        let system = JobSystem::new(config).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let shared = Arc::clone(&counter);
            let job = system
                .spawn(move |_| {
                    shared.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            system.wait_for_job(job, true);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn test_panicking_job_still_completes() {
        let system = JobSystem::new(small_config()).unwrap();
        let job = system.spawn(|_| panic!("job failure")).unwrap();
        system.wait_for_job(job, true);
        assert!(system.is_job_complete(job));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let system = JobSystem::new(small_config()).unwrap();
        system.shutdown();
        system.shutdown();
        assert_eq!(system.allocate_job(|_| {}), Err(JobError::ShuttingDown));
    }
}
