//! Engine configuration

use std::time::Duration;

/// Job system configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSystemConfig {
    /// Upper bound on the number of workers, the constructing thread included.
    /// The worker count never drops below 2.
    pub max_worker_count: usize,
    /// Job slots per worker, also the capacity of each worker's deque.
    /// Must be a power of two.
    pub job_pool_capacity: usize,
    /// How long an idle background worker sleeps before polling again
    pub idle_wait: Duration,
}

impl Default for JobSystemConfig {
    fn default() -> Self {
        Self {
            max_worker_count: 16,
            job_pool_capacity: 4096,
            idle_wait: Duration::from_millis(1),
        }
    }
}

impl JobSystemConfig {
    pub fn with_max_worker_count(mut self, count: usize) -> Self {
        self.max_worker_count = count;
        self
    }

    pub fn with_job_pool_capacity(mut self, capacity: usize) -> Self {
        self.job_pool_capacity = capacity;
        self
    }
}

/// Render graph configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderGraphConfig {
    /// Run topology validation during `build`
    pub validate: bool,
    /// Compute aliasing candidates between disjoint-lifetime resources
    pub enable_aliasing: bool,
    /// Share one physical resource between compatible transient resources.
    /// Only takes effect together with `enable_aliasing`.
    pub physical_aliasing: bool,
    /// Submit compute passes on the dedicated compute queue when the backend has one
    pub async_compute: bool,
}

impl Default for RenderGraphConfig {
    fn default() -> Self {
        Self {
            validate: true,
            enable_aliasing: true,
            physical_aliasing: false,
            async_compute: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    pub job_system: JobSystemConfig,
    pub render_graph: RenderGraphConfig,
}
