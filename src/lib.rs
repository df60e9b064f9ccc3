//! Render Graph Engine - the rendering core of a real-time engine
//!
//! # Features
//! - Work-stealing job system with parent/child job dependencies
//! - Render graph: passes declare the resources they read and write, the graph
//!   orders them, inserts barriers and drives a graphics backend
//! - Resource lifetimes, aliasing analysis and optional physical aliasing
//! - Named sizes (e.g. the swapchain) with selective resource recreation on resize
//! - Backend abstraction modelled on Vulkan and Direct3D12, with a CPU
//!   [`HeadlessBackend`](backend::HeadlessBackend) for tests and offscreen tools

pub mod backend;
pub mod config;
pub mod job_system;
pub mod render_graph;

// Re-export glam so callers build clear colors and sizes with the same version
pub use glam;

pub use backend::{BackendError, GraphicsBackend};
#[cfg(feature = "headless")]
pub use backend::HeadlessBackend;
pub use config::{EngineConfig, JobSystemConfig, RenderGraphConfig};
pub use job_system::{JobError, JobHandle, JobSystem};
pub use render_graph::{RenderGraph, RenderGraphError, RenderGraphPass};

/// Crate version, as reported in logs
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
