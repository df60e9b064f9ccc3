//! Core backend abstraction traits
//!
//! [`GraphicsBackend`] is the narrow interface the render graph consumes. A
//! Vulkan or Direct3D12 implementation maps each method onto the native call of
//! the same name; the [`headless`](super::headless) backend executes the same
//! commands on the CPU.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to create {kind}: {reason}")]
    ResourceCreationFailed { kind: &'static str, reason: String },
    #[error("Invalid {kind} handle {raw}")]
    InvalidHandle { kind: &'static str, raw: u64 },
    #[error("Invalid layout transition on texture {texture}: expected {expected:?}, found {found:?}")]
    InvalidLayoutTransition {
        texture: u64,
        expected: TextureLayout,
        found: TextureLayout,
    },
    #[error("Semaphore {0} was waited on but never signaled")]
    SemaphoreNotSignaled(u64),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Queue {0:?} is not available on this device")]
    UnsupportedQueue(QueueType),
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
    /// A native API call returned a failure code.
    #[error("Graphics API call failed with code {code} at {file}:{line}")]
    Api {
        code: i32,
        file: &'static str,
        line: u32,
    },
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Build a [`BackendError::Api`] carrying the caller's source location.
///
/// ```
/// use render_graph_engine::{api_error, backend::BackendError};
///
/// let err = api_error!(-4);
/// assert!(matches!(err, BackendError::Api { code: -4, .. }));
/// ```
#[macro_export]
macro_rules! api_error {
    ($code:expr) => {
        $crate::backend::BackendError::Api {
            code: $code as i32,
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl $name {
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

define_handle!(
    /// Handle to a GPU texture
    TextureHandle,
    /// Handle to a texture view
    TextureViewHandle,
    /// Handle to a GPU buffer
    BufferHandle,
    /// Handle to a render pass object (attachment layout)
    RenderPassHandle,
    FramebufferHandle,
    /// Handle to a graphics or compute pipeline
    PipelineHandle,
    DescriptorSetLayoutHandle,
    DescriptorPoolHandle,
    DescriptorSetHandle,
    /// Opaque GPU-side synchronisation primitive
    SemaphoreHandle,
    CommandBufferHandle,
);

/// Main graphics backend trait
///
/// Object safe: the render graph only ever sees `&mut dyn GraphicsBackend`.
/// Command recording on a single [`CommandBufferHandle`] is not thread safe and
/// must happen from one thread at a time.
pub trait GraphicsBackend {
    /// Human readable backend name, used in log output.
    fn name(&self) -> &str;

    /// Whether a dedicated asynchronous compute queue exists.
    fn has_compute_queue(&self) -> bool;

    // Resource creation

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Create a view covering the whole texture
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;
    fn destroy_texture_view(&mut self, view: TextureViewHandle);

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Write data to a buffer from the host
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    // Render passes

    fn create_render_pass(&mut self, desc: &RenderPassDescriptor)
        -> BackendResult<RenderPassHandle>;
    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // Pipelines and descriptors

    fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDescriptor,
    ) -> BackendResult<DescriptorSetLayoutHandle>;
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle);

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;
    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle>;
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    fn create_descriptor_pool(&mut self, max_sets: u32) -> BackendResult<DescriptorPoolHandle>;
    /// Destroying a pool frees every set allocated from it
    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolHandle);

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle>;
    fn free_descriptor_set(&mut self, pool: DescriptorPoolHandle, set: DescriptorSetHandle);
    fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<()>;

    // Synchronisation

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    // Command recording

    fn allocate_command_buffer(&mut self, queue: QueueType) -> BackendResult<CommandBufferHandle>;
    fn free_command_buffer(&mut self, cmd: CommandBufferHandle);

    /// Reset and begin recording
    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()>;

    /// Begin a render pass; `clear_values` is indexed like the framebuffer attachments
    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    );
    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle);

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    );

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    );

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    );

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    );

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    );

    fn cmd_draw(
        &mut self,
        cmd: CommandBufferHandle,
        vertices: std::ops::Range<u32>,
        instances: std::ops::Range<u32>,
    );

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandBufferHandle,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    );

    fn cmd_dispatch(&mut self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32);

    /// Layout transitions and buffer memory dependencies
    fn cmd_pipeline_barrier(
        &mut self,
        cmd: CommandBufferHandle,
        textures: &[TextureBarrier],
        buffers: &[BufferBarrier],
    );

    /// Scaled copy; `src` must be in `TransferSrc`, `dst` in `TransferDst`
    fn cmd_blit_texture(
        &mut self,
        cmd: CommandBufferHandle,
        src: TextureHandle,
        dst: TextureHandle,
        filter: FilterMode,
    );

    /// Resolve a multisampled texture into a single sampled one of the same extent
    fn cmd_resolve_texture(
        &mut self,
        cmd: CommandBufferHandle,
        src: TextureHandle,
        dst: TextureHandle,
    );

    // Submission and presentation

    /// Submit a finished command buffer. Every semaphore in `wait` must have been
    /// signaled by an earlier submission (or externally); `signal` is signaled
    /// once the work completes.
    fn submit(
        &mut self,
        queue: QueueType,
        cmd: CommandBufferHandle,
        wait: &[SemaphoreHandle],
        signal: Option<SemaphoreHandle>,
    ) -> BackendResult<()>;

    /// Present `texture` after waiting on `wait`
    fn present(&mut self, texture: TextureHandle, wait: &[SemaphoreHandle]) -> BackendResult<()>;

    /// Block until all submitted work finished
    fn wait_idle(&mut self) -> BackendResult<()>;
}
