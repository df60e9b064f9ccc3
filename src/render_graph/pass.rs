//! Render graph passes
//!
//! A [`RenderGraphPass`] is built once, handed to the graph by value and never
//! changed afterwards. Its declarations drive ordering, lifetimes, layout
//! transitions and the render pass objects the graph creates; its callbacks
//! are invoked by the graph with a context scoped to the pass.

use std::ops::Range;

use glam::Vec4;

use super::resource::{
    BufferResourceDesc, ResourceDesc, ResourceTable, ResourceUsage, StorageAccess,
    TextureResourceDesc,
};
use super::{RenderGraphError, RenderGraphResult};
use crate::backend::types::*;
use crate::backend::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, GraphicsBackend, PipelineHandle, RenderPassHandle, TextureHandle,
    TextureViewHandle,
};

/// Kind of work a pass records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineType {
    /// Rasterization inside a render pass built from the color and depth outputs
    Graphics,
    /// Dispatches; may run on the async compute queue
    Compute,
    /// Anything else, typically blits and resolves
    General,
}

/// What happens to an attachment's previous contents when its pass begins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttachmentLoad {
    Clear(ClearValue),
    Load,
    DontCare,
}

impl AttachmentLoad {
    pub fn clear_color(color: Vec4) -> Self {
        Self::Clear(ClearValue::Color(color))
    }

    pub fn clear_depth(depth: f32) -> Self {
        Self::Clear(ClearValue::DepthStencil { depth, stencil: 0 })
    }

    pub fn load_op(&self) -> LoadOp {
        match self {
            Self::Clear(_) => LoadOp::Clear,
            Self::Load => LoadOp::Load,
            Self::DontCare => LoadOp::DontCare,
        }
    }

    /// Whether the pass reads what earlier passes left in the attachment.
    pub fn keeps_contents(&self) -> bool {
        matches!(self, Self::Load)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AttachmentDeclaration {
    pub(crate) name: String,
    pub(crate) desc: TextureResourceDesc,
    pub(crate) load: AttachmentLoad,
}

#[derive(Debug, Clone)]
pub(crate) struct StorageDeclaration<D> {
    pub(crate) name: String,
    pub(crate) access: StorageAccess,
    pub(crate) desc: Option<D>,
}

/// Everything a pass declares about the resources it touches.
#[derive(Debug, Clone, Default)]
pub(crate) struct PassDeclarations {
    pub(crate) sampled_textures: Vec<String>,
    pub(crate) input_attachments: Vec<String>,
    pub(crate) storage_textures: Vec<StorageDeclaration<TextureResourceDesc>>,
    pub(crate) storage_buffers: Vec<StorageDeclaration<BufferResourceDesc>>,
    pub(crate) color_outputs: Vec<AttachmentDeclaration>,
    pub(crate) depth_output: Option<AttachmentDeclaration>,
    pub(crate) transfer_inputs: Vec<String>,
    pub(crate) transfer_outputs: Vec<(String, Option<TextureResourceDesc>)>,
}

impl PassDeclarations {
    /// Every declared use, in declaration order per category.
    pub(crate) fn accesses(&self) -> Vec<(&str, ResourceUsage)> {
        let mut accesses = Vec::new();
        for name in &self.sampled_textures {
            accesses.push((name.as_str(), ResourceUsage::SampledTexture));
        }
        for name in &self.input_attachments {
            accesses.push((name.as_str(), ResourceUsage::InputAttachment));
        }
        for storage in &self.storage_textures {
            accesses.push((storage.name.as_str(), ResourceUsage::StorageTexture(storage.access)));
        }
        for storage in &self.storage_buffers {
            accesses.push((storage.name.as_str(), ResourceUsage::StorageBuffer(storage.access)));
        }
        for output in &self.color_outputs {
            accesses.push((
                output.name.as_str(),
                ResourceUsage::ColorAttachment {
                    load: output.load.keeps_contents(),
                },
            ));
        }
        if let Some(depth) = &self.depth_output {
            accesses.push((
                depth.name.as_str(),
                ResourceUsage::DepthStencilAttachment {
                    load: depth.load.keeps_contents(),
                },
            ));
        }
        for name in &self.transfer_inputs {
            accesses.push((name.as_str(), ResourceUsage::TransferSrc));
        }
        for (name, _) in &self.transfer_outputs {
            accesses.push((name.as_str(), ResourceUsage::TransferDst));
        }
        accesses
    }

    /// Resource descriptions carried by the declarations.
    pub(crate) fn descriptions(&self) -> Vec<(&str, ResourceDesc)> {
        let textures = self
            .storage_textures
            .iter()
            .filter_map(|s| s.desc.clone().map(|d| (s.name.as_str(), ResourceDesc::Texture(d))));
        let buffers = self
            .storage_buffers
            .iter()
            .filter_map(|s| s.desc.map(|d| (s.name.as_str(), ResourceDesc::Buffer(d))));
        let attachments = self
            .color_outputs
            .iter()
            .chain(self.depth_output.iter())
            .map(|a| (a.name.as_str(), ResourceDesc::Texture(a.desc.clone())));
        let transfers = self
            .transfer_outputs
            .iter()
            .filter_map(|(name, desc)| {
                desc.clone().map(|d| (name.as_str(), ResourceDesc::Texture(d)))
            });
        textures
            .chain(buffers)
            .chain(attachments)
            .chain(transfers)
            .collect()
    }

    pub(crate) fn declares(&self, name: &str) -> bool {
        self.accesses().iter().any(|(declared, _)| *declared == name)
    }

    pub(crate) fn has_attachments(&self) -> bool {
        !self.color_outputs.is_empty() || self.depth_output.is_some()
    }
}

pub type InitCallback = Box<dyn FnMut(&mut PassInitContext<'_>) -> RenderGraphResult<()> + Send>;
pub type DescriptorUpdateCallback =
    Box<dyn FnMut(&mut DescriptorUpdateContext<'_>) -> RenderGraphResult<()> + Send>;
pub type RenderCallback =
    Box<dyn FnMut(&mut PassRenderContext<'_>) -> RenderGraphResult<()> + Send>;

#[derive(Default)]
pub(crate) struct PassCallbacks {
    pub(crate) init: Option<InitCallback>,
    pub(crate) descriptor_update: Option<DescriptorUpdateCallback>,
    pub(crate) render: Option<RenderCallback>,
}

/// A node of the render graph.
///
/// ```
/// use render_graph_engine::backend::{Extent3d, TextureFormat};
/// use render_graph_engine::glam::Vec4;
/// use render_graph_engine::render_graph::{
///     AttachmentLoad, PipelineType, RenderGraphPass, ResourceSize, TextureResourceDesc,
/// };
///
/// let pass = RenderGraphPass::new("clear", PipelineType::Graphics)
///     .color_output(
///         "color",
///         TextureResourceDesc::new(ResourceSize::named("swapchain"), TextureFormat::Rgba8Unorm),
///         AttachmentLoad::clear_color(Vec4::new(0.0, 0.0, 0.0, 1.0)),
///     )
///     .on_render(|_ctx| Ok(()));
/// assert_eq!(pass.name(), "clear");
/// ```
pub struct RenderGraphPass {
    name: String,
    pipeline_type: PipelineType,
    pub(crate) declarations: PassDeclarations,
    pub(crate) callbacks: PassCallbacks,
}

impl std::fmt::Debug for RenderGraphPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderGraphPass")
            .field("name", &self.name)
            .field("pipeline_type", &self.pipeline_type)
            .field("declarations", &self.declarations)
            .finish_non_exhaustive()
    }
}

impl RenderGraphPass {
    pub fn new(name: impl Into<String>, pipeline_type: PipelineType) -> Self {
        Self {
            name: name.into(),
            pipeline_type,
            declarations: PassDeclarations::default(),
            callbacks: PassCallbacks::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    /// Every declared resource use of this pass.
    pub fn accesses(&self) -> Vec<(&str, ResourceUsage)> {
        self.declarations.accesses()
    }

    pub fn reads_resource(&self, name: &str) -> bool {
        self.accesses()
            .iter()
            .any(|(declared, usage)| *declared == name && usage.is_read())
    }

    pub fn writes_resource(&self, name: &str) -> bool {
        self.accesses()
            .iter()
            .any(|(declared, usage)| *declared == name && usage.is_write())
    }

    /// Borrow the declarations while the callbacks are invoked.
    pub(crate) fn split_mut(&mut self) -> (&str, &PassDeclarations, &mut PassCallbacks) {
        (&self.name, &self.declarations, &mut self.callbacks)
    }

    // Declarations

    pub fn sample_texture(mut self, name: impl Into<String>) -> Self {
        self.declarations.sampled_textures.push(name.into());
        self
    }

    pub fn input_attachment(mut self, name: impl Into<String>) -> Self {
        self.declarations.input_attachments.push(name.into());
        self
    }

    /// Declare a storage texture. A description is required wherever the
    /// texture is first written, and optional elsewhere.
    pub fn storage_texture(
        mut self,
        name: impl Into<String>,
        access: StorageAccess,
        desc: Option<TextureResourceDesc>,
    ) -> Self {
        self.declarations.storage_textures.push(StorageDeclaration {
            name: name.into(),
            access,
            desc,
        });
        self
    }

    pub fn read_storage_texture(self, name: impl Into<String>) -> Self {
        self.storage_texture(name, StorageAccess::Read, None)
    }

    pub fn write_storage_texture(self, name: impl Into<String>, desc: TextureResourceDesc) -> Self {
        self.storage_texture(name, StorageAccess::Write, Some(desc))
    }

    pub fn storage_buffer(
        mut self,
        name: impl Into<String>,
        access: StorageAccess,
        desc: Option<BufferResourceDesc>,
    ) -> Self {
        self.declarations.storage_buffers.push(StorageDeclaration {
            name: name.into(),
            access,
            desc,
        });
        self
    }

    pub fn read_storage_buffer(self, name: impl Into<String>) -> Self {
        self.storage_buffer(name, StorageAccess::Read, None)
    }

    pub fn write_storage_buffer(self, name: impl Into<String>, desc: BufferResourceDesc) -> Self {
        self.storage_buffer(name, StorageAccess::Write, Some(desc))
    }

    pub fn color_output(
        mut self,
        name: impl Into<String>,
        desc: TextureResourceDesc,
        load: AttachmentLoad,
    ) -> Self {
        self.declarations.color_outputs.push(AttachmentDeclaration {
            name: name.into(),
            desc,
            load,
        });
        self
    }

    /// Set the depth-stencil output. A pass has at most one.
    pub fn depth_output(
        mut self,
        name: impl Into<String>,
        desc: TextureResourceDesc,
        load: AttachmentLoad,
    ) -> Self {
        let name = name.into();
        if let Some(previous) = &self.declarations.depth_output {
            log::warn!(
                "Pass {}: depth output {} replaced by {}",
                self.name,
                previous.name,
                name
            );
        }
        self.declarations.depth_output = Some(AttachmentDeclaration { name, desc, load });
        self
    }

    /// Source of a blit or resolve.
    pub fn transfer_input(mut self, name: impl Into<String>) -> Self {
        self.declarations.transfer_inputs.push(name.into());
        self
    }

    /// Destination of a blit or resolve.
    pub fn transfer_output(
        mut self,
        name: impl Into<String>,
        desc: Option<TextureResourceDesc>,
    ) -> Self {
        self.declarations
            .transfer_outputs
            .push((name.into(), desc));
        self
    }

    // Callbacks

    /// Called once per build (and after a resize touching this pass) to
    /// create pipelines and descriptor set layouts.
    pub fn on_init<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut PassInitContext<'_>) -> RenderGraphResult<()> + Send + 'static,
    {
        self.callbacks.init = Some(Box::new(callback));
        self
    }

    /// Called after init to allocate and write descriptor sets.
    pub fn on_descriptor_update<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut DescriptorUpdateContext<'_>) -> RenderGraphResult<()> + Send + 'static,
    {
        self.callbacks.descriptor_update = Some(Box::new(callback));
        self
    }

    /// Called every frame to record the pass's commands.
    pub fn on_render<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&mut PassRenderContext<'_>) -> RenderGraphResult<()> + Send + 'static,
    {
        self.callbacks.render = Some(Box::new(callback));
        self
    }
}

/// Backend objects a pass created through its contexts. Owned by the graph
/// and released with the pass's other resources.
#[derive(Debug, Default)]
pub(crate) struct PassBindings {
    pub(crate) pipelines: Vec<(PipelineHandle, PipelineBindPoint)>,
    pub(crate) set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub(crate) descriptor_sets: Vec<DescriptorSetHandle>,
}

impl PassBindings {
    pub(crate) fn release(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        pool: Option<DescriptorPoolHandle>,
    ) {
        for set in self.descriptor_sets.drain(..) {
            if let Some(pool) = pool {
                backend.free_descriptor_set(pool, set);
            }
        }
        for (pipeline, _) in self.pipelines.drain(..) {
            backend.destroy_pipeline(pipeline);
        }
        for layout in self.set_layouts.drain(..) {
            backend.destroy_descriptor_set_layout(layout);
        }
    }
}

/// Context handed to a pass's init callback.
pub struct PassInitContext<'a> {
    pub(crate) backend: &'a mut dyn GraphicsBackend,
    pub(crate) pass: &'a str,
    pub(crate) render_pass: Option<RenderPassHandle>,
    pub(crate) extent: Option<Extent3d>,
    pub(crate) bindings: &'a mut PassBindings,
}

impl PassInitContext<'_> {
    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        &mut *self.backend
    }

    /// Render pass created for this pass's attachments, if it has any.
    pub fn render_pass(&self) -> Option<RenderPassHandle> {
        self.render_pass
    }

    pub fn extent(&self) -> Option<Extent3d> {
        self.extent
    }

    /// Create a descriptor set layout owned by this pass.
    pub fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDescriptor,
    ) -> RenderGraphResult<DescriptorSetLayoutHandle> {
        let layout = self.backend.create_descriptor_set_layout(desc)?;
        self.bindings.set_layouts.push(layout);
        Ok(layout)
    }

    /// Create a graphics pipeline for this pass's render pass. The first
    /// pipeline created is bound automatically before the render callback.
    pub fn create_graphics_pipeline(
        &mut self,
        mut desc: GraphicsPipelineDescriptor,
    ) -> RenderGraphResult<PipelineHandle> {
        let render_pass = self.render_pass.ok_or_else(|| RenderGraphError::InvalidPass {
            pass: self.pass.to_string(),
            reason: "graphics pipeline requested by a pass without attachments".into(),
        })?;
        desc.render_pass = render_pass;
        let pipeline = self.backend.create_graphics_pipeline(&desc)?;
        log::debug!("Pass {}: created graphics pipeline {:?}", self.pass, desc.label);
        self.bindings
            .pipelines
            .push((pipeline, PipelineBindPoint::Graphics));
        Ok(pipeline)
    }

    pub fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> RenderGraphResult<PipelineHandle> {
        let pipeline = self.backend.create_compute_pipeline(desc)?;
        log::debug!("Pass {}: created compute pipeline {:?}", self.pass, desc.label);
        self.bindings
            .pipelines
            .push((pipeline, PipelineBindPoint::Compute));
        Ok(pipeline)
    }
}

fn unknown_resource(pass: &str, resource: &str) -> RenderGraphError {
    RenderGraphError::UnknownResource {
        pass: pass.to_string(),
        resource: resource.to_string(),
    }
}

/// Resource lookups shared by the descriptor-update and render contexts.
/// Only resources the pass declared are visible.
struct PassResources<'a> {
    pass: &'a str,
    declarations: &'a PassDeclarations,
    table: &'a ResourceTable,
}

impl PassResources<'_> {
    fn texture(&self, name: &str) -> RenderGraphResult<(TextureHandle, TextureViewHandle)> {
        if !self.declarations.declares(name) {
            return Err(unknown_resource(self.pass, name));
        }
        self.table
            .texture(name)
            .map(|physical| (physical.texture, physical.view))
            .ok_or_else(|| unknown_resource(self.pass, name))
    }

    fn buffer(&self, name: &str) -> RenderGraphResult<BufferHandle> {
        if !self.declarations.declares(name) {
            return Err(unknown_resource(self.pass, name));
        }
        self.table
            .buffer(name)
            .map(|physical| physical.buffer)
            .ok_or_else(|| unknown_resource(self.pass, name))
    }
}

/// Context handed to a pass's descriptor-update callback.
pub struct DescriptorUpdateContext<'a> {
    pub(crate) backend: &'a mut dyn GraphicsBackend,
    pub(crate) pass: &'a str,
    pub(crate) declarations: &'a PassDeclarations,
    pub(crate) resources: &'a ResourceTable,
    pub(crate) pool: DescriptorPoolHandle,
    pub(crate) bindings: &'a mut PassBindings,
}

impl DescriptorUpdateContext<'_> {
    fn lookup(&self) -> PassResources<'_> {
        PassResources {
            pass: self.pass,
            declarations: self.declarations,
            table: self.resources,
        }
    }

    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        &mut *self.backend
    }

    pub fn texture(&self, name: &str) -> RenderGraphResult<TextureHandle> {
        self.lookup().texture(name).map(|(texture, _)| texture)
    }

    pub fn texture_view(&self, name: &str) -> RenderGraphResult<TextureViewHandle> {
        self.lookup().texture(name).map(|(_, view)| view)
    }

    pub fn buffer(&self, name: &str) -> RenderGraphResult<BufferHandle> {
        self.lookup().buffer(name)
    }

    /// Layouts created by the init callback, in creation order.
    pub fn descriptor_set_layouts(&self) -> &[DescriptorSetLayoutHandle] {
        &self.bindings.set_layouts
    }

    /// Allocate a set from the graph's descriptor pool. Sets are bound in
    /// allocation order before the render callback runs.
    pub fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> RenderGraphResult<DescriptorSetHandle> {
        let set = self.backend.allocate_descriptor_set(self.pool, layout)?;
        self.bindings.descriptor_sets.push(set);
        Ok(set)
    }

    pub fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> RenderGraphResult<()> {
        self.backend.write_descriptor_set(set, writes)?;
        Ok(())
    }
}

/// Context handed to a pass's render callback: the command buffer being
/// recorded and the resources bound to the pass.
pub struct PassRenderContext<'a> {
    pub(crate) backend: &'a mut dyn GraphicsBackend,
    pub(crate) cmd: CommandBufferHandle,
    pub(crate) pass: &'a str,
    pub(crate) declarations: &'a PassDeclarations,
    pub(crate) resources: &'a ResourceTable,
    pub(crate) bindings: &'a PassBindings,
    pub(crate) extent: Option<Extent3d>,
    pub(crate) bound_pipeline: Option<PipelineHandle>,
}

impl PassRenderContext<'_> {
    fn lookup(&self) -> PassResources<'_> {
        PassResources {
            pass: self.pass,
            declarations: self.declarations,
            table: self.resources,
        }
    }

    pub fn pass_name(&self) -> &str {
        self.pass
    }

    pub fn backend(&mut self) -> &mut dyn GraphicsBackend {
        &mut *self.backend
    }

    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.cmd
    }

    /// Extent of the pass's attachments, or of the first texture it writes.
    pub fn extent(&self) -> Option<Extent3d> {
        self.extent
    }

    pub fn texture(&self, name: &str) -> RenderGraphResult<TextureHandle> {
        self.lookup().texture(name).map(|(texture, _)| texture)
    }

    pub fn texture_view(&self, name: &str) -> RenderGraphResult<TextureViewHandle> {
        self.lookup().texture(name).map(|(_, view)| view)
    }

    pub fn buffer(&self, name: &str) -> RenderGraphResult<BufferHandle> {
        self.lookup().buffer(name)
    }

    pub fn pipeline(&self) -> Option<PipelineHandle> {
        self.bound_pipeline
    }

    pub fn descriptor_sets(&self) -> &[DescriptorSetHandle] {
        &self.bindings.descriptor_sets
    }

    /// Bind another pipeline created by the init callback, by creation index,
    /// together with the pass's descriptor sets.
    pub fn bind_pipeline(&mut self, index: usize) -> RenderGraphResult<PipelineHandle> {
        let (pipeline, bind_point) =
            *self
                .bindings
                .pipelines
                .get(index)
                .ok_or_else(|| RenderGraphError::InvalidPass {
                    pass: self.pass.to_string(),
                    reason: format!("no pipeline at index {index}"),
                })?;
        self.backend.cmd_bind_pipeline(self.cmd, bind_point, pipeline);
        if !self.bindings.descriptor_sets.is_empty() {
            self.backend.cmd_bind_descriptor_sets(
                self.cmd,
                bind_point,
                pipeline,
                0,
                &self.bindings.descriptor_sets,
            );
        }
        self.bound_pipeline = Some(pipeline);
        Ok(pipeline)
    }

    /// Push `value` as raw bytes to the bound pipeline.
    pub fn push_constants<T: bytemuck::Pod>(
        &mut self,
        stages: ShaderStages,
        offset: u32,
        value: &T,
    ) -> RenderGraphResult<()> {
        let pipeline = self.bound_pipeline.ok_or_else(|| RenderGraphError::InvalidPass {
            pass: self.pass.to_string(),
            reason: "push constants without a bound pipeline".into(),
        })?;
        self.backend
            .cmd_push_constants(self.cmd, pipeline, stages, offset, bytemuck::bytes_of(value));
        Ok(())
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.backend.cmd_draw(self.cmd, vertices, instances);
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.backend.cmd_dispatch(self.cmd, x, y, z);
    }

    /// Blit between two declared textures. The graph has already moved `src`
    /// to `TransferSrc` and `dst` to `TransferDst`.
    pub fn blit(&mut self, src: &str, dst: &str, filter: FilterMode) -> RenderGraphResult<()> {
        let (src, _) = self.lookup().texture(src)?;
        let (dst, _) = self.lookup().texture(dst)?;
        self.backend.cmd_blit_texture(self.cmd, src, dst, filter);
        Ok(())
    }

    pub fn resolve(&mut self, src: &str, dst: &str) -> RenderGraphResult<()> {
        let (src, _) = self.lookup().texture(src)?;
        let (dst, _) = self.lookup().texture(dst)?;
        self.backend.cmd_resolve_texture(self.cmd, src, dst);
        Ok(())
    }
}
