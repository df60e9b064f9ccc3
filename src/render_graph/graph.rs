//! Render graph construction, build and execution

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use glam::Vec4;

use super::aliasing::{self, PhysicalSlot, SlotAssignment};
use super::compiler::{self, ResourceInfo};
use super::lifetime::{self, AliasCandidate, ResourceLifetime};
use super::pass::{
    DescriptorUpdateContext, PassBindings, PassDeclarations, PassInitContext, PassRenderContext,
    PipelineType, RenderGraphPass,
};
use super::resource::{LogicalResource, PhysicalBuffer, PhysicalTexture, ResourceDesc, ResourceTable};
use super::{RenderGraphError, RenderGraphResult};
use crate::backend::types::*;
use crate::backend::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, FramebufferHandle, GraphicsBackend,
    RenderPassHandle, SemaphoreHandle, TextureHandle, TextureViewHandle,
};
use crate::config::RenderGraphConfig;

/// Descriptor sets reserved per pass in the graph's descriptor pool
const DESCRIPTOR_SETS_PER_PASS: u32 = 8;

/// Build state of a [`RenderGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GraphState {
    /// Passes, named sizes and the output can be changed
    #[default]
    Configuring,
    /// Ordered and analysed, backend objects not created yet
    Validated,
    /// Backend objects exist; the graph can be executed
    Built,
}

/// Backend objects owned by one pass.
#[derive(Debug, Default)]
struct PassObjects {
    render_pass: Option<RenderPassHandle>,
    framebuffer: Option<FramebufferHandle>,
    /// One entry per attachment, colors first.
    clear_values: Vec<ClearValue>,
    extent: Option<Extent3d>,
    bindings: PassBindings,
}

impl PassObjects {
    fn release(&mut self, backend: &mut dyn GraphicsBackend, pool: Option<DescriptorPoolHandle>) {
        self.bindings.release(backend, pool);
        if let Some(framebuffer) = self.framebuffer.take() {
            backend.destroy_framebuffer(framebuffer);
        }
        if let Some(render_pass) = self.render_pass.take() {
            backend.destroy_render_pass(render_pass);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PassBarriers {
    textures: Vec<TextureBarrier>,
    buffers: Vec<BufferBarrier>,
}

impl PassBarriers {
    fn is_empty(&self) -> bool {
        self.textures.is_empty() && self.buffers.is_empty()
    }
}

/// Consecutive passes recorded into one command buffer for one queue.
#[derive(Debug, Clone)]
struct SubmissionBatch {
    queue: QueueType,
    /// Execution positions
    positions: Range<usize>,
    command_buffer: CommandBufferHandle,
    signal: SemaphoreHandle,
}

/// Everything `build` creates.
#[derive(Debug, Default)]
struct BuiltGraph {
    resources: ResourceTable,
    slots: BTreeMap<String, PhysicalSlot>,
    /// Indexed by insertion order
    pass_objects: Vec<PassObjects>,
    /// Indexed by execution position
    barriers: Vec<PassBarriers>,
    /// Moves the output to `TransferSrc` after the last pass.
    final_barriers: Vec<TextureBarrier>,
    /// Recorded once at the start of the next frame for freshly created textures.
    initial_transitions: Vec<TextureBarrier>,
    descriptor_pool: Option<DescriptorPoolHandle>,
    batches: Vec<SubmissionBatch>,
}

impl BuiltGraph {
    fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for objects in &mut self.pass_objects {
            objects.release(backend, self.descriptor_pool);
        }
        self.pass_objects.clear();
        if let Some(pool) = self.descriptor_pool.take() {
            backend.destroy_descriptor_pool(pool);
        }
        for batch in self.batches.drain(..) {
            backend.free_command_buffer(batch.command_buffer);
            backend.destroy_semaphore(batch.signal);
        }
        self.resources.release(backend);
        self.slots.clear();
        self.barriers.clear();
        self.final_barriers.clear();
        self.initial_transitions.clear();
    }
}

/// The main render graph structure
///
/// ```
/// use render_graph_engine::backend::{Extent3d, GraphicsBackend, HeadlessBackend, TextureFormat};
/// use render_graph_engine::glam::Vec4;
/// use render_graph_engine::render_graph::{
///     AttachmentLoad, PipelineType, RenderGraph, RenderGraphPass, ResourceSize,
///     TextureResourceDesc,
/// };
///
/// let mut backend = HeadlessBackend::new();
/// let mut graph = RenderGraph::new();
/// graph.add_named_size("swapchain", Extent3d::new_2d(4, 4)).unwrap();
/// graph
///     .add_render_pass(RenderGraphPass::new("clear", PipelineType::Graphics).color_output(
///         "color",
///         TextureResourceDesc::new(ResourceSize::named("swapchain"), TextureFormat::Rgba8Unorm),
///         AttachmentLoad::clear_color(Vec4::new(1.0, 0.0, 0.0, 1.0)),
///     ))
///     .unwrap();
/// graph.set_render_graph_output("color").unwrap();
///
/// graph.build(&mut backend, true).unwrap();
/// let done = graph.execute(&mut backend, &[]).unwrap();
/// backend.present(graph.output_texture().unwrap(), &[done]).unwrap();
/// assert_eq!(backend.presented_frames().len(), 1);
/// graph.destroy(&mut backend);
/// ```
pub struct RenderGraph {
    config: RenderGraphConfig,
    passes: Vec<RenderGraphPass>,
    named_sizes: HashMap<String, Extent3d>,
    output: Option<String>,
    state: GraphState,
    /// Pass indices in execution order
    order: Vec<usize>,
    lifetimes: BTreeMap<String, ResourceLifetime>,
    alias_candidates: Vec<AliasCandidate>,
    built: BuiltGraph,
    frame_index: u64,
}

impl RenderGraph {
    pub fn new() -> Self {
        Self::with_config(RenderGraphConfig::default())
    }

    pub fn with_config(config: RenderGraphConfig) -> Self {
        Self {
            config,
            passes: Vec::new(),
            named_sizes: HashMap::new(),
            output: None,
            state: GraphState::Configuring,
            order: Vec::new(),
            lifetimes: BTreeMap::new(),
            alias_candidates: Vec::new(),
            built: BuiltGraph::default(),
            frame_index: 0,
        }
    }

    pub fn config(&self) -> &RenderGraphConfig {
        &self.config
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    pub fn is_built(&self) -> bool {
        self.state == GraphState::Built
    }

    fn require_configuring(&self, operation: &'static str) -> RenderGraphResult<()> {
        if self.state != GraphState::Configuring {
            log::error!("Render graph: cannot {} while {:?}", operation, self.state);
            return Err(RenderGraphError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    // Configuration

    /// Add a pass. The graph owns it from now on.
    pub fn add_render_pass(&mut self, pass: RenderGraphPass) -> RenderGraphResult<()> {
        self.require_configuring("add a render pass")?;
        log::debug!("Render graph: adding pass {}", pass.name());
        self.passes.push(pass);
        Ok(())
    }

    /// Register a named size that texture sizes can derive from.
    pub fn add_named_size(
        &mut self,
        name: impl Into<String>,
        extent: Extent3d,
    ) -> RenderGraphResult<()> {
        self.require_configuring("add a named size")?;
        let name = name.into();
        if let Some(previous) = self.named_sizes.insert(name.clone(), extent) {
            log::warn!(
                "Render graph: named size {} redefined from {:?} to {:?}",
                name,
                previous,
                extent
            );
        }
        Ok(())
    }

    /// Designate the resource handed to presentation.
    pub fn set_render_graph_output(&mut self, name: impl Into<String>) -> RenderGraphResult<()> {
        self.require_configuring("set the output")?;
        let name = name.into();
        match &self.output {
            Some(existing) if *existing != name => {
                log::error!("Render graph: output already set to {}", existing);
                Err(RenderGraphError::MultipleOutputs {
                    existing: existing.clone(),
                    requested: name,
                })
            }
            _ => {
                self.output = Some(name);
                Ok(())
            }
        }
    }

    // Queries

    pub fn passes(&self) -> &[RenderGraphPass] {
        &self.passes
    }

    pub fn pass(&self, name: &str) -> Option<&RenderGraphPass> {
        self.passes.iter().find(|pass| pass.name() == name)
    }

    pub fn named_size(&self, name: &str) -> Option<Extent3d> {
        self.named_sizes.get(name).copied()
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    /// Pass names in execution order. Empty until the graph is ordered.
    pub fn execution_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&index| self.passes[index].name())
            .collect()
    }

    pub fn lifetimes(&self) -> &BTreeMap<String, ResourceLifetime> {
        &self.lifetimes
    }

    pub fn resource_lifetime(&self, name: &str) -> Option<ResourceLifetime> {
        self.lifetimes.get(name).copied()
    }

    pub fn alias_candidates(&self) -> &[AliasCandidate] {
        &self.alias_candidates
    }

    pub fn physical_slot(&self, name: &str) -> Option<PhysicalSlot> {
        self.built.slots.get(name).copied()
    }

    pub fn physical_texture_count(&self) -> usize {
        self.built.resources.textures.len()
    }

    pub fn physical_buffer_count(&self) -> usize {
        self.built.resources.buffers.len()
    }

    pub fn texture(&self, name: &str) -> Option<TextureHandle> {
        self.built.resources.texture(name).map(|physical| physical.texture)
    }

    pub fn texture_view(&self, name: &str) -> Option<TextureViewHandle> {
        self.built.resources.texture(name).map(|physical| physical.view)
    }

    pub fn texture_extent(&self, name: &str) -> Option<Extent3d> {
        self.built.resources.texture(name).map(|physical| physical.desc.size)
    }

    pub fn buffer(&self, name: &str) -> Option<BufferHandle> {
        self.built.resources.buffer(name).map(|physical| physical.buffer)
    }

    /// Texture to present once the semaphore returned by
    /// [`execute`](Self::execute) is signaled.
    pub fn output_texture(&self) -> Option<TextureHandle> {
        self.output.as_deref().and_then(|output| self.texture(output))
    }

    /// Queue of each submission batch, in submission order.
    pub fn submission_queues(&self) -> Vec<QueueType> {
        self.built.batches.iter().map(|batch| batch.queue).collect()
    }

    /// Number of frames executed since the last build.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    // Build

    /// Validate (optionally), order and analyse the graph, then create every
    /// backend object and run the init and descriptor-update callbacks.
    ///
    /// On failure everything created so far is released and the graph stays
    /// in [`GraphState::Configuring`].
    pub fn build(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        do_validation: bool,
    ) -> RenderGraphResult<()> {
        self.require_configuring("build")?;
        log::info!(
            "Building render graph: {} passes, {} named sizes, backend {}",
            self.passes.len(),
            self.named_sizes.len(),
            backend.name()
        );

        if do_validation {
            compiler::validate(&self.passes, &self.named_sizes, self.output.as_deref())?;
        }
        self.order = compiler::execution_order(&self.passes)?;
        self.lifetimes =
            lifetime::compute_lifetimes(&self.passes, &self.order, self.output.as_deref());
        self.alias_candidates = if self.config.enable_aliasing {
            lifetime::find_alias_candidates(&self.lifetimes)
        } else {
            Vec::new()
        };
        self.state = GraphState::Validated;
        log::debug!("Render graph order: {:?}", self.execution_order());

        let mut built = BuiltGraph::default();
        if let Err(err) = self.materialize(backend, &mut built) {
            log::error!("Render graph build failed: {}", err);
            built.release(backend);
            self.reset();
            return Err(err);
        }
        self.built = built;
        self.frame_index = 0;
        self.state = GraphState::Built;
        log::info!(
            "Render graph built: {} textures, {} buffers, {} submission batches",
            self.built.resources.textures.len(),
            self.built.resources.buffers.len(),
            self.built.batches.len()
        );
        Ok(())
    }

    fn materialize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        built: &mut BuiltGraph,
    ) -> RenderGraphResult<()> {
        let output = self.output.clone().ok_or(RenderGraphError::MissingOutput)?;
        let infos = compiler::collect_resources(&self.passes, Some(output.as_str()))?;
        if !infos.get(&output).is_some_and(|info| info.desc.is_texture()) {
            return Err(RenderGraphError::OutputNotProduced(output));
        }

        let persistent = aliasing::persistent_resources(&self.passes, &self.order);
        let assignment = aliasing::assign_slots(
            &infos,
            &self.lifetimes,
            &persistent,
            self.config.enable_aliasing && self.config.physical_aliasing,
        );
        self.create_physical_resources(backend, &infos, &assignment, &mut built.resources)?;
        built.slots = assignment.slots;

        for pass in &self.passes {
            built.pass_objects.push(PassObjects {
                clear_values: clear_values(&pass.declarations),
                ..Default::default()
            });
            let index = built.pass_objects.len() - 1;
            if needs_render_pass(pass) {
                let render_pass = create_render_pass(backend, pass.name(), &pass.declarations)?;
                built.pass_objects[index].render_pass = Some(render_pass);
                let framebuffer = create_framebuffer(
                    backend,
                    pass.name(),
                    &pass.declarations,
                    &built.resources,
                    render_pass,
                )?;
                built.pass_objects[index].framebuffer = Some(framebuffer);
            }
            built.pass_objects[index].extent = pass_extent(&pass.declarations, &built.resources);
        }

        let max_sets = (self.passes.len() as u32).max(1) * DESCRIPTOR_SETS_PER_PASS;
        let pool = backend.create_descriptor_pool(max_sets)?;
        built.descriptor_pool = Some(pool);

        let plan = plan_barriers(
            &self.passes,
            &self.order,
            &built.resources,
            Some(output.as_str()),
        );
        built.initial_transitions = initial_transitions(
            &built.resources,
            &plan.end_layouts,
            0..built.resources.textures.len(),
        );
        built.barriers = plan.per_pass;
        built.final_barriers = plan.final_barriers;

        let use_async = self.config.async_compute && backend.has_compute_queue();
        if self.config.async_compute && !use_async {
            log::warn!(
                "Async compute requested but backend {} has no compute queue",
                backend.name()
            );
        }
        for (queue, positions) in plan_batches(&self.passes, &self.order, use_async) {
            let command_buffer = backend.allocate_command_buffer(queue)?;
            let signal = match backend.create_semaphore() {
                Ok(signal) => signal,
                Err(err) => {
                    backend.free_command_buffer(command_buffer);
                    return Err(err.into());
                }
            };
            built.batches.push(SubmissionBatch {
                queue,
                positions,
                command_buffer,
                signal,
            });
        }

        for &pass_index in &self.order {
            run_init(
                backend,
                &mut self.passes[pass_index],
                &mut built.pass_objects[pass_index],
            )?;
        }
        for &pass_index in &self.order {
            run_descriptor_update(
                backend,
                &mut self.passes[pass_index],
                &mut built.pass_objects[pass_index],
                &built.resources,
                pool,
            )?;
        }
        Ok(())
    }

    fn create_physical_resources(
        &self,
        backend: &mut dyn GraphicsBackend,
        infos: &BTreeMap<String, ResourceInfo>,
        assignment: &SlotAssignment,
        table: &mut ResourceTable,
    ) -> RenderGraphResult<()> {
        for members in &assignment.texture_members {
            let first = members
                .first()
                .ok_or_else(|| RenderGraphError::MissingDescription("<empty slot>".into()))?;
            let info = infos
                .get(first)
                .ok_or_else(|| RenderGraphError::MissingDescription(first.clone()))?;
            let ResourceDesc::Texture(desc) = &info.desc else {
                return Err(RenderGraphError::DescriptionMismatch(first.clone()));
            };
            let usage = members
                .iter()
                .filter_map(|member| infos.get(member))
                .fold(TextureUsage::empty(), |usage, info| usage | info.texture_usage);
            let extent = desc.size.resolve(&self.named_sizes).ok_or_else(|| {
                RenderGraphError::UnknownNamedSize(desc.size.named_size().unwrap_or_default().into())
            })?;
            let descriptor = desc.to_descriptor(&members.join("+"), extent, usage);
            let texture = backend.create_texture(&descriptor)?;
            let view = match backend.create_texture_view(texture) {
                Ok(view) => view,
                Err(err) => {
                    backend.destroy_texture(texture);
                    return Err(err.into());
                }
            };
            table.textures.push(PhysicalTexture {
                texture,
                view,
                desc: descriptor,
                size: desc.size.clone(),
            });
        }

        for members in &assignment.buffer_members {
            let first = members
                .first()
                .ok_or_else(|| RenderGraphError::MissingDescription("<empty slot>".into()))?;
            let info = infos
                .get(first)
                .ok_or_else(|| RenderGraphError::MissingDescription(first.clone()))?;
            let ResourceDesc::Buffer(desc) = &info.desc else {
                return Err(RenderGraphError::DescriptionMismatch(first.clone()));
            };
            let usage = members
                .iter()
                .filter_map(|member| infos.get(member))
                .fold(BufferUsage::empty(), |usage, info| usage | info.buffer_usage);
            let descriptor = BufferDescriptor::new(desc.size, usage).with_label(members.join("+"));
            let buffer = backend.create_buffer(&descriptor)?;
            table.buffers.push(PhysicalBuffer { buffer });
        }

        for (name, slot) in &assignment.slots {
            let info = infos
                .get(name)
                .ok_or_else(|| RenderGraphError::MissingDescription(name.clone()))?;
            let physical = match slot {
                PhysicalSlot::Texture(index) | PhysicalSlot::Buffer(index) => *index,
            };
            table.logical.insert(
                name.clone(),
                LogicalResource {
                    desc: info.desc.clone(),
                    physical,
                },
            );
        }
        log::debug!(
            "Render graph: {} logical resources on {} textures and {} buffers",
            table.logical.len(),
            table.textures.len(),
            table.buffers.len()
        );
        Ok(())
    }

    // Execution

    /// Record and submit one frame. Returns the semaphore signaled when the
    /// frame's last submission completes; the output is then in
    /// `TransferSrc` layout.
    pub fn execute(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        wait_semaphores: &[SemaphoreHandle],
    ) -> RenderGraphResult<SemaphoreHandle> {
        if self.state != GraphState::Built {
            log::error!("Render graph: execute() while {:?}", self.state);
            return Err(RenderGraphError::NotBuilt);
        }

        let built = &mut self.built;
        let batch_count = built.batches.len();
        let mut previous_signal = None;
        for batch_index in 0..batch_count {
            let batch = built.batches[batch_index].clone();
            let cmd = batch.command_buffer;
            backend.begin_command_buffer(cmd)?;

            let recorded = (|| -> RenderGraphResult<()> {
                if batch_index == 0 && !built.initial_transitions.is_empty() {
                    backend.cmd_pipeline_barrier(cmd, &built.initial_transitions, &[]);
                }
                for position in batch.positions.clone() {
                    let pass_index = self.order[position];
                    record_pass(
                        &mut *backend,
                        cmd,
                        &mut self.passes[pass_index],
                        &built.pass_objects[pass_index],
                        &built.barriers[position],
                        &built.resources,
                    )?;
                }
                if batch_index + 1 == batch_count && !built.final_barriers.is_empty() {
                    backend.cmd_pipeline_barrier(cmd, &built.final_barriers, &[]);
                }
                Ok(())
            })();
            if let Err(err) = recorded {
                if let Err(end_err) = backend.end_command_buffer(cmd) {
                    log::warn!("Render graph: ending failed command buffer: {}", end_err);
                }
                return Err(err);
            }
            backend.end_command_buffer(cmd)?;

            let waits: Vec<SemaphoreHandle> = match previous_signal {
                Some(signal) => vec![signal],
                None => wait_semaphores.to_vec(),
            };
            backend.submit(batch.queue, cmd, &waits, Some(batch.signal))?;
            log::trace!(
                "Render graph: submitted batch {} ({:?}, passes {:?})",
                batch_index,
                batch.queue,
                batch.positions
            );
            if batch_index == 0 {
                built.initial_transitions.clear();
            }
            previous_signal = Some(batch.signal);
        }

        self.frame_index += 1;
        previous_signal.ok_or(RenderGraphError::NotBuilt)
    }

    // Resize

    /// Change a named size. When built, resources derived from it are
    /// recreated and only the passes touching them are set up again.
    pub fn resize_named_size(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        extent: Extent3d,
    ) -> RenderGraphResult<()> {
        let current = self
            .named_sizes
            .get(name)
            .copied()
            .ok_or_else(|| RenderGraphError::UnknownNamedSize(name.to_string()))?;
        if current == extent {
            log::debug!("Render graph: named size {} unchanged", name);
            return Ok(());
        }
        self.named_sizes.insert(name.to_string(), extent);
        if self.state != GraphState::Built {
            return Ok(());
        }

        log::info!(
            "Render graph: resizing {} from {}x{} to {}x{}",
            name,
            current.width,
            current.height,
            extent.width,
            extent.height
        );
        if let Err(err) = self.rebuild_for_size(backend, name) {
            log::error!("Render graph: resize of {} failed: {}", name, err);
            self.built.release(backend);
            self.reset();
            return Err(err);
        }
        Ok(())
    }

    fn rebuild_for_size(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
    ) -> RenderGraphResult<()> {
        let built = &mut self.built;
        let affected_textures: Vec<usize> = built
            .resources
            .textures
            .iter()
            .enumerate()
            .filter(|(_, physical)| physical.size.named_size() == Some(name))
            .map(|(index, _)| index)
            .collect();
        if affected_textures.is_empty() {
            return Ok(());
        }
        backend.wait_idle()?;

        let affected_names: HashSet<&str> = built
            .resources
            .logical
            .iter()
            .filter(|(_, logical)| {
                logical.desc.is_texture() && affected_textures.contains(&logical.physical)
            })
            .map(|(name, _)| name.as_str())
            .collect();
        let affected_passes: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&index| {
                self.passes[index]
                    .accesses()
                    .iter()
                    .any(|(resource, _)| affected_names.contains(resource))
            })
            .collect();
        log::debug!(
            "Render graph: recreating {} textures, re-initializing {} passes",
            affected_textures.len(),
            affected_passes.len()
        );

        let pool = built.descriptor_pool;
        for &pass_index in &affected_passes {
            let objects = &mut built.pass_objects[pass_index];
            objects.bindings.release(backend, pool);
            if let Some(framebuffer) = objects.framebuffer.take() {
                backend.destroy_framebuffer(framebuffer);
            }
        }

        for &slot in &affected_textures {
            let physical = &mut built.resources.textures[slot];
            let extent = physical.size.resolve(&self.named_sizes).ok_or_else(|| {
                RenderGraphError::UnknownNamedSize(name.to_string())
            })?;
            let mut descriptor = physical.desc.clone();
            descriptor.size = extent;
            let texture = backend.create_texture(&descriptor)?;
            let view = match backend.create_texture_view(texture) {
                Ok(view) => view,
                Err(err) => {
                    backend.destroy_texture(texture);
                    return Err(err.into());
                }
            };
            let replaced = physical.texture;
            built
                .initial_transitions
                .retain(|barrier| barrier.texture != replaced);
            backend.destroy_texture_view(physical.view);
            backend.destroy_texture(replaced);
            physical.texture = texture;
            physical.view = view;
            physical.desc = descriptor;
        }

        for &pass_index in &affected_passes {
            let pass = &self.passes[pass_index];
            let objects = &mut built.pass_objects[pass_index];
            if let Some(render_pass) = objects.render_pass {
                let framebuffer = create_framebuffer(
                    backend,
                    pass.name(),
                    &pass.declarations,
                    &built.resources,
                    render_pass,
                )?;
                objects.framebuffer = Some(framebuffer);
            }
            objects.extent = pass_extent(&pass.declarations, &built.resources);
        }

        // Every barrier names texture handles, so the whole plan is redone.
        let plan = plan_barriers(
            &self.passes,
            &self.order,
            &built.resources,
            self.output.as_deref(),
        );
        built.initial_transitions.extend(initial_transitions(
            &built.resources,
            &plan.end_layouts,
            affected_textures.iter().copied(),
        ));
        built.barriers = plan.per_pass;
        built.final_barriers = plan.final_barriers;

        let pool = pool.ok_or(RenderGraphError::NotBuilt)?;
        for &pass_index in &affected_passes {
            run_init(
                backend,
                &mut self.passes[pass_index],
                &mut built.pass_objects[pass_index],
            )?;
        }
        for &pass_index in &affected_passes {
            run_descriptor_update(
                backend,
                &mut self.passes[pass_index],
                &mut built.pass_objects[pass_index],
                &built.resources,
                pool,
            )?;
        }
        Ok(())
    }

    // Teardown

    /// Release every backend object and return to
    /// [`GraphState::Configuring`]. Passes, named sizes and the output stay.
    pub fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.state == GraphState::Built {
            if let Err(err) = backend.wait_idle() {
                log::warn!("Render graph: wait_idle before destroy failed: {}", err);
            }
            log::info!("Render graph: destroying backend objects");
        }
        self.built.release(backend);
        self.reset();
    }

    fn reset(&mut self) {
        self.built = BuiltGraph::default();
        self.order.clear();
        self.lifetimes.clear();
        self.alias_candidates.clear();
        self.frame_index = 0;
        self.state = GraphState::Configuring;
    }
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RenderGraph {
    fn drop(&mut self) {
        if self.state == GraphState::Built {
            log::warn!("Render graph dropped while built; backend objects leak without destroy()");
        }
    }
}

fn needs_render_pass(pass: &RenderGraphPass) -> bool {
    pass.pipeline_type() == PipelineType::Graphics && pass.declarations.has_attachments()
}

fn clear_values(declarations: &PassDeclarations) -> Vec<ClearValue> {
    let colors = declarations.color_outputs.iter().map(|output| match output.load {
        super::AttachmentLoad::Clear(value) => value,
        _ => ClearValue::Color(Vec4::ZERO),
    });
    let depth = declarations.depth_output.iter().map(|output| match output.load {
        super::AttachmentLoad::Clear(value) => value,
        _ => ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 0,
        },
    });
    colors.chain(depth).collect()
}

fn create_render_pass(
    backend: &mut dyn GraphicsBackend,
    name: &str,
    declarations: &PassDeclarations,
) -> RenderGraphResult<RenderPassHandle> {
    let layout = |attachment: &super::pass::AttachmentDeclaration| AttachmentLayout {
        format: attachment.desc.format,
        samples: attachment.desc.samples,
        load_op: attachment.load.load_op(),
        store_op: StoreOp::Store,
    };
    let desc = RenderPassDescriptor {
        label: Some(name.to_string()),
        color_attachments: declarations.color_outputs.iter().map(layout).collect(),
        depth_stencil_attachment: declarations.depth_output.as_ref().map(layout),
        input_attachment_count: declarations.input_attachments.len() as u32,
    };
    Ok(backend.create_render_pass(&desc)?)
}

fn create_framebuffer(
    backend: &mut dyn GraphicsBackend,
    name: &str,
    declarations: &PassDeclarations,
    resources: &ResourceTable,
    render_pass: RenderPassHandle,
) -> RenderGraphResult<FramebufferHandle> {
    let mut attachments = Vec::new();
    let mut extent = None;
    for attachment in declarations
        .color_outputs
        .iter()
        .chain(declarations.depth_output.iter())
    {
        let physical = resources.texture(&attachment.name).ok_or_else(|| {
            RenderGraphError::UnknownResource {
                pass: name.to_string(),
                resource: attachment.name.clone(),
            }
        })?;
        attachments.push(physical.view);
        extent.get_or_insert(physical.desc.size);
    }
    let extent = extent.ok_or_else(|| RenderGraphError::InvalidPass {
        pass: name.to_string(),
        reason: "render pass without attachments".into(),
    })?;
    let desc = FramebufferDescriptor {
        label: Some(name.to_string()),
        render_pass,
        attachments,
        extent,
    };
    Ok(backend.create_framebuffer(&desc)?)
}

/// Extent of the attachments, or of the first texture the pass writes.
fn pass_extent(declarations: &PassDeclarations, resources: &ResourceTable) -> Option<Extent3d> {
    let attachments = declarations
        .color_outputs
        .iter()
        .chain(declarations.depth_output.iter())
        .map(|attachment| attachment.name.as_str());
    let accesses = declarations.accesses();
    let written = accesses
        .iter()
        .filter(|(_, usage)| usage.is_write() && usage.is_texture())
        .map(|(name, _)| *name);
    attachments
        .chain(written)
        .find_map(|name| resources.texture(name))
        .map(|physical| physical.desc.size)
}

/// A pass's uses of one resource, merged over its declarations.
struct MergedUse<'a> {
    name: &'a str,
    layout: Option<TextureLayout>,
    write: bool,
    buffer_access: BufferAccess,
}

fn merged_uses(pass: &RenderGraphPass) -> Vec<MergedUse<'_>> {
    let mut merged: Vec<MergedUse<'_>> = Vec::new();
    for (name, usage) in pass.accesses() {
        match merged.iter_mut().find(|existing| existing.name == name) {
            Some(existing) => {
                existing.write |= usage.is_write();
                existing.layout = existing.layout.or(usage.texture_layout());
                existing.buffer_access = combine_access(existing.buffer_access, usage.buffer_access());
            }
            None => merged.push(MergedUse {
                name,
                layout: usage.texture_layout(),
                write: usage.is_write(),
                buffer_access: usage.buffer_access(),
            }),
        }
    }
    merged
}

fn combine_access(a: BufferAccess, b: BufferAccess) -> BufferAccess {
    match (a, b) {
        (BufferAccess::None, other) | (other, BufferAccess::None) => other,
        (a, b) if a == b => a,
        _ => BufferAccess::ShaderReadWrite,
    }
}

struct BarrierPlan {
    per_pass: Vec<PassBarriers>,
    final_barriers: Vec<TextureBarrier>,
    /// Layout of each physical texture between frames
    end_layouts: Vec<TextureLayout>,
}

/// Precompute the barriers of one frame.
///
/// Each physical texture starts the frame in the layout it ends it in, so the
/// same barriers are valid every frame. A barrier is emitted when the layout
/// changes or when either side of the hazard writes.
fn plan_barriers(
    passes: &[RenderGraphPass],
    order: &[usize],
    resources: &ResourceTable,
    output: Option<&str>,
) -> BarrierPlan {
    let mut end_layouts = vec![TextureLayout::Undefined; resources.textures.len()];
    let mut end_access = vec![BufferAccess::None; resources.buffers.len()];
    for &pass_index in order {
        for use_ in merged_uses(&passes[pass_index]) {
            match use_.layout {
                Some(layout) => {
                    if let Some(slot) = resources.texture_slot(use_.name) {
                        end_layouts[slot] = layout;
                    }
                }
                None => {
                    if let Some(slot) = resources.buffer_slot(use_.name) {
                        end_access[slot] = use_.buffer_access;
                    }
                }
            }
        }
    }
    let output_slot = output.and_then(|output| resources.texture_slot(output));
    if let Some(slot) = output_slot {
        end_layouts[slot] = TextureLayout::TransferSrc;
    }

    let mut layouts = end_layouts.clone();
    // The previous frame may have written anything.
    let mut last_write = vec![true; resources.textures.len()];
    let mut accesses = end_access;
    let mut per_pass = Vec::with_capacity(order.len());
    for &pass_index in order {
        let mut barriers = PassBarriers::default();
        for use_ in merged_uses(&passes[pass_index]) {
            if let Some(required) = use_.layout {
                let Some(slot) = resources.texture_slot(use_.name) else {
                    continue;
                };
                let current = layouts[slot];
                if current != required || last_write[slot] || use_.write {
                    barriers.textures.push(TextureBarrier {
                        texture: resources.textures[slot].texture,
                        old_layout: current,
                        new_layout: required,
                    });
                }
                layouts[slot] = required;
                last_write[slot] = use_.write;
            } else if let Some(slot) = resources.buffer_slot(use_.name) {
                let previous = accesses[slot];
                if previous.is_write()
                    || (use_.buffer_access.is_write() && previous != BufferAccess::None)
                {
                    barriers.buffers.push(BufferBarrier {
                        buffer: resources.buffers[slot].buffer,
                        src_access: previous,
                        dst_access: use_.buffer_access,
                    });
                }
                accesses[slot] = use_.buffer_access;
            }
        }
        per_pass.push(barriers);
    }

    let mut final_barriers = Vec::new();
    if let Some(slot) = output_slot {
        if layouts[slot] != TextureLayout::TransferSrc || last_write[slot] {
            final_barriers.push(TextureBarrier {
                texture: resources.textures[slot].texture,
                old_layout: layouts[slot],
                new_layout: TextureLayout::TransferSrc,
            });
        }
    }

    BarrierPlan {
        per_pass,
        final_barriers,
        end_layouts,
    }
}

/// Move freshly created textures into their between-frames layout.
fn initial_transitions(
    resources: &ResourceTable,
    end_layouts: &[TextureLayout],
    slots: impl IntoIterator<Item = usize>,
) -> Vec<TextureBarrier> {
    slots
        .into_iter()
        .filter_map(|slot| {
            let physical = resources.textures.get(slot)?;
            let layout = *end_layouts.get(slot)?;
            Some(TextureBarrier {
                texture: physical.texture,
                old_layout: TextureLayout::Undefined,
                new_layout: layout,
            })
        })
        .collect()
}

/// Split the execution order where the queue changes.
fn plan_batches(
    passes: &[RenderGraphPass],
    order: &[usize],
    use_async_compute: bool,
) -> Vec<(QueueType, Range<usize>)> {
    let queue_of = |pass: &RenderGraphPass| {
        if use_async_compute && pass.pipeline_type() == PipelineType::Compute {
            QueueType::Compute
        } else {
            QueueType::Graphics
        }
    };
    let mut batches: Vec<(QueueType, Range<usize>)> = Vec::new();
    for (position, &pass_index) in order.iter().enumerate() {
        let queue = queue_of(&passes[pass_index]);
        match batches.last_mut() {
            Some((last_queue, range)) if *last_queue == queue => range.end = position + 1,
            _ => batches.push((queue, position..position + 1)),
        }
    }
    batches
}

fn run_init(
    backend: &mut dyn GraphicsBackend,
    pass: &mut RenderGraphPass,
    objects: &mut PassObjects,
) -> RenderGraphResult<()> {
    let (name, _, callbacks) = pass.split_mut();
    let Some(init) = callbacks.init.as_mut() else {
        return Ok(());
    };
    log::debug!("Render graph: init {}", name);
    let mut ctx = PassInitContext {
        backend,
        pass: name,
        render_pass: objects.render_pass,
        extent: objects.extent,
        bindings: &mut objects.bindings,
    };
    init(&mut ctx).map_err(|err| {
        log::error!("Init callback of pass {} failed: {}", name, err);
        err
    })
}

fn run_descriptor_update(
    backend: &mut dyn GraphicsBackend,
    pass: &mut RenderGraphPass,
    objects: &mut PassObjects,
    resources: &ResourceTable,
    pool: DescriptorPoolHandle,
) -> RenderGraphResult<()> {
    let (name, declarations, callbacks) = pass.split_mut();
    let Some(update) = callbacks.descriptor_update.as_mut() else {
        return Ok(());
    };
    let mut ctx = DescriptorUpdateContext {
        backend,
        pass: name,
        declarations,
        resources,
        pool,
        bindings: &mut objects.bindings,
    };
    update(&mut ctx).map_err(|err| {
        log::error!("Descriptor update of pass {} failed: {}", name, err);
        err
    })
}

fn record_pass(
    backend: &mut dyn GraphicsBackend,
    cmd: CommandBufferHandle,
    pass: &mut RenderGraphPass,
    objects: &PassObjects,
    barriers: &PassBarriers,
    resources: &ResourceTable,
) -> RenderGraphResult<()> {
    if !barriers.is_empty() {
        backend.cmd_pipeline_barrier(cmd, &barriers.textures, &barriers.buffers);
    }

    let in_render_pass = match (objects.render_pass, objects.framebuffer) {
        (Some(render_pass), Some(framebuffer)) => {
            backend.cmd_begin_render_pass(cmd, render_pass, framebuffer, &objects.clear_values);
            true
        }
        _ => false,
    };

    let bound_pipeline = objects.bindings.pipelines.first().copied();
    if let Some((pipeline, bind_point)) = bound_pipeline {
        backend.cmd_bind_pipeline(cmd, bind_point, pipeline);
        if !objects.bindings.descriptor_sets.is_empty() {
            backend.cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                pipeline,
                0,
                &objects.bindings.descriptor_sets,
            );
        }
    }

    let (name, declarations, callbacks) = pass.split_mut();
    let result = match callbacks.render.as_mut() {
        Some(render) => {
            let mut ctx = PassRenderContext {
                backend: &mut *backend,
                cmd,
                pass: name,
                declarations,
                resources,
                bindings: &objects.bindings,
                extent: objects.extent,
                bound_pipeline: bound_pipeline.map(|(pipeline, _)| pipeline),
            };
            render(&mut ctx)
        }
        None => Ok(()),
    };

    if in_render_pass {
        backend.cmd_end_render_pass(cmd);
    }
    result.map_err(|err| {
        log::error!("Render callback of pass {} failed: {}", name, err);
        err
    })
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::render_graph::{
        AttachmentLoad, BufferResourceDesc, ResourceSize, StorageAccess, TextureResourceDesc,
    };

    fn screen(format: TextureFormat) -> TextureResourceDesc {
        TextureResourceDesc::new(ResourceSize::named("screen"), format)
    }

    fn chain_graph(config: RenderGraphConfig) -> RenderGraph {
        let mut graph = RenderGraph::with_config(config);
        graph.add_named_size("screen", Extent3d::new_2d(8, 8)).unwrap();
        let passes = [
            RenderGraphPass::new("a", PipelineType::Graphics).color_output(
                "t0",
                screen(TextureFormat::Rgba8Unorm),
                AttachmentLoad::clear_color(Vec4::ONE),
            ),
            RenderGraphPass::new("b", PipelineType::Graphics)
                .sample_texture("t0")
                .color_output("t1", screen(TextureFormat::Rgba8Unorm), AttachmentLoad::DontCare),
            RenderGraphPass::new("c", PipelineType::Graphics)
                .sample_texture("t1")
                .color_output("t2", screen(TextureFormat::Rgba8Unorm), AttachmentLoad::DontCare),
            RenderGraphPass::new("d", PipelineType::Graphics)
                .sample_texture("t2")
                .color_output("out", screen(TextureFormat::Rgba8Unorm), AttachmentLoad::DontCare),
        ];
        for pass in passes {
            graph.add_render_pass(pass).unwrap();
        }
        graph.set_render_graph_output("out").unwrap();
        graph
    }

    #[test]
    fn test_configuration_rejected_after_build() {
        let mut backend = HeadlessBackend::new();
        let mut graph = chain_graph(RenderGraphConfig::default());
        graph.build(&mut backend, true).unwrap();
        assert_eq!(graph.state(), GraphState::Built);

        let err = graph
            .add_named_size("shadow", Extent3d::new_2d(4, 4))
            .unwrap_err();
        assert!(matches!(err, RenderGraphError::InvalidState { .. }));
        assert!(matches!(
            graph.build(&mut backend, true),
            Err(RenderGraphError::InvalidState { .. })
        ));
        graph.destroy(&mut backend);
    }

    #[test]
    fn test_output_set_twice() {
        let mut graph = RenderGraph::new();
        graph.set_render_graph_output("a").unwrap();
        graph.set_render_graph_output("a").unwrap();
        assert_eq!(
            graph.set_render_graph_output("b"),
            Err(RenderGraphError::MultipleOutputs {
                existing: "a".into(),
                requested: "b".into()
            })
        );
    }

    #[test]
    fn test_frames_replay_the_same_barriers() {
        let mut backend = HeadlessBackend::new();
        let mut graph = chain_graph(RenderGraphConfig::default());
        graph.build(&mut backend, true).unwrap();
        for _ in 0..3 {
            let done = graph.execute(&mut backend, &[]).unwrap();
            let output = graph.output_texture().unwrap();
            assert_eq!(backend.texture_layout(output), Some(TextureLayout::TransferSrc));
            backend.present(output, &[done]).unwrap();
        }
        assert_eq!(backend.presented_frames().len(), 3);
        assert_eq!(graph.frame_index(), 3);
        graph.destroy(&mut backend);
    }

    #[test]
    fn test_physical_aliasing_shares_textures() {
        let mut backend = HeadlessBackend::new();
        let config = RenderGraphConfig {
            physical_aliasing: true,
            ..Default::default()
        };
        let mut graph = chain_graph(config);
        graph.build(&mut backend, true).unwrap();
        // t0 [0,1] and t2 [2,3] are disjoint.
        assert_eq!(graph.physical_slot("t0"), graph.physical_slot("t2"));
        assert_eq!(graph.physical_texture_count(), 3);
        assert_eq!(graph.texture("t0"), graph.texture("t2"));

        graph.execute(&mut backend, &[]).unwrap();
        graph.execute(&mut backend, &[]).unwrap();
        graph.destroy(&mut backend);

        let mut plain = chain_graph(RenderGraphConfig::default());
        plain.build(&mut backend, true).unwrap();
        assert_eq!(plain.physical_texture_count(), 4);
        plain.destroy(&mut backend);
    }

    #[test]
    fn test_failed_build_releases_everything() {
        let mut backend = HeadlessBackend::new().with_texture_limit(2);
        let mut graph = chain_graph(RenderGraphConfig::default());
        let err = graph.build(&mut backend, true).unwrap_err();
        assert_eq!(err, RenderGraphError::Backend(crate::backend::BackendError::OutOfMemory));
        assert_eq!(graph.state(), GraphState::Configuring);
        assert_eq!(backend.live_object_count(), 0);
        assert!(graph.execution_order().is_empty());
    }

    #[test]
    fn test_destroy_returns_to_configuring() {
        let mut backend = HeadlessBackend::new();
        let mut graph = chain_graph(RenderGraphConfig::default());
        graph.build(&mut backend, false).unwrap();
        assert!(backend.live_object_count() > 0);
        graph.destroy(&mut backend);
        assert_eq!(backend.live_object_count(), 0);
        assert_eq!(graph.state(), GraphState::Configuring);
        assert_eq!(graph.passes().len(), 4);

        // Configuring again is allowed, and so is another build.
        graph.add_named_size("shadow", Extent3d::new_2d(2, 2)).unwrap();
        graph.build(&mut backend, true).unwrap();
        graph.destroy(&mut backend);
    }

    #[test]
    fn test_async_compute_batches() {
        let buffer = BufferResourceDesc::new(64);
        let build_graph = |async_compute: bool| {
            let mut graph = RenderGraph::with_config(RenderGraphConfig {
                async_compute,
                ..Default::default()
            });
            graph.add_named_size("screen", Extent3d::new_2d(4, 4)).unwrap();
            graph
                .add_render_pass(
                    RenderGraphPass::new("cull", PipelineType::Compute).storage_buffer(
                        "visible",
                        StorageAccess::Write,
                        Some(buffer),
                    ),
                )
                .unwrap();
            graph
                .add_render_pass(
                    RenderGraphPass::new("draw", PipelineType::Graphics)
                        .read_storage_buffer("visible")
                        .color_output(
                            "color",
                            screen(TextureFormat::Rgba8Unorm),
                            AttachmentLoad::clear_color(Vec4::ZERO),
                        ),
                )
                .unwrap();
            graph.set_render_graph_output("color").unwrap();
            graph
        };

        let mut backend = HeadlessBackend::new();
        let mut graph = build_graph(true);
        graph.build(&mut backend, true).unwrap();
        assert_eq!(
            graph.submission_queues(),
            vec![QueueType::Compute, QueueType::Graphics]
        );
        let done = graph.execute(&mut backend, &[]).unwrap();
        assert!(backend.is_semaphore_signaled(done));
        assert_eq!(backend.stats().submits, 2);
        graph.destroy(&mut backend);

        let mut no_compute_queue = HeadlessBackend::new().with_compute_queue(false);
        let mut graph = build_graph(true);
        graph.build(&mut no_compute_queue, true).unwrap();
        assert_eq!(graph.submission_queues(), vec![QueueType::Graphics]);
        graph.destroy(&mut no_compute_queue);
    }

    #[test]
    fn test_barrier_plan_for_a_chain() {
        let mut backend = HeadlessBackend::new();
        let mut graph = chain_graph(RenderGraphConfig::default());
        graph.build(&mut backend, true).unwrap();

        let t0 = graph.texture("t0").unwrap();
        let built = &graph.built;
        // Pass b samples what pass a rendered.
        assert!(built.barriers[1].textures.contains(&TextureBarrier {
            texture: t0,
            old_layout: TextureLayout::ColorAttachment,
            new_layout: TextureLayout::ShaderReadOnly,
        }));
        assert_eq!(built.final_barriers.len(), 1);
        assert_eq!(built.final_barriers[0].new_layout, TextureLayout::TransferSrc);
        assert_eq!(built.initial_transitions.len(), 4);
        graph.destroy(&mut backend);
    }
}
