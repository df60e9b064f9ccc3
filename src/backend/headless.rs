//! Headless software backend.
//!
//! Implements [`GraphicsBackend`] entirely on the CPU. Textures are stored as
//! linear `f32` RGBA texels, command buffers record a list of commands that is
//! replayed on [`submit`](GraphicsBackend::submit), and [`present`](GraphicsBackend::present)
//! captures the texture into an [`image::RgbaImage`]. Shaders never run: draws
//! and dispatches are validated and counted, while clears, blits, resolves and
//! layout transitions have their full effect.
//!
//! The backend is strict about the things a GPU validation layer would catch:
//! layout transitions whose `old_layout` disagrees with the tracked layout,
//! attachments used in the wrong layout, waits on unsignaled semaphores and
//! commands recorded outside `begin`/`end`.

use std::collections::HashMap;

use glam::Vec4;
use image::{Rgba, RgbaImage};

use super::traits::*;
use super::types::*;

/// Counters collected while executing submitted work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submits: usize,
    pub render_passes: usize,
    pub draws: usize,
    pub dispatches: usize,
    pub texture_barriers: usize,
    pub buffer_barriers: usize,
    pub blits: usize,
    pub resolves: usize,
    pub presents: usize,
}

#[derive(Debug)]
struct TextureRecord {
    desc: TextureDescriptor,
    texels: Vec<[f32; 4]>,
    layout: TextureLayout,
}

#[derive(Debug)]
struct BufferRecord {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

#[derive(Debug)]
struct FramebufferRecord {
    render_pass: RenderPassHandle,
    attachments: Vec<TextureViewHandle>,
}

#[derive(Debug)]
struct PipelineRecord {
    bind_point: PipelineBindPoint,
    set_layouts: Vec<DescriptorSetLayoutHandle>,
    push_constant_size: u32,
}

#[derive(Debug)]
struct DescriptorPoolRecord {
    max_sets: u32,
    sets: Vec<DescriptorSetHandle>,
}

#[derive(Debug)]
struct DescriptorSetRecord {
    layout: DescriptorSetLayoutHandle,
    writes: Vec<DescriptorWrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandBufferState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug, Clone)]
enum Command {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    },
    BindDescriptorSets {
        pipeline: PipelineHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
    },
    PushConstants {
        pipeline: PipelineHandle,
        offset: u32,
        size: u32,
    },
    BindVertexBuffer(BufferHandle),
    BindIndexBuffer(BufferHandle),
    Draw {
        indexed: bool,
    },
    Dispatch,
    Barrier {
        textures: Vec<TextureBarrier>,
        buffers: Vec<BufferBarrier>,
    },
    Blit {
        src: TextureHandle,
        dst: TextureHandle,
        filter: FilterMode,
    },
    Resolve {
        src: TextureHandle,
        dst: TextureHandle,
    },
}

#[derive(Debug)]
struct CommandBufferRecord {
    queue: QueueType,
    state: CommandBufferState,
    commands: Vec<Command>,
    recording_error: Option<BackendError>,
}

/// State tracked while replaying one command buffer.
#[derive(Default)]
struct ReplayState {
    framebuffer: Option<FramebufferHandle>,
    graphics_pipeline: Option<PipelineHandle>,
    compute_pipeline: Option<PipelineHandle>,
    index_buffer: Option<BufferHandle>,
}

/// CPU implementation of [`GraphicsBackend`].
#[derive(Debug)]
pub struct HeadlessBackend {
    next_handle: u64,
    compute_queue: bool,
    texture_limit: Option<usize>,
    pending_api_error: Option<i32>,

    textures: HashMap<u64, TextureRecord>,
    views: HashMap<u64, TextureHandle>,
    buffers: HashMap<u64, BufferRecord>,
    render_passes: HashMap<u64, RenderPassDescriptor>,
    framebuffers: HashMap<u64, FramebufferRecord>,
    set_layouts: HashMap<u64, DescriptorSetLayoutDescriptor>,
    pipelines: HashMap<u64, PipelineRecord>,
    descriptor_pools: HashMap<u64, DescriptorPoolRecord>,
    descriptor_sets: HashMap<u64, DescriptorSetRecord>,
    semaphores: HashMap<u64, bool>,
    command_buffers: HashMap<u64, CommandBufferRecord>,

    presented: Vec<RgbaImage>,
    stats: HeadlessStats,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    /// Create a backend with a graphics queue and a dedicated compute queue.
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            compute_queue: true,
            texture_limit: None,
            pending_api_error: None,
            textures: HashMap::new(),
            views: HashMap::new(),
            buffers: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            set_layouts: HashMap::new(),
            pipelines: HashMap::new(),
            descriptor_pools: HashMap::new(),
            descriptor_sets: HashMap::new(),
            semaphores: HashMap::new(),
            command_buffers: HashMap::new(),
            presented: Vec::new(),
            stats: HeadlessStats::default(),
        }
    }

    pub fn with_compute_queue(mut self, enabled: bool) -> Self {
        self.compute_queue = enabled;
        self
    }

    /// Fail texture creation with `OutOfMemory` once `limit` textures are alive.
    pub fn with_texture_limit(mut self, limit: usize) -> Self {
        self.texture_limit = Some(limit);
        self
    }

    /// Make the next submission fail with a native API error code.
    pub fn inject_api_error(&mut self, code: i32) {
        self.pending_api_error = Some(code);
    }

    /// Signal a semaphore from outside any submission (e.g. an image-acquire semaphore).
    pub fn signal_semaphore(&mut self, semaphore: SemaphoreHandle) -> BackendResult<()> {
        match self.semaphores.get_mut(&semaphore.raw()) {
            Some(signaled) => {
                *signaled = true;
                Ok(())
            }
            None => Err(invalid("semaphore", semaphore.raw())),
        }
    }

    pub fn is_semaphore_signaled(&self, semaphore: SemaphoreHandle) -> bool {
        self.semaphores
            .get(&semaphore.raw())
            .copied()
            .unwrap_or(false)
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Frames captured by `present`, oldest first.
    pub fn presented_frames(&self) -> &[RgbaImage] {
        &self.presented
    }

    pub fn take_presented_frames(&mut self) -> Vec<RgbaImage> {
        std::mem::take(&mut self.presented)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of backend objects still alive, command buffers included.
    pub fn live_object_count(&self) -> usize {
        self.textures.len()
            + self.views.len()
            + self.buffers.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.set_layouts.len()
            + self.pipelines.len()
            + self.descriptor_pools.len()
            + self.descriptor_sets.len()
            + self.semaphores.len()
            + self.command_buffers.len()
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.raw()).map(|t| &t.desc)
    }

    pub fn texture_layout(&self, texture: TextureHandle) -> Option<TextureLayout> {
        self.textures.get(&texture.raw()).map(|t| t.layout)
    }

    /// Texels of the texture in row-major order.
    pub fn read_texture(&self, texture: TextureHandle) -> Option<&[[f32; 4]]> {
        self.textures.get(&texture.raw()).map(|t| t.texels.as_slice())
    }

    /// Overwrite the texels of a texture from the host.
    pub fn upload_texture(&mut self, texture: TextureHandle, texels: &[[f32; 4]]) -> BackendResult<()> {
        let record = self
            .textures
            .get_mut(&texture.raw())
            .ok_or_else(|| invalid("texture", texture.raw()))?;
        if record.texels.len() != texels.len() {
            return Err(BackendError::InvalidCommand(format!(
                "upload of {} texels into texture {} holding {}",
                texels.len(),
                texture.raw(),
                record.texels.len()
            )));
        }
        record.texels.copy_from_slice(texels);
        Ok(())
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.raw()).map(|b| b.data.as_slice())
    }

    /// Descriptor writes applied to a set, in write order.
    pub fn descriptor_writes(&self, set: DescriptorSetHandle) -> Option<&[DescriptorWrite]> {
        self.descriptor_sets.get(&set.raw()).map(|s| s.writes.as_slice())
    }

    fn allocate_handle(&mut self) -> u64 {
        let raw = self.next_handle;
        self.next_handle += 1;
        raw
    }

    fn view_texture(&self, view: TextureViewHandle) -> BackendResult<TextureHandle> {
        self.views
            .get(&view.raw())
            .copied()
            .ok_or_else(|| invalid("texture view", view.raw()))
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: Command) {
        match self.command_buffers.get_mut(&cmd.raw()) {
            Some(record) if record.state == CommandBufferState::Recording => {
                record.commands.push(command);
            }
            Some(record) => {
                log::error!(
                    "HeadlessBackend: command {:?} recorded into command buffer {} which is not recording",
                    command,
                    cmd.raw()
                );
                record
                    .recording_error
                    .get_or_insert(BackendError::InvalidCommand(format!(
                        "command buffer {} is not recording",
                        cmd.raw()
                    )));
            }
            None => {
                log::error!(
                    "HeadlessBackend: command recorded into unknown command buffer {}",
                    cmd.raw()
                );
            }
        }
    }

    fn consume_waits(&mut self, wait: &[SemaphoreHandle]) -> BackendResult<()> {
        for semaphore in wait {
            match self.semaphores.get(&semaphore.raw()) {
                Some(true) => {}
                Some(false) => return Err(BackendError::SemaphoreNotSignaled(semaphore.raw())),
                None => return Err(invalid("semaphore", semaphore.raw())),
            }
        }
        for semaphore in wait {
            self.semaphores.insert(semaphore.raw(), false);
        }
        Ok(())
    }

    fn replay(&mut self, commands: &[Command]) -> BackendResult<()> {
        let mut state = ReplayState::default();
        for command in commands {
            log::trace!("HeadlessBackend: executing {:?}", command);
            match command {
                Command::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    clear_values,
                } => {
                    if state.framebuffer.is_some() {
                        return Err(BackendError::InvalidCommand(
                            "render pass begun inside another render pass".into(),
                        ));
                    }
                    self.begin_render_pass(*render_pass, *framebuffer, clear_values)?;
                    state.framebuffer = Some(*framebuffer);
                    self.stats.render_passes += 1;
                }
                Command::EndRenderPass => {
                    if state.framebuffer.take().is_none() {
                        return Err(BackendError::InvalidCommand(
                            "render pass ended without being begun".into(),
                        ));
                    }
                }
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => {
                    let record = self
                        .pipelines
                        .get(&pipeline.raw())
                        .ok_or_else(|| invalid("pipeline", pipeline.raw()))?;
                    if record.bind_point != *bind_point {
                        return Err(BackendError::InvalidCommand(format!(
                            "pipeline {} bound at {:?} but created for {:?}",
                            pipeline.raw(),
                            bind_point,
                            record.bind_point
                        )));
                    }
                    match bind_point {
                        PipelineBindPoint::Graphics => state.graphics_pipeline = Some(*pipeline),
                        PipelineBindPoint::Compute => state.compute_pipeline = Some(*pipeline),
                    }
                }
                Command::BindDescriptorSets {
                    pipeline,
                    first_set,
                    sets,
                } => {
                    let record = self
                        .pipelines
                        .get(&pipeline.raw())
                        .ok_or_else(|| invalid("pipeline", pipeline.raw()))?;
                    for (index, set) in sets.iter().enumerate() {
                        let set_record = self
                            .descriptor_sets
                            .get(&set.raw())
                            .ok_or_else(|| invalid("descriptor set", set.raw()))?;
                        let slot = *first_set as usize + index;
                        if record.set_layouts.get(slot) != Some(&set_record.layout) {
                            return Err(BackendError::InvalidCommand(format!(
                                "descriptor set {} is incompatible with set {} of pipeline {}",
                                set.raw(),
                                slot,
                                pipeline.raw()
                            )));
                        }
                    }
                }
                Command::PushConstants {
                    pipeline,
                    offset,
                    size,
                } => {
                    let record = self
                        .pipelines
                        .get(&pipeline.raw())
                        .ok_or_else(|| invalid("pipeline", pipeline.raw()))?;
                    if offset + size > record.push_constant_size {
                        return Err(BackendError::InvalidCommand(format!(
                            "push constants [{}, {}) exceed the {} byte range of pipeline {}",
                            offset,
                            offset + size,
                            record.push_constant_size,
                            pipeline.raw()
                        )));
                    }
                }
                Command::BindVertexBuffer(buffer) => {
                    if !self.buffers.contains_key(&buffer.raw()) {
                        return Err(invalid("buffer", buffer.raw()));
                    }
                }
                Command::BindIndexBuffer(buffer) => {
                    if !self.buffers.contains_key(&buffer.raw()) {
                        return Err(invalid("buffer", buffer.raw()));
                    }
                    state.index_buffer = Some(*buffer);
                }
                Command::Draw { indexed } => {
                    if state.framebuffer.is_none() {
                        return Err(BackendError::InvalidCommand(
                            "draw outside of a render pass".into(),
                        ));
                    }
                    if state.graphics_pipeline.is_none() {
                        return Err(BackendError::InvalidCommand(
                            "draw without a bound graphics pipeline".into(),
                        ));
                    }
                    if *indexed && state.index_buffer.is_none() {
                        return Err(BackendError::InvalidCommand(
                            "indexed draw without an index buffer".into(),
                        ));
                    }
                    self.stats.draws += 1;
                }
                Command::Dispatch => {
                    if state.framebuffer.is_some() {
                        return Err(BackendError::InvalidCommand(
                            "dispatch inside a render pass".into(),
                        ));
                    }
                    if state.compute_pipeline.is_none() {
                        return Err(BackendError::InvalidCommand(
                            "dispatch without a bound compute pipeline".into(),
                        ));
                    }
                    self.stats.dispatches += 1;
                }
                Command::Barrier { textures, buffers } => {
                    for barrier in textures {
                        let record = self
                            .textures
                            .get_mut(&barrier.texture.raw())
                            .ok_or_else(|| invalid("texture", barrier.texture.raw()))?;
                        if barrier.old_layout != TextureLayout::Undefined
                            && barrier.old_layout != record.layout
                        {
                            return Err(BackendError::InvalidLayoutTransition {
                                texture: barrier.texture.raw(),
                                expected: barrier.old_layout,
                                found: record.layout,
                            });
                        }
                        record.layout = barrier.new_layout;
                    }
                    for barrier in buffers {
                        if !self.buffers.contains_key(&barrier.buffer.raw()) {
                            return Err(invalid("buffer", barrier.buffer.raw()));
                        }
                    }
                    self.stats.texture_barriers += textures.len();
                    self.stats.buffer_barriers += buffers.len();
                }
                Command::Blit { src, dst, filter } => {
                    self.blit(*src, *dst, *filter)?;
                    self.stats.blits += 1;
                }
                Command::Resolve { src, dst } => {
                    self.resolve(*src, *dst)?;
                    self.stats.resolves += 1;
                }
            }
        }
        if state.framebuffer.is_some() {
            return Err(BackendError::InvalidCommand(
                "command buffer ended inside a render pass".into(),
            ));
        }
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> BackendResult<()> {
        let fb = self
            .framebuffers
            .get(&framebuffer.raw())
            .ok_or_else(|| invalid("framebuffer", framebuffer.raw()))?;
        if fb.render_pass != render_pass {
            return Err(BackendError::InvalidCommand(format!(
                "framebuffer {} was not created for render pass {}",
                framebuffer.raw(),
                render_pass.raw()
            )));
        }
        let desc = self
            .render_passes
            .get(&render_pass.raw())
            .ok_or_else(|| invalid("render pass", render_pass.raw()))?
            .clone();
        let attachments = fb.attachments.clone();

        let depth = desc
            .depth_stencil_attachment
            .iter()
            .map(|layout| (layout, TextureLayout::DepthStencilAttachment));
        let slots = desc
            .color_attachments
            .iter()
            .map(|layout| (layout, TextureLayout::ColorAttachment))
            .chain(depth);

        for (index, ((attachment, required), view)) in slots.zip(attachments).enumerate() {
            let texture = self.view_texture(view)?;
            let record = self
                .textures
                .get_mut(&texture.raw())
                .ok_or_else(|| invalid("texture", texture.raw()))?;
            let layout_ok = record.layout == required
                || (required == TextureLayout::DepthStencilAttachment
                    && record.layout == TextureLayout::DepthStencilReadOnly);
            if !layout_ok {
                return Err(BackendError::InvalidLayoutTransition {
                    texture: texture.raw(),
                    expected: required,
                    found: record.layout,
                });
            }
            if attachment.load_op == LoadOp::Clear {
                let texel = match clear_values.get(index) {
                    Some(ClearValue::Color(color)) => color.to_array(),
                    Some(ClearValue::DepthStencil { depth, stencil }) => {
                        [*depth, *stencil as f32, 0.0, 0.0]
                    }
                    None => {
                        return Err(BackendError::InvalidCommand(format!(
                            "missing clear value for attachment {index}"
                        )))
                    }
                };
                record.texels.fill(texel);
            }
        }
        Ok(())
    }

    fn transfer_pair(
        &self,
        src: TextureHandle,
        dst: TextureHandle,
    ) -> BackendResult<(&TextureRecord, &TextureRecord)> {
        let src_record = self
            .textures
            .get(&src.raw())
            .ok_or_else(|| invalid("texture", src.raw()))?;
        let dst_record = self
            .textures
            .get(&dst.raw())
            .ok_or_else(|| invalid("texture", dst.raw()))?;
        if src_record.layout != TextureLayout::TransferSrc {
            return Err(BackendError::InvalidLayoutTransition {
                texture: src.raw(),
                expected: TextureLayout::TransferSrc,
                found: src_record.layout,
            });
        }
        if dst_record.layout != TextureLayout::TransferDst {
            return Err(BackendError::InvalidLayoutTransition {
                texture: dst.raw(),
                expected: TextureLayout::TransferDst,
                found: dst_record.layout,
            });
        }
        Ok((src_record, dst_record))
    }

    fn blit(&mut self, src: TextureHandle, dst: TextureHandle, filter: FilterMode) -> BackendResult<()> {
        let (src_record, dst_record) = self.transfer_pair(src, dst)?;
        let src_size = src_record.desc.size;
        let dst_size = dst_record.desc.size;
        let mut out = Vec::with_capacity(dst_size.texel_count());
        for z in 0..dst_size.depth.max(1) {
            let sz = (z * src_size.depth.max(1) / dst_size.depth.max(1)).min(src_size.depth.max(1) - 1);
            for y in 0..dst_size.height {
                for x in 0..dst_size.width {
                    let u = (x as f32 + 0.5) / dst_size.width as f32;
                    let v = (y as f32 + 0.5) / dst_size.height as f32;
                    out.push(sample(&src_record.texels, src_size, sz, u, v, filter));
                }
            }
        }
        if let Some(record) = self.textures.get_mut(&dst.raw()) {
            record.texels = out;
        }
        Ok(())
    }

    fn resolve(&mut self, src: TextureHandle, dst: TextureHandle) -> BackendResult<()> {
        let (src_record, dst_record) = self.transfer_pair(src, dst)?;
        if src_record.desc.size != dst_record.desc.size {
            return Err(BackendError::InvalidCommand(format!(
                "resolve from {:?} into {:?}",
                src_record.desc.size, dst_record.desc.size
            )));
        }
        if dst_record.desc.samples != 1 {
            return Err(BackendError::InvalidCommand(format!(
                "resolve target {} is multisampled",
                dst.raw()
            )));
        }
        // One stored sample per texel, so resolving is a copy.
        let texels = src_record.texels.clone();
        if let Some(record) = self.textures.get_mut(&dst.raw()) {
            record.texels = texels;
        }
        Ok(())
    }
}

fn invalid(kind: &'static str, raw: u64) -> BackendError {
    BackendError::InvalidHandle { kind, raw }
}

fn texel_at(texels: &[[f32; 4]], size: Extent3d, x: u32, y: u32, z: u32) -> Vec4 {
    let index = ((z * size.height + y) * size.width + x) as usize;
    Vec4::from_array(texels[index])
}

fn sample(texels: &[[f32; 4]], size: Extent3d, z: u32, u: f32, v: f32, filter: FilterMode) -> [f32; 4] {
    let max_x = size.width - 1;
    let max_y = size.height - 1;
    match filter {
        FilterMode::Nearest => {
            let x = ((u * size.width as f32) as u32).min(max_x);
            let y = ((v * size.height as f32) as u32).min(max_y);
            texel_at(texels, size, x, y, z).to_array()
        }
        FilterMode::Linear => {
            let fx = (u * size.width as f32 - 0.5).max(0.0);
            let fy = (v * size.height as f32 - 0.5).max(0.0);
            let x0 = (fx as u32).min(max_x);
            let y0 = (fy as u32).min(max_y);
            let x1 = (x0 + 1).min(max_x);
            let y1 = (y0 + 1).min(max_y);
            let tx = fx - x0 as f32;
            let ty = fy - y0 as f32;
            let top = texel_at(texels, size, x0, y0, z).lerp(texel_at(texels, size, x1, y0, z), tx);
            let bottom = texel_at(texels, size, x0, y1, z).lerp(texel_at(texels, size, x1, y1, z), tx);
            top.lerp(bottom, ty).to_array()
        }
    }
}

fn linear_to_srgb(value: f32) -> f32 {
    if value <= 0.003_130_8 {
        value * 12.92
    } else {
        1.055 * value.powf(1.0 / 2.4) - 0.055
    }
}

fn to_unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn capture(record: &TextureRecord) -> RgbaImage {
    let size = record.desc.size;
    let srgb = matches!(
        record.desc.format,
        TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
    );
    RgbaImage::from_fn(size.width, size.height, |x, y| {
        let texel = record.texels[(y * size.width + x) as usize];
        let encode = |c: f32| if srgb { to_unorm8(linear_to_srgb(c)) } else { to_unorm8(c) };
        Rgba([
            encode(texel[0]),
            encode(texel[1]),
            encode(texel[2]),
            to_unorm8(texel[3]),
        ])
    })
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &str {
        "Headless"
    }

    fn has_compute_queue(&self) -> bool {
        self.compute_queue
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}x{}, {:?})",
            desc.label,
            desc.size.width,
            desc.size.height,
            desc.size.depth,
            desc.format
        );
        if desc.size.width == 0 || desc.size.height == 0 || desc.size.depth == 0 {
            return Err(BackendError::ResourceCreationFailed {
                kind: "texture",
                reason: format!("zero sized extent {:?}", desc.size),
            });
        }
        if desc.usage.is_empty() {
            return Err(BackendError::ResourceCreationFailed {
                kind: "texture",
                reason: "no usage flags".into(),
            });
        }
        if let Some(limit) = self.texture_limit {
            if self.textures.len() >= limit {
                log::warn!("HeadlessBackend: texture limit of {} reached", limit);
                return Err(BackendError::OutOfMemory);
            }
        }
        let raw = self.allocate_handle();
        self.textures.insert(
            raw,
            TextureRecord {
                desc: desc.clone(),
                texels: vec![[0.0; 4]; desc.size.texel_count()],
                layout: TextureLayout::Undefined,
            },
        );
        Ok(TextureHandle::from_raw(raw))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture.raw()).is_none() {
            log::warn!("HeadlessBackend: destroying unknown texture {}", texture.raw());
        }
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.raw()) {
            return Err(invalid("texture", texture.raw()));
        }
        let raw = self.allocate_handle();
        self.views.insert(raw, texture);
        Ok(TextureViewHandle::from_raw(raw))
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        if self.views.remove(&view.raw()).is_none() {
            log::warn!("HeadlessBackend: destroying unknown texture view {}", view.raw());
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::ResourceCreationFailed {
                kind: "buffer",
                reason: "zero sized buffer".into(),
            });
        }
        let raw = self.allocate_handle();
        self.buffers.insert(
            raw,
            BufferRecord {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle::from_raw(raw))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.raw()).is_none() {
            log::warn!("HeadlessBackend: destroying unknown buffer {}", buffer.raw());
        }
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let record = self
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| invalid("buffer", buffer.raw()))?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(data.len())?))
            .filter(|range| range.end <= record.data.len());
        let Some(range) = range else {
            return Err(BackendError::InvalidCommand(format!(
                "write of {} bytes at offset {} overflows buffer {:?} of {} bytes",
                data.len(),
                offset,
                record.desc.label,
                record.desc.size
            )));
        };
        record.data[range].copy_from_slice(data);
        Ok(())
    }

    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> BackendResult<RenderPassHandle> {
        if desc.color_attachments.is_empty() && desc.depth_stencil_attachment.is_none() {
            return Err(BackendError::ResourceCreationFailed {
                kind: "render pass",
                reason: format!("{:?} has no attachments", desc.label),
            });
        }
        if let Some(depth) = &desc.depth_stencil_attachment {
            if !depth.format.is_depth_stencil() {
                return Err(BackendError::ResourceCreationFailed {
                    kind: "render pass",
                    reason: format!("{:?} is not a depth format", depth.format),
                });
            }
        }
        let raw = self.allocate_handle();
        self.render_passes.insert(raw, desc.clone());
        Ok(RenderPassHandle::from_raw(raw))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(&render_pass.raw());
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let pass = self
            .render_passes
            .get(&desc.render_pass.raw())
            .ok_or_else(|| invalid("render pass", desc.render_pass.raw()))?;
        let expected =
            pass.color_attachments.len() + usize::from(pass.depth_stencil_attachment.is_some());
        if desc.attachments.len() != expected {
            return Err(BackendError::ResourceCreationFailed {
                kind: "framebuffer",
                reason: format!(
                    "{} attachments given, render pass expects {}",
                    desc.attachments.len(),
                    expected
                ),
            });
        }
        for (index, view) in desc.attachments.iter().enumerate() {
            let texture = self.view_texture(*view)?;
            let record = self
                .textures
                .get(&texture.raw())
                .ok_or_else(|| invalid("texture", texture.raw()))?;
            let required = if index < pass.color_attachments.len() {
                TextureUsage::COLOR_ATTACHMENT
            } else {
                TextureUsage::DEPTH_STENCIL_ATTACHMENT
            };
            if !record.desc.usage.contains(required) {
                return Err(BackendError::ResourceCreationFailed {
                    kind: "framebuffer",
                    reason: format!(
                        "attachment {} ({:?}) lacks {:?} usage",
                        index, record.desc.label, required
                    ),
                });
            }
            if record.desc.size.width != desc.extent.width
                || record.desc.size.height != desc.extent.height
            {
                return Err(BackendError::ResourceCreationFailed {
                    kind: "framebuffer",
                    reason: format!(
                        "attachment {} is {:?}, framebuffer is {:?}",
                        index, record.desc.size, desc.extent
                    ),
                });
            }
        }
        let raw = self.allocate_handle();
        self.framebuffers.insert(
            raw,
            FramebufferRecord {
                render_pass: desc.render_pass,
                attachments: desc.attachments.clone(),
            },
        );
        Ok(FramebufferHandle::from_raw(raw))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.raw());
    }

    fn create_descriptor_set_layout(
        &mut self,
        desc: &DescriptorSetLayoutDescriptor,
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let raw = self.allocate_handle();
        self.set_layouts.insert(raw, desc.clone());
        Ok(DescriptorSetLayoutHandle::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        self.set_layouts.remove(&layout.raw());
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        let pass = self
            .render_passes
            .get(&desc.render_pass.raw())
            .ok_or_else(|| invalid("render pass", desc.render_pass.raw()))?;
        if !desc.color_targets.is_empty() && desc.color_targets.len() != pass.color_attachments.len()
        {
            return Err(BackendError::ResourceCreationFailed {
                kind: "graphics pipeline",
                reason: format!(
                    "{} color targets for a render pass with {} color attachments",
                    desc.color_targets.len(),
                    pass.color_attachments.len()
                ),
            });
        }
        if !desc
            .shaders
            .iter()
            .any(|shader| shader.stage.contains(ShaderStages::VERTEX))
        {
            return Err(BackendError::ResourceCreationFailed {
                kind: "graphics pipeline",
                reason: format!("{:?} has no vertex stage", desc.label),
            });
        }
        for layout in &desc.descriptor_set_layouts {
            if !self.set_layouts.contains_key(&layout.raw()) {
                return Err(invalid("descriptor set layout", layout.raw()));
            }
        }
        let raw = self.allocate_handle();
        self.pipelines.insert(
            raw,
            PipelineRecord {
                bind_point: PipelineBindPoint::Graphics,
                set_layouts: desc.descriptor_set_layouts.clone(),
                push_constant_size: desc.push_constant_size,
            },
        );
        Ok(PipelineHandle::from_raw(raw))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<PipelineHandle> {
        if !desc.shader.stage.contains(ShaderStages::COMPUTE) {
            return Err(BackendError::ResourceCreationFailed {
                kind: "compute pipeline",
                reason: format!("{:?} is not a compute shader", desc.label),
            });
        }
        for layout in &desc.descriptor_set_layouts {
            if !self.set_layouts.contains_key(&layout.raw()) {
                return Err(invalid("descriptor set layout", layout.raw()));
            }
        }
        let raw = self.allocate_handle();
        self.pipelines.insert(
            raw,
            PipelineRecord {
                bind_point: PipelineBindPoint::Compute,
                set_layouts: desc.descriptor_set_layouts.clone(),
                push_constant_size: desc.push_constant_size,
            },
        );
        Ok(PipelineHandle::from_raw(raw))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(&pipeline.raw());
    }

    fn create_descriptor_pool(&mut self, max_sets: u32) -> BackendResult<DescriptorPoolHandle> {
        let raw = self.allocate_handle();
        self.descriptor_pools.insert(
            raw,
            DescriptorPoolRecord {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(DescriptorPoolHandle::from_raw(raw))
    }

    fn destroy_descriptor_pool(&mut self, pool: DescriptorPoolHandle) {
        if let Some(record) = self.descriptor_pools.remove(&pool.raw()) {
            for set in record.sets {
                self.descriptor_sets.remove(&set.raw());
            }
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        if !self.set_layouts.contains_key(&layout.raw()) {
            return Err(invalid("descriptor set layout", layout.raw()));
        }
        let raw = self.next_handle;
        let record = self
            .descriptor_pools
            .get_mut(&pool.raw())
            .ok_or_else(|| invalid("descriptor pool", pool.raw()))?;
        if record.sets.len() >= record.max_sets as usize {
            return Err(BackendError::ResourceCreationFailed {
                kind: "descriptor set",
                reason: format!("descriptor pool {} exhausted", pool.raw()),
            });
        }
        record.sets.push(DescriptorSetHandle::from_raw(raw));
        self.next_handle += 1;
        self.descriptor_sets.insert(
            raw,
            DescriptorSetRecord {
                layout,
                writes: Vec::new(),
            },
        );
        Ok(DescriptorSetHandle::from_raw(raw))
    }

    fn free_descriptor_set(&mut self, pool: DescriptorPoolHandle, set: DescriptorSetHandle) {
        if let Some(record) = self.descriptor_pools.get_mut(&pool.raw()) {
            record.sets.retain(|s| *s != set);
        }
        self.descriptor_sets.remove(&set.raw());
    }

    fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<()> {
        let layout = self
            .descriptor_sets
            .get(&set.raw())
            .ok_or_else(|| invalid("descriptor set", set.raw()))?
            .layout;
        let layout_desc = self
            .set_layouts
            .get(&layout.raw())
            .ok_or_else(|| invalid("descriptor set layout", layout.raw()))?;
        for write in writes {
            let binding = layout_desc
                .bindings
                .iter()
                .find(|b| b.binding == write.binding)
                .ok_or_else(|| {
                    BackendError::InvalidCommand(format!(
                        "binding {} is not part of the set layout",
                        write.binding
                    ))
                })?;
            if binding.ty != write.ty || write.array_element >= binding.count.max(1) {
                return Err(BackendError::InvalidCommand(format!(
                    "write {:?} does not match binding {:?}",
                    write, binding
                )));
            }
            match write.resource {
                DescriptorResource::Texture(view) => {
                    self.view_texture(view)?;
                }
                DescriptorResource::Buffer { buffer, .. } => {
                    if !self.buffers.contains_key(&buffer.raw()) {
                        return Err(invalid("buffer", buffer.raw()));
                    }
                }
            }
        }
        if let Some(record) = self.descriptor_sets.get_mut(&set.raw()) {
            record.writes.extend_from_slice(writes);
        }
        Ok(())
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let raw = self.allocate_handle();
        self.semaphores.insert(raw, false);
        Ok(SemaphoreHandle::from_raw(raw))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.raw());
    }

    fn allocate_command_buffer(&mut self, queue: QueueType) -> BackendResult<CommandBufferHandle> {
        if queue == QueueType::Compute && !self.compute_queue {
            return Err(BackendError::UnsupportedQueue(queue));
        }
        let raw = self.allocate_handle();
        self.command_buffers.insert(
            raw,
            CommandBufferRecord {
                queue,
                state: CommandBufferState::Initial,
                commands: Vec::new(),
                recording_error: None,
            },
        );
        Ok(CommandBufferHandle::from_raw(raw))
    }

    fn free_command_buffer(&mut self, cmd: CommandBufferHandle) {
        self.command_buffers.remove(&cmd.raw());
    }

    fn begin_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let record = self
            .command_buffers
            .get_mut(&cmd.raw())
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        if record.state == CommandBufferState::Recording {
            return Err(BackendError::InvalidCommand(format!(
                "command buffer {} is already recording",
                cmd.raw()
            )));
        }
        record.state = CommandBufferState::Recording;
        record.commands.clear();
        record.recording_error = None;
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let record = self
            .command_buffers
            .get_mut(&cmd.raw())
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        if record.state != CommandBufferState::Recording {
            return Err(BackendError::InvalidCommand(format!(
                "command buffer {} is not recording",
                cmd.raw()
            )));
        }
        if let Some(error) = record.recording_error.take() {
            record.state = CommandBufferState::Initial;
            return Err(error);
        }
        record.state = CommandBufferState::Executable;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) {
        self.record(
            cmd,
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                clear_values: clear_values.to_vec(),
            },
        );
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        self.record(cmd, Command::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        self.record(
            cmd,
            Command::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        self.record(
            cmd,
            Command::BindDescriptorSets {
                pipeline,
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        _stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        self.record(
            cmd,
            Command::PushConstants {
                pipeline,
                offset,
                size: data.len() as u32,
            },
        );
    }

    fn cmd_bind_vertex_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        _slot: u32,
        buffer: BufferHandle,
        _offset: u64,
    ) {
        self.record(cmd, Command::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        buffer: BufferHandle,
        _offset: u64,
        _format: IndexFormat,
    ) {
        self.record(cmd, Command::BindIndexBuffer(buffer));
    }

    fn cmd_draw(
        &mut self,
        cmd: CommandBufferHandle,
        _vertices: std::ops::Range<u32>,
        _instances: std::ops::Range<u32>,
    ) {
        self.record(cmd, Command::Draw { indexed: false });
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandBufferHandle,
        _indices: std::ops::Range<u32>,
        _base_vertex: i32,
        _instances: std::ops::Range<u32>,
    ) {
        self.record(cmd, Command::Draw { indexed: true });
    }

    fn cmd_dispatch(&mut self, cmd: CommandBufferHandle, _x: u32, _y: u32, _z: u32) {
        self.record(cmd, Command::Dispatch);
    }

    fn cmd_pipeline_barrier(
        &mut self,
        cmd: CommandBufferHandle,
        textures: &[TextureBarrier],
        buffers: &[BufferBarrier],
    ) {
        if textures.is_empty() && buffers.is_empty() {
            return;
        }
        self.record(
            cmd,
            Command::Barrier {
                textures: textures.to_vec(),
                buffers: buffers.to_vec(),
            },
        );
    }

    fn cmd_blit_texture(
        &mut self,
        cmd: CommandBufferHandle,
        src: TextureHandle,
        dst: TextureHandle,
        filter: FilterMode,
    ) {
        self.record(cmd, Command::Blit { src, dst, filter });
    }

    fn cmd_resolve_texture(&mut self, cmd: CommandBufferHandle, src: TextureHandle, dst: TextureHandle) {
        self.record(cmd, Command::Resolve { src, dst });
    }

    fn submit(
        &mut self,
        queue: QueueType,
        cmd: CommandBufferHandle,
        wait: &[SemaphoreHandle],
        signal: Option<SemaphoreHandle>,
    ) -> BackendResult<()> {
        if let Some(code) = self.pending_api_error.take() {
            log::error!("HeadlessBackend: injected API error {} on submit", code);
            return Err(crate::api_error!(code));
        }
        if queue == QueueType::Compute && !self.compute_queue {
            return Err(BackendError::UnsupportedQueue(queue));
        }
        let record = self
            .command_buffers
            .get(&cmd.raw())
            .ok_or_else(|| invalid("command buffer", cmd.raw()))?;
        if record.state != CommandBufferState::Executable {
            return Err(BackendError::InvalidCommand(format!(
                "command buffer {} submitted while {:?}",
                cmd.raw(),
                record.state
            )));
        }
        if record.queue != queue {
            return Err(BackendError::InvalidCommand(format!(
                "command buffer {} allocated for {:?} submitted to {:?}",
                cmd.raw(),
                record.queue,
                queue
            )));
        }
        let commands = record.commands.clone();
        if let Some(signal) = signal {
            if !self.semaphores.contains_key(&signal.raw()) {
                return Err(invalid("semaphore", signal.raw()));
            }
        }
        self.consume_waits(wait)?;
        self.replay(&commands)?;
        self.stats.submits += 1;

        if let Some(signal) = signal {
            self.semaphores.insert(signal.raw(), true);
        }
        Ok(())
    }

    fn present(&mut self, texture: TextureHandle, wait: &[SemaphoreHandle]) -> BackendResult<()> {
        self.consume_waits(wait)?;
        let record = self
            .textures
            .get(&texture.raw())
            .ok_or_else(|| invalid("texture", texture.raw()))?;
        if !matches!(
            record.layout,
            TextureLayout::TransferSrc | TextureLayout::Present
        ) {
            return Err(BackendError::InvalidLayoutTransition {
                texture: texture.raw(),
                expected: TextureLayout::TransferSrc,
                found: record.layout,
            });
        }
        let frame = capture(record);
        log::debug!(
            "HeadlessBackend: presented {}x{} frame",
            frame.width(),
            frame.height()
        );
        self.presented.push(frame);
        self.stats.presents += 1;
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        // Submissions execute synchronously.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_target(backend: &mut HeadlessBackend, width: u32, height: u32) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor::new_2d(
                width,
                height,
                TextureFormat::Rgba8Unorm,
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::COPY_SRC,
            ))
            .unwrap()
    }

    fn single_color_pass(backend: &mut HeadlessBackend) -> RenderPassHandle {
        backend
            .create_render_pass(&RenderPassDescriptor {
                label: Some("test".into()),
                color_attachments: vec![AttachmentLayout {
                    format: TextureFormat::Rgba8Unorm,
                    samples: 1,
                    load_op: LoadOp::Clear,
                    store_op: StoreOp::Store,
                }],
                depth_stencil_attachment: None,
                input_attachment_count: 0,
            })
            .unwrap()
    }

    #[test]
    fn test_clear_and_present() {
        let mut backend = HeadlessBackend::new();
        let texture = color_target(&mut backend, 4, 2);
        let view = backend.create_texture_view(texture).unwrap();
        let pass = single_color_pass(&mut backend);
        let framebuffer = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                render_pass: pass,
                attachments: vec![view],
                extent: Extent3d::new_2d(4, 2),
            })
            .unwrap();
        let done = backend.create_semaphore().unwrap();
        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();

        backend.begin_command_buffer(cmd).unwrap();
        backend.cmd_pipeline_barrier(
            cmd,
            &[TextureBarrier {
                texture,
                old_layout: TextureLayout::Undefined,
                new_layout: TextureLayout::ColorAttachment,
            }],
            &[],
        );
        backend.cmd_begin_render_pass(
            cmd,
            pass,
            framebuffer,
            &[ClearValue::Color(Vec4::new(1.0, 0.0, 0.0, 1.0))],
        );
        backend.cmd_end_render_pass(cmd);
        backend.cmd_pipeline_barrier(
            cmd,
            &[TextureBarrier {
                texture,
                old_layout: TextureLayout::ColorAttachment,
                new_layout: TextureLayout::TransferSrc,
            }],
            &[],
        );
        backend.end_command_buffer(cmd).unwrap();
        backend
            .submit(QueueType::Graphics, cmd, &[], Some(done))
            .unwrap();
        assert!(backend.is_semaphore_signaled(done));

        backend.present(texture, &[done]).unwrap();
        assert!(!backend.is_semaphore_signaled(done));

        let frame = &backend.presented_frames()[0];
        assert_eq!(frame.dimensions(), (4, 2));
        assert!(frame.pixels().all(|p| p.0 == [255, 0, 0, 255]));
        assert_eq!(backend.stats().render_passes, 1);
    }

    #[test]
    fn test_mismatched_old_layout_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let texture = color_target(&mut backend, 2, 2);
        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.cmd_pipeline_barrier(
            cmd,
            &[TextureBarrier {
                texture,
                old_layout: TextureLayout::ShaderReadOnly,
                new_layout: TextureLayout::TransferSrc,
            }],
            &[],
        );
        backend.end_command_buffer(cmd).unwrap();

        let err = backend.submit(QueueType::Graphics, cmd, &[], None).unwrap_err();
        assert!(matches!(
            err,
            BackendError::InvalidLayoutTransition {
                found: TextureLayout::Undefined,
                ..
            }
        ));
    }

    #[test]
    fn test_wait_on_unsignaled_semaphore_fails() {
        let mut backend = HeadlessBackend::new();
        let semaphore = backend.create_semaphore().unwrap();
        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.end_command_buffer(cmd).unwrap();

        let err = backend
            .submit(QueueType::Graphics, cmd, &[semaphore], None)
            .unwrap_err();
        assert_eq!(err, BackendError::SemaphoreNotSignaled(semaphore.raw()));

        backend.signal_semaphore(semaphore).unwrap();
        backend
            .submit(QueueType::Graphics, cmd, &[semaphore], None)
            .unwrap();
    }

    #[test]
    fn test_recording_without_begin_surfaces_on_end() {
        let mut backend = HeadlessBackend::new();
        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();
        backend.cmd_dispatch(cmd, 1, 1, 1);
        assert!(backend.end_command_buffer(cmd).is_err());
    }

    #[test]
    fn test_blit_scales_nearest() {
        let mut backend = HeadlessBackend::new();
        let src = color_target(&mut backend, 2, 1);
        let dst = backend
            .create_texture(&TextureDescriptor::new_2d(
                4,
                1,
                TextureFormat::Rgba8Unorm,
                TextureUsage::COPY_DST,
            ))
            .unwrap();
        backend
            .upload_texture(src, &[[0.0, 0.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]])
            .unwrap();

        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.cmd_pipeline_barrier(
            cmd,
            &[
                TextureBarrier {
                    texture: src,
                    old_layout: TextureLayout::Undefined,
                    new_layout: TextureLayout::TransferSrc,
                },
                TextureBarrier {
                    texture: dst,
                    old_layout: TextureLayout::Undefined,
                    new_layout: TextureLayout::TransferDst,
                },
            ],
            &[],
        );
        backend.cmd_blit_texture(cmd, src, dst, FilterMode::Nearest);
        backend.end_command_buffer(cmd).unwrap();
        backend.submit(QueueType::Graphics, cmd, &[], None).unwrap();

        let texels = backend.read_texture(dst).unwrap();
        assert_eq!(texels[0][0], 0.0);
        assert_eq!(texels[1][0], 0.0);
        assert_eq!(texels[2][0], 1.0);
        assert_eq!(texels[3][0], 1.0);
    }

    #[test]
    fn test_texture_limit_and_injected_api_error() {
        let mut backend = HeadlessBackend::new().with_texture_limit(1);
        color_target(&mut backend, 1, 1);
        let desc = TextureDescriptor::new_2d(1, 1, TextureFormat::R32Float, TextureUsage::STORAGE);
        assert_eq!(backend.create_texture(&desc), Err(BackendError::OutOfMemory));

        let cmd = backend.allocate_command_buffer(QueueType::Graphics).unwrap();
        backend.begin_command_buffer(cmd).unwrap();
        backend.end_command_buffer(cmd).unwrap();
        backend.inject_api_error(-4);
        assert!(matches!(
            backend.submit(QueueType::Graphics, cmd, &[], None),
            Err(BackendError::Api { code: -4, .. })
        ));
    }

    #[test]
    fn test_compute_queue_can_be_disabled() {
        let mut backend = HeadlessBackend::new().with_compute_queue(false);
        assert!(!backend.has_compute_queue());
        assert_eq!(
            backend.allocate_command_buffer(QueueType::Compute),
            Err(BackendError::UnsupportedQueue(QueueType::Compute))
        );
    }

    #[test]
    fn test_write_buffer_rejects_out_of_range_writes() {
        let mut backend = HeadlessBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new(16, BufferUsage::UNIFORM | BufferUsage::COPY_DST))
            .unwrap();

        backend.write_buffer(buffer, 12, &[1, 2, 3, 4]).unwrap();
        assert_eq!(&backend.buffer_contents(buffer).unwrap()[12..], &[1, 2, 3, 4]);

        for offset in [13, u64::MAX - 1, u64::MAX] {
            assert!(matches!(
                backend.write_buffer(buffer, offset, &[0; 4]),
                Err(BackendError::InvalidCommand(_))
            ));
        }
        assert_eq!(&backend.buffer_contents(buffer).unwrap()[12..], &[1, 2, 3, 4]);
    }
}
