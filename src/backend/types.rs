//! Common types shared between backends

use bitflags::bitflags;
use glam::{Vec2, Vec4};

/// 3D extent for textures and named sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    /// Depth in texels (1 for 2D resources).
    pub depth: u32,
}

impl Extent3d {
    pub const fn new_2d(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            depth: 1,
        }
    }

    pub const fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Scale width and height, keeping depth. Each axis is at least one texel.
    pub fn scaled(&self, scale: Vec2) -> Self {
        Self {
            width: ((self.width as f32 * scale.x) as u32).max(1),
            height: ((self.height as f32 * scale.y) as u32).max(1),
            depth: self.depth,
        }
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth.max(1) as usize
    }
}

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    #[default]
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Rg32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn bytes_per_texel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Usage flags for textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const INPUT_ATTACHMENT = 1 << 6;
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
    }
}

bitflags! {
    /// Shader stages a binding or push constant range is visible to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = 0xF;
    }
}

impl Default for ColorWrites {
    fn default() -> Self {
        Self::ALL
    }
}

/// Texture descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub size: Extent3d,
    pub format: TextureFormat,
    pub mip_levels: u32,
    pub samples: u32,
    pub usage: TextureUsage,
}

impl TextureDescriptor {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat, usage: TextureUsage) -> Self {
        Self {
            label: None,
            size: Extent3d::new_2d(width, height),
            format,
            mip_levels: 1,
            samples: 1,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            size: Extent3d::new_2d(1, 1),
            format: TextureFormat::Rgba8Unorm,
            mip_levels: 1,
            samples: 1,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
        }
    }
}

/// Buffer descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Layout (state) a texture is in, mirrors Vulkan image layouts and D3D12
/// resource states closely enough for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureLayout {
    /// Contents are undefined and may be discarded.
    #[default]
    Undefined,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    /// Read/write storage access.
    General,
    TransferSrc,
    TransferDst,
    Present,
}

/// Buffer access state used for buffer memory barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferAccess {
    #[default]
    None,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    TransferRead,
    TransferWrite,
}

impl BufferAccess {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            BufferAccess::ShaderWrite | BufferAccess::ShaderReadWrite | BufferAccess::TransferWrite
        )
    }
}

/// A texture layout transition recorded by [`pipeline_barrier`](super::GraphicsBackend::cmd_pipeline_barrier).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureBarrier {
    pub texture: super::TextureHandle,
    pub old_layout: TextureLayout,
    pub new_layout: TextureLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: super::BufferHandle,
    pub src_access: BufferAccess,
    pub dst_access: BufferAccess,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOp {
    Clear,
    Load,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Clear value supplied when beginning a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color(Vec4),
    DepthStencil { depth: f32, stencil: u32 },
}

/// One attachment slot of a render pass layout
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentLayout {
    pub format: TextureFormat,
    pub samples: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

/// Render pass descriptor (the attachment formats and load/store ops,
/// independent of the concrete views bound through a framebuffer)
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<AttachmentLayout>,
    pub depth_stencil_attachment: Option<AttachmentLayout>,
    pub input_attachment_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FramebufferDescriptor {
    pub label: Option<String>,
    pub render_pass: super::RenderPassHandle,
    /// Color attachment views followed by the depth view, if any.
    pub attachments: Vec<super::TextureViewHandle>,
    pub extent: Extent3d,
}

/// Opaque shader module. Compilation and reflection happen outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderModuleDescriptor {
    pub stage: ShaderStages,
    pub entry_point: String,
    /// SPIR-V words or DXIL bytes packed into words.
    pub code: Vec<u32>,
}

impl ShaderModuleDescriptor {
    pub fn new(stage: ShaderStages, entry_point: impl Into<String>, code: Vec<u32>) -> Self {
        Self {
            stage,
            entry_point: entry_point.into(),
            code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    SampledTexture,
    StorageTexture,
    InputAttachment,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorSetLayoutDescriptor {
    pub label: Option<String>,
    pub bindings: Vec<DescriptorBinding>,
}

/// What a descriptor binding points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorResource {
    Texture(super::TextureViewHandle),
    Buffer {
        buffer: super::BufferHandle,
        offset: u64,
        range: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub array_element: u32,
    pub ty: DescriptorType,
    pub resource: DescriptorResource,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

/// Compare function for depth/stencil
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthState {
    pub write_enabled: bool,
    pub compare: CompareFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorTargetState {
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl Default for ColorTargetState {
    fn default() -> Self {
        Self {
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

/// Graphics pipeline descriptor. The render pass comes from the graph pass
/// the pipeline is created for.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDescriptor {
    pub label: Option<String>,
    pub render_pass: super::RenderPassHandle,
    pub shaders: Vec<ShaderModuleDescriptor>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub descriptor_set_layouts: Vec<super::DescriptorSetLayoutHandle>,
    pub push_constant_size: u32,
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth: Option<DepthState>,
    pub color_targets: Vec<ColorTargetState>,
    pub samples: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: ShaderModuleDescriptor,
    pub descriptor_set_layouts: Vec<super::DescriptorSetLayoutHandle>,
    pub push_constant_size: u32,
}

impl GraphicsPipelineDescriptor {
    /// Triangle list, no culling, no depth test, one sample. `render_pass` is
    /// left unset until a render graph pass creates the pipeline.
    pub fn new(shaders: Vec<ShaderModuleDescriptor>) -> Self {
        Self {
            label: None,
            render_pass: super::RenderPassHandle::from_raw(0),
            shaders,
            vertex_layouts: Vec::new(),
            descriptor_set_layouts: Vec::new(),
            push_constant_size: 0,
            topology: PrimitiveTopology::default(),
            front_face: FrontFace::default(),
            cull_mode: CullMode::default(),
            depth: None,
            color_targets: Vec::new(),
            samples: 1,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_descriptor_set_layouts(
        mut self,
        layouts: Vec<super::DescriptorSetLayoutHandle>,
    ) -> Self {
        self.descriptor_set_layouts = layouts;
        self
    }

    pub fn with_push_constant_size(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }

    pub fn with_depth(mut self, depth: DepthState) -> Self {
        self.depth = Some(depth);
        self
    }
}

impl ComputePipelineDescriptor {
    pub fn new(shader: ShaderModuleDescriptor) -> Self {
        Self {
            label: None,
            shader,
            descriptor_set_layouts: Vec::new(),
            push_constant_size: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_descriptor_set_layouts(
        mut self,
        layouts: Vec<super::DescriptorSetLayoutHandle>,
    ) -> Self {
        self.descriptor_set_layouts = layouts;
        self
    }

    pub fn with_push_constant_size(mut self, size: u32) -> Self {
        self.push_constant_size = size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Hardware queue a command buffer is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    Transfer,
}
