//! Logical resources for the render graph
//!
//! Passes refer to resources by name. A name declared by several passes is one
//! logical resource; the first declaration carrying a description defines it.

use std::collections::{BTreeMap, HashMap};

use glam::Vec2;

use crate::backend::types::*;
use crate::backend::{BufferHandle, GraphicsBackend, TextureHandle, TextureViewHandle};

/// Size of a graph texture: fixed, or derived from a named size.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSize {
    Absolute(Extent3d),
    /// `scale` is applied per axis to the named size's width and height.
    Named { name: String, scale: Vec2 },
}

impl ResourceSize {
    /// Same extent as the named size.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named {
            name: name.into(),
            scale: Vec2::ONE,
        }
    }

    pub fn scaled(name: impl Into<String>, scale: Vec2) -> Self {
        Self::Named {
            name: name.into(),
            scale,
        }
    }

    /// Name of the named size this resolves against, if any.
    pub fn named_size(&self) -> Option<&str> {
        match self {
            Self::Absolute(_) => None,
            Self::Named { name, .. } => Some(name),
        }
    }

    /// Resolve to an actual extent; `None` when the named size is unknown.
    pub fn resolve(&self, sizes: &HashMap<String, Extent3d>) -> Option<Extent3d> {
        match self {
            Self::Absolute(extent) => Some(*extent),
            Self::Named { name, scale } => sizes.get(name).map(|extent| extent.scaled(*scale)),
        }
    }
}

impl From<Extent3d> for ResourceSize {
    fn from(extent: Extent3d) -> Self {
        Self::Absolute(extent)
    }
}

/// Description of a graph texture. Usage flags are derived from how passes
/// declare the texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureResourceDesc {
    pub size: ResourceSize,
    pub format: TextureFormat,
    pub samples: u32,
    pub mip_levels: u32,
}

impl TextureResourceDesc {
    pub fn new(size: impl Into<ResourceSize>, format: TextureFormat) -> Self {
        Self {
            size: size.into(),
            format,
            samples: 1,
            mip_levels: 1,
        }
    }

    pub fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub(crate) fn to_descriptor(
        &self,
        label: &str,
        extent: Extent3d,
        usage: TextureUsage,
    ) -> TextureDescriptor {
        TextureDescriptor {
            label: Some(label.to_string()),
            size: extent,
            format: self.format,
            mip_levels: self.mip_levels,
            samples: self.samples,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferResourceDesc {
    pub size: u64,
}

impl BufferResourceDesc {
    pub fn new(size: u64) -> Self {
        Self { size }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceDesc {
    Texture(TextureResourceDesc),
    Buffer(BufferResourceDesc),
}

impl ResourceDesc {
    pub fn is_texture(&self) -> bool {
        matches!(self, Self::Texture(_))
    }

    pub fn as_texture(&self) -> Option<&TextureResourceDesc> {
        match self {
            Self::Texture(desc) => Some(desc),
            Self::Buffer(_) => None,
        }
    }
}

/// Access mode of a storage texture or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageAccess {
    Read,
    Write,
    ReadWrite,
}

impl StorageAccess {
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// How a pass uses a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    SampledTexture,
    InputAttachment,
    StorageTexture(StorageAccess),
    StorageBuffer(StorageAccess),
    /// `load` is true when the previous contents are kept.
    ColorAttachment { load: bool },
    DepthStencilAttachment { load: bool },
    TransferSrc,
    TransferDst,
}

impl ResourceUsage {
    pub fn is_read(&self) -> bool {
        match self {
            Self::SampledTexture | Self::InputAttachment | Self::TransferSrc => true,
            Self::StorageTexture(access) | Self::StorageBuffer(access) => access.is_read(),
            Self::ColorAttachment { load } | Self::DepthStencilAttachment { load } => *load,
            Self::TransferDst => false,
        }
    }

    pub fn is_write(&self) -> bool {
        match self {
            Self::SampledTexture | Self::InputAttachment | Self::TransferSrc => false,
            Self::StorageTexture(access) | Self::StorageBuffer(access) => access.is_write(),
            Self::ColorAttachment { .. }
            | Self::DepthStencilAttachment { .. }
            | Self::TransferDst => true,
        }
    }

    pub fn is_texture(&self) -> bool {
        !matches!(self, Self::StorageBuffer(_))
    }

    /// Layout a texture must be in while the pass runs.
    pub fn texture_layout(&self) -> Option<TextureLayout> {
        match self {
            Self::SampledTexture | Self::InputAttachment => Some(TextureLayout::ShaderReadOnly),
            Self::StorageTexture(_) => Some(TextureLayout::General),
            Self::ColorAttachment { .. } => Some(TextureLayout::ColorAttachment),
            Self::DepthStencilAttachment { .. } => Some(TextureLayout::DepthStencilAttachment),
            Self::TransferSrc => Some(TextureLayout::TransferSrc),
            Self::TransferDst => Some(TextureLayout::TransferDst),
            Self::StorageBuffer(_) => None,
        }
    }

    pub fn texture_usage(&self) -> TextureUsage {
        match self {
            Self::SampledTexture => TextureUsage::SAMPLED,
            Self::InputAttachment => TextureUsage::INPUT_ATTACHMENT,
            Self::StorageTexture(_) => TextureUsage::STORAGE,
            Self::ColorAttachment { .. } => TextureUsage::COLOR_ATTACHMENT,
            Self::DepthStencilAttachment { .. } => TextureUsage::DEPTH_STENCIL_ATTACHMENT,
            Self::TransferSrc => TextureUsage::COPY_SRC,
            Self::TransferDst => TextureUsage::COPY_DST,
            Self::StorageBuffer(_) => TextureUsage::empty(),
        }
    }

    pub fn buffer_access(&self) -> BufferAccess {
        match self {
            Self::StorageBuffer(StorageAccess::Read) => BufferAccess::ShaderRead,
            Self::StorageBuffer(StorageAccess::Write) => BufferAccess::ShaderWrite,
            Self::StorageBuffer(StorageAccess::ReadWrite) => BufferAccess::ShaderReadWrite,
            _ => BufferAccess::None,
        }
    }
}

/// A physical texture backing one or more logical resources.
#[derive(Debug, Clone)]
pub(crate) struct PhysicalTexture {
    pub(crate) texture: TextureHandle,
    pub(crate) view: TextureViewHandle,
    pub(crate) desc: TextureDescriptor,
    pub(crate) size: ResourceSize,
}

#[derive(Debug, Clone)]
pub(crate) struct PhysicalBuffer {
    pub(crate) buffer: BufferHandle,
}

#[derive(Debug, Clone)]
pub(crate) struct LogicalResource {
    pub(crate) desc: ResourceDesc,
    /// Index into [`ResourceTable::textures`] or [`ResourceTable::buffers`].
    pub(crate) physical: usize,
}

/// Logical resources of a built graph and the backend objects behind them.
#[derive(Debug, Default)]
pub(crate) struct ResourceTable {
    pub(crate) logical: BTreeMap<String, LogicalResource>,
    pub(crate) textures: Vec<PhysicalTexture>,
    pub(crate) buffers: Vec<PhysicalBuffer>,
}

impl ResourceTable {
    pub(crate) fn texture(&self, name: &str) -> Option<&PhysicalTexture> {
        let resource = self.logical.get(name)?;
        resource
            .desc
            .is_texture()
            .then(|| self.textures.get(resource.physical))
            .flatten()
    }

    pub(crate) fn buffer(&self, name: &str) -> Option<&PhysicalBuffer> {
        let resource = self.logical.get(name)?;
        match resource.desc {
            ResourceDesc::Buffer(_) => self.buffers.get(resource.physical),
            ResourceDesc::Texture(_) => None,
        }
    }

    /// Physical texture index of `name`.
    pub(crate) fn texture_slot(&self, name: &str) -> Option<usize> {
        let resource = self.logical.get(name)?;
        resource.desc.is_texture().then_some(resource.physical)
    }

    pub(crate) fn buffer_slot(&self, name: &str) -> Option<usize> {
        let resource = self.logical.get(name)?;
        (!resource.desc.is_texture()).then_some(resource.physical)
    }

    pub(crate) fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for physical in self.textures.drain(..) {
            backend.destroy_texture_view(physical.view);
            backend.destroy_texture(physical.texture);
        }
        for physical in self.buffers.drain(..) {
            backend.destroy_buffer(physical.buffer);
        }
        self.logical.clear();
    }
}
