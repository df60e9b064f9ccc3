//! Render Graph System
//!
//! Passes declare the logical resources they read and write by name; the graph
//! orders them, computes resource lifetimes and aliasing candidates, creates
//! every backend object once in [`RenderGraph::build`] and then records and
//! submits a frame per [`RenderGraph::execute`] call.
//!
//! Resources sized relative to a *named size* (for example the swapchain) are
//! recreated by [`RenderGraph::resize_named_size`] without rebuilding the rest
//! of the graph.

mod aliasing;
mod compiler;
pub mod graph;
pub mod lifetime;
pub mod pass;
pub mod resource;

use thiserror::Error;

use crate::backend::BackendError;

pub use aliasing::PhysicalSlot;
pub use graph::{GraphState, RenderGraph};
pub use lifetime::{AliasCandidate, ResourceLifetime};
pub use pass::{
    AttachmentLoad, DescriptorUpdateContext, PassInitContext, PassRenderContext, PipelineType,
    RenderGraphPass,
};
pub use resource::{
    BufferResourceDesc, ResourceDesc, ResourceSize, ResourceUsage, StorageAccess,
    TextureResourceDesc,
};

/// Render graph error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderGraphError {
    #[error("Cannot {operation} while the graph is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: GraphState,
    },
    #[error("Render graph has not been built")]
    NotBuilt,
    #[error("Duplicate pass name: {0}")]
    DuplicatePassName(String),
    #[error("Unknown named size: {0}")]
    UnknownNamedSize(String),
    #[error("No render graph output was set")]
    MissingOutput,
    #[error("Render graph output already set to {existing}, cannot set {requested}")]
    MultipleOutputs { existing: String, requested: String },
    #[error("Output resource {0} is not written as a texture by any pass")]
    OutputNotProduced(String),
    #[error("Resource {resource} is read by pass {pass} but never written")]
    ResourceNeverWritten { resource: String, pass: String },
    #[error("Resource {0} is written without a description")]
    MissingDescription(String),
    #[error("Conflicting descriptions for resource {0}")]
    DescriptionMismatch(String),
    #[error("Attachments of pass {pass} have different extents")]
    AttachmentExtentMismatch { pass: String },
    #[error("Invalid pass {pass}: {reason}")]
    InvalidPass { pass: String, reason: String },
    #[error("Cyclic dependency between passes {0:?}")]
    CyclicDependency(Vec<String>),
    #[error("Pass {pass} has no resource named {resource}")]
    UnknownResource { pass: String, resource: String },
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Callback of pass {pass} failed: {message}")]
    Callback { pass: String, message: String },
}

impl RenderGraphError {
    /// Convenience constructor for errors raised inside pass callbacks.
    pub fn callback(pass: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Callback {
            pass: pass.into(),
            message: message.into(),
        }
    }
}

pub type RenderGraphResult<T> = Result<T, RenderGraphError>;
