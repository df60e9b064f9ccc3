//! Shared helpers for the integration tests.

#![allow(dead_code)]

use render_graph_engine::backend::{Extent3d, TextureFormat};
use render_graph_engine::glam::Vec4;
use render_graph_engine::render_graph::{
    AttachmentLoad, PipelineType, RenderGraph, RenderGraphPass, ResourceSize, TextureResourceDesc,
};
use render_graph_engine::RenderGraphConfig;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A swapchain-relative color texture.
pub fn swapchain_color(format: TextureFormat) -> TextureResourceDesc {
    TextureResourceDesc::new(ResourceSize::named("swapchain"), format)
}

/// `scene -> blur -> composite -> "out"` over a named "swapchain" size.
///
/// Lifetimes in execution positions: `scene` [0,1], `blur` [1,2], `out` [2,∞).
pub fn post_chain(config: RenderGraphConfig, swapchain: Extent3d) -> RenderGraph {
    let mut graph = RenderGraph::with_config(config);
    graph.add_named_size("swapchain", swapchain).unwrap();
    graph
        .add_render_pass(RenderGraphPass::new("scene", PipelineType::Graphics).color_output(
            "scene",
            swapchain_color(TextureFormat::Rgba16Float),
            AttachmentLoad::clear_color(Vec4::new(0.1, 0.2, 0.3, 1.0)),
        ))
        .unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("blur", PipelineType::Graphics)
                .sample_texture("scene")
                .color_output(
                    "blur",
                    swapchain_color(TextureFormat::Rgba16Float),
                    AttachmentLoad::DontCare,
                ),
        )
        .unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("composite", PipelineType::Graphics)
                .sample_texture("blur")
                .color_output(
                    "out",
                    swapchain_color(TextureFormat::Rgba8Unorm),
                    AttachmentLoad::DontCare,
                ),
        )
        .unwrap();
    graph.set_render_graph_output("out").unwrap();
    graph
}
