//! # Headless Frame
//!
//! Builds a small deferred-style render graph, renders it on the headless
//! backend and writes the presented frame to a PNG.
//!
//! ```bash
//! cargo run --example headless_frame -- --width 320 --height 180 --frames 3 --output frame.png
//! ```

use std::path::PathBuf;

use clap::Parser;

use render_graph_engine::backend::{
    Extent3d, GraphicsBackend, GraphicsPipelineDescriptor, HeadlessBackend,
    ShaderModuleDescriptor, ShaderStages, TextureFormat,
};
use render_graph_engine::glam::{Vec2, Vec4};
use render_graph_engine::render_graph::{
    AttachmentLoad, PipelineType, RenderGraph, RenderGraphPass, ResourceSize, StorageAccess,
    TextureResourceDesc,
};
use render_graph_engine::{EngineConfig, RenderGraphConfig};

/// Render a frame on the CPU and save it.
#[derive(Parser, Debug)]
#[command(name = "headless_frame", about = "Render a render graph frame headlessly")]
struct Args {
    /// Swapchain width in pixels.
    #[arg(long, default_value = "256")]
    width: u32,

    /// Swapchain height in pixels.
    #[arg(long, default_value = "144")]
    height: u32,

    /// Number of frames to execute before saving.
    #[arg(long, default_value = "1")]
    frames: u32,

    /// Resize the swapchain to WIDTHxHEIGHT after the first frame.
    #[arg(long, value_parser = parse_extent)]
    resize: Option<Extent3d>,

    /// Share memory between transient textures with disjoint lifetimes.
    #[arg(long)]
    physical_aliasing: bool,

    /// Submit compute passes on the compute queue.
    #[arg(long)]
    async_compute: bool,

    /// Where to write the last presented frame.
    #[arg(long, default_value = "frame.png")]
    output: PathBuf,
}

fn parse_extent(value: &str) -> Result<Extent3d, String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value}"))?;
    let width = width.parse::<u32>().map_err(|e| e.to_string())?;
    let height = height.parse::<u32>().map_err(|e| e.to_string())?;
    Ok(Extent3d::new_2d(width, height))
}

fn swapchain(format: TextureFormat) -> TextureResourceDesc {
    TextureResourceDesc::new(ResourceSize::named("swapchain"), format)
}

fn shaders(fragment: bool) -> Vec<ShaderModuleDescriptor> {
    let mut modules = vec![ShaderModuleDescriptor::new(
        ShaderStages::VERTEX,
        "vs_main",
        vec![0x0723_0203],
    )];
    if fragment {
        modules.push(ShaderModuleDescriptor::new(
            ShaderStages::FRAGMENT,
            "fs_main",
            vec![0x0723_0203],
        ));
    }
    modules
}

fn build_graph(
    config: RenderGraphConfig,
    extent: Extent3d,
) -> Result<RenderGraph, Box<dyn std::error::Error>> {
    let mut graph = RenderGraph::with_config(config);
    graph.add_named_size("swapchain", extent)?;

    // GBuffer with depth
    graph.add_render_pass(
        RenderGraphPass::new("gbuffer", PipelineType::Graphics)
            .color_output(
                "albedo",
                swapchain(TextureFormat::Rgba8Unorm),
                AttachmentLoad::clear_color(Vec4::new(0.8, 0.3, 0.2, 1.0)),
            )
            .color_output(
                "normals",
                swapchain(TextureFormat::Rgba16Float),
                AttachmentLoad::clear_color(Vec4::new(0.5, 0.5, 1.0, 0.0)),
            )
            .depth_output(
                "depth",
                swapchain(TextureFormat::Depth32Float),
                AttachmentLoad::clear_depth(1.0),
            )
            .on_init(|ctx| {
                ctx.create_graphics_pipeline(
                    GraphicsPipelineDescriptor::new(shaders(true)).with_label("gbuffer"),
                )?;
                Ok(())
            })
            .on_render(|ctx| {
                ctx.draw(0..36, 0..16);
                Ok(())
            }),
    )?;

    // Half resolution SSAO on compute
    graph.add_render_pass(
        RenderGraphPass::new("ssao", PipelineType::Compute)
            .sample_texture("depth")
            .sample_texture("normals")
            .storage_texture(
                "ao",
                StorageAccess::Write,
                Some(TextureResourceDesc::new(
                    ResourceSize::scaled("swapchain", Vec2::splat(0.5)),
                    TextureFormat::R32Float,
                )),
            )
            .on_render(|ctx| {
                log::trace!("ssao at {:?}", ctx.extent());
                Ok(())
            }),
    )?;

    graph.add_render_pass(
        RenderGraphPass::new("lighting", PipelineType::Graphics)
            .sample_texture("albedo")
            .sample_texture("normals")
            .sample_texture("ao")
            .color_output(
                "hdr",
                swapchain(TextureFormat::Rgba16Float),
                AttachmentLoad::clear_color(Vec4::new(0.9, 0.6, 0.3, 1.0)),
            ),
    )?;

    graph.add_render_pass(
        RenderGraphPass::new("tonemap", PipelineType::Graphics)
            .sample_texture("hdr")
            .color_output(
                "ldr",
                swapchain(TextureFormat::Rgba8UnormSrgb),
                AttachmentLoad::clear_color(Vec4::new(0.9, 0.6, 0.3, 1.0)),
            ),
    )?;
    graph.set_render_graph_output("ldr")?;
    Ok(graph)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = EngineConfig {
        render_graph: RenderGraphConfig {
            physical_aliasing: args.physical_aliasing,
            async_compute: args.async_compute,
            ..Default::default()
        },
        ..Default::default()
    };
    log::info!(
        "render-graph-engine {} headless frame: {}x{}",
        render_graph_engine::VERSION,
        args.width,
        args.height
    );

    let mut backend = HeadlessBackend::new();
    let mut graph = build_graph(config.render_graph, Extent3d::new_2d(args.width, args.height))?;
    graph.build(&mut backend, config.render_graph.validate)?;
    log::info!("Execution order: {:?}", graph.execution_order());
    for candidate in graph.alias_candidates() {
        log::info!("Alias candidate: {} / {}", candidate.first, candidate.second);
    }

    for frame in 0..args.frames.max(1) {
        if frame == 1 {
            if let Some(extent) = args.resize {
                graph.resize_named_size(&mut backend, "swapchain", extent)?;
            }
        }
        let done = graph.execute(&mut backend, &[])?;
        let output = graph.output_texture().ok_or("graph has no output texture")?;
        backend.present(output, &[done])?;
    }

    let stats = backend.stats();
    log::info!(
        "{} submits, {} render passes, {} draws, {} texture barriers, {} physical textures",
        stats.submits,
        stats.render_passes,
        stats.draws,
        stats.texture_barriers,
        graph.physical_texture_count()
    );

    let frame = backend
        .take_presented_frames()
        .pop()
        .ok_or("no frame was presented")?;
    frame.save(&args.output)?;
    log::info!(
        "Saved {}x{} frame to {}",
        frame.width(),
        frame.height(),
        args.output.display()
    );

    graph.destroy(&mut backend);
    Ok(())
}
