//! Whole-frame scenarios: build, execute, present and resize on the headless
//! backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rstest::rstest;

use common::swapchain_color;
use render_graph_engine::backend::{
    DescriptorBinding, DescriptorResource, DescriptorSetHandle, DescriptorSetLayoutDescriptor,
    DescriptorType, DescriptorWrite, Extent3d, GraphicsBackend, GraphicsPipelineDescriptor,
    HeadlessBackend, ShaderModuleDescriptor, ShaderStages, TextureFormat, TextureViewHandle,
};
use render_graph_engine::glam::Vec4;
use render_graph_engine::render_graph::{
    AttachmentLoad, PipelineType, RenderGraph, RenderGraphPass, TextureResourceDesc,
};
use render_graph_engine::RenderGraphConfig;

/// SPIR-V magic; the headless backend never looks past it.
const SPIRV_STUB: [u32; 1] = [0x0723_0203];

fn fullscreen_pipeline() -> GraphicsPipelineDescriptor {
    GraphicsPipelineDescriptor::new(vec![
        ShaderModuleDescriptor::new(ShaderStages::VERTEX, "vs_main", SPIRV_STUB.to_vec()),
        ShaderModuleDescriptor::new(ShaderStages::FRAGMENT, "fs_main", SPIRV_STUB.to_vec()),
    ])
    .with_push_constant_size(16)
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

// ============================================================================
// Single pass to the swapchain
// ============================================================================

#[test]
fn test_single_pass_presents_filled_frame() {
    common::init_logging();
    let mut backend = HeadlessBackend::new();
    let init_calls = counter();
    let render_calls = counter();

    let mut graph = RenderGraph::new();
    graph
        .add_named_size("swapchain", Extent3d::new_2d(128, 72))
        .unwrap();
    let inits = Arc::clone(&init_calls);
    let renders = Arc::clone(&render_calls);
    graph
        .add_render_pass(
            RenderGraphPass::new("fill", PipelineType::Graphics)
                .color_output(
                    "Out",
                    swapchain_color(TextureFormat::Rgba8Unorm),
                    AttachmentLoad::clear_color(Vec4::new(0.0, 0.5, 1.0, 1.0)),
                )
                .on_init(move |ctx| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(ctx.extent(), Some(Extent3d::new_2d(128, 72)));
                    ctx.create_graphics_pipeline(fullscreen_pipeline().with_label("fill"))?;
                    Ok(())
                })
                .on_render(move |ctx| {
                    renders.fetch_add(1, Ordering::SeqCst);
                    ctx.push_constants(ShaderStages::FRAGMENT, 0, &Vec4::ONE)?;
                    ctx.draw(0..3, 0..1);
                    Ok(())
                }),
        )
        .unwrap();
    graph.set_render_graph_output("Out").unwrap();

    graph.build(&mut backend, true).unwrap();
    assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(render_calls.load(Ordering::SeqCst), 0);

    let done = graph.execute(&mut backend, &[]).unwrap();
    backend
        .present(graph.output_texture().unwrap(), &[done])
        .unwrap();

    assert_eq!(init_calls.load(Ordering::SeqCst), 1);
    assert_eq!(render_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.stats().draws, 1);

    let frames = backend.presented_frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!((frame.width(), frame.height()), (128, 72));
    assert!(frame.pixels().all(|pixel| pixel.0 == [0, 128, 255, 255]));

    graph.destroy(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_external_wait_semaphore_is_consumed() {
    common::init_logging();
    let mut backend = HeadlessBackend::new();
    let mut graph = common::post_chain(RenderGraphConfig::default(), Extent3d::new_2d(16, 16));
    graph.build(&mut backend, true).unwrap();

    let acquired = backend.create_semaphore().unwrap();
    // Unsignaled: the backend refuses the submission.
    assert!(graph.execute(&mut backend, &[acquired]).is_err());

    backend.signal_semaphore(acquired).unwrap();
    let done = graph.execute(&mut backend, &[acquired]).unwrap();
    assert!(!backend.is_semaphore_signaled(acquired));
    assert!(backend.is_semaphore_signaled(done));

    backend.destroy_semaphore(acquired);
    graph.destroy(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
}

// ============================================================================
// Named size resize
// ============================================================================

struct ResizeScene {
    graph: RenderGraph,
    scene_inits: Arc<AtomicUsize>,
    lut_inits: Arc<AtomicUsize>,
    composite_inits: Arc<AtomicUsize>,
    bound_scene: Arc<Mutex<Option<(DescriptorSetHandle, TextureViewHandle)>>>,
}

/// `scene` follows the swapchain, `lut` is fixed at 16x16; `composite`
/// samples both into the swapchain-sized output.
fn resize_scene(swapchain: Extent3d) -> ResizeScene {
    let scene_inits = counter();
    let lut_inits = counter();
    let composite_inits = counter();
    let bound_scene = Arc::new(Mutex::new(None));

    let mut graph = RenderGraph::new();
    graph.add_named_size("swapchain", swapchain).unwrap();

    let inits = Arc::clone(&scene_inits);
    graph
        .add_render_pass(
            RenderGraphPass::new("scene", PipelineType::Graphics)
                .color_output(
                    "scene",
                    swapchain_color(TextureFormat::Rgba16Float),
                    AttachmentLoad::clear_color(Vec4::new(0.25, 0.25, 0.25, 1.0)),
                )
                .on_init(move |_| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .unwrap();

    let inits = Arc::clone(&lut_inits);
    graph
        .add_render_pass(
            RenderGraphPass::new("lut", PipelineType::Graphics)
                .color_output(
                    "lut",
                    TextureResourceDesc::new(Extent3d::new_2d(16, 16), TextureFormat::Rgba8Unorm),
                    AttachmentLoad::clear_color(Vec4::ONE),
                )
                .on_init(move |_| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .unwrap();

    let inits = Arc::clone(&composite_inits);
    let bound = Arc::clone(&bound_scene);
    graph
        .add_render_pass(
            RenderGraphPass::new("composite", PipelineType::Graphics)
                .sample_texture("scene")
                .sample_texture("lut")
                .color_output(
                    "out",
                    swapchain_color(TextureFormat::Rgba8Unorm),
                    AttachmentLoad::clear_color(Vec4::new(0.0, 0.0, 0.0, 1.0)),
                )
                .on_init(move |ctx| {
                    inits.fetch_add(1, Ordering::SeqCst);
                    let sampled = |binding| DescriptorBinding {
                        binding,
                        ty: DescriptorType::SampledTexture,
                        count: 1,
                        stages: ShaderStages::FRAGMENT,
                    };
                    let layout = ctx.create_descriptor_set_layout(&DescriptorSetLayoutDescriptor {
                        label: Some("composite".into()),
                        bindings: vec![sampled(0), sampled(1)],
                    })?;
                    ctx.create_graphics_pipeline(
                        fullscreen_pipeline().with_descriptor_set_layouts(vec![layout]),
                    )?;
                    Ok(())
                })
                .on_descriptor_update(move |ctx| {
                    let layout = ctx.descriptor_set_layouts()[0];
                    let set = ctx.allocate_descriptor_set(layout)?;
                    let scene = ctx.texture_view("scene")?;
                    let lut = ctx.texture_view("lut")?;
                    let write = |binding, view| DescriptorWrite {
                        binding,
                        array_element: 0,
                        ty: DescriptorType::SampledTexture,
                        resource: DescriptorResource::Texture(view),
                    };
                    ctx.write_descriptor_set(set, &[write(0, scene), write(1, lut)])?;
                    *bound.lock() = Some((set, scene));
                    Ok(())
                })
                .on_render(|ctx| {
                    ctx.draw(0..3, 0..1);
                    Ok(())
                }),
        )
        .unwrap();
    graph.set_render_graph_output("out").unwrap();

    ResizeScene {
        graph,
        scene_inits,
        lut_inits,
        composite_inits,
        bound_scene,
    }
}

#[rstest]
#[case::shrink(Extent3d::new_2d(1920, 1080), Extent3d::new_2d(800, 600))]
#[case::grow(Extent3d::new_2d(320, 180), Extent3d::new_2d(640, 360))]
fn test_resize_recreates_only_derived_resources(#[case] from: Extent3d, #[case] to: Extent3d) {
    common::init_logging();
    let mut backend = HeadlessBackend::new();
    let mut scene = resize_scene(from);
    let graph = &mut scene.graph;
    graph.build(&mut backend, true).unwrap();

    let done = graph.execute(&mut backend, &[]).unwrap();
    backend
        .present(graph.output_texture().unwrap(), &[done])
        .unwrap();

    let old_scene = graph.texture("scene").unwrap();
    let old_lut = graph.texture("lut").unwrap();
    let objects_before = backend.live_object_count();

    graph.resize_named_size(&mut backend, "swapchain", to).unwrap();

    assert!(graph.is_built());
    assert_eq!(graph.named_size("swapchain"), Some(to));
    assert_eq!(graph.texture_extent("scene"), Some(to));
    assert_eq!(graph.texture_extent("out"), Some(to));
    assert_eq!(graph.texture_extent("lut"), Some(Extent3d::new_2d(16, 16)));
    assert_ne!(graph.texture("scene"), Some(old_scene));
    assert_eq!(graph.texture("lut"), Some(old_lut));
    // Old objects were released as their replacements were created.
    assert_eq!(backend.live_object_count(), objects_before);

    // Passes touching swapchain-sized resources were set up again; the
    // fixed-size pass was left alone.
    assert_eq!(scene.scene_inits.load(Ordering::SeqCst), 2);
    assert_eq!(scene.composite_inits.load(Ordering::SeqCst), 2);
    assert_eq!(scene.lut_inits.load(Ordering::SeqCst), 1);

    let bound = *scene.bound_scene.lock();
    let (set, view) = bound.unwrap();
    assert_eq!(Some(view), graph.texture_view("scene"));
    let writes = backend.descriptor_writes(set).unwrap();
    assert_eq!(writes[0].resource, DescriptorResource::Texture(view));

    let done = graph.execute(&mut backend, &[]).unwrap();
    backend
        .present(graph.output_texture().unwrap(), &[done])
        .unwrap();
    let frames = backend.presented_frames();
    assert_eq!(frames.len(), 2);
    assert_eq!((frames[0].width(), frames[0].height()), (from.width, from.height));
    assert_eq!((frames[1].width(), frames[1].height()), (to.width, to.height));
    assert_eq!(graph.frame_index(), 2);

    graph.destroy(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_resize_before_build_only_updates_size() {
    let mut backend = HeadlessBackend::new();
    let mut scene = resize_scene(Extent3d::new_2d(64, 64));
    let graph = &mut scene.graph;

    graph
        .resize_named_size(&mut backend, "swapchain", Extent3d::new_2d(32, 16))
        .unwrap();
    assert_eq!(backend.live_object_count(), 0);

    graph.build(&mut backend, true).unwrap();
    assert_eq!(graph.texture_extent("scene"), Some(Extent3d::new_2d(32, 16)));
    graph.destroy(&mut backend);
}

#[test]
fn test_resize_unknown_named_size_fails() {
    let mut backend = HeadlessBackend::new();
    let mut scene = resize_scene(Extent3d::new_2d(64, 64));
    scene.graph.build(&mut backend, true).unwrap();
    assert!(scene
        .graph
        .resize_named_size(&mut backend, "shadow_map", Extent3d::new_2d(8, 8))
        .is_err());
    assert!(scene.graph.is_built());
    scene.graph.destroy(&mut backend);
}
