//! Render graph integration tests against the headless backend.

mod common;

use rstest::rstest;

use common::{post_chain, swapchain_color};
use render_graph_engine::backend::{
    BackendError, Extent3d, FilterMode, GraphicsBackend, HeadlessBackend, TextureFormat,
};
use render_graph_engine::glam::Vec4;
use render_graph_engine::render_graph::{
    AttachmentLoad, BufferResourceDesc, GraphState, PipelineType, RenderGraph, RenderGraphError,
    RenderGraphPass, ResourceLifetime, StorageAccess,
};
use render_graph_engine::RenderGraphConfig;

const SWAPCHAIN: Extent3d = Extent3d::new_2d(64, 32);

/// `n` passes, pass `i` sampling the texture pass `i - 1` rendered.
fn linear_chain(config: RenderGraphConfig, passes: usize) -> RenderGraph {
    let mut graph = RenderGraph::with_config(config);
    graph.add_named_size("swapchain", SWAPCHAIN).unwrap();
    for index in 0..passes {
        let mut pass = RenderGraphPass::new(format!("pass_{index}"), PipelineType::Graphics);
        if index > 0 {
            pass = pass.sample_texture(format!("t{}", index - 1));
        }
        graph
            .add_render_pass(pass.color_output(
                format!("t{index}"),
                swapchain_color(TextureFormat::Rgba8Unorm),
                AttachmentLoad::clear_color(Vec4::ZERO),
            ))
            .unwrap();
    }
    graph
        .set_render_graph_output(format!("t{}", passes - 1))
        .unwrap();
    graph
}

// ============================================================================
// Lifetimes and aliasing candidates
// ============================================================================

#[rstest]
#[case::two_passes(2)]
#[case::five_passes(5)]
#[case::twelve_passes(12)]
fn test_output_lifetime_is_unbounded(#[case] passes: usize) {
    common::init_logging();
    let mut backend = HeadlessBackend::new();
    let mut graph = linear_chain(RenderGraphConfig::default(), passes);
    graph.build(&mut backend, true).unwrap();

    let output = graph.output().unwrap().to_string();
    assert!(graph.resource_lifetime(&output).unwrap().is_unbounded());
    assert!(graph
        .alias_candidates()
        .iter()
        .all(|candidate| !candidate.contains(&output)));
    graph.destroy(&mut backend);
}

#[rstest]
#[case::five_passes(5)]
#[case::twelve_passes(12)]
fn test_candidates_are_exactly_the_disjoint_pairs(#[case] passes: usize) {
    common::init_logging();
    let mut backend = HeadlessBackend::new();
    let mut graph = linear_chain(RenderGraphConfig::default(), passes);
    graph.build(&mut backend, true).unwrap();

    let lifetimes = graph.lifetimes().clone();
    let bounded: Vec<(&String, &ResourceLifetime)> = lifetimes
        .iter()
        .filter(|(_, lifetime)| !lifetime.is_unbounded())
        .collect();
    let candidates = graph.alias_candidates();
    for (index, (first, first_lifetime)) in bounded.iter().enumerate() {
        for (second, second_lifetime) in &bounded[index + 1..] {
            let listed = candidates.iter().any(|candidate| {
                candidate.contains(first.as_str()) && candidate.contains(second.as_str())
            });
            assert_eq!(
                listed,
                !first_lifetime.overlaps(second_lifetime),
                "{first} {first_lifetime:?} / {second} {second_lifetime:?}"
            );
        }
    }
    // In a chain, t_i lives over [i, i + 1].
    assert_eq!(
        graph.resource_lifetime("t1"),
        Some(ResourceLifetime {
            first_use: 1,
            last_use: 2
        })
    );
    graph.destroy(&mut backend);
}

#[test]
fn test_candidates_require_aliasing_enabled() {
    let mut backend = HeadlessBackend::new();
    let config = RenderGraphConfig {
        enable_aliasing: false,
        ..Default::default()
    };
    let mut graph = linear_chain(config, 6);
    graph.build(&mut backend, true).unwrap();
    assert!(graph.alias_candidates().is_empty());
    assert_eq!(graph.lifetimes().len(), 6);
    graph.destroy(&mut backend);
}

#[test]
fn test_physical_aliasing_keeps_output_correct() {
    common::init_logging();
    let config = RenderGraphConfig {
        physical_aliasing: true,
        ..Default::default()
    };
    let mut backend = HeadlessBackend::new();
    let mut graph = linear_chain(config, 6);
    graph.build(&mut backend, true).unwrap();
    // Two alternating slots carry t0..t4; the output has its own.
    assert_eq!(graph.physical_texture_count(), 3);

    for _ in 0..2 {
        let done = graph.execute(&mut backend, &[]).unwrap();
        backend
            .present(graph.output_texture().unwrap(), &[done])
            .unwrap();
    }
    assert_eq!(backend.presented_frames().len(), 2);
    graph.destroy(&mut backend);
}

// ============================================================================
// Transfers
// ============================================================================

/// `scene` renders 4x MSAA, `resolve` resolves it into "resolved" and
/// `upscale` blits that into the output.
fn msaa_resolve_chain(config: RenderGraphConfig) -> RenderGraph {
    let mut graph = RenderGraph::with_config(config);
    graph.add_named_size("swapchain", SWAPCHAIN).unwrap();
    graph
        .add_render_pass(RenderGraphPass::new("scene", PipelineType::Graphics).color_output(
            "scene_msaa",
            swapchain_color(TextureFormat::Rgba8Unorm).with_samples(4),
            AttachmentLoad::clear_color(Vec4::new(1.0, 0.0, 0.0, 1.0)),
        ))
        .unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("resolve", PipelineType::General)
                .transfer_input("scene_msaa")
                .transfer_output("resolved", Some(swapchain_color(TextureFormat::Rgba8Unorm)))
                .on_render(|ctx| ctx.resolve("scene_msaa", "resolved")),
        )
        .unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("upscale", PipelineType::General)
                .transfer_input("resolved")
                .transfer_output("out", Some(swapchain_color(TextureFormat::Rgba8Unorm)))
                .on_render(|ctx| ctx.blit("resolved", "out", FilterMode::Linear)),
        )
        .unwrap();
    graph.set_render_graph_output("out").unwrap();
    graph
}

#[rstest]
#[case::plain(false)]
#[case::physical_aliasing(true)]
fn test_msaa_resolve_then_blit_to_output(#[case] physical_aliasing: bool) {
    common::init_logging();
    let config = RenderGraphConfig {
        physical_aliasing,
        ..Default::default()
    };
    let mut backend = HeadlessBackend::new();
    let mut graph = msaa_resolve_chain(config);
    graph.build(&mut backend, true).unwrap();

    assert_eq!(graph.execution_order(), vec!["scene", "resolve", "upscale"]);
    assert_eq!(
        graph.resource_lifetime("scene_msaa"),
        Some(ResourceLifetime {
            first_use: 0,
            last_use: 1
        })
    );
    assert_eq!(
        graph.resource_lifetime("resolved"),
        Some(ResourceLifetime {
            first_use: 1,
            last_use: 2
        })
    );
    assert!(graph.resource_lifetime("out").unwrap().is_unbounded());
    // Every pair overlaps somewhere, so nothing may share memory.
    assert!(graph.alias_candidates().is_empty());
    assert_eq!(graph.physical_texture_count(), 3);

    for _ in 0..3 {
        let done = graph.execute(&mut backend, &[]).unwrap();
        backend
            .present(graph.output_texture().unwrap(), &[done])
            .unwrap();
    }
    let stats = backend.stats();
    assert_eq!(stats.resolves, 3);
    assert_eq!(stats.blits, 3);
    assert_eq!(stats.render_passes, 3);

    let frames = backend.presented_frames();
    assert_eq!(frames.len(), 3);
    for frame in frames {
        assert_eq!(frame.dimensions(), (SWAPCHAIN.width, SWAPCHAIN.height));
        assert!(frame.pixels().all(|pixel| pixel.0 == [255, 0, 0, 255]));
    }
    graph.destroy(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn test_execute_before_build_is_rejected() {
    let mut backend = HeadlessBackend::new();
    let mut graph = post_chain(RenderGraphConfig::default(), SWAPCHAIN);
    assert_eq!(
        graph.execute(&mut backend, &[]),
        Err(RenderGraphError::NotBuilt)
    );
    assert_eq!(backend.stats().submits, 0);
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_execute_after_destroy_is_rejected() {
    let mut backend = HeadlessBackend::new();
    let mut graph = post_chain(RenderGraphConfig::default(), SWAPCHAIN);
    graph.build(&mut backend, true).unwrap();
    graph.destroy(&mut backend);
    assert_eq!(
        graph.execute(&mut backend, &[]),
        Err(RenderGraphError::NotBuilt)
    );
}

#[test]
fn test_configuration_locked_while_built() {
    let mut backend = HeadlessBackend::new();
    let mut graph = post_chain(RenderGraphConfig::default(), SWAPCHAIN);
    graph.build(&mut backend, true).unwrap();

    let pass = RenderGraphPass::new("late", PipelineType::Compute);
    assert!(matches!(
        graph.add_render_pass(pass),
        Err(RenderGraphError::InvalidState {
            state: GraphState::Built,
            ..
        })
    ));
    assert!(matches!(
        graph.set_render_graph_output("scene"),
        Err(RenderGraphError::InvalidState { .. })
    ));
    graph.destroy(&mut backend);
}

#[test]
fn test_destroy_releases_every_backend_object() {
    let mut backend = HeadlessBackend::new();
    let mut graph = post_chain(RenderGraphConfig::default(), SWAPCHAIN);
    graph.build(&mut backend, true).unwrap();
    graph.execute(&mut backend, &[]).unwrap();
    assert!(backend.live_object_count() > 0);

    graph.destroy(&mut backend);
    assert_eq!(backend.live_object_count(), 0);
    assert_eq!(graph.state(), GraphState::Configuring);
    assert!(graph.texture("scene").is_none());
}

// ============================================================================
// Build failures
// ============================================================================

#[test]
fn test_missing_named_size_fails_build() {
    let mut backend = HeadlessBackend::new();
    let mut graph = RenderGraph::new();
    graph
        .add_render_pass(RenderGraphPass::new("draw", PipelineType::Graphics).color_output(
            "out",
            swapchain_color(TextureFormat::Rgba8Unorm),
            AttachmentLoad::DontCare,
        ))
        .unwrap();
    graph.set_render_graph_output("out").unwrap();

    assert_eq!(
        graph.build(&mut backend, true),
        Err(RenderGraphError::UnknownNamedSize("swapchain".into()))
    );
    assert_eq!(graph.state(), GraphState::Configuring);
}

#[test]
fn test_backend_failure_leaves_graph_configuring() {
    let mut backend = HeadlessBackend::new().with_texture_limit(1);
    let mut graph = post_chain(RenderGraphConfig::default(), SWAPCHAIN);
    assert_eq!(
        graph.build(&mut backend, true),
        Err(RenderGraphError::Backend(BackendError::OutOfMemory))
    );
    assert_eq!(graph.state(), GraphState::Configuring);
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_failing_init_callback_fails_build() {
    let mut backend = HeadlessBackend::new();
    let mut graph = RenderGraph::new();
    graph.add_named_size("swapchain", SWAPCHAIN).unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("broken", PipelineType::Graphics)
                .color_output(
                    "out",
                    swapchain_color(TextureFormat::Rgba8Unorm),
                    AttachmentLoad::DontCare,
                )
                .on_init(|ctx| Err(RenderGraphError::callback(ctx.pass_name(), "shader missing"))),
        )
        .unwrap();
    graph.set_render_graph_output("out").unwrap();

    let err = graph.build(&mut backend, true).unwrap_err();
    assert!(matches!(err, RenderGraphError::Callback { ref pass, .. } if pass == "broken"));
    assert_eq!(graph.state(), GraphState::Configuring);
    assert_eq!(backend.live_object_count(), 0);
}

#[test]
fn test_build_without_validation_still_orders() {
    let mut backend = HeadlessBackend::new();
    let mut graph = RenderGraph::new();
    graph.add_named_size("swapchain", SWAPCHAIN).unwrap();
    // Inserted consumer-first; the order follows the data.
    graph
        .add_render_pass(
            RenderGraphPass::new("present_prep", PipelineType::Graphics)
                .read_storage_buffer("histogram")
                .color_output(
                    "out",
                    swapchain_color(TextureFormat::Rgba8Unorm),
                    AttachmentLoad::DontCare,
                ),
        )
        .unwrap();
    graph
        .add_render_pass(
            RenderGraphPass::new("histogram", PipelineType::Compute).storage_buffer(
                "histogram",
                StorageAccess::Write,
                Some(BufferResourceDesc::new(256 * 4)),
            ),
        )
        .unwrap();
    graph.set_render_graph_output("out").unwrap();

    graph.build(&mut backend, false).unwrap();
    assert_eq!(graph.execution_order(), vec!["histogram", "present_prep"]);
    let histogram = graph.buffer("histogram").unwrap();
    assert!(backend.buffer_contents(histogram).is_some());
    assert_eq!(graph.physical_buffer_count(), 1);

    graph.execute(&mut backend, &[]).unwrap();
    graph.destroy(&mut backend);
}
