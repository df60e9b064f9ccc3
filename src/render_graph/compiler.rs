//! Validation and ordering of render graph passes.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use super::pass::{PipelineType, RenderGraphPass};
use super::resource::{ResourceDesc, ResourceUsage};
use super::{RenderGraphError, RenderGraphResult};
use crate::backend::types::*;

/// A logical resource with the usage flags accumulated over every pass.
#[derive(Debug, Clone)]
pub(crate) struct ResourceInfo {
    pub(crate) desc: ResourceDesc,
    pub(crate) texture_usage: TextureUsage,
    pub(crate) buffer_usage: BufferUsage,
}

/// Check the configured graph. Cycles are reported by [`execution_order`].
pub(crate) fn validate(
    passes: &[RenderGraphPass],
    named_sizes: &HashMap<String, Extent3d>,
    output: Option<&str>,
) -> RenderGraphResult<()> {
    check_pass_names(passes)?;
    for pass in passes {
        check_pass_structure(pass)?;
    }
    check_named_sizes(passes, named_sizes)?;
    check_output(passes, output)?;
    check_reads_are_produced(passes)?;
    check_descriptions(passes)?;
    for pass in passes {
        check_attachment_extents(pass, named_sizes)?;
    }
    Ok(())
}

fn check_pass_names(passes: &[RenderGraphPass]) -> RenderGraphResult<()> {
    let mut seen = HashSet::new();
    for pass in passes {
        if !seen.insert(pass.name()) {
            log::error!("Render graph: duplicate pass name {}", pass.name());
            return Err(RenderGraphError::DuplicatePassName(pass.name().to_string()));
        }
    }
    Ok(())
}

fn invalid_pass(pass: &RenderGraphPass, reason: impl Into<String>) -> RenderGraphError {
    RenderGraphError::InvalidPass {
        pass: pass.name().to_string(),
        reason: reason.into(),
    }
}

fn check_pass_structure(pass: &RenderGraphPass) -> RenderGraphResult<()> {
    let declarations = &pass.declarations;
    match pass.pipeline_type() {
        PipelineType::Graphics => {
            if !declarations.has_attachments() {
                return Err(invalid_pass(pass, "graphics pass without color or depth output"));
            }
            if !declarations.transfer_inputs.is_empty() || !declarations.transfer_outputs.is_empty()
            {
                return Err(invalid_pass(pass, "transfers cannot run inside a render pass"));
            }
        }
        PipelineType::Compute | PipelineType::General => {
            if declarations.has_attachments() {
                return Err(invalid_pass(pass, "only graphics passes have attachments"));
            }
        }
    }

    // One layout per texture while the pass runs.
    let mut layouts: HashMap<&str, TextureLayout> = HashMap::new();
    for (name, usage) in pass.accesses() {
        let Some(layout) = usage.texture_layout() else {
            continue;
        };
        if let Some(previous) = layouts.insert(name, layout) {
            if previous != layout {
                return Err(invalid_pass(
                    pass,
                    format!("{name} is used as both {previous:?} and {layout:?}"),
                ));
            }
        }
    }
    Ok(())
}

fn check_named_sizes(
    passes: &[RenderGraphPass],
    named_sizes: &HashMap<String, Extent3d>,
) -> RenderGraphResult<()> {
    for pass in passes {
        for (_, desc) in pass.declarations.descriptions() {
            let Some(texture) = desc.as_texture() else {
                continue;
            };
            if let Some(name) = texture.size.named_size() {
                if !named_sizes.contains_key(name) {
                    log::error!("Pass {} references unknown named size {}", pass.name(), name);
                    return Err(RenderGraphError::UnknownNamedSize(name.to_string()));
                }
            }
        }
    }
    Ok(())
}

fn check_output(passes: &[RenderGraphPass], output: Option<&str>) -> RenderGraphResult<()> {
    let output = output.ok_or(RenderGraphError::MissingOutput)?;
    let produced = passes.iter().any(|pass| {
        pass.accesses()
            .iter()
            .any(|(name, usage)| *name == output && usage.is_write() && usage.is_texture())
    });
    if !produced {
        return Err(RenderGraphError::OutputNotProduced(output.to_string()));
    }
    Ok(())
}

fn check_reads_are_produced(passes: &[RenderGraphPass]) -> RenderGraphResult<()> {
    let written: HashSet<&str> = passes
        .iter()
        .flat_map(|pass| pass.accesses())
        .filter(|(_, usage)| usage.is_write())
        .map(|(name, _)| name)
        .collect();
    for pass in passes {
        for (name, usage) in pass.accesses() {
            if usage.is_read() && !written.contains(name) {
                return Err(RenderGraphError::ResourceNeverWritten {
                    resource: name.to_string(),
                    pass: pass.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_descriptions(passes: &[RenderGraphPass]) -> RenderGraphResult<()> {
    let mut descriptions: HashMap<&str, ResourceDesc> = HashMap::new();
    for pass in passes {
        for (name, desc) in pass.declarations.descriptions() {
            match descriptions.get(name) {
                Some(existing) if *existing != desc => {
                    log::error!(
                        "Pass {} describes {} as {:?}, previously {:?}",
                        pass.name(),
                        name,
                        desc,
                        existing
                    );
                    return Err(RenderGraphError::DescriptionMismatch(name.to_string()));
                }
                Some(_) => {}
                None => {
                    descriptions.insert(name, desc);
                }
            }
        }
    }

    let mut kinds: HashMap<&str, bool> = HashMap::new();
    for pass in passes {
        for (name, usage) in pass.accesses() {
            let is_texture = *kinds.entry(name).or_insert(usage.is_texture());
            if is_texture != usage.is_texture() {
                return Err(RenderGraphError::DescriptionMismatch(name.to_string()));
            }
        }
    }
    for (name, desc) in &descriptions {
        if kinds.get(name).is_some_and(|is_texture| *is_texture != desc.is_texture()) {
            return Err(RenderGraphError::DescriptionMismatch(name.to_string()));
        }
    }
    Ok(())
}

fn check_attachment_extents(
    pass: &RenderGraphPass,
    named_sizes: &HashMap<String, Extent3d>,
) -> RenderGraphResult<()> {
    let declarations = &pass.declarations;
    let mut extents = declarations
        .color_outputs
        .iter()
        .chain(declarations.depth_output.iter())
        .filter_map(|attachment| attachment.desc.size.resolve(named_sizes));
    if let Some(first) = extents.next() {
        if extents.any(|extent| extent != first) {
            log::error!("Pass {}: attachment extents differ", pass.name());
            return Err(RenderGraphError::AttachmentExtentMismatch {
                pass: pass.name().to_string(),
            });
        }
    }
    Ok(())
}

/// Gather every logical resource. The first description of a name wins.
pub(crate) fn collect_resources(
    passes: &[RenderGraphPass],
    output: Option<&str>,
) -> RenderGraphResult<BTreeMap<String, ResourceInfo>> {
    let mut descriptions: HashMap<&str, ResourceDesc> = HashMap::new();
    for pass in passes {
        for (name, desc) in pass.declarations.descriptions() {
            descriptions.entry(name).or_insert(desc);
        }
    }

    let mut resources: BTreeMap<String, ResourceInfo> = BTreeMap::new();
    for pass in passes {
        for (name, usage) in pass.accesses() {
            let desc = descriptions
                .get(name)
                .ok_or_else(|| RenderGraphError::MissingDescription(name.to_string()))?;
            if desc.is_texture() != usage.is_texture() {
                return Err(RenderGraphError::DescriptionMismatch(name.to_string()));
            }
            let info = resources
                .entry(name.to_string())
                .or_insert_with(|| ResourceInfo {
                    desc: desc.clone(),
                    texture_usage: TextureUsage::empty(),
                    buffer_usage: BufferUsage::empty(),
                });
            match usage {
                ResourceUsage::StorageBuffer(_) => {
                    info.buffer_usage |= BufferUsage::STORAGE | BufferUsage::COPY_DST;
                }
                _ => info.texture_usage |= usage.texture_usage(),
            }
        }
    }
    if let Some(info) = output.and_then(|output| resources.get_mut(output)) {
        // Presentation copies out of the output.
        info.texture_usage |= TextureUsage::COPY_SRC;
    }
    Ok(resources)
}

/// Dependency edges as successor sets, indexed by insertion order.
///
/// Per resource: a read depends on the last earlier writer, or on every later
/// writer when there is none; writers keep insertion order; a read that
/// follows a writer also precedes the next writer.
pub(crate) fn dependency_edges(passes: &[RenderGraphPass]) -> Vec<BTreeSet<usize>> {
    let mut successors = vec![BTreeSet::new(); passes.len()];

    let mut uses: BTreeMap<&str, Vec<(usize, bool, bool)>> = BTreeMap::new();
    for (index, pass) in passes.iter().enumerate() {
        let mut merged: BTreeMap<&str, (bool, bool)> = BTreeMap::new();
        for (name, usage) in pass.accesses() {
            let entry = merged.entry(name).or_default();
            entry.0 |= usage.is_read();
            entry.1 |= usage.is_write();
        }
        for (name, (reads, writes)) in merged {
            uses.entry(name).or_default().push((index, reads, writes));
        }
    }

    for list in uses.values() {
        let writers: Vec<usize> = list
            .iter()
            .filter(|(_, _, writes)| *writes)
            .map(|(index, _, _)| *index)
            .collect();
        for pair in writers.windows(2) {
            successors[pair[0]].insert(pair[1]);
        }
        for &(reader, reads, writes) in list {
            if !reads {
                continue;
            }
            match writers.iter().rev().find(|&&writer| writer < reader) {
                Some(&previous) => {
                    successors[previous].insert(reader);
                    if !writes {
                        if let Some(&next) = writers.iter().find(|&&writer| writer > reader) {
                            successors[reader].insert(next);
                        }
                    }
                }
                None if !writes => {
                    for &writer in writers.iter().filter(|&&writer| writer > reader) {
                        successors[writer].insert(reader);
                    }
                }
                None => {}
            }
        }
    }
    successors
}

/// Stable topological order: among ready passes the lowest insertion index
/// runs first.
pub(crate) fn execution_order(passes: &[RenderGraphPass]) -> RenderGraphResult<Vec<usize>> {
    let successors = dependency_edges(passes);
    let mut in_degree = vec![0usize; passes.len()];
    for targets in &successors {
        for &target in targets {
            in_degree[target] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(passes.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &target in &successors[index] {
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.push(Reverse(target));
            }
        }
    }

    if order.len() != passes.len() {
        let cyclic: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(index, _)| passes[index].name().to_string())
            .collect();
        log::error!("Render graph: cyclic dependency between {:?}", cyclic);
        return Err(RenderGraphError::CyclicDependency(cyclic));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::{
        AttachmentLoad, BufferResourceDesc, ResourceSize, StorageAccess, TextureResourceDesc,
    };

    fn desc(size: ResourceSize) -> TextureResourceDesc {
        TextureResourceDesc::new(size, TextureFormat::Rgba8Unorm)
    }

    fn screen() -> TextureResourceDesc {
        desc(ResourceSize::named("screen"))
    }

    fn sizes() -> HashMap<String, Extent3d> {
        HashMap::from([("screen".to_string(), Extent3d::new_2d(64, 32))])
    }

    fn writer(name: &str, output: &str) -> RenderGraphPass {
        RenderGraphPass::new(name, PipelineType::Graphics).color_output(
            output,
            screen(),
            AttachmentLoad::DontCare,
        )
    }

    fn reader(name: &str, input: &str, output: &str) -> RenderGraphPass {
        writer(name, output).sample_texture(input)
    }

    #[test]
    fn test_order_is_insertion_order_for_a_chain() {
        let passes = vec![
            writer("gbuffer", "albedo"),
            reader("lighting", "albedo", "hdr"),
            reader("tonemap", "hdr", "color"),
        ];
        assert_eq!(execution_order(&passes).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reader_added_before_writer_runs_after_it() {
        let passes = vec![reader("tonemap", "hdr", "color"), writer("lighting", "hdr")];
        assert_eq!(execution_order(&passes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_independent_passes_keep_insertion_order() {
        let passes = vec![
            writer("a", "ta"),
            writer("b", "tb"),
            reader("c", "tb", "tc"),
            reader("d", "ta", "td"),
        ];
        assert_eq!(execution_order(&passes).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_read_precedes_next_writer() {
        let passes = vec![
            writer("first", "shared"),
            reader("consume", "shared", "out"),
            writer("second", "shared"),
        ];
        let edges = dependency_edges(&passes);
        assert!(edges[0].contains(&1));
        assert!(edges[0].contains(&2));
        assert!(edges[1].contains(&2));
        assert_eq!(execution_order(&passes).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cycle_is_reported() {
        // a writes x after b wrote it (writer order), b reads y written by a later writer a.
        let passes = vec![
            RenderGraphPass::new("b", PipelineType::Compute)
                .storage_texture("x", StorageAccess::Write, Some(screen()))
                .storage_texture("y", StorageAccess::Read, None),
            RenderGraphPass::new("a", PipelineType::Compute)
                .storage_texture("x", StorageAccess::Write, Some(screen()))
                .storage_texture("y", StorageAccess::Write, Some(screen())),
            RenderGraphPass::new("c", PipelineType::Compute)
                .storage_texture("z", StorageAccess::Write, Some(screen())),
        ];
        // x: b -> a. y: a -> b (read with no earlier writer). Cycle.
        match execution_order(&passes) {
            Err(RenderGraphError::CyclicDependency(names)) => {
                assert_eq!(names, vec!["b".to_string(), "a".to_string()]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_failures() {
        let sizes = sizes();

        let duplicate = vec![writer("p", "a"), writer("p", "b")];
        assert_eq!(
            validate(&duplicate, &sizes, Some("a")),
            Err(RenderGraphError::DuplicatePassName("p".into()))
        );

        let passes = vec![writer("p", "a")];
        assert_eq!(validate(&passes, &sizes, None), Err(RenderGraphError::MissingOutput));
        assert_eq!(
            validate(&passes, &sizes, Some("b")),
            Err(RenderGraphError::OutputNotProduced("b".into()))
        );
        assert_eq!(
            validate(&passes, &HashMap::new(), Some("a")),
            Err(RenderGraphError::UnknownNamedSize("screen".into()))
        );

        let unproduced = vec![reader("p", "missing", "a")];
        assert_eq!(
            validate(&unproduced, &sizes, Some("a")),
            Err(RenderGraphError::ResourceNeverWritten {
                resource: "missing".into(),
                pass: "p".into()
            })
        );
    }

    #[test]
    fn test_description_mismatch() {
        let passes = vec![
            writer("p", "a"),
            RenderGraphPass::new("q", PipelineType::Graphics).color_output(
                "a",
                TextureResourceDesc::new(ResourceSize::named("screen"), TextureFormat::Rgba16Float),
                AttachmentLoad::Load,
            ),
        ];
        assert_eq!(
            validate(&passes, &sizes(), Some("a")),
            Err(RenderGraphError::DescriptionMismatch("a".into()))
        );

        let kinds = vec![
            writer("p", "a"),
            RenderGraphPass::new("q", PipelineType::Compute)
                .storage_buffer("a", StorageAccess::Read, None),
        ];
        assert_eq!(
            validate(&kinds, &sizes(), Some("a")),
            Err(RenderGraphError::DescriptionMismatch("a".into()))
        );
    }

    #[test]
    fn test_attachment_extent_mismatch() {
        let passes = vec![RenderGraphPass::new("p", PipelineType::Graphics)
            .color_output("a", screen(), AttachmentLoad::DontCare)
            .depth_output(
                "depth",
                TextureResourceDesc::new(
                    ResourceSize::Absolute(Extent3d::new_2d(16, 16)),
                    TextureFormat::Depth32Float,
                ),
                AttachmentLoad::clear_depth(1.0),
            )];
        assert_eq!(
            validate(&passes, &sizes(), Some("a")),
            Err(RenderGraphError::AttachmentExtentMismatch { pass: "p".into() })
        );
    }

    #[test]
    fn test_structure_checks() {
        let compute_with_attachment = vec![RenderGraphPass::new("p", PipelineType::Compute)
            .color_output("a", screen(), AttachmentLoad::DontCare)];
        assert!(matches!(
            validate(&compute_with_attachment, &sizes(), Some("a")),
            Err(RenderGraphError::InvalidPass { .. })
        ));

        let conflicting = vec![RenderGraphPass::new("p", PipelineType::Compute)
            .storage_texture("a", StorageAccess::Write, Some(screen()))
            .sample_texture("a")];
        assert!(matches!(
            validate(&conflicting, &sizes(), Some("a")),
            Err(RenderGraphError::InvalidPass { .. })
        ));
    }

    #[test]
    fn test_collect_resources_accumulates_usage() {
        let passes = vec![
            writer("gbuffer", "albedo"),
            reader("lighting", "albedo", "color")
                .storage_buffer("lights", StorageAccess::Write, Some(BufferResourceDesc::new(64))),
        ];
        let resources = collect_resources(&passes, Some("color")).unwrap();
        assert_eq!(resources.len(), 3);
        assert_eq!(
            resources["albedo"].texture_usage,
            TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLED
        );
        assert!(resources["color"].texture_usage.contains(TextureUsage::COPY_SRC));
        assert!(resources["lights"].buffer_usage.contains(BufferUsage::STORAGE));

        let undescribed = vec![RenderGraphPass::new("p", PipelineType::Compute)
            .storage_texture("a", StorageAccess::ReadWrite, None)];
        assert_eq!(
            collect_resources(&undescribed, None).unwrap_err(),
            RenderGraphError::MissingDescription("a".into())
        );
    }
}
