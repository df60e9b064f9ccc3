//! Physical placement of logical resources.
//!
//! Without aliasing every logical resource gets its own texture or buffer.
//! With aliasing, transient resources are packed greedily: sorted by first
//! use, each takes the first slot whose previous occupant has the identical
//! description and is already dead. Descriptions compare by their unresolved
//! size, so a named-size resize never splits a slot.

use std::collections::{BTreeMap, HashSet};

use super::compiler::ResourceInfo;
use super::lifetime::ResourceLifetime;
use super::pass::RenderGraphPass;
use super::resource::ResourceDesc;

/// Physical resource a logical resource is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysicalSlot {
    Texture(usize),
    Buffer(usize),
}

#[derive(Debug, Default)]
pub(crate) struct SlotAssignment {
    pub(crate) slots: BTreeMap<String, PhysicalSlot>,
    /// Logical resources per physical texture, in placement order.
    pub(crate) texture_members: Vec<Vec<String>>,
    pub(crate) buffer_members: Vec<Vec<String>>,
}

struct OpenSlot {
    slot: PhysicalSlot,
    desc: ResourceDesc,
    last_use: usize,
}

/// Resources whose first use in execution order reads them. Their contents
/// must survive from the previous frame, so they are never aliased.
pub(crate) fn persistent_resources(passes: &[RenderGraphPass], order: &[usize]) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut persistent = HashSet::new();
    for &pass_index in order {
        let accesses = passes[pass_index].accesses();
        for (name, _) in &accesses {
            if seen.contains(*name) {
                continue;
            }
            let reads = accesses
                .iter()
                .any(|(other, usage)| other == name && usage.is_read());
            if reads {
                persistent.insert(name.to_string());
            }
        }
        for (name, _) in accesses {
            seen.insert(name.to_string());
        }
    }
    persistent
}

pub(crate) fn assign_slots(
    resources: &BTreeMap<String, ResourceInfo>,
    lifetimes: &BTreeMap<String, ResourceLifetime>,
    persistent: &HashSet<String>,
    enabled: bool,
) -> SlotAssignment {
    let unknown = ResourceLifetime {
        first_use: 0,
        last_use: ResourceLifetime::UNBOUNDED,
    };
    let mut ordered: Vec<(&String, &ResourceInfo, ResourceLifetime)> = resources
        .iter()
        .map(|(name, info)| (name, info, lifetimes.get(name).copied().unwrap_or(unknown)))
        .collect();
    ordered.sort_by(|a, b| a.2.first_use.cmp(&b.2.first_use).then_with(|| a.0.cmp(b.0)));

    let mut assignment = SlotAssignment::default();
    let mut open: Vec<OpenSlot> = Vec::new();
    for (name, info, lifetime) in ordered {
        let aliasable = enabled && !lifetime.is_unbounded() && !persistent.contains(name);
        let reused = aliasable
            .then(|| {
                open.iter_mut().find(|candidate| {
                    candidate.desc == info.desc && candidate.last_use < lifetime.first_use
                })
            })
            .flatten();

        let slot = match reused {
            Some(candidate) => {
                candidate.last_use = lifetime.last_use;
                log::trace!("Render graph: {} aliases {:?}", name, candidate.slot);
                candidate.slot
            }
            None => {
                let slot = match info.desc {
                    ResourceDesc::Texture(_) => {
                        assignment.texture_members.push(Vec::new());
                        PhysicalSlot::Texture(assignment.texture_members.len() - 1)
                    }
                    ResourceDesc::Buffer(_) => {
                        assignment.buffer_members.push(Vec::new());
                        PhysicalSlot::Buffer(assignment.buffer_members.len() - 1)
                    }
                };
                if aliasable {
                    open.push(OpenSlot {
                        slot,
                        desc: info.desc.clone(),
                        last_use: lifetime.last_use,
                    });
                }
                slot
            }
        };

        match slot {
            PhysicalSlot::Texture(index) => assignment.texture_members[index].push(name.clone()),
            PhysicalSlot::Buffer(index) => assignment.buffer_members[index].push(name.clone()),
        }
        assignment.slots.insert(name.clone(), slot);
    }
    assignment
}
