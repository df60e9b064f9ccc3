//! Resource lifetimes and aliasing candidates.
//!
//! Lifetimes are measured in execution positions: the index of a pass in the
//! order the graph runs them. Two resources whose spans never overlap could
//! share memory; the graph reports every such pair.

use std::collections::BTreeMap;

use super::pass::RenderGraphPass;

/// Resource lifetime in terms of pass execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceLifetime {
    /// First execution position that uses the resource
    pub first_use: usize,
    /// Last execution position that uses the resource, inclusive
    pub last_use: usize,
}

impl ResourceLifetime {
    /// `last_use` of a resource that must outlive the frame.
    pub const UNBOUNDED: usize = usize::MAX;

    pub fn new(position: usize) -> Self {
        Self {
            first_use: position,
            last_use: position,
        }
    }

    pub fn extend(&mut self, position: usize) {
        self.first_use = self.first_use.min(position);
        self.last_use = self.last_use.max(position);
    }

    pub fn is_unbounded(&self) -> bool {
        self.last_use == Self::UNBOUNDED
    }

    pub fn is_alive_at(&self, position: usize) -> bool {
        self.first_use <= position && position <= self.last_use
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// Two resources that are never alive at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasCandidate {
    pub first: String,
    pub second: String,
}

impl AliasCandidate {
    pub fn contains(&self, name: &str) -> bool {
        self.first == name || self.second == name
    }
}

/// Compute one span per resource name over the execution order. The output
/// is pinned to [`ResourceLifetime::UNBOUNDED`].
pub(crate) fn compute_lifetimes(
    passes: &[RenderGraphPass],
    order: &[usize],
    output: Option<&str>,
) -> BTreeMap<String, ResourceLifetime> {
    let mut lifetimes: BTreeMap<String, ResourceLifetime> = BTreeMap::new();
    for (position, &pass_index) in order.iter().enumerate() {
        for (name, _) in passes[pass_index].accesses() {
            match lifetimes.get_mut(name) {
                Some(lifetime) => lifetime.extend(position),
                None => {
                    lifetimes.insert(name.to_string(), ResourceLifetime::new(position));
                }
            }
        }
    }
    if let Some(lifetime) = output.and_then(|output| lifetimes.get_mut(output)) {
        lifetime.last_use = ResourceLifetime::UNBOUNDED;
    }
    lifetimes
}

/// Every unordered pair with disjoint spans, in name order. Unbounded
/// resources never take part.
pub(crate) fn find_alias_candidates(
    lifetimes: &BTreeMap<String, ResourceLifetime>,
) -> Vec<AliasCandidate> {
    let bounded: Vec<(&String, &ResourceLifetime)> = lifetimes
        .iter()
        .filter(|(_, lifetime)| !lifetime.is_unbounded())
        .collect();

    let mut candidates = Vec::new();
    for (index, (first, first_lifetime)) in bounded.iter().enumerate() {
        for (second, second_lifetime) in &bounded[index + 1..] {
            if !first_lifetime.overlaps(second_lifetime) {
                candidates.push(AliasCandidate {
                    first: (*first).clone(),
                    second: (*second).clone(),
                });
            }
        }
    }
    log::debug!(
        "Render graph: {} aliasing candidates over {} resources",
        candidates.len(),
        lifetimes.len()
    );
    candidates
}
