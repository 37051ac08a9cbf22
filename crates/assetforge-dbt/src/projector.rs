//! Dependency projection
//!
//! Restricts the manifest DAG to the selected asset nodes. Upstreams that are
//! not selected, or are not assets (sources, for instance), are dropped from
//! the projection and reported separately as unmanaged inputs.

use std::collections::{BTreeMap, BTreeSet};

use crate::manifest::{DbtNode, ResourceType};

/// Resource types that become orchestration assets
pub const ASSET_RESOURCE_TYPES: &[ResourceType] =
    &[ResourceType::Model, ResourceType::Seed, ResourceType::Snapshot];

/// Immediate upstreams of every selected asset node, restricted to selected
/// asset nodes.
///
/// Every selected asset node gets an entry, with an empty list when none of
/// its upstreams survive. Upstream order follows the manifest, de-duplicated.
/// The manifest DAG is assumed acyclic.
pub fn get_deps(
    nodes: &BTreeMap<String, DbtNode>,
    selected_unique_ids: &BTreeSet<String>,
    asset_resource_types: &[ResourceType],
) -> BTreeMap<String, Vec<String>> {
    let is_selected_asset = |id: &str| {
        selected_unique_ids.contains(id)
            && nodes
                .get(id)
                .is_some_and(|node| asset_resource_types.contains(&node.resource_type))
    };

    let mut deps = BTreeMap::new();

    for unique_id in selected_unique_ids {
        if !is_selected_asset(unique_id) {
            continue;
        }
        let Some(node) = nodes.get(unique_id) else {
            continue;
        };

        let mut upstream: Vec<String> = Vec::new();
        for parent_id in &node.depends_on {
            if is_selected_asset(parent_id) && !upstream.contains(parent_id) {
                upstream.push(parent_id.clone());
            }
        }

        deps.insert(unique_id.clone(), upstream);
    }

    deps
}

/// Upstreams of projected nodes that the projection dropped but the manifest
/// knows about: sources and unselected assets.
pub fn unmanaged_inputs(
    nodes: &BTreeMap<String, DbtNode>,
    deps: &BTreeMap<String, Vec<String>>,
) -> BTreeSet<String> {
    let mut inputs = BTreeSet::new();

    for unique_id in deps.keys() {
        let Some(node) = nodes.get(unique_id) else {
            continue;
        };
        for parent_id in &node.depends_on {
            if deps.contains_key(parent_id) {
                continue;
            }
            let known_input = nodes.get(parent_id).is_some_and(|parent| {
                parent.resource_type == ResourceType::Source
                    || ASSET_RESOURCE_TYPES.contains(&parent.resource_type)
            });
            if known_input {
                inputs.insert(parent_id.clone());
            }
        }
    }

    inputs
}
