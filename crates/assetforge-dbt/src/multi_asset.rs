//! Multi-output asset definition for a dbt project
//!
//! A [`DbtMultiAsset`] exposes one output per selected dbt asset node and,
//! at execution time, turns the requested subset of outputs back into a dbt
//! selection.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use assetforge_core::DbtConfig;

use crate::manifest::{DbtNode, Manifest, ResourceType};
use crate::projector::{get_deps, unmanaged_inputs, ASSET_RESOURCE_TYPES};
use crate::selector::{select_unique_ids, SelectionSyntaxError};

/// Kind tag shown next to dbt assets in the UI
pub const COMPUTE_KIND: &str = "dbt";

/// Separator dbt uses between fqn segments in a selection
pub const FQN_SEPARATOR: &str = ".";

/// Hierarchical asset key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AssetKey(pub Vec<String>);

impl AssetKey {
    /// Default key for a dbt node: `[source_name, name]` for sources,
    /// `[config.schema, name]` when a custom schema is set, else `[name]`
    pub fn for_node(node: &DbtNode) -> Self {
        if node.resource_type == ResourceType::Source {
            let source_name = node.source_name.clone().unwrap_or_default();
            return Self(vec![source_name, node.name.clone()]);
        }

        match &node.config_schema {
            Some(schema) => Self(vec![schema.clone(), node.name.clone()]),
            None => Self(vec![node.name.clone()]),
        }
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One output of the multi-asset
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetOut {
    pub output_name: String,
    pub asset_key: AssetKey,
    pub unique_id: String,
    pub resource_type: ResourceType,
    pub description: Option<String>,
    /// Always false: the asset can be subset
    pub is_required: bool,
}

/// Output name for a dbt unique_id (`model.pkg.name` -> `model_pkg_name`)
pub fn output_name(unique_id: &str) -> String {
    unique_id.replace(['.', '-'], "_")
}

/// Arguments for one dbt invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbtInvocation {
    /// dbt sub-command (run, build, seed, ...)
    pub command: String,
    /// `--select` values
    pub select: Vec<String>,
    /// `--exclude` value
    pub exclude: Option<String>,
}

impl DbtInvocation {
    /// Command-line arguments after the executable and global flags
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![self.command.clone()];
        if !self.select.is_empty() {
            args.push("--select".to_string());
            args.extend(self.select.iter().cloned());
        }
        if let Some(exclude) = &self.exclude {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        args
    }
}

/// Errors building or invoking the multi-asset
#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error(transparent)]
    Selection(#[from] SelectionSyntaxError),

    #[error("Output name '{output_name}' is produced by both {first} and {second}")]
    DuplicateOutputName {
        output_name: String,
        first: String,
        second: String,
    },

    #[error("Unknown output '{0}' requested")]
    UnknownOutput(String),

    #[error("No outputs were requested")]
    EmptySelection,
}

/// A single multi-output computation over a dbt project
#[derive(Debug, Clone)]
pub struct DbtMultiAsset {
    select: String,
    exclude: Option<String>,
    outs: BTreeMap<String, AssetOut>,
    internal_asset_deps: BTreeMap<String, BTreeSet<String>>,
    non_argument_deps: BTreeSet<AssetKey>,
    fqns_by_output_name: BTreeMap<String, Vec<String>>,
}

impl DbtMultiAsset {
    /// Resolve the selection and derive outputs and their dependencies
    pub fn new(manifest: &Manifest, select: &str, exclude: Option<&str>) -> Result<Self, AssetError> {
        let exclude = exclude.filter(|e| !e.trim().is_empty());
        let unique_ids = select_unique_ids(manifest, select, exclude)?;
        let nodes = manifest.node_table();
        let deps = get_deps(&nodes, &unique_ids, ASSET_RESOURCE_TYPES);

        let mut outs: BTreeMap<String, AssetOut> = BTreeMap::new();
        let mut fqns_by_output_name = BTreeMap::new();
        let mut output_by_id = BTreeMap::new();

        for unique_id in deps.keys() {
            let Some(node) = nodes.get(unique_id) else {
                continue;
            };
            let name = output_name(unique_id);

            if let Some(existing) = outs.get(&name) {
                return Err(AssetError::DuplicateOutputName {
                    output_name: name,
                    first: existing.unique_id.clone(),
                    second: unique_id.clone(),
                });
            }

            outs.insert(
                name.clone(),
                AssetOut {
                    output_name: name.clone(),
                    asset_key: AssetKey::for_node(node),
                    unique_id: unique_id.clone(),
                    resource_type: node.resource_type,
                    description: Some(node.description.clone()).filter(|d| !d.is_empty()),
                    is_required: false,
                },
            );
            fqns_by_output_name.insert(name.clone(), node.fqn.clone());
            output_by_id.insert(unique_id.clone(), name);
        }

        let internal_asset_deps = deps
            .iter()
            .filter_map(|(unique_id, upstream)| {
                let name = output_by_id.get(unique_id)?;
                let upstream_names = upstream
                    .iter()
                    .filter_map(|id| output_by_id.get(id).cloned())
                    .collect();
                Some((name.clone(), upstream_names))
            })
            .collect();

        let non_argument_deps = unmanaged_inputs(&nodes, &deps)
            .iter()
            .filter_map(|id| nodes.get(id).map(AssetKey::for_node))
            .collect();

        tracing::info!(
            select,
            exclude = exclude.unwrap_or(""),
            outputs = outs.len(),
            "Built dbt multi-asset"
        );

        Ok(Self {
            select: select.to_string(),
            exclude: exclude.map(str::to_string),
            outs,
            internal_asset_deps,
            non_argument_deps,
            fqns_by_output_name,
        })
    }

    /// Build from the `[dbt]` config section's default selection
    pub fn from_config(manifest: &Manifest, config: &DbtConfig) -> Result<Self, AssetError> {
        Self::new(manifest, &config.select, config.exclude.as_deref())
    }

    /// Original include selection
    pub fn select(&self) -> &str {
        &self.select
    }

    /// Original exclude selection
    pub fn exclude(&self) -> Option<&str> {
        self.exclude.as_deref()
    }

    /// Outputs keyed by output name
    pub fn outs(&self) -> &BTreeMap<String, AssetOut> {
        &self.outs
    }

    /// All output names
    pub fn output_names(&self) -> BTreeSet<String> {
        self.outs.keys().cloned().collect()
    }

    /// Output name -> names of the outputs it depends on
    pub fn internal_asset_deps(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.internal_asset_deps
    }

    /// Keys of upstream inputs that are not outputs of this asset
    pub fn non_argument_deps(&self) -> &BTreeSet<AssetKey> {
        &self.non_argument_deps
    }

    /// Output name -> fqn of its dbt node
    pub fn fqns_by_output_name(&self) -> &BTreeMap<String, Vec<String>> {
        &self.fqns_by_output_name
    }

    pub fn compute_kind(&self) -> &'static str {
        COMPUTE_KIND
    }

    pub fn can_subset(&self) -> bool {
        true
    }

    /// Translate the requested outputs into a dbt invocation
    ///
    /// When every output is requested the original selection strings are
    /// reused verbatim. Otherwise each requested output becomes one
    /// `--select` entry: its fqn joined with `.`.
    pub fn invocation(
        &self,
        command: &str,
        requested: &BTreeSet<String>,
    ) -> Result<DbtInvocation, AssetError> {
        if requested.is_empty() {
            return Err(AssetError::EmptySelection);
        }
        if let Some(unknown) = requested.iter().find(|name| !self.outs.contains_key(*name)) {
            return Err(AssetError::UnknownOutput(unknown.clone()));
        }

        if requested.len() == self.outs.len() {
            return Ok(DbtInvocation {
                command: command.to_string(),
                select: vec![self.select.clone()],
                exclude: self.exclude.clone(),
            });
        }

        let select = requested
            .iter()
            .filter_map(|name| self.fqns_by_output_name.get(name))
            .map(|fqn| fqn.join(FQN_SEPARATOR))
            .collect();

        Ok(DbtInvocation {
            command: command.to_string(),
            select,
            exclude: None,
        })
    }

    /// Map dbt unique_ids back to output names, skipping ids that are not outputs
    pub fn output_names_for(&self, unique_ids: &[String]) -> BTreeSet<String> {
        unique_ids
            .iter()
            .map(|id| output_name(id))
            .filter(|name| self.outs.contains_key(name))
            .collect()
    }
}
