//! dbt project adapter
//!
//! This crate handles:
//! - Parsing manifest.json (dbt-generated artifacts)
//! - Building the dependency graph (DAG)
//! - Evaluating dbt selection strings against the manifest
//! - Projecting the selection into a multi-output asset
//! - Running the dbt CLI and parsing its JSON log stream

pub mod manifest;
pub mod dag;
pub mod selector;
pub mod projector;
pub mod multi_asset;
pub mod cli_runner;

pub use manifest::{
    DbtNode, DependsOn, Manifest, ManifestError, ManifestExposure, ManifestMetadata,
    ManifestMetric, ManifestNode, ManifestSource, NodeConfig, ResourceType,
};
pub use dag::{DependencyGraph, NodeId};
pub use selector::{select_from_nodes, select_unique_ids, SelectionSpec, SelectionSyntaxError};
pub use projector::{get_deps, unmanaged_inputs, ASSET_RESOURCE_TYPES};
pub use multi_asset::{AssetError, AssetKey, AssetOut, DbtInvocation, DbtMultiAsset, COMPUTE_KIND};
pub use cli_runner::{DbtCliClient, DbtCliError, DbtCliEvent, DbtCliLine, DbtCliOutput};
