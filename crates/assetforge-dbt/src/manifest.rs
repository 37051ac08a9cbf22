//! dbt manifest.json parsing
//!
//! Parses dbt-generated manifest.json and flattens its node, source, exposure
//! and metric tables into one node table keyed by unique_id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Oldest manifest schema version we can read
pub const MIN_MANIFEST_VERSION: u32 = 4;

/// Newest manifest schema version we can read
pub const MAX_MANIFEST_VERSION: u32 = 12;

/// dbt manifest.json structure (subset of fields we care about)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Metadata about the manifest
    pub metadata: ManifestMetadata,

    /// Models, seeds, snapshots, tests, analyses
    pub nodes: BTreeMap<String, ManifestNode>,

    /// Source definitions
    #[serde(default)]
    pub sources: BTreeMap<String, ManifestSource>,

    /// Exposure definitions
    #[serde(default)]
    pub exposures: BTreeMap<String, ManifestExposure>,

    /// Metric definitions
    #[serde(default)]
    pub metrics: BTreeMap<String, ManifestMetric>,

    /// Parent map (node -> list of parent nodes)
    #[serde(default)]
    pub parent_map: BTreeMap<String, Vec<String>>,

    /// Child map (node -> list of child nodes)
    #[serde(default)]
    pub child_map: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// Load manifest from file, rejecting unsupported schema versions
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::IoError(path.display().to_string(), e.to_string()))?;

        Self::from_str(&contents)
    }

    /// Parse manifest from JSON string, rejecting unsupported schema versions
    pub fn from_str(json: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest =
            serde_json::from_str(json).map_err(|e| ManifestError::ParseError(e.to_string()))?;

        manifest.check_version()?;
        Ok(manifest)
    }

    /// Schema version number parsed from `dbt_schema_version`
    /// (e.g. `https://schemas.getdbt.com/dbt/manifest/v9.json` -> 9)
    pub fn schema_version(&self) -> Option<u32> {
        let url = self.metadata.dbt_schema_version.trim();
        let file = url.rsplit('/').next()?;
        let kind = url.trim_end_matches(file).trim_end_matches('/').rsplit('/').next()?;
        if kind != "manifest" {
            return None;
        }
        file.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
    }

    /// Ensure the manifest schema version is one we understand
    pub fn check_version(&self) -> Result<(), ManifestError> {
        match self.schema_version() {
            Some(v) if (MIN_MANIFEST_VERSION..=MAX_MANIFEST_VERSION).contains(&v) => Ok(()),
            _ => Err(ManifestError::UnsupportedVersion(
                self.metadata.dbt_schema_version.clone(),
            )),
        }
    }

    /// Flatten nodes, sources, exposures and metrics into one table
    pub fn node_table(&self) -> BTreeMap<String, DbtNode> {
        let mut table = BTreeMap::new();

        for (id, node) in &self.nodes {
            table.insert(id.clone(), DbtNode::from(node));
        }
        for (id, source) in &self.sources {
            table.insert(id.clone(), DbtNode::from(source));
        }
        for (id, exposure) in &self.exposures {
            table.insert(id.clone(), DbtNode::from(exposure));
        }
        for (id, metric) in &self.metrics {
            table.insert(id.clone(), DbtNode::from(metric));
        }

        table
    }

}

/// Manifest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub dbt_schema_version: String,
    pub dbt_version: String,
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
}

/// dbt resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Model,
    Source,
    Seed,
    Snapshot,
    Test,
    Exposure,
    Metric,
    Analysis,
    Operation,
    SqlOperation,
    SemanticModel,
    #[serde(other)]
    Other,
}

impl ResourceType {
    /// Stable lowercase name, as written in manifest.json
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Source => "source",
            Self::Seed => "seed",
            Self::Snapshot => "snapshot",
            Self::Test => "test",
            Self::Exposure => "exposure",
            Self::Metric => "metric",
            Self::Analysis => "analysis",
            Self::Operation => "operation",
            Self::SqlOperation => "sql_operation",
            Self::SemanticModel => "semantic_model",
            Self::Other => "other",
        }
    }

    /// Parse a resource type name, returning `None` for unknown names
    pub fn parse(name: &str) -> Option<Self> {
        let parsed = match name {
            "model" => Self::Model,
            "source" => Self::Source,
            "seed" => Self::Seed,
            "snapshot" => Self::Snapshot,
            "test" => Self::Test,
            "exposure" => Self::Exposure,
            "metric" => Self::Metric,
            "analysis" => Self::Analysis,
            "operation" => Self::Operation,
            "sql_operation" => Self::SqlOperation,
            "semantic_model" => Self::SemanticModel,
            _ => return None,
        };
        Some(parsed)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A node in the manifest (model, test, snapshot, etc.)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestNode {
    /// Unique identifier (e.g., "model.my_project.users")
    pub unique_id: String,

    /// Node name (e.g., "users")
    pub name: String,

    /// Resource type (model, test, snapshot, etc.)
    pub resource_type: ResourceType,

    /// Package name
    pub package_name: String,

    /// Relative path to SQL file
    #[serde(default)]
    pub path: String,

    /// Original file path
    #[serde(default)]
    pub original_file_path: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Schema name
    #[serde(default)]
    pub schema: Option<String>,

    /// Alias (output table name)
    #[serde(default)]
    pub alias: Option<String>,

    /// Node configuration
    #[serde(default)]
    pub config: NodeConfig,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Dependencies
    #[serde(default)]
    pub depends_on: DependsOn,

    /// Fully qualified name
    #[serde(default)]
    pub fqn: Vec<String>,
}

/// Node configuration (from dbt_project.yml or model config)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether the node is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Materialization type
    #[serde(default)]
    pub materialized: Option<String>,

    /// Custom schema configured on the node
    #[serde(default)]
    pub schema: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            materialized: None,
            schema: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Dependencies structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependsOn {
    /// List of node unique_ids this node depends on
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A source in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSource {
    /// Unique identifier (e.g., "source.my_project.raw.users")
    pub unique_id: String,

    /// Source name (e.g., "raw")
    pub source_name: String,

    /// Table name (e.g., "users")
    pub name: String,

    /// Package name
    #[serde(default)]
    pub package_name: String,

    /// Original file path (the sources yml)
    #[serde(default)]
    pub original_file_path: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Schema name
    #[serde(default)]
    pub schema: Option<String>,

    /// Identifier (actual table name)
    #[serde(default)]
    pub identifier: Option<String>,

    /// Description
    #[serde(default)]
    pub description: String,

    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Source configuration
    #[serde(default)]
    pub config: NodeConfig,

    /// Fully qualified name
    #[serde(default)]
    pub fqn: Vec<String>,
}

/// An exposure in the manifest (dashboards, notebooks, applications)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestExposure {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub original_file_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub fqn: Vec<String>,
}

/// A metric in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetric {
    pub unique_id: String,
    pub name: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub original_file_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: NodeConfig,
    #[serde(default)]
    pub depends_on: DependsOn,
    #[serde(default)]
    pub fqn: Vec<String>,
}

/// Uniform view of any manifest entry, used by selection and projection
#[derive(Debug, Clone, PartialEq)]
pub struct DbtNode {
    pub unique_id: String,
    pub name: String,
    pub resource_type: ResourceType,
    pub package_name: String,
    pub original_file_path: String,
    pub fqn: Vec<String>,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
    pub enabled: bool,
    pub materialized: Option<String>,
    pub description: String,
    /// Custom schema from node config
    pub config_schema: Option<String>,
    /// Source name, for sources only
    pub source_name: Option<String>,
}

impl From<&ManifestNode> for DbtNode {
    fn from(node: &ManifestNode) -> Self {
        Self {
            unique_id: node.unique_id.clone(),
            name: node.name.clone(),
            resource_type: node.resource_type,
            package_name: node.package_name.clone(),
            original_file_path: node.original_file_path.clone(),
            fqn: node.fqn.clone(),
            depends_on: node.depends_on.nodes.clone(),
            tags: node.tags.clone(),
            enabled: node.config.enabled,
            materialized: node.config.materialized.clone(),
            description: node.description.clone(),
            config_schema: node.config.schema.clone(),
            source_name: None,
        }
    }
}

impl From<&ManifestSource> for DbtNode {
    fn from(source: &ManifestSource) -> Self {
        Self {
            unique_id: source.unique_id.clone(),
            name: source.name.clone(),
            resource_type: ResourceType::Source,
            package_name: source.package_name.clone(),
            original_file_path: source.original_file_path.clone(),
            fqn: source.fqn.clone(),
            depends_on: Vec::new(),
            tags: source.tags.clone(),
            enabled: source.config.enabled,
            materialized: None,
            description: source.description.clone(),
            config_schema: None,
            source_name: Some(source.source_name.clone()),
        }
    }
}

impl From<&ManifestExposure> for DbtNode {
    fn from(exposure: &ManifestExposure) -> Self {
        Self {
            unique_id: exposure.unique_id.clone(),
            name: exposure.name.clone(),
            resource_type: ResourceType::Exposure,
            package_name: exposure.package_name.clone(),
            original_file_path: exposure.original_file_path.clone(),
            fqn: exposure.fqn.clone(),
            depends_on: exposure.depends_on.nodes.clone(),
            tags: exposure.tags.clone(),
            enabled: exposure.config.enabled,
            materialized: None,
            description: exposure.description.clone(),
            config_schema: None,
            source_name: None,
        }
    }
}

impl From<&ManifestMetric> for DbtNode {
    fn from(metric: &ManifestMetric) -> Self {
        Self {
            unique_id: metric.unique_id.clone(),
            name: metric.name.clone(),
            resource_type: ResourceType::Metric,
            package_name: metric.package_name.clone(),
            original_file_path: metric.original_file_path.clone(),
            fqn: metric.fqn.clone(),
            depends_on: metric.depends_on.nodes.clone(),
            tags: metric.tags.clone(),
            enabled: metric.config.enabled,
            materialized: None,
            description: metric.description.clone(),
            config_schema: None,
            source_name: None,
        }
    }
}

/// Manifest parsing errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to read manifest file {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse manifest JSON: {0}")]
    ParseError(String),

    #[error(
        "Unsupported manifest schema version '{0}' (supported: v{min} through v{max})",
        min = MIN_MANIFEST_VERSION,
        max = MAX_MANIFEST_VERSION
    )]
    UnsupportedVersion(String),
}
