//! dbt node selection
//!
//! Evaluates `--select` / `--exclude` style expressions against a manifest.
//! Supported syntax:
//!
//! - whitespace separates unions, commas separate intersections
//! - `method:value` with methods `fqn` (default), `path`, `tag`,
//!   `resource_type`, `package`, `source`, `exposure`, `metric`,
//!   `config.materialized`
//! - `*` and `?` wildcards in values
//! - graph operators `+x`, `N+x`, `x+`, `x+N` and `@x`
//!
//! Disabled nodes are never selected.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::dag::DependencyGraph;
use crate::manifest::{DbtNode, Manifest, ResourceType};

/// Selection methods understood by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMethod {
    Fqn,
    Path,
    Tag,
    ResourceType,
    Package,
    Source,
    Exposure,
    Metric,
    ConfigMaterialized,
}

impl SelectMethod {
    fn parse(name: &str) -> Option<Self> {
        let method = match name {
            "fqn" => Self::Fqn,
            "path" | "file" => Self::Path,
            "tag" => Self::Tag,
            "resource_type" => Self::ResourceType,
            "package" => Self::Package,
            "source" => Self::Source,
            "exposure" => Self::Exposure,
            "metric" => Self::Metric,
            "config.materialized" => Self::ConfigMaterialized,
            _ => return None,
        };
        Some(method)
    }
}

/// How far a graph operator reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Unbounded,
    Limited(usize),
}

impl Depth {
    fn as_option(self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::Limited(n) => Some(n),
        }
    }
}

/// A single selection criterion, e.g. `2+tag:nightly+`
#[derive(Debug, Clone)]
pub struct Criterion {
    pub raw: String,
    pub method: SelectMethod,
    pub value: String,
    pub parents: Option<Depth>,
    pub children: Option<Depth>,
    pub childrens_parents: bool,
}

/// A parsed selection: a union of intersections of criteria
#[derive(Debug, Clone, Default)]
pub struct SelectionSpec {
    unions: Vec<Vec<Criterion>>,
}

/// Syntax errors in a selection expression
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionSyntaxError {
    #[error("Empty selection criterion in '{0}'")]
    EmptyCriterion(String),

    #[error("Invalid selection criterion '{0}'")]
    InvalidCriterion(String),

    #[error("Unknown selection method '{method}' in '{criterion}'")]
    UnknownMethod { method: String, criterion: String },

    #[error("Selection criterion '{0}' is missing a value after ':'")]
    MissingValue(String),

    #[error("Cannot combine '@' with a '+' child operator in '{0}'")]
    ConflictingOperators(String),

    #[error("Invalid unknown resource type '{0}'")]
    UnknownResourceType(String),
}

fn criterion_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<at>@)?(?:(?P<parents_depth>\d*)(?P<parents>\+))?(?P<body>[^+@]+?)(?:(?P<children>\+)(?P<children_depth>\d*))?$",
        )
        .expect("criterion regex is valid")
    })
}

impl Criterion {
    /// Parse one criterion token (no whitespace or commas)
    pub fn parse(raw: &str) -> Result<Self, SelectionSyntaxError> {
        if raw.is_empty() {
            return Err(SelectionSyntaxError::EmptyCriterion(raw.to_string()));
        }

        let caps = criterion_regex()
            .captures(raw)
            .ok_or_else(|| SelectionSyntaxError::InvalidCriterion(raw.to_string()))?;

        let childrens_parents = caps.name("at").is_some();
        let parents = caps
            .name("parents")
            .map(|_| Self::depth(caps.name("parents_depth").map_or("", |m| m.as_str())));
        let children = caps
            .name("children")
            .map(|_| Self::depth(caps.name("children_depth").map_or("", |m| m.as_str())));

        if childrens_parents && children.is_some() {
            return Err(SelectionSyntaxError::ConflictingOperators(raw.to_string()));
        }

        let body = caps.name("body").map_or("", |m| m.as_str());
        let (method, value) = match body.split_once(':') {
            Some((method_name, value)) => {
                let method = SelectMethod::parse(method_name).ok_or_else(|| {
                    SelectionSyntaxError::UnknownMethod {
                        method: method_name.to_string(),
                        criterion: raw.to_string(),
                    }
                })?;
                if value.is_empty() {
                    return Err(SelectionSyntaxError::MissingValue(raw.to_string()));
                }
                (method, value.to_string())
            }
            None => (Self::default_method(body), body.to_string()),
        };

        if method == SelectMethod::ResourceType && ResourceType::parse(&value).is_none() {
            return Err(SelectionSyntaxError::UnknownResourceType(value));
        }

        Ok(Self {
            raw: raw.to_string(),
            method,
            value,
            parents,
            children,
            childrens_parents,
        })
    }

    fn depth(digits: &str) -> Depth {
        // regex guarantees digits only; overflow falls back to unbounded
        if digits.is_empty() {
            Depth::Unbounded
        } else {
            digits.parse().map(Depth::Limited).unwrap_or(Depth::Unbounded)
        }
    }

    /// Path-looking values use the path method, everything else fqn
    fn default_method(value: &str) -> SelectMethod {
        if value.contains('/') || value.contains('\\') || value.ends_with(".sql") {
            SelectMethod::Path
        } else {
            SelectMethod::Fqn
        }
    }

    /// Nodes matched by the criterion before graph operators are applied
    fn matching_nodes(&self, nodes: &BTreeMap<String, DbtNode>) -> BTreeSet<String> {
        let matcher = Pattern::new(&self.value);
        nodes
            .values()
            .filter(|node| node.enabled && self.matches(node, &matcher))
            .map(|node| node.unique_id.clone())
            .collect()
    }

    fn matches(&self, node: &DbtNode, pattern: &Pattern) -> bool {
        match self.method {
            SelectMethod::Fqn => fqn_matches(&node.fqn, &self.value),
            SelectMethod::Path => path_matches(&node.original_file_path, &self.value, pattern),
            SelectMethod::Tag => node.tags.iter().any(|tag| pattern.matches(tag)),
            SelectMethod::ResourceType => node.resource_type.as_str() == self.value,
            SelectMethod::Package => pattern.matches(&node.package_name),
            SelectMethod::Source => {
                node.resource_type == ResourceType::Source && source_matches(node, &self.value)
            }
            SelectMethod::Exposure => {
                node.resource_type == ResourceType::Exposure && named_matches(node, &self.value)
            }
            SelectMethod::Metric => {
                node.resource_type == ResourceType::Metric && named_matches(node, &self.value)
            }
            SelectMethod::ConfigMaterialized => node
                .materialized
                .as_deref()
                .is_some_and(|m| pattern.matches(m)),
        }
    }

    /// Evaluate the criterion including its graph operators
    pub fn evaluate(
        &self,
        nodes: &BTreeMap<String, DbtNode>,
        graph: &DependencyGraph,
    ) -> BTreeSet<String> {
        let initial = self.matching_nodes(nodes);
        let mut selected = initial.clone();

        for id in &initial {
            if let Some(depth) = self.parents {
                selected.extend(graph.ancestors(id, depth.as_option()));
            }
            if let Some(depth) = self.children {
                selected.extend(graph.descendants(id, depth.as_option()));
            }
        }

        if self.childrens_parents {
            let mut descendants = initial.clone();
            for id in &initial {
                descendants.extend(graph.descendants(id, None));
            }
            selected.extend(descendants.iter().cloned());
            for id in &descendants {
                selected.extend(graph.ancestors(id, None));
            }
        }

        // graph walks can reach disabled or unknown ids
        selected.retain(|id| nodes.get(id).is_some_and(|node| node.enabled));
        selected
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl SelectionSpec {
    /// Parse a full selection expression
    pub fn parse(raw: &str) -> Result<Self, SelectionSyntaxError> {
        let mut unions = Vec::new();

        for token in raw.split_whitespace() {
            let intersection = token
                .split(',')
                .map(|part| {
                    if part.is_empty() {
                        Err(SelectionSyntaxError::EmptyCriterion(token.to_string()))
                    } else {
                        Criterion::parse(part)
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            unions.push(intersection);
        }

        Ok(Self { unions })
    }

    /// Whether the expression selects nothing (empty or whitespace-only)
    pub fn is_empty(&self) -> bool {
        self.unions.is_empty()
    }

    /// Evaluate to a set of unique ids
    pub fn evaluate(
        &self,
        nodes: &BTreeMap<String, DbtNode>,
        graph: &DependencyGraph,
    ) -> BTreeSet<String> {
        let mut selected = BTreeSet::new();

        for intersection in &self.unions {
            let mut parts = intersection.iter().map(|c| c.evaluate(nodes, graph));
            let Some(first) = parts.next() else {
                continue;
            };
            let matched = parts.fold(first, |acc, next| acc.intersection(&next).cloned().collect());
            selected.extend(matched);
        }

        selected
    }
}

/// Select unique ids from a manifest: `include` minus `exclude`
///
/// An empty `include` selects nothing; an empty `exclude` excludes nothing.
pub fn select_unique_ids(
    manifest: &Manifest,
    include: &str,
    exclude: Option<&str>,
) -> Result<BTreeSet<String>, SelectionSyntaxError> {
    let nodes = manifest.node_table();
    let graph = DependencyGraph::from_manifest(manifest);
    select_from_nodes(&nodes, &graph, include, exclude)
}

/// Same as [`select_unique_ids`] over an already-flattened node table
pub fn select_from_nodes(
    nodes: &BTreeMap<String, DbtNode>,
    graph: &DependencyGraph,
    include: &str,
    exclude: Option<&str>,
) -> Result<BTreeSet<String>, SelectionSyntaxError> {
    let include_spec = SelectionSpec::parse(include)?;
    let exclude_spec = SelectionSpec::parse(exclude.unwrap_or(""))?;

    let mut selected = include_spec.evaluate(nodes, graph);
    if !exclude_spec.is_empty() {
        let excluded = exclude_spec.evaluate(nodes, graph);
        selected.retain(|id| !excluded.contains(id));
    }

    tracing::debug!(
        include,
        exclude = exclude.unwrap_or(""),
        selected = selected.len(),
        "Evaluated dbt selection"
    );

    Ok(selected)
}

/// Glob-style matcher for `*` and `?`
#[derive(Debug)]
enum Pattern {
    Exact(String),
    Glob(Regex),
}

impl Pattern {
    fn new(value: &str) -> Self {
        if !has_wildcard(value) {
            return Self::Exact(value.to_string());
        }

        let mut expr = String::from("^");
        for ch in value.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        match Regex::new(&expr) {
            Ok(re) => Self::Glob(re),
            Err(_) => Self::Exact(value.to_string()),
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Exact(value) => value == text,
            Self::Glob(re) => re.is_match(text),
        }
    }
}

fn has_wildcard(value: &str) -> bool {
    value.contains('*') || value.contains('?')
}

/// fqn matching: a bare node name, a dotted fqn prefix (with or without the
/// package), or a wildcard over the rest of the dotted fqn
fn fqn_matches(fqn: &[String], selector: &str) -> bool {
    if selector == "*" {
        return true;
    }
    if fqn.last().is_some_and(|name| name == selector) {
        return true;
    }

    let parts: Vec<&str> = selector.split('.').collect();
    fqn_prefix_matches(fqn, &parts) || (fqn.len() > 1 && fqn_prefix_matches(&fqn[1..], &parts))
}

fn fqn_prefix_matches(fqn: &[String], parts: &[&str]) -> bool {
    if parts.len() > fqn.len() {
        return false;
    }

    for (i, part) in parts.iter().enumerate() {
        if has_wildcard(part) {
            let rest_selector = parts[i..].join(".");
            let rest_fqn = fqn[i..].join(".");
            return Pattern::new(&rest_selector).matches(&rest_fqn);
        }
        if fqn[i] != *part {
            return false;
        }
    }

    true
}

fn path_matches(node_path: &str, selector: &str, pattern: &Pattern) -> bool {
    if node_path.is_empty() {
        return false;
    }

    let selector = selector.trim_end_matches('/');
    if has_wildcard(selector) {
        return pattern.matches(node_path);
    }

    node_path == selector
        || node_path
            .strip_prefix(selector)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// `source:raw`, `source:raw.customers` or `source:package.raw.customers`
fn source_matches(node: &DbtNode, selector: &str) -> bool {
    let source_name = node.source_name.as_deref().unwrap_or_default();
    let target: Vec<&str> = match selector.split('.').count() {
        1 => vec![source_name],
        2 => vec![source_name, &node.name],
        3 => vec![&node.package_name, source_name, &node.name],
        _ => return false,
    };
    Pattern::new(selector).matches(&target.join("."))
}

/// `exposure:name` or `exposure:package.name` (same for metrics)
fn named_matches(node: &DbtNode, selector: &str) -> bool {
    match selector.split_once('.') {
        Some(_) => Pattern::new(selector).matches(&format!("{}.{}", node.package_name, node.name)),
        None => Pattern::new(selector).matches(&node.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FIXTURE: &str = include_str!("../tests/fixtures/jaffle_shop_manifest.json");

    fn manifest() -> Manifest {
        Manifest::from_str(FIXTURE).unwrap()
    }

    fn select(include: &str, exclude: Option<&str>) -> Vec<String> {
        select_unique_ids(&manifest(), include, exclude)
            .unwrap()
            .into_iter()
            .collect()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        let mut v: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        v.sort();
        v
    }

    #[test]
    fn star_selects_every_enabled_node() {
        let selected = select("*", None);
        assert_eq!(selected.len(), manifest().node_table().len() - 1);
        assert!(!selected.contains(&"model.jaffle_shop.legacy_orders".to_string()));
    }

    #[test]
    fn bare_name_and_fqn_prefix() {
        assert_eq!(
            select("customers", None),
            ids(&["model.jaffle_shop.customers", "source.jaffle_shop.raw.customers"])
        );
        assert_eq!(
            select("marts", None),
            ids(&[
                "metric.jaffle_shop.revenue",
                "model.jaffle_shop.customers",
                "model.jaffle_shop.orders",
                "test.jaffle_shop.not_null_customers_customer_id",
            ])
        );
        assert_eq!(
            select("jaffle_shop.staging.stg_*", None),
            ids(&[
                "model.jaffle_shop.stg_customers",
                "model.jaffle_shop.stg_orders",
                "model.jaffle_shop.stg_payments",
            ])
        );
    }

    #[test]
    fn methods() {
        assert_eq!(
            select("tag:nightly", None),
            ids(&["model.jaffle_shop.customers", "model.jaffle_shop.orders"])
        );
        assert_eq!(select("resource_type:seed", None), ids(&["seed.jaffle_shop.country_codes"]));
        assert_eq!(
            select("source:raw.payments", None),
            ids(&["source.jaffle_shop.raw.payments"])
        );
        assert_eq!(
            select("config.materialized:table", None),
            ids(&["model.jaffle_shop.customers", "model.jaffle_shop.orders"])
        );
        assert_eq!(
            select("models/staging/stg_orders.sql", None),
            ids(&["model.jaffle_shop.stg_orders"])
        );
        assert_eq!(select("exposure:weekly_dashboard", None).len(), 1);
        assert_eq!(select("metric:revenue", None), ids(&["metric.jaffle_shop.revenue"]));
    }

    #[test]
    fn path_selects_directories() {
        let selected = select("path:models/staging", None);
        assert!(selected.contains(&"model.jaffle_shop.stg_customers".to_string()));
        assert!(selected.contains(&"source.jaffle_shop.raw.orders".to_string()));
        assert!(!selected.contains(&"model.jaffle_shop.customers".to_string()));
    }

    #[test]
    fn graph_operators() {
        assert_eq!(
            select("+orders", None),
            ids(&[
                "model.jaffle_shop.orders",
                "model.jaffle_shop.stg_orders",
                "model.jaffle_shop.stg_payments",
                "source.jaffle_shop.raw.orders",
                "source.jaffle_shop.raw.payments",
            ])
        );
        assert_eq!(
            select("1+orders", None),
            ids(&[
                "model.jaffle_shop.orders",
                "model.jaffle_shop.stg_orders",
                "model.jaffle_shop.stg_payments",
                "source.jaffle_shop.raw.orders",
            ])
        );
        assert_eq!(
            select("stg_payments+1", None),
            ids(&[
                "model.jaffle_shop.customers",
                "model.jaffle_shop.orders",
                "model.jaffle_shop.stg_payments",
            ])
        );
    }

    #[test]
    fn at_operator_adds_parents_of_children() {
        let selected = select("@stg_payments", None);
        // customers is a child, so its other parents come along
        assert!(selected.contains(&"model.jaffle_shop.stg_customers".to_string()));
        assert!(selected.contains(&"seed.jaffle_shop.country_codes".to_string()));
        assert!(selected.contains(&"exposure.jaffle_shop.weekly_dashboard".to_string()));
    }

    #[test]
    fn at_operator_combines_with_parent_operator() {
        let mut expected = select("@stg_payments", None);
        expected.extend(select("+stg_payments", None));
        expected.sort();
        expected.dedup();
        assert_eq!(select("@+stg_payments", None), expected);
    }

    #[test]
    fn intersection_and_union() {
        assert_eq!(
            select("tag:nightly,+orders", None),
            ids(&["model.jaffle_shop.orders"])
        );
        assert_eq!(
            select("stg_orders stg_payments", None),
            ids(&["model.jaffle_shop.stg_orders", "model.jaffle_shop.stg_payments"])
        );
    }

    #[test]
    fn exclude_is_subtracted() {
        assert_eq!(
            select("tag:staging", Some("stg_orders")),
            ids(&["model.jaffle_shop.stg_customers", "model.jaffle_shop.stg_payments"])
        );
        assert_eq!(select("tag:staging", Some("")).len(), 3);
    }

    #[test]
    fn disabled_nodes_are_never_selected() {
        assert!(select("legacy_orders", None).is_empty());
        assert!(!select("stg_orders+", None).contains(&"model.jaffle_shop.legacy_orders".to_string()));
    }

    #[test]
    fn empty_include_selects_nothing() {
        assert!(select("", None).is_empty());
        assert!(select("   ", None).is_empty());
    }

    #[test]
    fn selection_is_idempotent() {
        let m = manifest();
        let first = select_unique_ids(&m, "+customers", Some("resource_type:source")).unwrap();
        let second = select_unique_ids(&m, "+customers", Some("resource_type:source")).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn syntax_errors() {
        let m = manifest();
        assert!(matches!(
            select_unique_ids(&m, "bogus:thing", None),
            Err(SelectionSyntaxError::UnknownMethod { .. })
        ));
        assert!(matches!(
            select_unique_ids(&m, "tag:", None),
            Err(SelectionSyntaxError::MissingValue(_))
        ));
        assert!(matches!(
            select_unique_ids(&m, "orders,", None),
            Err(SelectionSyntaxError::EmptyCriterion(_))
        ));
        assert!(matches!(
            select_unique_ids(&m, "@orders+", None),
            Err(SelectionSyntaxError::ConflictingOperators(_))
        ));
        assert!(matches!(
            select_unique_ids(&m, "+", None),
            Err(SelectionSyntaxError::InvalidCriterion(_))
        ));
        assert!(matches!(
            select_unique_ids(&m, "orders", Some("resource_type:widget")),
            Err(SelectionSyntaxError::UnknownResourceType(_))
        ));
    }
}
