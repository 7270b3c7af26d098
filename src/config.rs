//! Configuration for buckets and bucket hierarchies.
//!
//! A [`BucketConfig`] holds the parameters of a single bucket and doubles as
//! the constructor argument. A [`HierarchyConfig`] describes a whole tree of
//! named buckets, loadable from YAML, that builds into a [`Hierarchy`]
//! registry with parents wired ancestor-first.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::bucket::Bucket;
use crate::error::{CascadeError, Result};

/// Configuration for a single bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens held. May be infinite (`.inf` in YAML).
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Initial token count. Defaults to the capacity.
    #[serde(default)]
    pub tokens: Option<f64>,

    /// Tokens added per refill interval.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Duration of one refill interval in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Credit fractional tokens continuously instead of a full batch per
    /// interval.
    #[serde(default)]
    pub spread: bool,

    /// Ceiling on the combined wait across the hierarchy, in milliseconds.
    #[serde(default)]
    pub max_wait_ms: Option<u64>,

    /// Persistence identity. Buckets without one cannot be saved or loaded.
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            tokens: None,
            refill_rate: default_refill_rate(),
            interval_ms: default_interval_ms(),
            spread: false,
            max_wait_ms: None,
            key: None,
        }
    }
}

fn default_capacity() -> f64 {
    1.0
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_interval_ms() -> u64 {
    1000
}

/// A named node in a bucket hierarchy definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketNode {
    /// Unique name for the bucket within the hierarchy.
    pub name: String,

    /// Bucket parameters.
    #[serde(flatten)]
    pub config: BucketConfig,

    /// Child buckets gated by this one.
    #[serde(default)]
    pub children: Vec<BucketNode>,
}

/// A complete hierarchy configuration containing one or more root buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HierarchyConfig {
    /// Root buckets of the hierarchy
    #[serde(default)]
    pub roots: Vec<BucketNode>,
}

impl HierarchyConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading bucket hierarchy configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try to parse as a single root bucket (the common case)
        if let Ok(node) = serde_yaml::from_str::<BucketNode>(yaml) {
            return Ok(Self { roots: vec![node] });
        }

        // Otherwise, try to parse as a full config with multiple roots
        serde_yaml::from_str(yaml).map_err(|e| {
            CascadeError::Config(format!("failed to parse hierarchy config: {}", e))
        })
    }

    /// Build the configured buckets, wiring children to their parents.
    ///
    /// Names must be unique across the whole hierarchy.
    pub fn build(&self) -> Result<Hierarchy> {
        let mut buckets = HashMap::new();
        for root in &self.roots {
            Self::build_node(root, None, &mut buckets)?;
        }
        Ok(Hierarchy { buckets })
    }

    fn build_node(
        node: &BucketNode,
        parent: Option<Arc<Bucket>>,
        out: &mut HashMap<String, Arc<Bucket>>,
    ) -> Result<()> {
        if out.contains_key(&node.name) {
            return Err(CascadeError::Config(format!(
                "duplicate bucket name: {}",
                node.name
            )));
        }
        let bucket = match parent {
            Some(parent) => Arc::new(Bucket::with_parent(node.config.clone(), parent)),
            None => Arc::new(Bucket::new(node.config.clone())),
        };
        out.insert(node.name.clone(), Arc::clone(&bucket));
        for child in &node.children {
            Self::build_node(child, Some(Arc::clone(&bucket)), out)?;
        }
        Ok(())
    }
}

/// A built registry of buckets keyed by name.
#[derive(Debug)]
pub struct Hierarchy {
    buckets: HashMap<String, Arc<Bucket>>,
}

impl Hierarchy {
    /// Look up a bucket by name.
    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(name).map(Arc::clone)
    }

    /// Number of buckets in the hierarchy.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the hierarchy holds no buckets.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let yaml = "name: root";
        let config = HierarchyConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.roots.len(), 1);

        let node = &config.roots[0];
        assert_eq!(node.name, "root");
        assert_eq!(node.config.capacity, 1.0);
        assert_eq!(node.config.refill_rate, 1.0);
        assert_eq!(node.config.interval_ms, 1000);
        assert!(!node.config.spread);
        assert!(node.config.max_wait_ms.is_none());
    }

    #[test]
    fn test_parse_nested_hierarchy() {
        let yaml = r#"
roots:
  - name: api
    capacity: 1000
    refill_rate: 1000
    interval_ms: 86400000
    children:
      - name: per_user
        capacity: 15
        refill_rate: 15
        interval_ms: 900000
        max_wait_ms: 3600000
"#;
        let config = HierarchyConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.roots.len(), 1);
        assert_eq!(config.roots[0].children.len(), 1);

        let child = &config.roots[0].children[0];
        assert_eq!(child.config.capacity, 15.0);
        assert_eq!(child.config.max_wait_ms, Some(3_600_000));
    }

    #[test]
    fn test_parse_infinite_capacity() {
        let yaml = r#"
name: unbounded
capacity: .inf
"#;
        let config = HierarchyConfig::from_yaml(yaml).unwrap();
        assert!(config.roots[0].config.capacity.is_infinite());
    }

    #[test]
    fn test_build_wires_parents() {
        let yaml = r#"
roots:
  - name: root
    capacity: 3
    children:
      - name: leaf
        capacity: 10
"#;
        let hierarchy = HierarchyConfig::from_yaml(yaml).unwrap().build().unwrap();
        assert_eq!(hierarchy.len(), 2);

        let leaf = hierarchy.get("leaf").unwrap();
        assert!(leaf.parent().is_some());
        assert_eq!(leaf.parent().unwrap().capacity(), 3.0);
        assert!(hierarchy.get("root").unwrap().parent().is_none());
    }

    #[test]
    fn test_built_hierarchy_gates_admission() {
        let yaml = r#"
roots:
  - name: root
    capacity: 3
    children:
      - name: leaf
        capacity: 10
"#;
        let hierarchy = HierarchyConfig::from_yaml(yaml).unwrap().build().unwrap();
        let leaf = hierarchy.get("leaf").unwrap();

        // The leaf holds plenty, but the root runs out after the first debit.
        assert!(leaf.try_remove(2.0));
        assert!(!leaf.try_remove(2.0));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
roots:
  - name: api
  - name: api
"#;
        let config = HierarchyConfig::from_yaml(yaml).unwrap();
        let err = config.build().unwrap_err();
        assert!(matches!(err, CascadeError::Config(_)));
        assert!(err.to_string().contains("duplicate bucket name"));
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let err = HierarchyConfig::from_yaml("roots: 12").unwrap_err();
        assert!(matches!(err, CascadeError::Config(_)));
    }
}
