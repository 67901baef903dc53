//! JSON-backed configuration for a pipeline's node properties.
//!
//! Node properties (`AlgorithmNode::describe_properties`/`set_property`) are the
//! kernel's runtime configuration surface; a CLI option parser is out of scope, but
//! something has to load a config file's worth of properties into a pipeline before
//! `update()` runs. [`PipelineConfig`] is that generic sink: a flat map of node name to
//! a map of property name to value, round-tripped through `serde_json` the same way
//! `crate::metrics::MetricsCollector::save_to_file` serializes its own JSON report.

use crate::error::{KernelError, KernelResult};
use crate::node::PropertyValue;
use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// A single property value as it appears in a config file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<ConfigValue> for PropertyValue {
    fn from(v: ConfigValue) -> Self {
        match v {
            ConfigValue::Int(i) => PropertyValue::Int(i),
            ConfigValue::Float(f) => PropertyValue::Float(f),
            ConfigValue::Str(s) => PropertyValue::Str(s),
            ConfigValue::Bool(b) => PropertyValue::Bool(b),
        }
    }
}

impl From<PropertyValue> for ConfigValue {
    fn from(v: PropertyValue) -> Self {
        match v {
            PropertyValue::Int(i) => ConfigValue::Int(i),
            PropertyValue::Float(f) => ConfigValue::Float(f),
            PropertyValue::Str(s) => ConfigValue::Str(s),
            PropertyValue::Bool(b) => ConfigValue::Bool(b),
        }
    }
}

/// A named node's property settings, keyed by the node name a config author chooses
/// (distinct from the pipeline's internal `NodeId`, which is assigned at `add_node`
/// time and not known ahead of config-file authoring).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    nodes: BTreeMap<String, BTreeMap<String, ConfigValue>>,
}

impl PipelineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property value for a named node, overwriting any prior value.
    pub fn set(&mut self, node_name: impl Into<String>, property: impl Into<String>, value: impl Into<ConfigValue>) {
        self.nodes.entry(node_name.into()).or_default().insert(property.into(), value.into());
    }

    /// Properties configured for `node_name`, if any were set.
    #[must_use]
    pub fn properties_for(&self, node_name: &str) -> Option<&BTreeMap<String, ConfigValue>> {
        self.nodes.get(node_name)
    }

    /// Load a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> KernelResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| KernelError::IoFailure {
            step: None,
            reason: format!("failed to read config file {}: {e}", path.as_ref().display()),
        })?;
        serde_json::from_str(&text).map_err(|e| KernelError::IoFailure {
            step: None,
            reason: format!("failed to parse config file {}: {e}", path.as_ref().display()),
        })
    }

    /// Save this config to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> KernelResult<()> {
        let text = serde_json::to_string_pretty(self).map_err(|e| KernelError::IoFailure {
            step: None,
            reason: format!("failed to serialize config: {e}"),
        })?;
        fs::write(path.as_ref(), text).map_err(|e| KernelError::IoFailure {
            step: None,
            reason: format!("failed to write config file {}: {e}", path.as_ref().display()),
        })
    }

    /// Apply every configured property to the matching node in `pipeline`, by looking
    /// up each configured node name in `named_nodes` (a caller-supplied map from the
    /// names used in the config file to the `NodeId`s `Pipeline::add_node` returned).
    pub fn apply(&self, pipeline: &Pipeline, named_nodes: &BTreeMap<String, crate::node_id::NodeId>) -> KernelResult<()> {
        for (node_name, props) in &self.nodes {
            let id = *named_nodes.get(node_name).ok_or_else(|| KernelError::KeyMissing {
                key: node_name.clone(),
            })?;
            for (prop_name, value) in props {
                pipeline.set_property(id, prop_name, value.clone().into())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryMeshSource;
    use crate::dataset::{Extent, Mesh};
    use crate::mapreduce::MapReduceNode;
    use crate::node::PropertyValue;
    use std::sync::Arc;

    #[test]
    fn set_and_properties_for_roundtrip() {
        let mut cfg = PipelineConfig::new();
        cfg.set("reduce", "first_step", ConfigValue::Int(1));
        cfg.set("reduce", "thread_pool_size", ConfigValue::Int(4));

        let props = cfg.properties_for("reduce").unwrap();
        assert_eq!(props.get("first_step"), Some(&ConfigValue::Int(1)));
        assert_eq!(props.get("thread_pool_size"), Some(&ConfigValue::Int(4)));
    }

    #[test]
    fn json_roundtrip_preserves_values() {
        let mut cfg = PipelineConfig::new();
        cfg.set("reduce", "last_step", ConfigValue::Int(-1));
        let text = serde_json::to_string(&cfg).unwrap();
        let decoded: PipelineConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn apply_sets_properties_on_the_matching_node() {
        let p = Pipeline::new();
        let src = p.add_node(InMemoryMeshSource::new("src", Extent::new(0, 0, 0, 0, 0, 0), vec![Mesh::new(Extent::new(0, 0, 0, 0, 0, 0))]));
        let reduce = p.add_node(MapReduceNode::new("sum", |l, _r| Ok(l), Arc::new(crate::comm::SingleProcessComm)));
        p.connect(reduce, 0, src, 0);

        let mut cfg = PipelineConfig::new();
        cfg.set("reduce", "thread_pool_size", ConfigValue::Int(2));
        let mut names = BTreeMap::new();
        names.insert("reduce".to_string(), reduce);
        cfg.apply(&p, &names).unwrap();

        assert_eq!(p.get_property(reduce, "thread_pool_size").unwrap(), PropertyValue::Int(2));
    }
}
