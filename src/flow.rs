use std::collections::{HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::node::NodeRegistry;

/// Flow tab markers carry no runtime behavior; they only group nodes.
pub const TAB_TYPE: &str = "tab";

/// Declarative description of one node: stable id, a type key into the node
/// registry, the enclosing flow tab, ordered output ports wired to target
/// node ids, and arbitrary type-specific properties.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NodeConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    /// Output ports, each an ordered list of target node ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wires: Vec<Vec<String>>,
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            z: None,
            wires: Vec::new(),
            props: Map::new(),
        }
    }

    pub fn with_z(mut self, z: impl Into<String>) -> Self {
        self.z = Some(z.into());
        self
    }

    pub fn with_wires(mut self, wires: Vec<Vec<String>>) -> Self {
        self.wires = wires;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn is_tab(&self) -> bool {
        self.type_name == TAB_TYPE
    }

    /// Canonical per-node digest, used both for the configuration revision
    /// and for change detection on partial deploys.
    pub fn digest(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        sha256_hex(canonical_json(&value).as_bytes())
    }
}

/// Per-node sensitive configuration, stored apart from the flows themselves
/// and never part of the revision hash.
pub type Credentials = HashMap<String, Value>;

/// The full deployable unit: the ordered node list across all flow tabs.
/// Insertion order is preserved for external editors but does not affect
/// routing or the revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct FlowConfig {
    pub nodes: Vec<NodeConfig>,
}

impl FlowConfig {
    pub fn new(nodes: Vec<NodeConfig>) -> Self {
        Self { nodes }
    }

    /// Parse the raw admin-facing shape: a JSON array of node objects.
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        if !value.is_array() {
            return Err(FlowError::NotAnArray);
        }
        serde_json::from_value(value).map_err(|e| FlowError::Malformed(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Array(Vec::new()))
    }

    pub fn get(&self, id: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes that become live instances (everything except tab markers).
    pub fn runtime_nodes(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(|n| !n.is_tab())
    }

    /// id -> canonical digest for every node, tabs included.
    pub fn digests(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .map(|n| (n.id.clone(), n.digest()))
            .collect()
    }

    /// Content revision of this configuration.
    ///
    /// Canonicalization is order-independent: nodes are sorted by id and each
    /// rendered as recursively key-sorted JSON before hashing, so reordering
    /// the node list never changes the revision while any property change
    /// does. Credentials are never part of the hash.
    pub fn rev(&self) -> String {
        let mut entries: Vec<(&str, String)> = self
            .nodes
            .iter()
            .map(|n| {
                let value = serde_json::to_value(n).unwrap_or(Value::Null);
                (n.id.as_str(), canonical_json(&value))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (_, canon) in &entries {
            hasher.update(canon.as_bytes());
            hasher.update(b"\n");
        }
        hex_digest(hasher)
    }
}

/// Reject configurations the graph builder cannot turn into a live graph:
/// duplicate ids, wires to missing or non-runtime targets, unknown types.
/// Runs before any live state is touched.
pub fn validate_config(config: &FlowConfig, registry: &NodeRegistry) -> Result<(), FlowError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for node in &config.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(FlowError::DuplicateId(node.id.clone()));
        }
    }

    let runtime_ids: HashSet<&str> = config.runtime_nodes().map(|n| n.id.as_str()).collect();
    for node in config.runtime_nodes() {
        if !registry.contains(&node.type_name) {
            return Err(FlowError::UnknownType {
                id: node.id.clone(),
                type_name: node.type_name.clone(),
            });
        }
        for port in &node.wires {
            for target in port {
                if !runtime_ids.contains(target.as_str()) {
                    return Err(FlowError::UnresolvedWire {
                        source_id: node.id.clone(),
                        target_id: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Render a JSON value with object keys recursively sorted, so two values
/// with identical content always serialize to identical bytes.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("flows configuration must be a JSON array of nodes")]
    NotAnArray,
    #[error("malformed node entry: {0}")]
    Malformed(String),
    #[error("duplicate node id `{0}`")]
    DuplicateId(String),
    #[error("node `{source_id}` wires to unknown node `{target_id}`")]
    UnresolvedWire { source_id: String, target_id: String },
    #[error("node `{id}` has unknown type `{type_name}`")]
    UnknownType { id: String, type_name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_nodes() -> Vec<NodeConfig> {
        vec![
            NodeConfig::new("a", "inject")
                .with_z("tab1")
                .with_wires(vec![vec!["b".into()]])
                .with_prop("payload", json!("tick")),
            NodeConfig::new("b", "debug").with_z("tab1"),
        ]
    }

    #[test]
    fn test_rev_is_deterministic() {
        let config = FlowConfig::new(sample_nodes());
        assert_eq!(config.rev(), config.rev());

        let reparsed = FlowConfig::from_value(config.to_value()).unwrap();
        assert_eq!(config.rev(), reparsed.rev());
    }

    #[test]
    fn test_rev_ignores_node_order() {
        let config = FlowConfig::new(sample_nodes());
        let mut reversed = sample_nodes();
        reversed.reverse();
        assert_eq!(config.rev(), FlowConfig::new(reversed).rev());
    }

    #[test]
    fn test_rev_changes_with_properties() {
        let config = FlowConfig::new(sample_nodes());
        let mut changed = sample_nodes();
        changed[0].props.insert("payload".into(), json!("tock"));
        assert_ne!(config.rev(), FlowConfig::new(changed).rev());
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn test_from_value_rejects_non_array() {
        let err = FlowConfig::from_value(json!({"flows": []})).unwrap_err();
        assert_eq!(err, FlowError::NotAnArray);
    }

    #[test]
    fn test_extra_props_survive_roundtrip() {
        let raw = json!([
            {"id": "n1", "type": "inject", "z": "t", "wires": [[]], "repeat": 5, "topic": "x"}
        ]);
        let config = FlowConfig::from_value(raw.clone()).unwrap();
        assert_eq!(config.nodes[0].prop("repeat"), Some(&json!(5)));
        assert_eq!(config.to_value()[0]["topic"], json!("x"));
    }

    #[test]
    fn test_validate_duplicate_id() {
        let registry = NodeRegistry::new();
        let config = FlowConfig::new(vec![
            NodeConfig::new("a", TAB_TYPE),
            NodeConfig::new("a", TAB_TYPE),
        ]);
        assert_eq!(
            validate_config(&config, &registry).unwrap_err(),
            FlowError::DuplicateId("a".into())
        );
    }

    #[test]
    fn test_validate_unresolved_wire() {
        let registry = crate::nodes::test_registry();
        let config = FlowConfig::new(vec![
            NodeConfig::new("a", "inject").with_wires(vec![vec!["ghost".into()]]),
        ]);
        assert_eq!(
            validate_config(&config, &registry).unwrap_err(),
            FlowError::UnresolvedWire {
                source_id: "a".into(),
                target_id: "ghost".into()
            }
        );
    }

    #[test]
    fn test_validate_unknown_type() {
        let registry = NodeRegistry::new();
        let config = FlowConfig::new(vec![NodeConfig::new("a", "mystery")]);
        assert!(matches!(
            validate_config(&config, &registry).unwrap_err(),
            FlowError::UnknownType { .. }
        ));
    }

    #[test]
    fn test_wire_to_tab_is_unresolved() {
        let registry = crate::nodes::test_registry();
        let config = FlowConfig::new(vec![
            NodeConfig::new("t", TAB_TYPE),
            NodeConfig::new("a", "inject").with_wires(vec![vec!["t".into()]]),
        ]);
        assert!(matches!(
            validate_config(&config, &registry).unwrap_err(),
            FlowError::UnresolvedWire { .. }
        ));
    }
}
