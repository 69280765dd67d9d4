use std::collections::HashMap;
use std::sync::Arc;

use crate::flow::FlowConfig;
use crate::router::NodeInstance;

pub const CATCH_TYPE: &str = "catch";
pub const STATUS_TYPE: &str = "status";
const GLOBAL_SCOPE: &str = "global";

/// Which catch/status instances observe a given node, resolved once per
/// deploy from graph topology and cached here; never recomputed per error.
///
/// A catch or status node watches its own flow tab by default; a `scope`
/// property of `"global"` widens it to every flow. Errors fall back to the
/// global list only when the erroring node's own flow has no catch node.
#[derive(Default)]
pub struct ScopeIndex {
    catch_by_flow: HashMap<String, Vec<Arc<NodeInstance>>>,
    global_catch: Vec<Arc<NodeInstance>>,
    status_by_flow: HashMap<String, Vec<Arc<NodeInstance>>>,
    global_status: Vec<Arc<NodeInstance>>,
}

impl ScopeIndex {
    pub fn build(
        config: &FlowConfig,
        instances: &HashMap<String, Arc<NodeInstance>>,
    ) -> Self {
        let mut index = Self::default();
        for node in config.runtime_nodes() {
            let Some(instance) = instances.get(&node.id) else {
                continue;
            };
            let global = node.prop_str("scope") == Some(GLOBAL_SCOPE);
            match node.type_name.as_str() {
                CATCH_TYPE => {
                    if global {
                        index.global_catch.push(instance.clone());
                    } else {
                        index
                            .catch_by_flow
                            .entry(node.z.clone().unwrap_or_default())
                            .or_default()
                            .push(instance.clone());
                    }
                }
                STATUS_TYPE => {
                    if global {
                        index.global_status.push(instance.clone());
                    } else {
                        index
                            .status_by_flow
                            .entry(node.z.clone().unwrap_or_default())
                            .or_default()
                            .push(instance.clone());
                    }
                }
                _ => {}
            }
        }
        index
    }

    /// Catch instances for an error raised in flow `z`: the flow's own catch
    /// nodes, or the global ones when the flow has none.
    pub fn catch_targets(&self, z: Option<&str>) -> &[Arc<NodeInstance>] {
        match self.catch_by_flow.get(z.unwrap_or_default()) {
            Some(local) if !local.is_empty() => local,
            _ => &self.global_catch,
        }
    }

    /// Status instances watching flow `z`; global watchers always included
    /// via the returned pair of slices.
    pub fn status_targets(&self, z: Option<&str>) -> impl Iterator<Item = &Arc<NodeInstance>> {
        self.status_by_flow
            .get(z.unwrap_or_default())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .chain(self.global_status.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.catch_by_flow.is_empty()
            && self.global_catch.is_empty()
            && self.status_by_flow.is_empty()
            && self.global_status.is_empty()
    }
}
