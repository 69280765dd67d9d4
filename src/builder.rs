use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::api::RouteTable;
use crate::catch::ScopeIndex;
use crate::flow::{Credentials, FlowConfig, NodeConfig};
use crate::node::{NodeError, NodeRegistry, NodeType};
use crate::router::{NodeInstance, Router, resolve_wires};

/// Output of a build pass: the full id -> instance map for the deployment
/// plus the cached catch/status scope index.
pub struct BuiltGraph {
    pub instances: HashMap<String, Arc<NodeInstance>>,
    pub scopes: ScopeIndex,
}

/// Construct behaviors for the given configs without spawning anything.
/// Factory failures surface here, before any live state is disturbed.
pub fn create_behaviors<'a>(
    configs: &[&'a NodeConfig],
    registry: &NodeRegistry,
) -> Result<Vec<(&'a NodeConfig, Box<dyn NodeType>)>, (String, NodeError)> {
    let mut behaviors = Vec::with_capacity(configs.len());
    for cfg in configs {
        let behavior = registry
            .create(cfg)
            .map_err(|e| (cfg.id.clone(), e))?;
        behaviors.push((*cfg, behavior));
    }
    Ok(behaviors)
}

/// Instantiate every behavior as a parked NodeInstance. Nothing runs yet:
/// workers wait behind their start gate so that initialization, once
/// released, can rely on the complete instance map.
pub fn instantiate(
    behaviors: Vec<(&NodeConfig, Box<dyn NodeType>)>,
    router: &Arc<Router>,
    routes: &Arc<RouteTable>,
    credentials: &Credentials,
) -> HashMap<String, Arc<NodeInstance>> {
    let mut instances = HashMap::with_capacity(behaviors.len());
    for (cfg, behavior) in behaviors {
        let creds = credentials.get(&cfg.id).cloned().unwrap_or(Value::Null);
        let instance = NodeInstance::spawn(cfg, behavior, router.clone(), routes.clone(), creds);
        debug!(node = %cfg.id, r#type = %cfg.type_name, "node instantiated");
        instances.insert(cfg.id.clone(), instance);
    }
    instances
}

/// Resolve every runtime node's output ports to direct instance references.
/// Also applied to preserved instances so a partial deploy rewires them
/// against their replaced neighbors.
pub fn wire(config: &FlowConfig, instances: &HashMap<String, Arc<NodeInstance>>) {
    for cfg in config.runtime_nodes() {
        if let Some(instance) = instances.get(&cfg.id) {
            instance.set_wires(resolve_wires(cfg, instances));
        }
    }
}

/// Release the start gates of `to_start` and await their `initialize`
/// results. Initialization failures are logged by the worker and reported
/// back here; they do not abort the deploy.
pub async fn start_all(to_start: &[Arc<NodeInstance>]) -> usize {
    let mut pending = Vec::with_capacity(to_start.len());
    for instance in to_start {
        if let Some(done) = instance.start() {
            pending.push((instance.id().to_string(), done));
        }
    }

    let mut failures = 0;
    for (id, done) in pending {
        match done.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failures += 1,
            Err(_) => {
                debug!(node = %id, "worker exited before initialization");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        info!(failures, "some nodes failed to initialize");
    }
    failures
}

/// Full build for a validated configuration: instantiate everything, wire,
/// and index scopes. Callers decide when to swap and start.
pub fn build_graph(
    config: &FlowConfig,
    registry: &NodeRegistry,
    router: &Arc<Router>,
    routes: &Arc<RouteTable>,
    credentials: &Credentials,
) -> Result<BuiltGraph, (String, NodeError)> {
    let configs: Vec<&NodeConfig> = config.runtime_nodes().collect();
    let behaviors = create_behaviors(&configs, registry)?;
    let instances = instantiate(behaviors, router, routes, credentials);
    wire(config, &instances);
    let scopes = ScopeIndex::build(config, &instances);
    Ok(BuiltGraph { instances, scopes })
}
