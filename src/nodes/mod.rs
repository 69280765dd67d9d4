//! Built-in node types. Everything here goes through the same registry as
//! host-supplied nodes; the engine gives them no special treatment.

pub mod catch;
pub mod debug;
pub mod http;
pub mod inject;
pub mod json;
pub mod status;

use crate::node::NodeRegistry;

pub fn register_builtins(registry: &NodeRegistry) {
    registry.register("inject", inject::InjectNode::from_config);
    registry.register("debug", debug::DebugNode::from_config);
    registry.register("json", json::JsonNode::from_config);
    registry.register("http in", http::HttpInNode::from_config);
    registry.register("http response", http::HttpResponseNode::from_config);
    registry.register("http request", http::HttpRequestNode::from_config);
    registry.register("catch", catch::CatchNode::from_config);
    registry.register("status", status::StatusNode::from_config);
}

pub fn builtin_registry() -> NodeRegistry {
    let registry = NodeRegistry::new();
    register_builtins(&registry);
    registry
}

#[cfg(test)]
pub(crate) fn test_registry() -> NodeRegistry {
    builtin_registry()
}
