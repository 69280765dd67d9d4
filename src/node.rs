use std::fmt::Debug;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::RouteTable;
use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::router::{NodeInstance, Router};

/// The polymorphic node capability. A concrete node type only sees messages
/// and its context; the engine guarantees the routing contract around it.
///
/// `handle_input` runs strictly sequentially per instance and may suspend on
/// I/O; a returned error never reaches the sender, it is redirected to
/// catch-scope nodes instead.
#[async_trait]
pub trait NodeType: Send + Debug {
    fn type_name(&self) -> &str;

    /// Called once, after every instance of the deployment exists. May claim
    /// external resources (HTTP routes, timers) and look up sibling nodes.
    async fn initialize(&mut self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError>;

    /// Release anything claimed in `initialize`. The context's cancellation
    /// token is already triggered when this runs.
    async fn close(&mut self, _ctx: &NodeContext) {}
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum NodeError {
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
    #[error("unknown node type `{0}`")]
    UnknownType(String),
    #[error("processing error: {0}")]
    ExecutionFailed(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Node-reported status, observed by status-scope nodes and external
/// collaborators. Not a message: it never travels over wires.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct NodeStatus {
    pub fill: String,
    pub shape: String,
    pub text: String,
}

impl NodeStatus {
    pub fn new(fill: impl Into<String>, shape: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            fill: fill.into(),
            shape: shape.into(),
            text: text.into(),
        }
    }
}

/// Everything a node may do besides returning from `handle_input`: emit on
/// its output ports, report status and errors, look up siblings, read its
/// credentials, and observe the close signal.
#[derive(Clone)]
pub struct NodeContext {
    instance: Weak<NodeInstance>,
    router: Arc<Router>,
    routes: Arc<RouteTable>,
    credentials: Value,
    cancel: CancellationToken,
}

impl NodeContext {
    pub(crate) fn new(
        instance: Weak<NodeInstance>,
        router: Arc<Router>,
        routes: Arc<RouteTable>,
        credentials: Value,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance,
            router,
            routes,
            credentials,
            cancel,
        }
    }

    pub fn instance(&self) -> Option<Arc<NodeInstance>> {
        self.instance.upgrade()
    }

    /// Emit a message on one of this node's output ports. Fire-and-forget:
    /// enqueues on every target and returns without awaiting processing.
    pub fn send(&self, msg: FlowMessage, output: usize) {
        if let Some(instance) = self.instance.upgrade() {
            self.router.send(&instance, msg, output);
        }
    }

    pub fn set_status(&self, status: NodeStatus) {
        if let Some(instance) = self.instance.upgrade() {
            instance.store_status(Some(status.clone()));
            self.router.propagate_status(&instance, status);
        }
    }

    pub fn clear_status(&self) {
        if let Some(instance) = self.instance.upgrade() {
            instance.store_status(None);
        }
    }

    /// Report an error against the message being processed. Routed to
    /// catch-scope nodes; a terminal logged failure when none is reachable.
    pub fn report_error(&self, err: NodeError, msg: &FlowMessage) {
        if let Some(instance) = self.instance.upgrade() {
            self.router.propagate_error(&instance, err, msg.clone_for_fanout());
        }
    }

    pub fn warn(&self, text: &str) {
        match self.instance.upgrade() {
            Some(instance) => warn!(node = %instance.id(), "{text}"),
            None => warn!("{text}"),
        }
    }

    /// Look up a sibling instance of the current deployment by id.
    pub fn node(&self, id: &str) -> Option<Arc<NodeInstance>> {
        self.router.snapshot().get(id).cloned()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn credentials(&self) -> &Value {
        &self.credentials
    }

    pub fn credential(&self, key: &str) -> Option<&Value> {
        self.credentials.get(key)
    }

    /// Cancellation signal honored on close. Long-running `handle_input`
    /// implementations should select against it.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id = self.instance.upgrade().map(|i| i.id().to_string());
        f.debug_struct("NodeContext").field("node", &id).finish()
    }
}

pub type NodeFactory =
    Arc<dyn Fn(&NodeConfig) -> Result<Box<dyn NodeType>, NodeError> + Send + Sync>;

/// Registry mapping type name to a factory producing the node behavior.
/// Resolved once at graph-build time; never consulted on the message path.
pub struct NodeRegistry {
    factories: DashMap<String, NodeFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    pub fn register<F>(&self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(&NodeConfig) -> Result<Box<dyn NodeType>, NodeError> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }

    pub fn create(&self, config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let factory = self
            .factories
            .get(&config.type_name)
            .ok_or_else(|| NodeError::UnknownType(config.type_name.clone()))?;
        factory(config)
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
