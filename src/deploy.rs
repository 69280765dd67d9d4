use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::RouteTable;
use crate::builder;
use crate::flow::{Credentials, FlowConfig, FlowError, NodeConfig, validate_config};
use crate::node::{NodeError, NodeRegistry};
use crate::router::{NodeInstance, Router};
use crate::storage::{FileStorage, StorageError};

/// Upper bound on a node's `close` during redeploy; a node that overruns it
/// is abandoned with a leak warning instead of stalling the deploy.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(15);

/// How much of the live graph a deploy replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentType {
    /// Stop and recreate every node.
    #[default]
    Full,
    /// Restart only nodes whose configuration changed; preserve the rest.
    Nodes,
    /// Restart every node of any flow containing a change.
    Flows,
    /// Discard the submitted body and redeploy from storage.
    Reload,
}

impl FromStr for DeploymentType {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "nodes" => Ok(Self::Nodes),
            "flows" => Ok(Self::Flows),
            "reload" => Ok(Self::Reload),
            other => Err(DeployError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Invalid(#[from] FlowError),
    #[error("node `{id}` could not be constructed: {source}")]
    Node { id: String, source: NodeError },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unknown deployment type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowsState {
    Started,
    Stopped,
}

#[derive(Default)]
struct Deployed {
    config: FlowConfig,
    credentials: Credentials,
    rev: String,
}

/// Serializes deploys and owns the deployed configuration. The router only
/// ever sees complete graphs: a deploy builds everything off to the side,
/// closes what it replaces, then swaps the instance map in one step.
pub struct DeployManager {
    registry: Arc<NodeRegistry>,
    router: Arc<Router>,
    routes: Arc<RouteTable>,
    storage: Arc<FileStorage>,
    gate: Mutex<()>,
    deployed: RwLock<Deployed>,
    state: RwLock<FlowsState>,
    close_timeout: Duration,
}

struct DeployPlan<'a> {
    preserved: Vec<Arc<NodeInstance>>,
    to_close: Vec<Arc<NodeInstance>>,
    to_create: Vec<&'a NodeConfig>,
}

impl DeployManager {
    pub fn new(
        registry: Arc<NodeRegistry>,
        router: Arc<Router>,
        routes: Arc<RouteTable>,
        storage: Arc<FileStorage>,
    ) -> Self {
        Self {
            registry,
            router,
            routes,
            storage,
            gate: Mutex::new(()),
            deployed: RwLock::new(Deployed::default()),
            state: RwLock::new(FlowsState::Started),
            close_timeout: CLOSE_TIMEOUT,
        }
    }

    /// Override how long a replaced node's `close` may run before it is
    /// abandoned as a leak.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn current_rev(&self) -> String {
        self.deployed.read().unwrap().rev.clone()
    }

    pub fn flows_value(&self) -> Value {
        self.deployed.read().unwrap().config.to_value()
    }

    pub fn state(&self) -> FlowsState {
        *self.state.read().unwrap()
    }

    /// Load the persisted configuration and make it the running graph.
    /// Called once at startup and by the reload path.
    pub async fn load_and_deploy(&self) -> Result<String, DeployError> {
        let _guard = self.gate.lock().await;
        let (config, credentials) = self.storage.load_flows().await?;
        self.apply(config, credentials, DeploymentType::Full, false)
            .await
    }

    /// Deploy a submitted configuration. Inline per-node `credentials`
    /// objects are stripped and merged into the stored credential map before
    /// validation, so they never enter the revision hash.
    pub async fn deploy(
        &self,
        config: FlowConfig,
        kind: DeploymentType,
    ) -> Result<String, DeployError> {
        self.deploy_with_credentials(config, None, kind).await
    }

    /// Deploy with an explicit credential map alongside the flows (the v2
    /// admin body shape). Explicit entries replace stored ones per node id.
    pub async fn deploy_with_credentials(
        &self,
        mut config: FlowConfig,
        explicit: Option<Credentials>,
        kind: DeploymentType,
    ) -> Result<String, DeployError> {
        let _guard = self.gate.lock().await;

        if kind == DeploymentType::Reload {
            let (stored, credentials) = self.storage.load_flows().await?;
            return self
                .apply(stored, credentials, DeploymentType::Full, false)
                .await;
        }

        let mut credentials = {
            let deployed = self.deployed.read().unwrap();
            extract_credentials(&mut config, &deployed.credentials)
        };
        if let Some(explicit) = explicit {
            for (id, value) in explicit {
                if config.get(&id).is_some() {
                    credentials.insert(id, value);
                }
            }
        }
        self.apply(config, credentials, kind, true).await
    }

    /// Close every live node but keep the deployed configuration; messages
    /// sent while stopped are dropped.
    pub async fn stop_flows(&self) -> Result<(), DeployError> {
        let _guard = self.gate.lock().await;
        if *self.state.read().unwrap() == FlowsState::Stopped {
            return Ok(());
        }
        let snapshot = self.router.snapshot();
        self.close_instances(snapshot.values().cloned().collect())
            .await;
        self.router
            .swap(Arc::new(HashMap::new()), Default::default());
        self.routes.clear();
        *self.state.write().unwrap() = FlowsState::Stopped;
        info!("flows stopped");
        Ok(())
    }

    /// Rebuild the graph from the deployed configuration after a stop.
    pub async fn start_flows(&self) -> Result<(), DeployError> {
        let _guard = self.gate.lock().await;
        if *self.state.read().unwrap() == FlowsState::Started {
            return Ok(());
        }
        *self.state.write().unwrap() = FlowsState::Started;
        let (config, credentials) = {
            let deployed = self.deployed.read().unwrap();
            (deployed.config.clone(), deployed.credentials.clone())
        };
        self.apply(config, credentials, DeploymentType::Full, false)
            .await?;
        info!("flows started");
        Ok(())
    }

    /// Core deploy sequence, always run under the gate: validate, plan what
    /// survives, construct all new behaviors (aborting here leaves the old
    /// graph fully running and storage untouched), persist, close the
    /// replaced nodes, wire, swap, start.
    async fn apply(
        &self,
        config: FlowConfig,
        credentials: Credentials,
        kind: DeploymentType,
        persist: bool,
    ) -> Result<String, DeployError> {
        validate_config(&config, &self.registry)?;
        let rev = config.rev();

        if *self.state.read().unwrap() == FlowsState::Stopped {
            if persist {
                self.storage.save_flows(&config, &credentials).await?;
            }
            // record only; the graph is rebuilt when flows are started
            *self.deployed.write().unwrap() = Deployed {
                config,
                credentials,
                rev: rev.clone(),
            };
            return Ok(rev);
        }

        let plan = self.plan(&config, kind);
        let created = builder::create_behaviors(&plan.to_create, &self.registry)
            .map_err(|(id, source)| DeployError::Node { id, source })?;

        // only persist once the config is known to be buildable, so a
        // restart never loads a config that cannot construct
        if persist {
            self.storage.save_flows(&config, &credentials).await?;
        }

        let closed = plan.to_close.len();
        self.close_instances(plan.to_close).await;

        let mut instances =
            builder::instantiate(created, &self.router, &self.routes, &credentials);
        let fresh: Vec<Arc<NodeInstance>> = instances.values().cloned().collect();
        for instance in plan.preserved {
            instances.insert(instance.id().to_string(), instance);
        }
        builder::wire(&config, &instances);
        let scopes = crate::catch::ScopeIndex::build(&config, &instances);

        let started = fresh.len();
        let total = instances.len();
        self.router.swap(Arc::new(instances), scopes);
        builder::start_all(&fresh).await;

        *self.deployed.write().unwrap() = Deployed {
            config,
            credentials,
            rev: rev.clone(),
        };
        info!(
            rev = %rev,
            ?kind,
            started,
            closed,
            total,
            "deployed flow configuration"
        );
        Ok(rev)
    }

    fn plan<'a>(&self, config: &'a FlowConfig, kind: DeploymentType) -> DeployPlan<'a> {
        let snapshot = self.router.snapshot();
        let dirty = match kind {
            DeploymentType::Flows => {
                let deployed = self.deployed.read().unwrap();
                Some(dirty_flows(&deployed.config, config))
            }
            _ => None,
        };

        let unchanged = |node: &NodeConfig| {
            snapshot
                .get(&node.id)
                .is_some_and(|i| i.digest() == node.digest() && !i.is_closing())
        };

        let mut preserved = Vec::new();
        let mut to_create = Vec::new();
        let mut kept: HashSet<&str> = HashSet::new();
        for node in config.runtime_nodes() {
            let survives = match kind {
                DeploymentType::Full | DeploymentType::Reload => false,
                DeploymentType::Nodes => unchanged(node),
                DeploymentType::Flows => {
                    !dirty.as_ref().is_some_and(|d| d.contains(&node.z)) && unchanged(node)
                }
            };
            if survives {
                preserved.push(snapshot[&node.id].clone());
                kept.insert(node.id.as_str());
            } else {
                to_create.push(node);
            }
        }

        let to_close = snapshot
            .values()
            .filter(|i| !kept.contains(i.id()))
            .cloned()
            .collect();

        DeployPlan {
            preserved,
            to_close,
            to_create,
        }
    }

    async fn close_instances(&self, instances: Vec<Arc<NodeInstance>>) {
        if instances.is_empty() {
            return;
        }
        let timeout = self.close_timeout;
        join_all(instances.iter().map(|i| i.close(timeout))).await;
    }
}

/// Flow groups that must restart under a `flows` deploy: any group with an
/// added, removed, or modified member, keyed by tab id (tab nodes belong to
/// their own group; nodes without a tab form the `None` group).
fn dirty_flows(old: &FlowConfig, new: &FlowConfig) -> HashSet<Option<String>> {
    let group = |node: &NodeConfig| {
        if node.is_tab() {
            Some(node.id.clone())
        } else {
            node.z.clone()
        }
    };
    let old_digests = old.digests();
    let new_digests = new.digests();

    let mut dirty = HashSet::new();
    for node in &new.nodes {
        if old_digests.get(&node.id) != new_digests.get(&node.id) {
            dirty.insert(group(node));
        }
    }
    for node in &old.nodes {
        if !new_digests.contains_key(&node.id) {
            dirty.insert(group(node));
        }
    }
    dirty
}

/// Strip inline credential objects from the submitted config and merge them
/// over the stored map. A null value deletes the stored key; credentials for
/// ids absent from the new config are dropped.
fn extract_credentials(config: &mut FlowConfig, existing: &Credentials) -> Credentials {
    let mut merged = existing.clone();
    for node in &mut config.nodes {
        let Some(Value::Object(update)) = node.props.remove("credentials") else {
            continue;
        };
        let entry = merged.entry(node.id.clone()).or_insert_with(|| json!({}));
        if let Value::Object(map) = entry {
            for (key, value) in update {
                if value.is_null() {
                    map.remove(&key);
                } else {
                    map.insert(key, value);
                }
            }
        }
    }

    let ids: HashSet<&str> = config.nodes.iter().map(|n| n.id.as_str()).collect();
    let before = merged.len();
    merged.retain(|id, _| ids.contains(id.as_str()));
    if merged.len() != before {
        warn!(
            dropped = before - merged.len(),
            "discarded credentials for removed nodes"
        );
    }
    merged
}
