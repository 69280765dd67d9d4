use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::api::{ApiState, RouteTable};
use crate::deploy::{DeployError, DeployManager, DeploymentType, FlowsState};
use crate::flow::FlowConfig;
use crate::node::NodeRegistry;
use crate::nodes;
use crate::router::Router;
use crate::storage::FileStorage;

/// The assembled engine: registry, router, route table, storage, and the
/// deploy manager tying them together. One per process.
pub struct Runtime {
    registry: Arc<NodeRegistry>,
    router: Arc<Router>,
    routes: Arc<RouteTable>,
    storage: Arc<FileStorage>,
    deploys: Arc<DeployManager>,
}

impl Runtime {
    /// Wire up the engine over a storage root with the built-in node set
    /// registered. Nothing runs until `start`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let registry = Arc::new(nodes::builtin_registry());
        Self::with_registry(root, registry)
    }

    /// Same, with a caller-supplied registry (embedding hosts add their own
    /// node types before handing the registry over).
    pub fn with_registry(root: impl AsRef<Path>, registry: Arc<NodeRegistry>) -> Self {
        let router = Arc::new(Router::new());
        let routes = Arc::new(RouteTable::new());
        let storage = Arc::new(FileStorage::new(root.as_ref()));
        let deploys = Arc::new(DeployManager::new(
            registry.clone(),
            router.clone(),
            routes.clone(),
            storage.clone(),
        ));
        Self {
            registry,
            router,
            routes,
            storage,
            deploys,
        }
    }

    /// Load the persisted flows and bring the graph up.
    pub async fn start(&self) -> Result<String, DeployError> {
        let rev = self.deploys.load_and_deploy().await?;
        info!(rev = %rev, root = %self.storage.root().display(), "runtime started");
        Ok(rev)
    }

    /// Close every node and drop the graph. Storage is left as deployed.
    pub async fn shutdown(&self) {
        if self.deploys.state() == FlowsState::Started {
            let _ = self.deploys.stop_flows().await;
        }
        info!("runtime stopped");
    }

    pub async fn deploy(
        &self,
        config: FlowConfig,
        kind: DeploymentType,
    ) -> Result<String, DeployError> {
        self.deploys.deploy(config, kind).await
    }

    pub fn current_rev(&self) -> String {
        self.deploys.current_rev()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn storage(&self) -> &Arc<FileStorage> {
        &self.storage
    }

    pub fn deploys(&self) -> &Arc<DeployManager> {
        &self.deploys
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            deploys: self.deploys.clone(),
            storage: self.storage.clone(),
            routes: self.routes.clone(),
        }
    }
}
