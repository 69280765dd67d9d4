use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::api::RouteTable;
use crate::catch::ScopeIndex;
use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeStatus, NodeType};

/// The live, running counterpart of a NodeConfig: an inbox drained by a
/// single worker task, output ports resolved to direct target references,
/// and a close signal. Never outlives its deployment revision unless a
/// partial deploy explicitly preserves it.
pub struct NodeInstance {
    id: String,
    type_name: String,
    z: Option<String>,
    digest: String,
    inbox: mpsc::UnboundedSender<FlowMessage>,
    wires: RwLock<Vec<Vec<Arc<NodeInstance>>>>,
    status: RwLock<Option<NodeStatus>>,
    cancel: CancellationToken,
    closing: AtomicBool,
    start_gate: Mutex<Option<oneshot::Sender<()>>>,
    init_done: Mutex<Option<oneshot::Receiver<Result<(), NodeError>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NodeInstance {
    /// Create the instance and spawn its worker. The worker stays parked
    /// until `start` releases it (after the whole deployment is wired), runs
    /// `initialize`, then drains the inbox strictly sequentially.
    pub fn spawn(
        config: &NodeConfig,
        mut behavior: Box<dyn NodeType>,
        router: Arc<Router>,
        routes: Arc<RouteTable>,
        credentials: Value,
    ) -> Arc<Self> {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<FlowMessage>();
        let (start_tx, start_rx) = oneshot::channel::<()>();
        let (init_tx, init_rx) = oneshot::channel::<Result<(), NodeError>>();
        let cancel = CancellationToken::new();

        let instance = Arc::new(Self {
            id: config.id.clone(),
            type_name: config.type_name.clone(),
            z: config.z.clone(),
            digest: config.digest(),
            inbox: inbox_tx,
            wires: RwLock::new(Vec::new()),
            status: RwLock::new(None),
            cancel: cancel.clone(),
            closing: AtomicBool::new(false),
            start_gate: Mutex::new(Some(start_tx)),
            init_done: Mutex::new(Some(init_rx)),
            worker: Mutex::new(None),
        });

        let ctx = NodeContext::new(
            Arc::downgrade(&instance),
            router.clone(),
            routes,
            credentials,
            cancel.clone(),
        );
        let node_id = instance.id.clone();

        let handle = tokio::spawn(async move {
            // Parked until the deploy releases the whole graph at once, so
            // initialize may assume every sibling instance exists.
            tokio::select! {
                _ = cancel.cancelled() => return,
                gate = start_rx => {
                    if gate.is_err() {
                        return;
                    }
                }
            }

            let init_result = behavior.initialize(&ctx).await;
            if let Err(ref err) = init_result {
                error!(node = %node_id, %err, "node initialization failed");
            }
            let _ = init_tx.send(init_result);

            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = inbox_rx.recv() => match received {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                // Retained for the catch path; handle_input consumes its copy.
                let retained = msg.clone_for_fanout();
                if let Err(err) = behavior.handle_input(msg, &ctx).await {
                    if let Some(source) = ctx.instance() {
                        router.propagate_error(&source, err, retained);
                    }
                }
            }

            behavior.close(&ctx).await;
        });

        *instance.worker.lock().unwrap() = Some(handle);
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn z(&self) -> Option<&str> {
        self.z.as_deref()
    }

    /// Canonical digest of the config this instance was built from; partial
    /// deploys compare it byte-for-byte to decide preservation.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn status(&self) -> Option<NodeStatus> {
        self.status.read().unwrap().clone()
    }

    pub(crate) fn store_status(&self, status: Option<NodeStatus>) {
        *self.status.write().unwrap() = status;
    }

    /// Deliver a message straight to this instance's inbox. Dropped silently
    /// once the instance is closing.
    pub fn enqueue(&self, msg: FlowMessage) {
        if self.closing.load(Ordering::SeqCst) {
            trace!(node = %self.id, "message dropped: instance closing");
            return;
        }
        if self.inbox.send(msg).is_err() {
            trace!(node = %self.id, "message dropped: worker gone");
        }
    }

    pub(crate) fn set_wires(&self, wires: Vec<Vec<Arc<NodeInstance>>>) {
        *self.wires.write().unwrap() = wires;
    }

    pub(crate) fn resolved_wires(&self) -> Vec<Vec<Arc<NodeInstance>>> {
        self.wires.read().unwrap().clone()
    }

    /// Release the worker: runs `initialize`, then starts inbox processing.
    /// Returns a receiver for the initialization outcome.
    pub(crate) fn start(&self) -> Option<oneshot::Receiver<Result<(), NodeError>>> {
        if let Some(gate) = self.start_gate.lock().unwrap().take() {
            let _ = gate.send(());
            return self.init_done.lock().unwrap().take();
        }
        None
    }

    /// Stop accepting input, signal cancellation, and wait for the worker
    /// (including the behavior's `close`) up to `timeout`. A worker that does
    /// not finish in time is logged as a leak rather than blocking deploys.
    pub async fn close(&self, timeout: Duration) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(node = %self.id, "close timed out; node resources may leak");
            }
        }
        // Direct target references would otherwise keep cycles alive.
        self.wires.write().unwrap().clear();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for NodeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInstance")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("z", &self.z)
            .finish()
    }
}

/// Shared dispatch infrastructure: the atomically swapped id -> instance map,
/// the deploy-time catch/status scope index, and the wire fan-out rules.
pub struct Router {
    live: RwLock<Arc<HashMap<String, Arc<NodeInstance>>>>,
    scopes: RwLock<Arc<ScopeIndex>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(Arc::new(HashMap::new())),
            scopes: RwLock::new(Arc::new(ScopeIndex::default())),
        }
    }

    /// Snapshot of the live graph. A message is routed either entirely
    /// against the map swapped in by one deploy or entirely against the next.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<NodeInstance>>> {
        self.live.read().unwrap().clone()
    }

    pub(crate) fn swap(
        &self,
        map: Arc<HashMap<String, Arc<NodeInstance>>>,
        scopes: ScopeIndex,
    ) {
        *self.scopes.write().unwrap() = Arc::new(scopes);
        *self.live.write().unwrap() = map;
    }

    /// Dispatch `msg` onto `from`'s output port. An empty or missing wire
    /// list is a normal terminal case: the message is dropped. Each target
    /// gets an independent fan-out clone, enqueued synchronously so delivery
    /// order per target equals `send` call order even across senders.
    pub fn send(&self, from: &NodeInstance, msg: FlowMessage, output: usize) {
        let wires = from.wires.read().unwrap();
        let Some(targets) = wires.get(output) else {
            trace!(node = %from.id(), output, "message dropped: no such output port");
            return;
        };
        if targets.is_empty() {
            trace!(node = %from.id(), output, "message dropped: port not wired");
            return;
        }
        for target in targets {
            target.enqueue(msg.clone_for_fanout());
        }
    }

    /// Route a node-reported error to its catch scope: same-flow catch nodes
    /// first, global catch nodes as fallback, terminal log when neither
    /// exists. The originating `handle_input` is never retried here.
    pub fn propagate_error(&self, source: &Arc<NodeInstance>, err: NodeError, mut msg: FlowMessage) {
        let scopes = self.scopes.read().unwrap().clone();
        let targets = scopes.catch_targets(source.z());
        if targets.is_empty() {
            error!(node = %source.id(), %err, "uncaught node error");
            return;
        }
        msg.set(
            "error",
            json!({
                "message": err.to_string(),
                "source": {
                    "id": source.id(),
                    "type": source.type_name(),
                },
            }),
        );
        for target in targets {
            if target.id() == source.id() {
                continue;
            }
            target.enqueue(msg.clone_for_fanout());
        }
        debug!(node = %source.id(), %err, "error routed to catch scope");
    }

    /// Notify status-scope nodes of a status change on `source`.
    pub fn propagate_status(&self, source: &Arc<NodeInstance>, status: NodeStatus) {
        let scopes = self.scopes.read().unwrap().clone();
        for target in scopes.status_targets(source.z()) {
            if target.id() == source.id() {
                continue;
            }
            let mut msg = FlowMessage::new(Value::Null);
            msg.set(
                "status",
                json!({
                    "fill": status.fill,
                    "shape": status.shape,
                    "text": status.text,
                    "source": {
                        "id": source.id(),
                        "type": source.type_name(),
                    },
                }),
            );
            target.enqueue(msg);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Retained so deploys can rewire preserved instances against a new map.
pub(crate) fn resolve_wires(
    config: &NodeConfig,
    map: &HashMap<String, Arc<NodeInstance>>,
) -> Vec<Vec<Arc<NodeInstance>>> {
    config
        .wires
        .iter()
        .map(|port| {
            port.iter()
                .filter_map(|id| map.get(id).cloned())
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct Recorder {
        seen: Arc<StdMutex<Vec<String>>>,
        delay: Duration,
    }

    #[async_trait]
    impl NodeType for Recorder {
        fn type_name(&self) -> &str {
            "recorder"
        }

        async fn handle_input(
            &mut self,
            msg: FlowMessage,
            _ctx: &NodeContext,
        ) -> Result<(), NodeError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen
                .lock()
                .unwrap()
                .push(msg.payload().as_str().unwrap_or_default().to_string());
            Ok(())
        }
    }

    fn spawn_recorder(
        id: &str,
        router: &Arc<Router>,
        seen: Arc<StdMutex<Vec<String>>>,
        delay: Duration,
    ) -> Arc<NodeInstance> {
        let cfg = NodeConfig::new(id, "recorder");
        let inst = NodeInstance::spawn(
            &cfg,
            Box::new(Recorder { seen, delay }),
            router.clone(),
            Arc::new(RouteTable::new()),
            Value::Null,
        );
        inst.start();
        inst
    }

    #[tokio::test]
    async fn test_send_with_no_wires_drops_silently() {
        let router = Arc::new(Router::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let source = spawn_recorder("src", &router, seen.clone(), Duration::ZERO);

        router.send(&source, FlowMessage::new(serde_json::json!("x")), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
        source.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cross_sender_ordering_preserved() {
        let router = Arc::new(Router::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let target = spawn_recorder("t", &router, seen.clone(), Duration::from_millis(100));
        let a = spawn_recorder("a", &router, Arc::new(StdMutex::new(Vec::new())), Duration::ZERO);
        let b = spawn_recorder("b", &router, Arc::new(StdMutex::new(Vec::new())), Duration::ZERO);
        a.set_wires(vec![vec![target.clone()]]);
        b.set_wires(vec![vec![target.clone()]]);

        // slow first message from a, fast second from b: the second must
        // queue behind the first, never overtake it
        router.send(&a, FlowMessage::new(serde_json::json!("first")), 0);
        router.send(&b, FlowMessage::new(serde_json::json!("second")), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);

        for inst in [a, b, target] {
            inst.close(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn test_fanout_delivers_clone_to_each_target() {
        let router = Arc::new(Router::new());
        let seen1 = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = Arc::new(StdMutex::new(Vec::new()));

        let t1 = spawn_recorder("t1", &router, seen1.clone(), Duration::ZERO);
        let t2 = spawn_recorder("t2", &router, seen2.clone(), Duration::ZERO);
        let src = spawn_recorder("s", &router, Arc::new(StdMutex::new(Vec::new())), Duration::ZERO);
        src.set_wires(vec![vec![t1.clone(), t2.clone()]]);

        router.send(&src, FlowMessage::new(serde_json::json!("hello")), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*seen1.lock().unwrap(), vec!["hello"]);
        assert_eq!(*seen2.lock().unwrap(), vec!["hello"]);

        for inst in [t1, t2, src] {
            inst.close(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn test_close_timeout_abandons_stuck_worker() {
        let router = Arc::new(Router::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let stuck = spawn_recorder("stuck", &router, seen.clone(), Duration::from_secs(60));

        // park the worker inside a long handle_input
        stuck.enqueue(FlowMessage::new(serde_json::json!("never")));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        stuck.close(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_instance_drops_input() {
        let router = Arc::new(Router::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let target = spawn_recorder("t", &router, seen.clone(), Duration::ZERO);

        target.close(Duration::from_secs(1)).await;
        target.enqueue(FlowMessage::new(serde_json::json!("late")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
