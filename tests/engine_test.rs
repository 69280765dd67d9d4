use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::sleep;

use rivulet::{
    DeploymentType, FlowConfig, FlowMessage, NodeConfig, NodeContext, NodeError, NodeRegistry,
    NodeStatus, NodeType, Runtime,
};

#[derive(Debug)]
struct CaptureNode {
    seen: Arc<Mutex<Vec<FlowMessage>>>,
}

#[async_trait]
impl NodeType for CaptureNode {
    fn type_name(&self) -> &str {
        "capture"
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        self.seen.lock().unwrap().push(msg.clone_for_fanout());
        ctx.send(msg, 0);
        Ok(())
    }
}

#[derive(Debug)]
struct RelayNode;

#[async_trait]
impl NodeType for RelayNode {
    fn type_name(&self) -> &str {
        "relay"
    }

    async fn handle_input(
        &mut self,
        mut msg: FlowMessage,
        ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        msg.set("relayed", json!(true));
        ctx.send(msg, 0);
        Ok(())
    }
}

#[derive(Debug)]
struct BeaconNode;

#[async_trait]
impl NodeType for BeaconNode {
    fn type_name(&self) -> &str {
        "beacon"
    }

    async fn handle_input(
        &mut self,
        _msg: FlowMessage,
        ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        ctx.set_status(NodeStatus::new("red", "ring", "hot"));
        Ok(())
    }
}

#[derive(Debug)]
struct FailingNode;

#[async_trait]
impl NodeType for FailingNode {
    fn type_name(&self) -> &str {
        "failing"
    }

    async fn handle_input(
        &mut self,
        _msg: FlowMessage,
        _ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        Err(NodeError::ExecutionFailed("deliberate failure".into()))
    }
}

struct TestBed {
    runtime: Runtime,
    seen: Arc<Mutex<Vec<FlowMessage>>>,
    inits: Arc<Mutex<Vec<String>>>,
    _dir: TempDir,
}

fn testbed() -> TestBed {
    let seen: Arc<Mutex<Vec<FlowMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let inits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let registry = NodeRegistry::new();
    rivulet::nodes::register_builtins(&registry);
    {
        let seen = seen.clone();
        registry.register("capture", move |_cfg| {
            Ok(Box::new(CaptureNode { seen: seen.clone() }) as Box<dyn NodeType>)
        });
    }
    {
        let inits = inits.clone();
        registry.register("relay", move |cfg| {
            inits.lock().unwrap().push(cfg.id.clone());
            Ok(Box::new(RelayNode) as Box<dyn NodeType>)
        });
    }
    registry.register("failing", |_cfg| Ok(Box::new(FailingNode) as Box<dyn NodeType>));
    registry.register("beacon", |_cfg| Ok(Box::new(BeaconNode) as Box<dyn NodeType>));

    let dir = TempDir::new().unwrap();
    let runtime = Runtime::with_registry(dir.path(), Arc::new(registry));
    TestBed {
        runtime,
        seen,
        inits,
        _dir: dir,
    }
}

fn feed(runtime: &Runtime, node_id: &str, payload: Value) {
    let snapshot = runtime.router().snapshot();
    let instance = snapshot.get(node_id).expect("node should be live");
    instance.enqueue(FlowMessage::new(payload));
}

async fn drain(seen: &Arc<Mutex<Vec<FlowMessage>>>, expected: usize) -> Vec<FlowMessage> {
    for _ in 0..50 {
        sleep(Duration::from_millis(20)).await;
        let guard = seen.lock().unwrap();
        if guard.len() >= expected {
            return guard.clone();
        }
    }
    seen.lock().unwrap().clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_flows_end_to_end() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let config = FlowConfig::new(vec![
        NodeConfig::new("t", "tab"),
        NodeConfig::new("in", "relay")
            .with_z("t")
            .with_wires(vec![vec!["out".into()]]),
        NodeConfig::new("out", "capture").with_z("t"),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    feed(&bed.runtime, "in", json!({"n": 1}));
    let seen = drain(&bed.seen, 1).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload(), &json!({"n": 1}));
    assert_eq!(seen[0].get("relayed"), Some(&json!(true)));

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fanout_preserves_id_and_isolates_copies() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    // relay mutates its copy after the fan-out point; capture must not see it
    let config = FlowConfig::new(vec![
        NodeConfig::new("src", "relay")
            .with_wires(vec![vec!["a".into(), "b".into()]]),
        NodeConfig::new("a", "capture"),
        NodeConfig::new("b", "capture"),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    feed(&bed.runtime, "src", json!("payload"));
    let seen = drain(&bed.seen, 2).await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].id(), seen[1].id());

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_deploy_keeps_old_graph_processing() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let good = FlowConfig::new(vec![
        NodeConfig::new("in", "relay").with_wires(vec![vec!["out".into()]]),
        NodeConfig::new("out", "capture"),
    ]);
    let rev = bed
        .runtime
        .deploy(good, DeploymentType::Full)
        .await
        .unwrap();

    let broken = FlowConfig::new(vec![
        NodeConfig::new("in", "relay").with_wires(vec![vec!["ghost".into()]]),
    ]);
    assert!(
        bed.runtime
            .deploy(broken, DeploymentType::Full)
            .await
            .is_err()
    );
    assert_eq!(bed.runtime.current_rev(), rev);

    // the previously deployed graph still routes messages
    feed(&bed.runtime, "in", json!("still alive"));
    let seen = drain(&bed.seen, 1).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload(), &json!("still alive"));

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nodes_deploy_preserves_untouched_instances() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let v1 = FlowConfig::new(vec![
        NodeConfig::new("a", "relay")
            .with_prop("label", json!("one"))
            .with_wires(vec![vec!["b".into()]]),
        NodeConfig::new("b", "relay"),
    ]);
    bed.runtime.deploy(v1, DeploymentType::Full).await.unwrap();
    assert_eq!(bed.inits.lock().unwrap().clone(), vec!["a", "b"]);

    let v2 = FlowConfig::new(vec![
        NodeConfig::new("a", "relay")
            .with_prop("label", json!("two"))
            .with_wires(vec![vec!["b".into()]]),
        NodeConfig::new("b", "relay"),
    ]);
    bed.runtime.deploy(v2, DeploymentType::Nodes).await.unwrap();

    // only the changed node was rebuilt
    assert_eq!(bed.inits.lock().unwrap().clone(), vec!["a", "b", "a"]);

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_error_reaches_same_flow_catch() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let config = FlowConfig::new(vec![
        NodeConfig::new("t1", "tab"),
        NodeConfig::new("boom", "failing").with_z("t1"),
        NodeConfig::new("net", "catch")
            .with_z("t1")
            .with_wires(vec![vec!["out".into()]]),
        NodeConfig::new("out", "capture").with_z("t1"),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    feed(&bed.runtime, "boom", json!("doomed"));
    let seen = drain(&bed.seen, 1).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload(), &json!("doomed"));

    let error = seen[0].get("error").expect("error annotation");
    assert_eq!(error["source"]["id"], json!("boom"));
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .contains("deliberate failure")
    );

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_change_reaches_same_flow_status_node() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let config = FlowConfig::new(vec![
        NodeConfig::new("t1", "tab"),
        NodeConfig::new("s", "beacon").with_z("t1"),
        NodeConfig::new("watch", "status")
            .with_z("t1")
            .with_wires(vec![vec!["out".into()]]),
        NodeConfig::new("out", "capture").with_z("t1"),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    feed(&bed.runtime, "s", json!(null));
    let seen = drain(&bed.seen, 1).await;
    assert_eq!(seen.len(), 1);

    let status = seen[0].get("status").expect("status envelope");
    assert_eq!(status["fill"], json!("red"));
    assert_eq!(status["shape"], json!("ring"));
    assert_eq!(status["source"]["id"], json!("s"));

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inject_delivers_exactly_once_downstream() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let config = FlowConfig::new(vec![
        NodeConfig::new("a", "inject")
            .with_prop("payload", json!("tick"))
            .with_prop("topic", json!("clock"))
            .with_wires(vec![vec!["b".into()]]),
        NodeConfig::new("b", "capture"),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    // trigger the inject node once
    feed(&bed.runtime, "a", json!(null));
    let seen = drain(&bed.seen, 1).await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload(), &json!("tick"));
    assert_eq!(seen[0].topic(), "clock");
    assert!(!seen[0].id().is_empty());

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credentials_persisted_apart_from_flows() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let config = FlowConfig::new(vec![
        NodeConfig::new("a", "relay").with_prop("credentials", json!({"token": "hush"})),
    ]);
    bed.runtime
        .deploy(config, DeploymentType::Full)
        .await
        .unwrap();

    let root = bed.runtime.storage().root().to_path_buf();
    let flows = std::fs::read_to_string(root.join("flows.json")).unwrap();
    assert!(!flows.contains("hush"));

    let creds: Value =
        serde_json::from_str(&std::fs::read_to_string(root.join("flows_cred.json")).unwrap())
            .unwrap();
    assert_eq!(creds["a"]["token"], json!("hush"));

    bed.runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_api_roundtrip_over_http() {
    let bed = testbed();
    bed.runtime.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = bed.runtime.api_state();
    tokio::spawn(async move {
        let _ = rivulet::api::serve(listener, state).await;
    });

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // v2 deploy of an http-in flow
    let flows = json!([
        {"id": "hin", "type": "http in", "url": "/ping", "method": "post", "wires": [["hres"]]},
        {"id": "hres", "type": "http response", "statusCode": 200}
    ]);
    let resp = client
        .post(format!("{base}/flows"))
        .header("Node-RED-API-Version", "v2")
        .header("Node-RED-Deployment-Type", "full")
        .json(&json!({"flows": flows}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let rev = resp.json::<Value>().await.unwrap()["rev"]
        .as_str()
        .unwrap()
        .to_string();

    // the flow now answers on its claimed endpoint
    let resp = client
        .post(format!("{base}/ping"))
        .json(&json!({"echo": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), json!({"echo": 1}));

    // stale revision is rejected
    let resp = client
        .post(format!("{base}/flows"))
        .header("Node-RED-API-Version", "v2")
        .json(&json!({"flows": [], "rev": "0000"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // current revision is accepted
    let resp = client
        .post(format!("{base}/flows"))
        .header("Node-RED-API-Version", "v2")
        .json(&json!({"flows": [], "rev": rev}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/flows"))
        .header("Node-RED-API-Version", "v2")
        .send()
        .await
        .unwrap();
    let body = resp.json::<Value>().await.unwrap();
    assert_eq!(body["flows"], json!([]));

    // unknown version header
    let resp = client
        .get(format!("{base}/flows"))
        .header("Node-RED-API-Version", "v9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.json::<Value>().await.unwrap()["code"],
        json!("invalid_api_version")
    );

    bed.runtime.shutdown().await;
}
