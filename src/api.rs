use std::sync::Arc;
use std::time::Duration;

use axum::Router as AxumRouter;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::deploy::{DeployError, DeployManager, DeploymentType, FlowsState};
use crate::flow::{Credentials, FlowConfig};
use crate::message::{FlowMessage, HttpHandle};
use crate::router::NodeInstance;
use crate::storage::{FileStorage, StorageError};

pub const API_VERSION_HEADER: &str = "Node-RED-API-Version";
pub const DEPLOYMENT_TYPE_HEADER: &str = "Node-RED-Deployment-Type";

/// How long an HTTP-triggered flow may take to complete the request before
/// the endpoint gives up with a gateway timeout.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Endpoints claimed by running nodes, matched by method and exact path.
/// Entries are registered during node initialization and removed on close,
/// so the table always mirrors the live graph.
pub struct RouteTable {
    routes: DashMap<(Method, String), Arc<NodeInstance>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    pub fn register(&self, method: Method, path: impl Into<String>, node: Arc<NodeInstance>) {
        let path = path.into();
        let id = node.id().to_string();
        debug!(%method, %path, node = %id, "http route registered");
        if let Some(prev) = self.routes.insert((method.clone(), path.clone()), node)
            && prev.id() != id
        {
            warn!(%method, %path, old = %prev.id(), new = %id, "http route claim displaced another node");
        }
    }

    pub fn unregister(&self, method: &Method, path: &str) {
        self.routes.remove(&(method.clone(), path.to_string()));
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<Arc<NodeInstance>> {
        self.routes
            .get(&(method.clone(), path.to_string()))
            .map(|e| e.value().clone())
    }

    pub fn clear(&self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub deploys: Arc<DeployManager>,
    pub storage: Arc<FileStorage>,
    pub routes: Arc<RouteTable>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApiVersion {
    V1,
    V2,
}

/// Admin API plus the fallback that dispatches everything else into
/// node-claimed HTTP routes.
pub fn admin_router(state: ApiState) -> AxumRouter {
    AxumRouter::new()
        .route("/flows", get(get_flows).post(post_flows))
        .route("/flows/state", get(get_flows_state).post(post_flows_state))
        .route(
            "/library/{kind}/{*entry}",
            get(get_library).post(post_library),
        )
        .fallback(dispatch_to_flow)
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ApiState) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "admin api listening");
    axum::serve(listener, admin_router(state)).await
}

pub(crate) fn parse_api_version(headers: &HeaderMap) -> Result<ApiVersion, Response> {
    match headers.get(API_VERSION_HEADER).map(|v| v.to_str()) {
        None => Ok(ApiVersion::V1),
        Some(Ok("v1")) => Ok(ApiVersion::V1),
        Some(Ok("v2")) => Ok(ApiVersion::V2),
        Some(_) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_api_version",
            "unsupported api version",
        )),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"code": code, "message": message.into()})),
    )
        .into_response()
}

fn deploy_error_response(err: DeployError) -> Response {
    match err {
        DeployError::Invalid(e) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_flow", e.to_string())
        }
        DeployError::UnknownType(e) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_deployment_type",
            format!("unknown deployment type `{e}`"),
        ),
        DeployError::Node { id, source } => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_flow",
            format!("node `{id}`: {source}"),
        ),
        DeployError::Storage(e) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        }
    }
}

async fn get_flows(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let version = match parse_api_version(&headers) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let flows = state.deploys.flows_value();
    match version {
        ApiVersion::V1 => Json(flows).into_response(),
        ApiVersion::V2 => Json(json!({
            "flows": flows,
            "rev": state.deploys.current_rev(),
        }))
        .into_response(),
    }
}

async fn post_flows(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let version = match parse_api_version(&headers) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let kind = match headers
        .get(DEPLOYMENT_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => DeploymentType::Full,
        Some(raw) => match raw.parse() {
            Ok(kind) => kind,
            Err(e) => return deploy_error_response(e),
        },
    };

    let (flows, expected_rev, credentials) = match version {
        ApiVersion::V1 => (body, None, None),
        ApiVersion::V2 => {
            let mut body = body;
            let rev = body
                .get("rev")
                .and_then(Value::as_str)
                .map(str::to_string);
            let dirty = body
                .get("credentialsDirty")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let credentials = if dirty {
                body.get_mut("credentials")
                    .map(Value::take)
                    .and_then(|v| serde_json::from_value::<Credentials>(v).ok())
            } else {
                None
            };
            let flows = body
                .get_mut("flows")
                .map(Value::take)
                .unwrap_or(Value::Null);
            (flows, rev, credentials)
        }
    };

    // optimistic concurrency: a stale editor must reload, not overwrite
    if let Some(expected) = expected_rev
        && kind != DeploymentType::Reload
        && expected != state.deploys.current_rev()
    {
        warn!("flow deploy rejected: revision mismatch");
        return error_response(
            StatusCode::CONFLICT,
            "version_mismatch",
            "deployed flows have changed",
        );
    }

    let config = if kind == DeploymentType::Reload {
        FlowConfig::default()
    } else {
        match FlowConfig::from_value(flows) {
            Ok(config) => config,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, "invalid_flow", e.to_string());
            }
        }
    };

    match state
        .deploys
        .deploy_with_credentials(config, credentials, kind)
        .await
    {
        Ok(rev) => match version {
            ApiVersion::V1 => StatusCode::NO_CONTENT.into_response(),
            ApiVersion::V2 => Json(json!({"rev": rev})).into_response(),
        },
        Err(e) => deploy_error_response(e),
    }
}

async fn get_flows_state(State(state): State<ApiState>) -> Response {
    let flows_state = match state.deploys.state() {
        FlowsState::Started => "start",
        FlowsState::Stopped => "stop",
    };
    Json(json!({"state": flows_state})).into_response()
}

async fn post_flows_state(State(state): State<ApiState>, Json(body): Json<Value>) -> Response {
    let result = match body.get("state").and_then(Value::as_str) {
        Some("start") => state.deploys.start_flows().await,
        Some("stop") => state.deploys.stop_flows().await,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_state",
                "state must be `start` or `stop`",
            );
        }
    };
    match result {
        Ok(()) => get_flows_state(State(state)).await,
        Err(e) => deploy_error_response(e),
    }
}

async fn get_library(
    State(state): State<ApiState>,
    Path((kind, entry)): Path<(String, String)>,
) -> Response {
    match state.storage.get_library_entry(&kind, &entry).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => storage_error_response(e),
    }
}

async fn post_library(
    State(state): State<ApiState>,
    Path((kind, entry)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    match state.storage.save_library_entry(&kind, &entry, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => storage_error_response(e),
    }
}

fn storage_error_response(err: StorageError) -> Response {
    match err {
        StorageError::NotFound(e) => {
            error_response(StatusCode::NOT_FOUND, "not_found", format!("`{e}` not found"))
        }
        StorageError::InvalidPath(e) => error_response(
            StatusCode::FORBIDDEN,
            "invalid_path",
            format!("`{e}` is outside the library"),
        ),
        other => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
            other.to_string(),
        ),
    }
}

/// Everything the admin routes do not claim is offered to the live graph:
/// an exact route-table match injects the request as a message and waits
/// for some node downstream to complete the reply handle.
async fn dispatch_to_flow(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let Some(node) = state.routes.lookup(&method, &path) else {
        return error_response(StatusCode::NOT_FOUND, "not_found", "no such endpoint");
    };

    let payload = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::String(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    };

    let (handle, reply) = HttpHandle::new(method.as_str(), &path);
    let mut msg = FlowMessage::new(payload);
    msg.set("method", json!(method.as_str()));
    msg.set("path", json!(path));
    if let Some(query) = uri.query() {
        msg.set("query", json!(query));
    }
    msg.set_http(handle);
    node.enqueue(msg);

    match tokio::time::timeout(REPLY_TIMEOUT, reply).await {
        Ok(Ok(reply)) => {
            let status =
                StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(reply.body)).into_response()
        }
        Ok(Err(_)) => {
            // every handle holder closed without replying
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "no_response",
                "flow dropped the request",
            )
        }
        Err(_) => {
            warn!(%path, "flow did not answer an http request in time");
            error_response(StatusCode::GATEWAY_TIMEOUT, "timeout", "flow did not respond")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::NodeConfig;
    use crate::node::{NodeContext, NodeError, NodeType};
    use crate::router::Router;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Sink;

    #[async_trait]
    impl NodeType for Sink {
        fn type_name(&self) -> &str {
            "sink"
        }

        async fn handle_input(
            &mut self,
            _msg: FlowMessage,
            _ctx: &NodeContext,
        ) -> Result<(), NodeError> {
            Ok(())
        }
    }

    fn dummy_instance(id: &str, routes: &Arc<RouteTable>) -> Arc<NodeInstance> {
        NodeInstance::spawn(
            &NodeConfig::new(id, "sink"),
            Box::new(Sink),
            Arc::new(Router::new()),
            routes.clone(),
            Value::Null,
        )
    }

    #[tokio::test]
    async fn test_route_table_lookup_is_method_exact() {
        let routes = Arc::new(RouteTable::new());
        let node = dummy_instance("h1", &routes);
        routes.register(Method::GET, "/webhook", node.clone());

        assert!(routes.lookup(&Method::GET, "/webhook").is_some());
        assert!(routes.lookup(&Method::POST, "/webhook").is_none());
        assert!(routes.lookup(&Method::GET, "/webhook/sub").is_none());

        routes.unregister(&Method::GET, "/webhook");
        assert!(routes.is_empty());
        node.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_route_table_replaces_on_reregister() {
        let routes = Arc::new(RouteTable::new());
        let first = dummy_instance("h1", &routes);
        let second = dummy_instance("h2", &routes);
        routes.register(Method::POST, "/hook", first.clone());
        routes.register(Method::POST, "/hook", second.clone());

        assert_eq!(routes.len(), 1);
        assert_eq!(routes.lookup(&Method::POST, "/hook").unwrap().id(), "h2");
        first.close(Duration::from_secs(1)).await;
        second.close(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_api_version_parsing() {
        let name: axum::http::HeaderName = API_VERSION_HEADER.parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(parse_api_version(&headers).unwrap(), ApiVersion::V1);

        headers.insert(name.clone(), "v1".parse().unwrap());
        assert_eq!(parse_api_version(&headers).unwrap(), ApiVersion::V1);

        headers.insert(name.clone(), "v2".parse().unwrap());
        assert_eq!(parse_api_version(&headers).unwrap(), ApiVersion::V2);

        headers.insert(name, "v3".parse().unwrap());
        assert!(parse_api_version(&headers).is_err());
    }
}
