use async_trait::async_trait;
use axum::http::Method;
use serde_json::{Value, json};
use tracing::debug;

use crate::flow::NodeConfig;
use crate::message::{FlowMessage, HttpReply};
use crate::node::{NodeContext, NodeError, NodeType};

/// Claims an HTTP endpoint on the admin server and turns each request into
/// a message. Some downstream node must complete the request through the
/// message's reply handle, normally `http response`.
#[derive(Debug)]
pub struct HttpInNode {
    method: Method,
    path: String,
}

impl HttpInNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let path = config
            .prop_str("url")
            .filter(|p| p.starts_with('/'))
            .ok_or_else(|| {
                NodeError::InvalidConfig("`url` must be an absolute path like /orders".into())
            })?
            .to_string();
        let method = config
            .prop_str("method")
            .unwrap_or("get")
            .to_uppercase()
            .parse::<Method>()
            .map_err(|_| NodeError::InvalidConfig("unrecognized http method".into()))?;
        Ok(Box::new(Self { method, path }))
    }
}

#[async_trait]
impl NodeType for HttpInNode {
    fn type_name(&self) -> &str {
        "http in"
    }

    async fn initialize(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
        let instance = ctx
            .instance()
            .ok_or_else(|| NodeError::Internal("instance gone during initialize".into()))?;
        ctx.routes()
            .register(self.method.clone(), self.path.clone(), instance);
        Ok(())
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.send(msg, 0);
        Ok(())
    }

    async fn close(&mut self, ctx: &NodeContext) {
        ctx.routes().unregister(&self.method, &self.path);
        debug!(method = %self.method, path = %self.path, "http route released");
    }
}

/// Completes the pending HTTP request carried by the message: the payload
/// becomes the response body. Status comes from the node configuration or,
/// if absent, the message's `statusCode` field.
#[derive(Debug)]
pub struct HttpResponseNode {
    status: Option<u16>,
}

impl HttpResponseNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let status = match config.prop("statusCode") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .and_then(|s| u16::try_from(s).ok())
                    .filter(|s| (100..=599).contains(s))
                    .ok_or_else(|| {
                        NodeError::InvalidConfig(format!("bad statusCode: {value}"))
                    })?,
            ),
        };
        Ok(Box::new(Self { status }))
    }
}

#[async_trait]
impl NodeType for HttpResponseNode {
    fn type_name(&self) -> &str {
        "http response"
    }

    async fn handle_input(
        &mut self,
        mut msg: FlowMessage,
        ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        let Some(handle) = msg.http().cloned() else {
            ctx.warn("message has no pending http request to respond to");
            return Ok(());
        };
        let status = self
            .status
            .or_else(|| {
                msg.get("statusCode")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
            })
            .unwrap_or(200);
        if !handle.complete(HttpReply {
            status,
            body: msg.take_payload(),
        }) {
            ctx.warn("http request was already answered");
        }
        Ok(())
    }
}

/// Outbound HTTP client node. Issues one request per message and emits the
/// decoded response as the new payload, with the status code in `statusCode`.
#[derive(Debug)]
pub struct HttpRequestNode {
    method: Method,
    url: Option<String>,
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let method = config
            .prop_str("method")
            .unwrap_or("get")
            .to_uppercase()
            .parse::<Method>()
            .map_err(|_| NodeError::InvalidConfig("unrecognized http method".into()))?;
        Ok(Box::new(Self {
            method,
            url: config.prop_str("url").map(str::to_string),
            client: reqwest::Client::new(),
        }))
    }
}

#[async_trait]
impl NodeType for HttpRequestNode {
    fn type_name(&self) -> &str {
        "http request"
    }

    async fn handle_input(
        &mut self,
        mut msg: FlowMessage,
        ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        let url = self
            .url
            .clone()
            .or_else(|| msg.get("url").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| {
                NodeError::InvalidConfig("no url configured and none on the message".into())
            })?;

        let method = reqwest::Method::from_bytes(self.method.as_str().as_bytes())
            .map_err(|_| NodeError::Internal("method conversion failed".into()))?;
        let mut request = self.client.request(method, &url);
        if self.method != Method::GET && !msg.payload().is_null() {
            request = request.json(msg.payload());
        }

        let cancel = ctx.cancelled();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = request.send() => res.map_err(|e| NodeError::ConnectionFailed(e.to_string()))?,
        };

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| NodeError::ConnectionFailed(e.to_string()))?;
        let payload = serde_json::from_str(&body).unwrap_or(Value::String(body));

        msg.set("statusCode", json!(status));
        msg.set_payload(payload);
        ctx.send(msg, 0);
        Ok(())
    }
}
