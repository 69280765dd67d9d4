use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeStatus, NodeType};

/// Terminal sink that logs what reaches it. With `complete` set it logs the
/// whole message envelope instead of just the payload, and it mirrors a
/// short payload preview into its status.
#[derive(Debug)]
pub struct DebugNode {
    complete: bool,
    to_status: bool,
}

impl DebugNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        Ok(Box::new(Self {
            complete: config
                .prop("complete")
                .map(|v| v == &json!(true) || v == &json!("true"))
                .unwrap_or(false),
            to_status: config
                .prop("tostatus")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }))
    }
}

#[async_trait]
impl NodeType for DebugNode {
    fn type_name(&self) -> &str {
        "debug"
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        let node = ctx
            .instance()
            .map(|i| i.id().to_string())
            .unwrap_or_default();

        if self.complete {
            info!(
                target: "debug",
                node = %node,
                msg_id = %msg.id(),
                topic = %msg.topic(),
                payload = %msg.payload(),
                "debug"
            );
        } else {
            info!(target: "debug", node = %node, payload = %msg.payload(), "debug");
        }

        if self.to_status {
            ctx.set_status(NodeStatus::new("green", "dot", preview(msg.payload())));
        }
        Ok(())
    }
}

fn preview(payload: &Value) -> String {
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > 32 {
        let mut cut: String = text.chars().take(32).collect();
        cut.push('\u{2026}');
        return cut;
    }
    text
}
