use async_trait::async_trait;
use serde_json::Value;

use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeType};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    /// String payloads are parsed, everything else is stringified.
    Auto,
    Parse,
    Stringify,
}

/// Converts between JSON text and structured payloads.
#[derive(Debug)]
pub struct JsonNode {
    action: Action,
}

impl JsonNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let action = match config.prop_str("action").unwrap_or("") {
            "" => Action::Auto,
            "obj" => Action::Parse,
            "str" => Action::Stringify,
            other => {
                return Err(NodeError::InvalidConfig(format!(
                    "action must be empty, `obj` or `str`, got `{other}`"
                )));
            }
        };
        Ok(Box::new(Self { action }))
    }

    fn convert(&self, payload: Value) -> Result<Value, NodeError> {
        let action = match (self.action, &payload) {
            (Action::Auto, Value::String(_)) => Action::Parse,
            (Action::Auto, _) => Action::Stringify,
            (fixed, _) => fixed,
        };
        match action {
            Action::Parse => {
                let Value::String(text) = payload else {
                    // already structured; nothing to do
                    return Ok(payload);
                };
                serde_json::from_str(&text)
                    .map_err(|e| NodeError::ExecutionFailed(format!("invalid JSON payload: {e}")))
            }
            Action::Stringify => match payload {
                Value::String(_) => Ok(payload),
                other => Ok(Value::String(other.to_string())),
            },
            Action::Auto => unreachable!(),
        }
    }
}

#[async_trait]
impl NodeType for JsonNode {
    fn type_name(&self) -> &str {
        "json"
    }

    async fn handle_input(
        &mut self,
        mut msg: FlowMessage,
        ctx: &NodeContext,
    ) -> Result<(), NodeError> {
        let converted = self.convert(msg.take_payload())?;
        msg.set_payload(converted);
        ctx.send(msg, 0);
        Ok(())
    }
}
