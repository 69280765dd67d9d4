use async_trait::async_trait;

use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeType};

/// Receives status change notifications for the nodes in its scope and
/// forwards them as messages with a `status` field.
#[derive(Debug)]
pub struct StatusNode;

impl StatusNode {
    pub fn from_config(_config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl NodeType for StatusNode {
    fn type_name(&self) -> &str {
        "status"
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.send(msg, 0);
        Ok(())
    }
}
