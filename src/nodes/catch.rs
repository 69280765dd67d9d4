use async_trait::async_trait;

use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeType};

/// Entry point for error handling flows. The engine delivers failed
/// messages here (annotated with an `error` field); the node itself only
/// forwards them. Its `scope` property is read at deploy time.
#[derive(Debug)]
pub struct CatchNode;

impl CatchNode {
    pub fn from_config(_config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        Ok(Box::new(Self))
    }
}

#[async_trait]
impl NodeType for CatchNode {
    fn type_name(&self) -> &str {
        "catch"
    }

    async fn handle_input(&mut self, msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.send(msg, 0);
        Ok(())
    }
}
