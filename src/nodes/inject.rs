use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::flow::NodeConfig;
use crate::message::FlowMessage;
use crate::node::{NodeContext, NodeError, NodeType};

/// Message source. Emits its configured payload once at startup, on a
/// repeating timer, or both; without a payload it emits the current epoch
/// time in milliseconds.
#[derive(Debug)]
pub struct InjectNode {
    payload: Option<Value>,
    topic: String,
    repeat: Option<Duration>,
    once: bool,
    once_delay: Duration,
}

impl InjectNode {
    pub fn from_config(config: &NodeConfig) -> Result<Box<dyn NodeType>, NodeError> {
        let repeat = match config.prop("repeat") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(value) => {
                let secs = value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .filter(|s| *s > 0.0)
                    .ok_or_else(|| {
                        NodeError::InvalidConfig(format!("bad repeat interval: {value}"))
                    })?;
                Some(Duration::from_secs_f64(secs))
            }
        };

        let once_delay = config
            .prop("onceDelay")
            .and_then(Value::as_f64)
            .filter(|s| *s >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::ZERO);

        Ok(Box::new(Self {
            payload: config.prop("payload").cloned(),
            topic: config.prop_str("topic").unwrap_or_default().to_string(),
            repeat,
            once: config.prop("once").and_then(Value::as_bool).unwrap_or(false),
            once_delay,
        }))
    }

    fn message(&self) -> FlowMessage {
        let payload = self
            .payload
            .clone()
            .unwrap_or_else(|| json!(chrono::Utc::now().timestamp_millis()));
        FlowMessage::new(payload).with_topic(self.topic.clone())
    }
}

#[async_trait]
impl NodeType for InjectNode {
    fn type_name(&self) -> &str {
        "inject"
    }

    async fn initialize(&mut self, ctx: &NodeContext) -> Result<(), NodeError> {
        if !self.once && self.repeat.is_none() {
            return Ok(());
        }

        let emitter = Emitter {
            payload: self.payload.clone(),
            topic: self.topic.clone(),
        };
        let ctx = ctx.clone();
        let once = self.once;
        let once_delay = self.once_delay;
        let repeat = self.repeat;
        let cancel = ctx.cancelled();

        tokio::spawn(async move {
            if once {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(once_delay) => {}
                }
                emitter.emit(&ctx);
            }
            let Some(every) = repeat else { return };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(every) => emitter.emit(&ctx),
                }
            }
        });
        Ok(())
    }

    /// A delivered message acts as an external trigger.
    async fn handle_input(&mut self, _msg: FlowMessage, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.send(self.message(), 0);
        Ok(())
    }
}

#[derive(Debug)]
struct Emitter {
    payload: Option<Value>,
    topic: String,
}

impl Emitter {
    fn emit(&self, ctx: &NodeContext) {
        let payload = self
            .payload
            .clone()
            .unwrap_or_else(|| json!(chrono::Utc::now().timestamp_millis()));
        debug!(topic = %self.topic, "inject fired");
        ctx.send(FlowMessage::new(payload).with_topic(self.topic.clone()), 0);
    }
}
