use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

/// The unit traveling across wires. Every logically distinct message gets a
/// `msg_id` exactly once; fan-out copies keep the id so downstream nodes can
/// correlate lineage.
#[derive(Clone)]
pub struct FlowMessage {
    msg_id: String,
    topic: String,
    payload: Value,
    meta: HashMap<String, Value>,
    http: Option<HttpHandle>,
}

impl FlowMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            topic: String::new(),
            payload,
            meta: HashMap::new(),
            http: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.msg_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Value) {
        self.payload = payload;
    }

    pub fn take_payload(&mut self) -> Value {
        std::mem::take(&mut self.payload)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.meta.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.meta.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.meta.remove(name)
    }

    pub fn http(&self) -> Option<&HttpHandle> {
        self.http.as_ref()
    }

    pub fn set_http(&mut self, handle: HttpHandle) {
        self.http = Some(handle);
    }

    /// Produce the copy handed to each downstream receiver on fan-out.
    ///
    /// Payload and metadata are deep-cloned so receivers never observe each
    /// other's mutations. The HTTP correlation handle is the one sanctioned
    /// exception: it stands for a single pending external request and is
    /// shared by reference across all copies.
    pub fn clone_for_fanout(&self) -> Self {
        self.clone()
    }
}

impl fmt::Debug for FlowMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowMessage")
            .field("msg_id", &self.msg_id)
            .field("topic", &self.topic)
            .field("payload", &self.payload)
            .field("meta", &self.meta)
            .field("http", &self.http.is_some())
            .finish()
    }
}

/// Response produced by a flow for one pending inbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

struct PendingRequest {
    method: String,
    path: String,
    responder: Mutex<Option<oneshot::Sender<HttpReply>>>,
}

/// Correlation handle for one pending inbound HTTP request. Cloning shares
/// the same pending request; `complete` fires at most once.
#[derive(Clone)]
pub struct HttpHandle {
    inner: Arc<PendingRequest>,
}

impl HttpHandle {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> (Self, oneshot::Receiver<HttpReply>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            inner: Arc::new(PendingRequest {
                method: method.into(),
                path: path.into(),
                responder: Mutex::new(Some(tx)),
            }),
        };
        (handle, rx)
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Complete the pending request. Returns false if a response was already
    /// sent (or the requester went away).
    pub fn complete(&self, reply: HttpReply) -> bool {
        let sender = self.inner.responder.lock().unwrap().take();
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for HttpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpHandle")
            .field("method", &self.inner.method)
            .field("path", &self.inner.path)
            .finish()
    }
}
