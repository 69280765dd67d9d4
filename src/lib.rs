//! Flow-based automation engine: a deployable graph of message-passing
//! nodes with an admin HTTP api, revisioned flat-file storage, and
//! hot reload of externally edited flows.

pub mod api;
pub mod builder;
pub mod catch;
pub mod deploy;
pub mod flow;
pub mod logger;
pub mod message;
pub mod node;
pub mod nodes;
pub mod router;
pub mod runtime;
pub mod schema;
pub mod storage;
pub mod watcher;

pub use deploy::{DeployError, DeployManager, DeploymentType, FlowsState};
pub use flow::{FlowConfig, FlowError, NodeConfig};
pub use message::{FlowMessage, HttpHandle, HttpReply};
pub use node::{NodeContext, NodeError, NodeRegistry, NodeStatus, NodeType};
pub use router::{NodeInstance, Router};
pub use runtime::Runtime;
pub use storage::{FileStorage, StorageError};
