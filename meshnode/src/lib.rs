#![forbid(unsafe_code)]

extern crate self as meshnode;

pub use meshnode_macro::api;

mod error;
pub use error::{Error, ErrorKind, Result, code};

mod framing;
pub use framing::{FrameReader, FrameWriter, MAX_FRAME_SIZE, encode_frame, parse_frame};

mod envelope;
pub use envelope::{
    Envelope, Notification, Params, Request, RequestId, Response, RpcError, split_method,
};

mod identity;
pub use identity::{ConnectionDirection, NodeIdentity, PeerInfo, PeerType};

mod waiter;

mod receiver;

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

mod context;
pub use context::Context;

mod session;
pub use session::{CloseObserver, Session, SessionOptions};

mod api;
pub use api::{
    ApiRegistry, Method, MethodFuture, NAMESPACE_SEPARATOR, ParamDescriptor, ParamType,
    RegisteredMethod, Remote, RpcMethodDescriptor, RpcParam,
};

mod routing;
pub use routing::{ConnectedNode, MAX_HOPS, Route, RouteList, RoutingTable};

mod dispatcher;
pub use dispatcher::Dispatcher;

mod retry;
pub use retry::{RetryPolicy, RetryScheduler};

pub mod certs;
pub use certs::{CertificateStore, TrustStore};

mod tls;
pub use tls::{TlsContext, server_name};

mod registry;
pub use registry::{
    ConnectFuture, ConnectionInformation, ConnectionRegistry, ConnectionState, Connector,
    PeerConfig, SessionHook,
};

mod listener;
pub use listener::Listeners;

#[cfg(unix)]
mod control;
#[cfg(unix)]
pub use control::{ControlChannel, ControlClient};

mod config;
pub use config::NodeConfig;

mod node_api;
pub use node_api::NodeService;

mod node;
pub use node::{ConnectionSubscriber, Node, NodeBuilder};

/// Support code for `#[api]` expansions.
#[doc(hidden)]
pub mod __private {
    use serde::{Serialize, de::DeserializeOwned};

    pub use crate::api::MethodFuture;
    pub use serde_json::Value;

    use crate::{Error, Result};

    pub fn from_param<T: DeserializeOwned>(name: &str, value: Option<Value>) -> Result<T> {
        serde_json::from_value(value.unwrap_or(Value::Null))
            .map_err(|e| Error::invalid_argument(name, e))
    }

    pub fn to_param<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }

    pub fn to_result<T: Serialize>(value: T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }
}
