use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use uuid::Uuid;

use crate::{
    Context, RoutingTable,
    api::{ApiRegistry, RpcMethodDescriptor},
    envelope::{Notification, Params, Request, Response, RpcError},
    error::{Error, ErrorKind, Result, code},
    identity::NodeIdentity,
};

/// Resolves every incoming request to a local handler or to the next hop.
pub struct Dispatcher {
    identity: NodeIdentity,
    registry: ApiRegistry,
    routing: Option<Arc<RoutingTable>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(identity: NodeIdentity, registry: ApiRegistry) -> Self {
        Self {
            identity,
            registry,
            routing: None,
        }
    }

    #[must_use]
    pub fn with_routing(mut self, routing: Arc<RoutingTable>) -> Self {
        self.routing = Some(routing);
        self
    }

    #[must_use]
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<RpcMethodDescriptor> {
        self.registry.descriptors()
    }

    /// Answers one request. Never fails: every problem becomes an error
    /// response carrying the caller's id.
    pub async fn handle_request(&self, ctx: Context, request: Request) -> Response {
        let Request {
            id,
            method,
            params,
            target,
        } = request;

        if let Some(target) = self.remote_target(target.as_deref()) {
            return match self.forward(&target, &method, params).await {
                // only the id is mapped back, the payload is passed on as is.
                Ok(response) => Response { id, ..response },
                Err(e) if e.kind == ErrorKind::NoSuchTarget => {
                    Response::failure(id, self.no_such_target_error(&target))
                }
                Err(e) => Response::failure(id, e),
            };
        }

        match self.call_local(ctx, &method, params).await {
            Ok(result) => Response::success(id, result),
            Err(e) => Response::failure(id, e),
        }
    }

    pub async fn handle_notification(&self, ctx: Context, notification: Notification) {
        let Notification {
            method,
            params,
            target,
        } = notification;

        let result = match self.remote_target(target.as_deref()) {
            Some(target) => match self.next_hop(&target) {
                Ok(session) => session.notify(&method, params, Some(target)).await,
                Err(e) => Err(e),
            },
            None => self.call_local(ctx, &method, params).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!("notification {method} failed: {e}");
        }
    }

    /// Runs `method` on this node.
    ///
    /// # Errors
    ///
    /// `MethodNotFound`, `InvalidArgument`, or the handler's own error.
    pub async fn call_local(&self, ctx: Context, method: &str, params: Params) -> Result<Value> {
        let Some(registered) = self.registry.get(method) else {
            return Err(Error::new(
                ErrorKind::MethodNotFound,
                format!("method not found: {method}"),
            ));
        };
        let values = registered.descriptor.coerce(params)?;
        let future = (registered.method)(ctx, values);
        match std::panic::AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            // kinds without a code of their own are reported as handler failures.
            Ok(Err(e)) if e.kind.code() == code::INTERNAL_ERROR => {
                Err(Error::new(ErrorKind::HandlerFailed, e.to_string()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::error!("handler for {method} panicked");
                Err(Error::new(
                    ErrorKind::HandlerFailed,
                    format!("{method} failed unexpectedly"),
                ))
            }
        }
    }

    /// The target uuid if the request must be executed elsewhere.
    fn remote_target(&self, target: Option<&str>) -> Option<String> {
        self.routing.as_ref()?;
        let target = target?.trim();
        if target.is_empty() || target == self.identity.uuid.to_string() {
            return None;
        }
        Some(target.to_string())
    }

    async fn forward(&self, target: &str, method: &str, params: Params) -> Result<Response> {
        let session = self.next_hop(target)?;
        tracing::debug!("forwarding {method} for {target} to {}", session.peer().address);
        session.call(method, params, Some(target.to_string())).await
    }

    fn next_hop(&self, target: &str) -> Result<Arc<crate::Session>> {
        let routing = self
            .routing
            .as_ref()
            .ok_or_else(|| self.no_such_target(target, &[]))?;
        let session = Uuid::parse_str(target)
            .ok()
            .and_then(|uuid| routing.connection_for(&uuid));
        session.ok_or_else(|| self.no_such_target(target, &routing.reachable()))
    }

    fn no_such_target(&self, target: &str, reachable: &[Uuid]) -> Error {
        let msg = if reachable.is_empty() {
            format!("I am not {target} and not connected to other nodes")
        } else {
            let connections: Vec<String> = reachable.iter().map(Uuid::to_string).collect();
            format!("I am not {target}. Connections: {}", connections.join(", "))
        };
        Error::new(ErrorKind::NoSuchTarget, msg)
    }

    /// Error for an unroutable target, listing what is reachable in `data`.
    #[must_use]
    pub fn no_such_target_error(&self, target: &str) -> RpcError {
        let reachable = self
            .routing
            .as_ref()
            .map(|routing| routing.reachable())
            .unwrap_or_default();
        let mut error = RpcError::from(self.no_such_target(target, &reachable));
        error.data = Some(Value::from(
            reachable.iter().map(Uuid::to_string).collect::<Vec<_>>(),
        ));
        error
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity", &self.identity)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
