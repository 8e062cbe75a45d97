use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use uuid::Uuid;

use crate::{
    Context, Node,
    api::RpcMethodDescriptor,
    error::{Error, Result},
    identity::NodeIdentity,
    registry::ConnectionInformation,
    routing::{ConnectedNode, RouteList},
};

/// Built-in `node` namespace served by every node.
#[crate::api(namespace = "node")]
pub trait NodeService {
    async fn get_identifier(&self, ctx: &Context) -> Result<NodeIdentity>;

    async fn get_name(&self, ctx: &Context) -> Result<String>;

    async fn get_uuid(&self, ctx: &Context) -> Result<Uuid>;

    async fn get_available_methods(&self, ctx: &Context) -> Result<Vec<RpcMethodDescriptor>>;

    async fn get_active_routes(&self, ctx: &Context) -> Result<RouteList>;

    async fn get_directly_connected_nodes(
        &self,
        ctx: &Context,
    ) -> Result<BTreeMap<String, ConnectedNode>>;

    async fn get_connections(&self, ctx: &Context) -> Result<Vec<ConnectionInformation>>;

    /// Listen on a TCP socket address.
    async fn listen(&self, ctx: &Context, socket: String, persist: Option<bool>) -> Result<bool>;

    /// Stop listening on a TCP socket address.
    async fn stop_listening(
        &self,
        ctx: &Context,
        socket: String,
        persist: Option<bool>,
    ) -> Result<bool>;

    async fn list_listeners(&self, ctx: &Context) -> Result<Vec<String>>;

    async fn connect(
        &self,
        ctx: &Context,
        peer_address: String,
        persist: Option<bool>,
    ) -> Result<bool>;

    async fn disconnect(
        &self,
        ctx: &Context,
        peer_address: String,
        persist: Option<bool>,
    ) -> Result<bool>;

    /// Returns the fingerprint of the stored CA certificate.
    async fn add_trusted_ca(&self, ctx: &Context, ca_certificate: String) -> Result<String>;

    async fn get_csr(&self, ctx: &Context) -> Result<String>;

    async fn set_signed_certificate(&self, ctx: &Context, certificate: String) -> Result<bool>;
}

pub(crate) struct NodeApi {
    node: Weak<Node>,
}

impl NodeApi {
    pub(crate) fn new(node: Weak<Node>) -> Self {
        Self { node }
    }

    fn node(&self) -> Result<Arc<Node>> {
        self.node.upgrade().ok_or_else(Error::connection_closed)
    }
}

impl NodeService for NodeApi {
    async fn get_identifier(&self, _: &Context) -> Result<NodeIdentity> {
        Ok(self.node()?.identity().clone())
    }

    async fn get_name(&self, _: &Context) -> Result<String> {
        Ok(self.node()?.identity().name.clone())
    }

    async fn get_uuid(&self, _: &Context) -> Result<Uuid> {
        Ok(self.node()?.identity().uuid)
    }

    async fn get_available_methods(&self, _: &Context) -> Result<Vec<RpcMethodDescriptor>> {
        Ok(self.node()?.dispatcher().descriptors())
    }

    async fn get_active_routes(&self, _: &Context) -> Result<RouteList> {
        Ok(self.node()?.routing().active_routes())
    }

    async fn get_directly_connected_nodes(
        &self,
        _: &Context,
    ) -> Result<BTreeMap<String, ConnectedNode>> {
        Ok(self.node()?.routing().connected_nodes())
    }

    async fn get_connections(&self, _: &Context) -> Result<Vec<ConnectionInformation>> {
        Ok(self.node()?.registry().connections())
    }

    async fn listen(&self, ctx: &Context, socket: String, _persist: Option<bool>) -> Result<bool> {
        tracing::info!("{} asks to listen on {socket}", ctx.peer.address);
        self.node()?.listeners().listen(&socket).await?;
        Ok(true)
    }

    async fn stop_listening(
        &self,
        _: &Context,
        socket: String,
        _persist: Option<bool>,
    ) -> Result<bool> {
        Ok(self.node()?.listeners().stop(&socket))
    }

    async fn list_listeners(&self, _: &Context) -> Result<Vec<String>> {
        Ok(self.node()?.listeners().list())
    }

    async fn connect(
        &self,
        _: &Context,
        peer_address: String,
        _persist: Option<bool>,
    ) -> Result<bool> {
        let connect = self.node()?.registry().connect(&peer_address);
        connect.await?;
        Ok(true)
    }

    async fn disconnect(
        &self,
        _: &Context,
        peer_address: String,
        _persist: Option<bool>,
    ) -> Result<bool> {
        Ok(self.node()?.registry().disconnect(&peer_address))
    }

    async fn add_trusted_ca(&self, _: &Context, ca_certificate: String) -> Result<String> {
        self.node()?
            .tls()
            .trust_store()
            .add_ca_certificate(&ca_certificate)
    }

    async fn get_csr(&self, _: &Context) -> Result<String> {
        self.node()?.tls().certificates().csr_pem()
    }

    async fn set_signed_certificate(&self, _: &Context, certificate: String) -> Result<bool> {
        let node = self.node()?;
        node.tls().certificates().write_certificate(&certificate)?;
        node.start_configured_listeners().await;
        Ok(true)
    }
}
