#![forbid(unsafe_code)]

mod common;

use std::{net::SocketAddr, sync::Arc};

use common::{Mesh, wait_for};
use meshnode::{
    ConnectionState, ControlClient, Context, ErrorKind, Node, NodeService, Params, PeerInfo,
    PeerType, Route,
};

const LISTENER: &str = "127.0.0.1:0";

fn address(node: &Node) -> String {
    let addr: SocketAddr = node.listeners().local_addr(LISTENER).unwrap();
    addr.to_string()
}

async fn handshake(node: &Node, address: &str, fingerprint: &str) -> meshnode::Result<PeerInfo> {
    let config = node.tls().client_config(Some(fingerprint))?;
    let stream = tokio::net::TcpStream::connect(address).await?;
    let (_stream, peer) = node.tls().connect(config, stream, address).await?;
    Ok(peer)
}

fn incoming_peer_type(node: &Node) -> Option<PeerType> {
    node.registry()
        .connections()
        .into_iter()
        .filter(|info| info.state == ConnectionState::Connected)
        .find_map(|info| node.registry().session(&info.peer_address))
        .map(|session| session.peer().peer_type)
}

#[tokio::test]
async fn test_mutual_tls_peering() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    let b_addr = address(&b);

    let session = a.registry().connect(&b_addr).await.unwrap();
    assert_eq!(session.peer().peer_type, PeerType::Peer);
    assert_eq!(session.identity().unwrap().uuid, b.identity().uuid);

    let info = a.registry().connection(&b_addr).unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    assert_eq!(info.peer_identifier, Some(b.identity().uuid.to_string()));

    // B registers the connection as soon as the route exchange is over.
    wait_for("B to register A", || incoming_peer_type(&b).is_some()).await;
    assert_eq!(incoming_peer_type(&b), Some(PeerType::Control));

    assert!(a.routing().has_peer(&b.identity().uuid));
    let direct = a.routing().directly_connected();
    assert_eq!(direct.len(), 1);
    assert_eq!(direct[0].name, "b");

    // the accepting side registers A as well, over the same session.
    wait_for("B to add A as a peer", || b.routing().has_peer(&a.identity().uuid)).await;
    assert_eq!(b.routing().directly_connected()[0].name, "a");

    // a second connect joins the live session.
    let again = a.registry().connect(&b_addr).await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));

    assert!(a.registry().disconnect(&b_addr));
    wait_for("A to forget B", || !a.routing().has_peer(&b.identity().uuid)).await;
    assert!(a.registry().connection(&b_addr).is_none());
    wait_for("B to forget A", || !b.routing().has_peer(&a.identity().uuid)).await;

    a.stop();
    b.stop();
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn test_forwarding_over_two_hops() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    let c = Node::start(mesh.config("c")).await.unwrap();

    b.registry().connect(&address(&c)).await.unwrap();
    a.registry().connect(&address(&b)).await.unwrap();

    let (b_uuid, c_uuid) = (b.identity().uuid, c.identity().uuid);
    let routes = a.routing().active_routes();
    assert_eq!(routes.route_to(&c_uuid), Some(&Route::new(c_uuid, b_uuid, 1)));

    let mut client = ControlClient::connect(mesh.socket_path("a")).await.unwrap();
    let uuid = client.request("node.getUuid", Params::None).await.unwrap();
    assert_eq!(uuid, serde_json::json!(a.identity().uuid));

    client.set_target(Some(b_uuid.to_string()));
    let uuid = client.request("node.getUuid", Params::None).await.unwrap();
    assert_eq!(uuid, serde_json::json!(b_uuid));

    client.set_target(Some(c_uuid.to_string()));
    let ctx = Context::local();
    let remote = client.remote();
    assert_eq!(remote.get_uuid(&ctx).await.unwrap(), c_uuid);
    assert_eq!(remote.get_name(&ctx).await.unwrap(), "c");

    // C answers for itself: it only knows B, as an incoming connection.
    let connections = remote.get_connections(&ctx).await.unwrap();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].state, ConnectionState::Connected);

    client.close();
    for node in [&a, &b, &c] {
        node.stop();
        node.join().await;
    }
}

#[tokio::test]
async fn test_accepting_node_routes_back() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    let c = Node::start(mesh.config("c")).await.unwrap();
    let (a_uuid, b_uuid, c_uuid) = (a.identity().uuid, b.identity().uuid, c.identity().uuid);
    let b_addr = address(&b);

    c.registry().connect(&b_addr).await.unwrap();
    wait_for("B to add C", || b.routing().has_peer(&c_uuid)).await;
    a.registry().connect(&b_addr).await.unwrap();
    wait_for("B to add A", || b.routing().has_peer(&a_uuid)).await;
    assert_eq!(b.routing().directly_connected().len(), 2);

    // B only accepted both connections and still reaches A directly.
    let mut from_b = ControlClient::connect(mesh.socket_path("b")).await.unwrap();
    from_b.set_target(Some(a_uuid.to_string()));
    let uuid = from_b.request("node.getUuid", Params::None).await.unwrap();
    assert_eq!(uuid, serde_json::json!(a_uuid));

    // A learned C from B, which holds C as an incoming connection.
    let routes = a.routing().active_routes();
    assert_eq!(routes.route_to(&c_uuid), Some(&Route::new(c_uuid, b_uuid, 1)));
    let mut from_a = ControlClient::connect(mesh.socket_path("a")).await.unwrap();
    from_a.set_target(Some(c_uuid.to_string()));
    let uuid = from_a.request("node.getUuid", Params::None).await.unwrap();
    assert_eq!(uuid, serde_json::json!(c_uuid));

    from_a.close();
    from_b.close();
    for node in [&a, &b, &c] {
        node.stop();
        node.join().await;
    }
}

#[tokio::test]
async fn test_nodes_dialing_each_other() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    let (a_addr, b_addr) = (address(&a), address(&b));

    let first = a.registry().connect(&b_addr).await.unwrap();
    wait_for("B to add A", || b.routing().has_peer(&a.identity().uuid)).await;

    // the second session is kept open next to the registered one.
    let second = b.registry().connect(&a_addr).await.unwrap();
    assert_eq!(second.peer().peer_type, PeerType::Peer);
    let info = b.registry().connection(&a_addr).unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!first.is_closed());
    assert!(!second.is_closed());
    assert!(a.routing().has_peer(&b.identity().uuid));
    assert!(b.routing().has_peer(&a.identity().uuid));
    assert_eq!(a.routing().directly_connected().len(), 1);

    a.stop();
    b.stop();
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn test_pinned_fingerprint() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    let b_addr = address(&b);

    let b_leaf = b.tls().certificates().certificate_chain().unwrap().remove(0);
    let pinned = meshnode::certs::fingerprint(&b_leaf).to_uppercase();
    let peer = handshake(&a, &b_addr, &pinned).await.unwrap();
    assert_eq!(peer.peer_type, PeerType::Peer);
    assert_eq!(peer.identity.unwrap().uuid, b.identity().uuid);

    let a_leaf = a.tls().certificates().certificate_chain().unwrap().remove(0);
    let wrong = meshnode::certs::fingerprint(&a_leaf);
    let err = handshake(&a, &b_addr, &wrong).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TlsHandshakeFailed);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_dispatch_errors() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.config("a")).await.unwrap();
    let b = Node::start(mesh.config("b")).await.unwrap();
    a.registry().connect(&address(&b)).await.unwrap();

    let mut client = ControlClient::connect(mesh.socket_path("a")).await.unwrap();
    let err = client.request("foo.bar", Params::None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::MethodNotFound);

    let err = client
        .request("node.connect", vec![serde_json::json!(1), serde_json::json!("x")])
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidArgument);

    let unknown = uuid::Uuid::new_v4().to_string();
    client.set_target(Some(unknown.clone()));
    let err = client.request("node.getUuid", Params::None).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoSuchTarget);
    assert!(err.msg.contains(&unknown), "{err}");
    assert!(err.msg.contains(&b.identity().uuid.to_string()), "{err}");

    // the session survives failed requests.
    client.set_target(None);
    let methods = client
        .request("node.getAvailableMethods", Params::None)
        .await
        .unwrap();
    let methods = methods.as_array().unwrap();
    assert!(methods.iter().any(|m| m["namespace"] == "node" && m["name"] == "getUuid"));
    let connect = methods.iter().find(|m| m["name"] == "connect").unwrap();
    assert_eq!(connect["params"][0]["name"], "peerAddress");
    assert_eq!(connect["params"][1]["optional"], true);

    client.close();
    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_unreachable_peer_is_retried() {
    let mesh = Mesh::new();
    let b_config = mesh.config("b");

    // reserve a port nobody listens on yet.
    let port = std::net::TcpListener::bind(LISTENER)
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let b_addr = format!("127.0.0.1:{port}");

    let mut a_config = mesh.config("a");
    a_config.connections.insert(b_addr.clone(), Default::default());
    let a = Node::start(a_config).await.unwrap();

    wait_for("the first attempt to fail", || {
        a.registry()
            .connection(&b_addr)
            .is_some_and(|info| {
                info.state == ConnectionState::Failing && info.error_message.is_some()
            })
    })
    .await;
    assert!(a.routing().directly_connected().is_empty());

    let mut b_config = b_config;
    b_config.listeners = vec![b_addr.clone()];
    let b = Node::start(b_config).await.unwrap();

    wait_for("the retry to connect", || {
        a.registry()
            .connection(&b_addr)
            .is_some_and(|info| info.state == ConnectionState::Connected)
    })
    .await;
    wait_for("B to become a peer", || a.routing().has_peer(&b.identity().uuid)).await;

    // losing the session schedules a reconnect for configured peers.
    b.stop();
    wait_for("A to notice", || !a.routing().has_peer(&b.identity().uuid)).await;
    wait_for("the reconnect to fail", || {
        a.registry()
            .connection(&b_addr)
            .is_some_and(|info| info.state == ConnectionState::Failing)
    })
    .await;

    a.stop();
    a.join().await;
}

#[tokio::test]
async fn test_self_signed_node_cannot_listen() {
    let mesh = Mesh::new();
    let a = Node::start(mesh.unsigned_config("a")).await.unwrap();
    assert!(a.listeners().list().is_empty());

    let err = a.listeners().listen(LISTENER).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);

    // the control channel works without any certificate.
    let client = ControlClient::connect(mesh.socket_path("a")).await.unwrap();
    let csr = client.request("node.getCsr", Params::None).await.unwrap();
    assert!(csr.as_str().unwrap().contains("CERTIFICATE REQUEST"));
    let listeners = client.request("node.listListeners", Params::None).await.unwrap();
    assert_eq!(listeners, serde_json::json!([]));

    client.close();
    a.stop();
}
