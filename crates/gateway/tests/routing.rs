//! Cross-node routing flows driven through the public API.
//!
//! Two gateway "nodes" (registry + router pairs) share an in-memory wire
//! carrying real envelopes, reproducing the bus adapter's loop-suppression
//! semantics without a broker.

use async_trait::async_trait;
use gateway::config::RateLimitConfig;
use gateway::limiter::RateLimiterTree;
use gateway::registry::NoopHooks;
use gateway::router::{BusPublisher, NoMembership, Router};
use gateway::session::{Outbound, Session, SessionLimits};
use gateway::{Authenticator, Body, CloseReason, Frame, Identity, Registry};
use parking_lot::Mutex;
use pubsub::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Publishes envelopes onto a wire shared by every node.
struct WireBus {
    node_id: String,
    wire: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BusPublisher for WireBus {
    async fn publish(&self, payload: &str) -> Result<(), pubsub::BusError> {
        let envelope = Envelope::wrap(&self.node_id, payload)?;
        self.wire.lock().push(envelope.encode()?);
        Ok(())
    }
}

/// Tokens look like `user:device`.
struct FakeAuthenticator;

impl Authenticator for FakeAuthenticator {
    fn validate(&self, token: &str) -> Result<Identity, gateway::error::AuthError> {
        let (user, device) = token
            .split_once(':')
            .ok_or_else(|| gateway::error::AuthError::InvalidToken("bad shape".into()))?;
        Ok(Identity {
            user_id: user.to_string(),
            device_id: device.to_string(),
            session_id: Uuid::new_v4().to_string(),
        })
    }
}

struct Node {
    node_id: String,
    registry: Arc<Registry>,
    router: Arc<Router>,
}

fn node(node_id: &str, wire: Arc<Mutex<Vec<String>>>) -> Node {
    let limits = Arc::new(RateLimiterTree::new(
        &RateLimitConfig {
            messages_per_second: 1000,
            burst: 1000,
            connections_per_user: 5,
            global_connections: 100,
            connections_per_ip_per_sec: 100,
            ip_bucket_ttl_secs: 600,
            slow_drop_threshold: 64,
            slow_drop_window_secs: 60,
        },
        10,
    ));
    let registry = Arc::new(Registry::new(4, limits, Arc::new(NoopHooks)));
    let router = Arc::new(Router::new(
        registry.clone(),
        Arc::new(WireBus {
            node_id: node_id.to_string(),
            wire,
        }),
        Arc::new(FakeAuthenticator),
        Arc::new(NoMembership),
        false,
    ));
    Node {
        node_id: node_id.to_string(),
        registry,
        router,
    }
}

async fn connect(node: &Node, user: &str, device: &str) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
    let id = Uuid::new_v4();
    let shard_id = node.registry.shard_index(&id);
    let (session, mut rx) = Session::new(
        id,
        "127.0.0.1".parse().unwrap(),
        shard_id,
        node.registry.limits().message_bucket(),
        SessionLimits::default(),
        CancellationToken::new(),
    );
    node.registry.add(session.clone()).unwrap();
    node.router
        .handle_inbound(&session, &format!(r#"{{"type":"auth","token":"{user}:{device}"}}"#))
        .await
        .unwrap();
    let _ = rx.try_recv(); // auth ack
    (session, rx)
}

/// Replay the wire into every node, skipping each node's own envelopes —
/// exactly what the bus adapter does.
async fn deliver_wire(wire: &Arc<Mutex<Vec<String>>>, nodes: &[&Node]) {
    let envelopes: Vec<String> = wire.lock().drain(..).collect();
    for raw in envelopes {
        let envelope = Envelope::decode(&raw).unwrap();
        for node in nodes {
            if envelope.is_from(&node.node_id) {
                continue;
            }
            let _ = node.router.deliver_remote(envelope.message.get()).await;
        }
    }
}

fn drain_messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Frame(json) = out {
            let frame = Frame::parse(&json).unwrap();
            if matches!(frame.body, Body::Message { .. }) {
                frames.push(frame);
            }
        }
    }
    frames
}

#[tokio::test]
async fn cross_node_fan_out_without_loopback() {
    let wire = Arc::new(Mutex::new(Vec::new()));
    let node_a = node("node-a", wire.clone());
    let node_b = node("node-b", wire.clone());

    let (sender, _sender_rx) = connect(&node_a, "u1", "d1").await;
    let (_a_recipient, mut a_rx) = connect(&node_a, "u2", "d1").await;
    let (_b_recipient, mut b_rx) = connect(&node_b, "u2", "d2").await;
    wire.lock().clear(); // discard presence envelopes from the auths

    node_a
        .router
        .handle_inbound(
            &sender,
            r#"{"type":"message","to":"u2","payload":{"text":"hi"}}"#,
        )
        .await
        .unwrap();

    // Local delivery on node A happened immediately.
    let local = drain_messages(&mut a_rx);
    assert_eq!(local.len(), 1);
    assert!(matches!(&local[0].body, Body::Message { from, payload, .. }
        if from.as_deref() == Some("u1") && payload.text == "hi"));

    // One publication on the wire; replay it into both nodes.
    assert_eq!(wire.lock().len(), 1);
    deliver_wire(&wire, &[&node_a, &node_b]).await;

    // Node B's device got the message exactly once.
    let remote = drain_messages(&mut b_rx);
    assert_eq!(remote.len(), 1);

    // Node A did not re-deliver its own echo to d1.
    assert!(drain_messages(&mut a_rx).is_empty());
}

#[tokio::test]
async fn duplicate_device_leaves_exactly_one_session() {
    let wire = Arc::new(Mutex::new(Vec::new()));
    let node_a = node("node-a", wire.clone());

    let (first, _rx1) = connect(&node_a, "u1", "d1").await;
    assert_eq!(node_a.registry.lookup_user("u1").len(), 1);

    let (second, _rx2) = connect(&node_a, "u1", "d1").await;

    assert!(first.is_closed());
    assert_eq!(first.close_reason(), Some(CloseReason::Superseded));
    let remaining = node_a.registry.lookup_user("u1");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, second.id);
    assert_eq!(
        node_a.registry.limits().global.current() as usize,
        node_a.registry.total_active()
    );
}

#[tokio::test]
async fn full_outbound_queue_drops_without_closing() {
    let wire = Arc::new(Mutex::new(Vec::new()));
    let node_a = node("node-a", wire.clone());
    let (session, _rx) = connect(&node_a, "u1", "d1").await;

    // The default queue holds 256 entries; the ack consumed none because
    // it was drained, so fill it completely.
    for i in 0..256 {
        session.enqueue(format!("m{i}")).unwrap();
    }
    assert!(session.enqueue("m256".into()).is_err());
    assert!(!session.is_closed());
    assert!(!session.queue_idle());
    assert_eq!(session.counters.slow_drops.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn typing_is_fanned_out_best_effort() {
    let wire = Arc::new(Mutex::new(Vec::new()));
    let node_a = node("node-a", wire.clone());
    let node_b = node("node-b", wire.clone());

    let (sender, _rx) = connect(&node_a, "u1", "d1").await;
    let (_peer, mut peer_rx) = connect(&node_b, "u2", "d1").await;
    wire.lock().clear();

    node_a
        .router
        .handle_inbound(&sender, r#"{"type":"typing","to":"u2","is_typing":true}"#)
        .await
        .unwrap();
    deliver_wire(&wire, &[&node_a, &node_b]).await;

    let mut saw_typing = false;
    while let Ok(Outbound::Frame(json)) = peer_rx.try_recv() {
        if matches!(Frame::parse(&json).unwrap().body, Body::Typing { is_typing: true, .. }) {
            saw_typing = true;
        }
    }
    assert!(saw_typing);
}
