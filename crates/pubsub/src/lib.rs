//! Redis pub/sub bus adapter.
//!
//! Bridges a gateway node to the shared pub/sub bus that makes the fleet
//! behave as a single logical router:
//!
//! ```text
//! Router ── publish ──▶ {prefix}:messages ──▶ every other node
//!    ▲                                             │
//!    └──────── handlers (by message type) ◀────────┘
//! ```
//!
//! Every publication is wrapped in an [`Envelope`] stamped with this node's
//! id; inbound envelopes carrying our own id are discarded (loop
//! suppression). Surviving messages are dispatched to type-registered
//! handlers under a per-handler deadline. Transient broker failures trigger
//! an exponential-backoff reconnect with jitter; publishes retry a short
//! in-memory window and then fail back to the producer.

pub mod envelope;
pub mod error;

pub use envelope::Envelope;
pub use error::{BusError, Result};

use futures::future::BoxFuture;
use futures::StreamExt;
use metrics::counter;
use parking_lot::RwLock;
use rand::Rng;
use redis::AsyncCommands;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delays between in-memory publish retries.
const PUBLISH_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

/// Deadline for a single inbound-message handler invocation.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap for the reconnect backoff.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Configuration for the bus adapter.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Redis server URLs; the first address is used.
    pub addresses: Vec<String>,
    /// Channel name prefix shared by the fleet.
    pub channel_prefix: String,
    /// This node's identifier, stamped on every envelope.
    pub node_id: String,
}

impl BusConfig {
    /// The broadcast channel every node subscribes to.
    pub fn broadcast_channel(&self) -> String {
        format!("{}:messages", self.channel_prefix)
    }

    /// The targeted channel for a single user.
    pub fn user_channel(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.channel_prefix, user_id)
    }
}

/// Handler invoked for inbound bus messages of a registered type.
///
/// Receives the inner application payload (the envelope is already
/// unwrapped). Errors are logged, never propagated to the adapter.
pub type Handler =
    Arc<dyn Fn(String) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    msg_type: String,
}

/// Duplex bridge to the Redis pub/sub broker.
pub struct BusAdapter {
    client: redis::Client,
    config: BusConfig,
    handlers: RwLock<HashMap<String, Handler>>,
    handler_timeout: Duration,
}

impl BusAdapter {
    /// Create an adapter for the configured broker.
    ///
    /// The URL is parsed eagerly; connections are established lazily on
    /// first publish and by [`run`](Self::run).
    pub fn new(config: BusConfig) -> Result<Self> {
        let url = config
            .addresses
            .first()
            .map(String::as_str)
            .unwrap_or("redis://127.0.0.1:6379");
        let client = redis::Client::open(url)?;

        Ok(Self {
            client,
            config,
            handlers: RwLock::new(HashMap::new()),
            handler_timeout: HANDLER_TIMEOUT,
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Register a handler for an inbound message type.
    ///
    /// Re-registering a type replaces the previous handler.
    pub fn register_handler<F, Fut>(&self, msg_type: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.write().insert(msg_type.to_string(), handler);
        debug!(msg_type, "registered bus handler");
    }

    /// Publish an application payload on the broadcast channel.
    pub async fn publish(&self, payload: &str) -> Result<()> {
        self.publish_to(&self.config.broadcast_channel(), payload)
            .await
    }

    /// Publish an application payload on a user's targeted channel.
    pub async fn publish_user(&self, user_id: &str, payload: &str) -> Result<()> {
        self.publish_to(&self.config.user_channel(user_id), payload)
            .await
    }

    async fn publish_to(&self, channel: &str, payload: &str) -> Result<()> {
        let body = Envelope::wrap(&self.config.node_id, payload)?.encode()?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.try_publish(channel, &body).await {
                Ok(()) => {
                    counter!("gateway_bus_published_total").increment(1);
                    return Ok(());
                }
                Err(e) if attempts <= PUBLISH_RETRY_DELAYS.len() => {
                    warn!(channel, attempt = attempts, error = %e, "bus publish failed, retrying");
                    tokio::time::sleep(PUBLISH_RETRY_DELAYS[attempts - 1]).await;
                }
                Err(e) => {
                    counter!("gateway_bus_errors_total").increment(1);
                    error!(channel, error = %e, "bus publish failed, giving up");
                    return Err(BusError::PublishFailed { attempts });
                }
            }
        }
    }

    async fn try_publish(&self, channel: &str, body: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(channel, body).await?;
        Ok(())
    }

    /// Run the subscription loop until cancelled.
    ///
    /// Reconnects with exponential backoff and jitter on broker failure.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let channel = self.config.broadcast_channel();
        let mut delay = Duration::from_secs(1);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.subscribe_and_listen(&channel, &cancel).await {
                Ok(()) => break,
                Err(e) => {
                    counter!("gateway_bus_errors_total").increment(1);
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    warn!(
                        channel,
                        error = %e,
                        retry_in = ?(delay + jitter),
                        "bus subscription lost, reconnecting"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay + jitter) => {}
                    }
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                }
            }
        }

        info!("bus adapter stopped");
    }

    async fn subscribe_and_listen(&self, channel: &str, cancel: &CancellationToken) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        info!(channel, node_id = %self.config.node_id, "bus subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                msg = stream.next() => match msg {
                    Some(msg) => {
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(error = %e, "undecodable bus payload");
                                continue;
                            }
                        };
                        self.handle_payload(&payload).await;
                    }
                    None => return Err(BusError::Closed),
                },
            }
        }
    }

    /// Unwrap one inbound envelope and dispatch it to its handler.
    ///
    /// Envelopes originated by this node are silently discarded.
    pub async fn handle_payload(&self, payload: &str) {
        let envelope = match Envelope::decode(payload) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "malformed bus envelope");
                return;
            }
        };

        if envelope.is_from(&self.config.node_id) {
            return;
        }

        counter!("gateway_bus_received_total").increment(1);

        let inner = envelope.message.get().to_string();
        let msg_type = match serde_json::from_str::<TypeProbe>(&inner) {
            Ok(probe) => probe.msg_type,
            Err(e) => {
                warn!(error = %e, "bus message missing type discriminator");
                return;
            }
        };

        let handler = self.handlers.read().get(&msg_type).cloned();
        let Some(handler) = handler else {
            debug!(msg_type, "no handler for bus message type");
            return;
        };

        match timeout(self.handler_timeout, handler(inner)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(msg_type, error = %e, "bus handler failed");
            }
            Err(_) => {
                counter!("gateway_bus_errors_total").increment(1);
                error!(msg_type, timeout = ?self.handler_timeout, "bus handler timed out");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter(node_id: &str) -> Arc<BusAdapter> {
        Arc::new(
            BusAdapter::new(BusConfig {
                addresses: vec!["redis://127.0.0.1:6379".to_string()],
                channel_prefix: "ws-gateway".to_string(),
                node_id: node_id.to_string(),
            })
            .unwrap(),
        )
    }

    #[test]
    fn channel_names() {
        let cfg = BusConfig {
            addresses: vec![],
            channel_prefix: "ws-gateway".to_string(),
            node_id: "n1".to_string(),
        };
        assert_eq!(cfg.broadcast_channel(), "ws-gateway:messages");
        assert_eq!(cfg.user_channel("u1"), "ws-gateway:user:u1");
    }

    #[tokio::test]
    async fn own_envelopes_are_discarded() {
        let bus = adapter("node-a");
        let fired = Arc::new(AtomicUsize::new(0));

        let count = fired.clone();
        bus.register_handler("message", move |_| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let own = Envelope::wrap("node-a", r#"{"type":"message"}"#)
            .unwrap()
            .encode()
            .unwrap();
        bus.handle_payload(&own).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let remote = Envelope::wrap("node-b", r#"{"type":"message"}"#)
            .unwrap()
            .encode()
            .unwrap();
        bus.handle_payload(&remote).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_selects_handler_by_type() {
        let bus = adapter("node-a");
        let typing = Arc::new(AtomicUsize::new(0));

        let count = typing.clone();
        bus.register_handler("typing", move |_| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let env = Envelope::wrap("node-b", r#"{"type":"presence","status":"online"}"#)
            .unwrap()
            .encode()
            .unwrap();
        bus.handle_payload(&env).await;
        assert_eq!(typing.load(Ordering::SeqCst), 0);

        let env = Envelope::wrap("node-b", r#"{"type":"typing","to":"u1"}"#)
            .unwrap()
            .encode()
            .unwrap();
        bus.handle_payload(&env).await;
        assert_eq!(typing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_receives_inner_payload_verbatim() {
        let bus = adapter("node-a");
        let seen = Arc::new(parking_lot::Mutex::new(String::new()));

        let captured = seen.clone();
        bus.register_handler("message", move |payload| {
            let captured = captured.clone();
            async move {
                *captured.lock() = payload;
                Ok(())
            }
        });

        let inner = r#"{"type":"message","to":"u2","payload":{"text":"hi"}}"#;
        let env = Envelope::wrap("node-b", inner).unwrap().encode().unwrap();
        bus.handle_payload(&env).await;
        assert_eq!(*seen.lock(), inner);
    }

    #[tokio::test]
    async fn malformed_envelope_is_ignored() {
        let bus = adapter("node-a");
        // Must not panic or fire anything.
        bus.handle_payload("not an envelope").await;
        bus.handle_payload(r#"{"node_id":"x"}"#).await;
    }
}
