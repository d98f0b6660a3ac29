//! Message routing: inbound frames to local recipients and the bus,
//! bus deliveries to local recipients.
//!
//! The router stamps every outbound message with the sender's verified
//! user id (client-supplied `from` is ignored) and preserves per-sender
//! FIFO toward any single local recipient: each recipient session has one
//! ordered outbound queue and the router never reorders.

use crate::auth::Authenticator;
use crate::error::{GatewayError, ProtocolError, Result};
use crate::protocol::{Body, Frame};
use crate::registry::Registry;
use crate::session::{ClientId, Session};
use async_trait::async_trait;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Typed authentication context threaded through dispatch.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub client_id: ClientId,
    pub user_id: String,
    pub device_id: String,
}

/// Group membership collaborator; owned by a business-layer service.
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn members(&self, group_id: &str) -> Result<Vec<String>>;
}

/// Membership resolver that knows no groups.
pub struct NoMembership;

#[async_trait]
impl GroupMembership for NoMembership {
    async fn members(&self, _group_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Cross-node publication seam, implemented by the bus adapter.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, payload: &str) -> std::result::Result<(), pubsub::BusError>;
}

#[async_trait]
impl BusPublisher for pubsub::BusAdapter {
    async fn publish(&self, payload: &str) -> std::result::Result<(), pubsub::BusError> {
        pubsub::BusAdapter::publish(self, payload).await
    }
}

pub struct Router {
    registry: Arc<Registry>,
    bus: Arc<dyn BusPublisher>,
    auth: Arc<dyn Authenticator>,
    membership: Arc<dyn GroupMembership>,
    echo_to_origin: bool,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        bus: Arc<dyn BusPublisher>,
        auth: Arc<dyn Authenticator>,
        membership: Arc<dyn GroupMembership>,
        echo_to_origin: bool,
    ) -> Self {
        Self {
            registry,
            bus,
            auth,
            membership,
            echo_to_origin,
        }
    }

    /// Route one inbound frame from a session.
    pub async fn handle_inbound(&self, session: &Arc<Session>, raw: &str) -> Result<()> {
        let started = Instant::now();
        let frame = Frame::parse(raw).map_err(GatewayError::Protocol)?;
        let result = self.dispatch(session, frame).await;
        histogram!("gateway_message_latency_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch(&self, session: &Arc<Session>, frame: Frame) -> Result<()> {
        let Frame {
            message_id,
            timestamp,
            body,
        } = frame;

        if !session.authenticated() {
            return match body {
                Body::Auth { token } => self.handle_auth(session, message_id, &token).await,
                _ => {
                    counter!("gateway_errors_total", "error_type" => "unauthenticated")
                        .increment(1);
                    Err(ProtocolError::AuthRequired.into())
                }
            };
        }

        let ctx = match session.identity() {
            Some(identity) => SessionContext {
                client_id: session.id,
                user_id: identity.user_id.clone(),
                device_id: identity.device_id.clone(),
            },
            None => return Err(ProtocolError::AuthRequired.into()),
        };

        match body {
            Body::Auth { .. } => {
                warn!(client_id = %session.id, "auth frame on authenticated session ignored");
                Ok(())
            }

            Body::Message { to, payload, .. } => {
                let json = Frame {
                    message_id,
                    timestamp,
                    body: Body::Message {
                        from: Some(ctx.user_id.clone()),
                        to: to.clone(),
                        payload,
                    },
                }
                .encode()?;

                self.deliver_local(&to, &json, Some(ctx.client_id), false);
                // Remote nodes may hold other sessions of the recipient.
                self.publish(&json).await;
                Ok(())
            }

            Body::GroupMessage {
                group_id, payload, ..
            } => {
                let members = self.membership.members(&group_id).await?;
                let json = Frame {
                    message_id,
                    timestamp,
                    body: Body::GroupMessage {
                        from: Some(ctx.user_id.clone()),
                        group_id,
                        payload,
                    },
                }
                .encode()?;

                for member in &members {
                    self.deliver_local(member, &json, Some(ctx.client_id), false);
                }
                self.publish(&json).await;
                Ok(())
            }

            Body::Typing { to, is_typing, .. } => {
                let json = Frame {
                    message_id,
                    timestamp,
                    body: Body::Typing {
                        from: Some(ctx.user_id.clone()),
                        to: to.clone(),
                        is_typing,
                    },
                }
                .encode()?;

                self.deliver_local(&to, &json, Some(ctx.client_id), true);
                self.publish(&json).await;
                Ok(())
            }

            Body::Presence {
                status,
                last_seen,
                device,
                ..
            } => {
                let json = Frame {
                    message_id,
                    timestamp,
                    body: Body::Presence {
                        user_id: Some(ctx.user_id.clone()),
                        status,
                        last_seen,
                        device: device.or_else(|| Some(ctx.device_id.clone())),
                    },
                }
                .encode()?;

                // A user's devices see each other's presence.
                self.deliver_local(&ctx.user_id, &json, Some(ctx.client_id), true);
                self.publish(&json).await;
                Ok(())
            }

            Body::Ack {
                original_message_id,
                status,
                to,
            } => match to {
                Some(target) => {
                    let json = Frame {
                        message_id,
                        timestamp,
                        body: Body::Ack {
                            original_message_id,
                            status,
                            to: Some(target.clone()),
                        },
                    }
                    .encode()?;

                    self.deliver_local(&target, &json, Some(ctx.client_id), false);
                    self.publish(&json).await;
                    Ok(())
                }
                None => {
                    counter!("gateway_messages_dropped_total", "reason" => "ack_no_target")
                        .increment(1);
                    Ok(())
                }
            },

            Body::Heartbeat { sequence } => {
                let _ = session.enqueue_frame(Frame::outbound(Body::Heartbeat { sequence }));
                Ok(())
            }

            Body::Error { code, message, .. } => {
                debug!(client_id = %session.id, code = %code, message = %message,
                    "error frame from client");
                Ok(())
            }
        }
    }

    async fn handle_auth(
        &self,
        session: &Arc<Session>,
        message_id: Option<String>,
        token: &str,
    ) -> Result<()> {
        counter!("gateway_auth_attempts_total").increment(1);

        let identity = match self.auth.validate(token) {
            Ok(identity) => identity,
            Err(err) => {
                counter!("gateway_auth_failures_total").increment(1);
                return Err(err.into());
            }
        };

        self.registry
            .register_authenticated(session, identity.clone())?;

        let _ = session.enqueue_frame(Frame::ack(message_id.as_deref().unwrap_or(""), "ok"));

        let mut presence =
            Frame::presence(&identity.user_id, "online", Some(identity.device_id));
        if let Ok(json) = presence.encode() {
            self.publish(&json).await;
        }
        Ok(())
    }

    /// Dispatch a message that arrived from the bus to local recipients.
    ///
    /// Never republishes: loop suppression already happened in the adapter,
    /// and re-publishing would echo across the fleet forever.
    pub async fn deliver_remote(&self, raw: &str) -> Result<()> {
        let frame = Frame::parse(raw).map_err(GatewayError::Protocol)?;

        match &frame.body {
            Body::Message { to, .. } => {
                self.deliver_local(to, raw, None, false);
            }
            Body::GroupMessage { group_id, .. } => {
                let members = self.membership.members(group_id).await?;
                for member in &members {
                    self.deliver_local(member, raw, None, false);
                }
            }
            Body::Typing { to, .. } => {
                self.deliver_local(to, raw, None, true);
            }
            Body::Presence {
                user_id: Some(user_id),
                ..
            } => {
                self.deliver_local(user_id, raw, None, true);
            }
            Body::Ack { to: Some(to), .. } => {
                self.deliver_local(to, raw, None, false);
            }
            _ => {}
        }
        Ok(())
    }

    /// Enqueue `json` for every local session of `to_user`.
    ///
    /// `exclude` suppresses the originating session per the self-echo
    /// policy; best-effort delivery drops on full queues silently.
    fn deliver_local(
        &self,
        to_user: &str,
        json: &str,
        exclude: Option<ClientId>,
        best_effort: bool,
    ) -> usize {
        let recipients = self.registry.lookup_user(to_user);
        let mut delivered = 0;

        for recipient in recipients {
            if !self.echo_to_origin && exclude == Some(recipient.id) {
                continue;
            }
            match recipient.enqueue(json.to_string()) {
                Ok(()) => delivered += 1,
                Err(err) if !best_effort => {
                    debug!(
                        recipient = %recipient.id,
                        user_id = to_user,
                        error = %err,
                        "local delivery failed"
                    );
                }
                Err(_) => {}
            }
        }
        delivered
    }

    async fn publish(&self, json: &str) {
        if let Err(err) = self.bus.publish(json).await {
            counter!("gateway_errors_total", "error_type" => "bus_publish").increment(1);
            warn!(error = %err, "bus publish failed");
        }
    }
}
