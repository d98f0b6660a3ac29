//! WebSocket upgrade endpoint and connection admission.
//!
//! Admission order for every inbound connection: per-IP bucket (429),
//! global ceiling (503), then token validation (401 when auth-on-connect
//! is required or a presented token is invalid). Only then is the protocol
//! upgraded, the session minted and registered, and its two pumps started.

use crate::auth::{self, Authenticator, Identity};
use crate::config::{GatewayConfig, MAX_MESSAGE_SIZE_CEILING};
use crate::protocol::{code, Frame};
use crate::registry::Registry;
use crate::router::Router;
use crate::session::{
    read_pump, write_pump, CloseReason, PumpConfig, Session, SessionLimits,
};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router as HttpRouter;
use futures::StreamExt;
use metrics::counter;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared state for the upgrade endpoint.
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub auth: Arc<dyn Authenticator>,
    pub pump: PumpConfig,
    /// Parent token for every session; cancelled on forced shutdown.
    pub sessions_cancel: CancellationToken,
}

/// Build the upgrade router (`GET /`).
pub fn app_router(state: Arc<AppState>) -> HttpRouter {
    HttpRouter::new()
        .route("/", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let cfg = &state.config;
    let ip = client_ip(&headers, addr, cfg.server.trusted_proxy);
    let limits = state.registry.limits();

    if !limits.ip.allow(ip) {
        counter!("gateway_errors_total", "error_type" => "ip_quota").increment(1);
        debug!(%ip, "connection rejected: ip quota");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "too many connections from this ip",
        )
            .into_response();
    }

    if !limits.global.has_capacity() {
        counter!("gateway_errors_total", "error_type" => "global_quota").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "gateway at capacity").into_response();
    }

    let identity = match auth::token_from_headers(&headers) {
        Some(token) => {
            counter!("gateway_auth_attempts_total").increment(1);
            match state.auth.validate(&token) {
                Ok(identity) => Some(identity),
                Err(err) => {
                    counter!("gateway_auth_failures_total").increment(1);
                    debug!(%ip, error = %err, "connection rejected: invalid token");
                    return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
                }
            }
        }
        None if cfg.auth.require_auth_on_connect => {
            return (StatusCode::UNAUTHORIZED, "authorization required").into_response();
        }
        None => None,
    };

    ws.max_message_size(MAX_MESSAGE_SIZE_CEILING)
        .write_buffer_size(cfg.server.write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state, ip, identity))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    ip: IpAddr,
    identity: Option<Identity>,
) {
    let (sink, stream) = socket.split();
    let cfg = &state.config;

    let id = Uuid::new_v4();
    let shard_id = state.registry.shard_index(&id);
    let (session, outbound_rx) = Session::new(
        id,
        ip,
        shard_id,
        state.registry.limits().message_bucket(),
        SessionLimits {
            queue_capacity: crate::session::OUTBOUND_QUEUE_CAPACITY,
            slow_drop_threshold: cfg.rate_limit.slow_drop_threshold,
            slow_drop_window: cfg.rate_limit.slow_drop_window(),
        },
        state.sessions_cancel.child_token(),
    );

    if state.registry.add(session.clone()).is_err() {
        // The ceiling filled between the pre-upgrade check and the add.
        debug!(%ip, "dropping upgraded socket: global ceiling reached");
        return;
    }

    info!(client_id = %session.id, %ip, shard_id, "session connected");

    let writer = tokio::spawn(write_pump(
        session.clone(),
        outbound_rx,
        sink,
        state.pump.clone(),
    ));

    match identity {
        Some(identity) => {
            if state
                .registry
                .register_authenticated(&session, identity)
                .is_err()
            {
                let _ = session.enqueue_frame(Frame::error(
                    code::AUTH_FAILED,
                    "user connection limit reached",
                    None,
                ));
                session.soft_close(CloseReason::UserLimit);
            }
        }
        None => spawn_auth_deadline(session.clone(), cfg.auth.auth_timeout()),
    }

    read_pump(
        session.clone(),
        state.router.clone(),
        stream,
        state.pump.clone(),
    )
    .await;

    let reason = session.close_reason().unwrap_or(CloseReason::Normal);
    session.close(reason);
    state.registry.remove(&session.id, reason);
    let _ = writer.await;

    info!(client_id = %session.id, reason = reason.as_str(), "session closed");
}

/// Close the session if it has not authenticated within the deadline.
fn spawn_auth_deadline(session: Arc<Session>, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = session.cancel.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                if !session.authenticated() {
                    debug!(client_id = %session.id, "authentication deadline expired");
                    session.close(CloseReason::AuthTimeout);
                }
            }
        }
    });
}

/// Peer IP, honoring the first forwarded hop when the proxy is trusted.
fn client_ip(headers: &HeaderMap, addr: SocketAddr, trusted_proxy: bool) -> IpAddr {
    if trusted_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
        {
            return forwarded;
        }
    }
    addr.ip()
}
