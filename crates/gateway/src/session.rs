//! Per-connection session state and its two cooperating I/O tasks.
//!
//! Each session runs an independent read pump and write pump sharing the
//! socket. The write pump owns the sink, drains a strictly bounded outbound
//! queue (coalescing consecutive payloads with `\n`) and emits pings; the
//! read pump enforces the read deadline, the per-client message bucket and
//! the frame size limit, and feeds the router. Enqueueing on a full queue
//! never blocks the producer.

use crate::auth::Identity;
use crate::config::GatewayConfig;
use crate::error::{FlowError, GatewayError, ProtocolError};
use crate::limiter::TokenBucket;
use crate::protocol::{code, Frame};
use crate::router::Router;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Process-unique session identifier.
pub type ClientId = Uuid;

/// Default bound of the per-session outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Protocol violations tolerated before the session is closed.
pub const VIOLATION_QUOTA: u32 = 5;

/// Why a session was (or is being) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    AuthTimeout,
    AuthFailed,
    Superseded,
    UserLimit,
    HeartbeatTimeout,
    Inactive,
    ClientSlow,
    ProtocolViolation,
    ServerShutdown,
    TransportError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::Superseded => "superseded",
            CloseReason::UserLimit => "user_limit",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Inactive => "inactive_timeout",
            CloseReason::ClientSlow => "client_slow",
            CloseReason::ProtocolViolation => "protocol_violation",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::TransportError => "transport_error",
        }
    }

    fn close_code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::ServerShutdown
            | CloseReason::HeartbeatTimeout
            | CloseReason::Inactive => 1001,
            CloseReason::ProtocolViolation => 1002,
            CloseReason::AuthTimeout
            | CloseReason::AuthFailed
            | CloseReason::Superseded
            | CloseReason::UserLimit => 1008,
            CloseReason::ClientSlow => 1013,
            CloseReason::TransportError => 1011,
        }
    }
}

/// Entry in the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized application frame.
    Frame(String),
    /// Soft close: flush everything ahead of it, then close with reason.
    Close(CloseReason),
}

/// Heartbeat state machine.
///
/// | State        | Trigger               | Next                       |
/// |--------------|-----------------------|----------------------------|
/// | Idle         | ping interval elapsed | SendingPing                |
/// | SendingPing  | write ok              | AwaitingPong               |
/// | AwaitingPong | pong received         | Idle (reset read deadline) |
/// | AwaitingPong | read deadline expires | Closing(heartbeat_timeout) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    SendingPing,
    AwaitingPong,
}

#[derive(Debug)]
pub struct Heartbeat {
    state: HeartbeatState,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            state: HeartbeatState::Idle,
        }
    }

    /// Ping interval elapsed; true when a ping should be written.
    pub fn on_ping_due(&mut self) -> bool {
        if self.state == HeartbeatState::Idle {
            self.state = HeartbeatState::SendingPing;
            true
        } else {
            false
        }
    }

    /// The ping write succeeded.
    pub fn on_write_ok(&mut self) {
        if self.state == HeartbeatState::SendingPing {
            self.state = HeartbeatState::AwaitingPong;
        }
    }

    /// A pong arrived.
    pub fn on_pong(&mut self) {
        self.state = HeartbeatState::Idle;
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Running per-session counters.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub slow_drops: AtomicU64,
}

/// Per-session bounds on the queue and the slow-consumer window.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub queue_capacity: usize,
    pub slow_drop_threshold: u32,
    pub slow_drop_window: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            queue_capacity: OUTBOUND_QUEUE_CAPACITY,
            slow_drop_threshold: 64,
            slow_drop_window: Duration::from_secs(60),
        }
    }
}

struct SlowWindow {
    count: u32,
    window_start: Instant,
}

/// Live state for one client connection.
///
/// Owned by its shard; the pumps hold `Arc` references for the session's
/// lifetime.
pub struct Session {
    pub id: ClientId,
    pub ip: IpAddr,
    pub shard_id: u32,
    pub connected_at_ms: i64,

    last_activity_ms: AtomicU64,
    last_pong_ms: AtomicU64,
    last_pong_at: Mutex<Instant>,

    identity: OnceLock<Identity>,

    outbound: mpsc::Sender<Outbound>,
    bucket: Mutex<TokenBucket>,
    pub heartbeat: Mutex<Heartbeat>,

    closed: AtomicBool,
    writes_closed: AtomicBool,
    draining: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    violations: AtomicU32,
    slow: Mutex<SlowWindow>,
    limits: SessionLimits,

    pub counters: SessionCounters,
    pub cancel: CancellationToken,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue.
    pub fn new(
        id: ClientId,
        ip: IpAddr,
        shard_id: u32,
        bucket: TokenBucket,
        limits: SessionLimits,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(limits.queue_capacity);
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;

        let session = Arc::new(Self {
            id,
            ip,
            shard_id,
            connected_at_ms: now_ms as i64,
            last_activity_ms: AtomicU64::new(now_ms),
            last_pong_ms: AtomicU64::new(now_ms),
            last_pong_at: Mutex::new(Instant::now()),
            identity: OnceLock::new(),
            outbound: tx,
            bucket: Mutex::new(bucket),
            heartbeat: Mutex::new(Heartbeat::new()),
            closed: AtomicBool::new(false),
            writes_closed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            violations: AtomicU32::new(0),
            slow: Mutex::new(SlowWindow {
                count: 0,
                window_start: Instant::now(),
            }),
            limits,
            counters: SessionCounters::default(),
            cancel,
        });

        (session, rx)
    }

    pub fn authenticated(&self) -> bool {
        self.identity.get().is_some()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Record the authenticated identity; false if one was already set.
    pub fn set_identity(&self, identity: Identity) -> bool {
        self.identity.set(identity).is_ok()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.get().map(|i| i.user_id.as_str())
    }

    pub fn touch_activity(&self) {
        self.last_activity_ms.store(
            chrono::Utc::now().timestamp_millis() as u64,
            Ordering::Relaxed,
        );
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        self.last_pong_ms.store(now_ms, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);
        *self.last_pong_at.lock() = Instant::now();
        self.heartbeat.lock().on_pong();
    }

    /// Deadline by which the next pong (or frame) must arrive.
    pub fn read_deadline(&self, pong_wait: Duration) -> Instant {
        *self.last_pong_at.lock() + pong_wait
    }

    pub fn last_pong_ms(&self) -> u64 {
        self.last_pong_ms.load(Ordering::Relaxed)
    }

    /// Consume one token from the per-client message bucket.
    pub fn allow_message(&self) -> bool {
        self.bucket.lock().allow()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Queue a serialized frame for the write pump.
    ///
    /// Never blocks: a full queue drops the message and reports
    /// `client_slow`; repeated drops within the window trigger a proactive
    /// close.
    pub fn enqueue(&self, payload: String) -> Result<(), FlowError> {
        if self.writes_closed.load(Ordering::Acquire) {
            return Err(FlowError::SessionClosed);
        }

        match self.outbound.try_send(Outbound::Frame(payload)) {
            Ok(()) => {
                self.counters.messages_out.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_messages_sent_total").increment(1);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.slow_drops.fetch_add(1, Ordering::Relaxed);
                counter!("gateway_errors_total", "error_type" => "client_slow").increment(1);
                counter!("gateway_messages_dropped_total", "reason" => "client_slow").increment(1);

                if self.note_slow_drop() {
                    warn!(client_id = %self.id, "slow-consumer threshold exceeded, closing");
                    self.close(CloseReason::ClientSlow);
                }
                Err(FlowError::ClientSlow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(FlowError::SessionClosed),
        }
    }

    /// Serialize and queue an application frame.
    pub fn enqueue_frame(&self, mut frame: Frame) -> Result<(), FlowError> {
        match frame.encode() {
            Ok(json) => self.enqueue(json),
            Err(err) => {
                warn!(client_id = %self.id, error = %err, "failed to encode outbound frame");
                Err(FlowError::SessionClosed)
            }
        }
    }

    fn note_slow_drop(&self) -> bool {
        let mut slow = self.slow.lock();
        let now = Instant::now();
        if now.duration_since(slow.window_start) > self.limits.slow_drop_window {
            slow.window_start = now;
            slow.count = 0;
        }
        slow.count += 1;
        slow.count >= self.limits.slow_drop_threshold
    }

    /// Count a protocol violation; true when the quota is exceeded.
    pub fn record_violation(&self, quota: u32) -> bool {
        self.violations.fetch_add(1, Ordering::Relaxed) + 1 > quota
    }

    /// Transition to Closing and cancel both pumps. Idempotent; returns
    /// true only for the call that performed the transition.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.writes_closed.store(true, Ordering::Release);
        self.draining.store(true, Ordering::Release);
        let _ = self.close_reason.set(reason);
        self.cancel.cancel();
        true
    }

    /// Queue a close frame behind pending traffic and refuse new writes.
    ///
    /// Falls back to a hard close when the queue has no room left.
    pub fn soft_close(&self, reason: CloseReason) {
        self.draining.store(true, Ordering::Release);
        if self.writes_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.outbound.try_send(Outbound::Close(reason)).is_err() {
            self.close(reason);
        }
    }

    /// Whether the outbound queue has fully drained.
    pub fn queue_idle(&self) -> bool {
        self.outbound.capacity() == self.outbound.max_capacity()
    }

    #[cfg(test)]
    pub fn force_last_activity_ms(&self, ms: u64) {
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("shard_id", &self.shard_id)
            .field("authenticated", &self.authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pump parameters derived from the gateway configuration.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub max_message_size: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub violation_quota: u32,
}

impl PumpConfig {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            max_message_size: cfg.server.max_message_size,
            pong_wait: cfg.server.pong_wait(),
            ping_period: cfg.server.ping_period(),
            write_wait: cfg.server.write_wait(),
            violation_quota: VIOLATION_QUOTA,
        }
    }
}

/// Read frames from the socket until close, error, deadline or cancel.
pub async fn read_pump(
    session: Arc<Session>,
    router: Arc<Router>,
    mut stream: SplitStream<WebSocket>,
    cfg: PumpConfig,
) {
    loop {
        let deadline = session.read_deadline(cfg.pong_wait);

        tokio::select! {
            biased;

            _ = session.cancel.cancelled() => break,

            _ = sleep_until(deadline) => {
                debug!(client_id = %session.id, "read deadline expired");
                session.close(CloseReason::HeartbeatTimeout);
                break;
            }

            item = stream.next() => match item {
                Some(Ok(Message::Text(text))) => {
                    handle_inbound_text(&session, &router, text.as_str(), &cfg).await;
                    if session.is_closed() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    match std::str::from_utf8(&data) {
                        Ok(text) => {
                            handle_inbound_text(&session, &router, text, &cfg).await;
                            if session.is_closed() {
                                break;
                            }
                        }
                        Err(_) => {
                            emit_protocol_error(
                                &session,
                                code::INTERNAL_ERROR,
                                "binary frame is not valid UTF-8",
                                None,
                                &cfg,
                            );
                            if session.is_closed() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => session.record_pong(),
                // The transport answers pings for us; just note liveness.
                Some(Ok(Message::Ping(_))) => session.touch_activity(),
                Some(Ok(Message::Close(_))) => {
                    session.close(CloseReason::Normal);
                    break;
                }
                Some(Err(err)) => {
                    debug!(client_id = %session.id, error = %err, "websocket read error");
                    session.close(CloseReason::TransportError);
                    break;
                }
                None => {
                    session.close(CloseReason::Normal);
                    break;
                }
            },
        }
    }
}

async fn handle_inbound_text(
    session: &Arc<Session>,
    router: &Arc<Router>,
    text: &str,
    cfg: &PumpConfig,
) {
    session.touch_activity();
    session.counters.messages_in.fetch_add(1, Ordering::Relaxed);
    session
        .counters
        .bytes_in
        .fetch_add(text.len() as u64, Ordering::Relaxed);
    counter!("gateway_messages_received_total").increment(1);

    // During graceful drain inbound frames are discarded.
    if session.is_draining() {
        return;
    }

    if text.len() > cfg.max_message_size {
        emit_protocol_error(
            session,
            code::MESSAGE_TOO_LARGE,
            "message exceeds size limit",
            Some(format!("limit is {} bytes", cfg.max_message_size)),
            cfg,
        );
        return;
    }

    if !session.allow_message() {
        counter!("gateway_rate_limit_hits_total").increment(1);
        let _ = session.enqueue_frame(Frame::error(
            code::RATE_LIMIT_EXCEEDED,
            "too many messages",
            Some("please slow down".to_string()),
        ));
        return;
    }

    if let Err(err) = router.handle_inbound(session, text).await {
        report_routing_error(session, err, cfg);
    }
}

fn emit_protocol_error(
    session: &Arc<Session>,
    error_code: &str,
    message: &str,
    details: Option<String>,
    cfg: &PumpConfig,
) {
    counter!("gateway_errors_total", "error_type" => "protocol").increment(1);
    let _ = session.enqueue_frame(Frame::error(error_code, message, details));
    if session.record_violation(cfg.violation_quota) {
        session.close(CloseReason::ProtocolViolation);
    }
}

fn report_routing_error(session: &Arc<Session>, err: GatewayError, cfg: &PumpConfig) {
    match err {
        GatewayError::Protocol(p) => {
            let (error_code, message, details) = match p {
                ProtocolError::Oversize => {
                    (code::MESSAGE_TOO_LARGE, "message exceeds size limit", None)
                }
                ProtocolError::Malformed(detail) => {
                    (code::INTERNAL_ERROR, "malformed message", Some(detail))
                }
                ProtocolError::UnknownType(t) => (code::UNKNOWN_TYPE, "unknown message type", Some(t)),
                ProtocolError::AuthRequired => {
                    (code::AUTH_REQUIRED, "authenticate before sending messages", None)
                }
            };
            emit_protocol_error(session, error_code, message, details, cfg);
        }
        GatewayError::Auth(err) => {
            let _ = session.enqueue_frame(Frame::error(
                code::AUTH_FAILED,
                "authentication failed",
                Some(err.to_string()),
            ));
            session.close(CloseReason::AuthFailed);
        }
        GatewayError::Admission(err) => {
            let _ = session.enqueue_frame(Frame::error(
                code::AUTH_FAILED,
                "connection quota exceeded",
                Some(err.to_string()),
            ));
            session.close(CloseReason::UserLimit);
        }
        GatewayError::Flow(FlowError::RateLimited) => {
            let _ = session.enqueue_frame(Frame::error(
                code::RATE_LIMIT_EXCEEDED,
                "too many messages",
                None,
            ));
        }
        err => {
            counter!("gateway_errors_total", "error_type" => "internal").increment(1);
            warn!(client_id = %session.id, error = %err, "message handling failed");
            let _ = session.enqueue_frame(Frame::error(
                code::INTERNAL_ERROR,
                "internal error",
                None,
            ));
        }
    }
}

/// Drain the outbound queue into the socket; ping on the heartbeat
/// interval; emit the close frame on the way out.
pub async fn write_pump(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WebSocket, Message>,
    cfg: PumpConfig,
) {
    let mut ping = interval(cfg.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick of `interval` fires immediately; skip it.
    ping.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = session.cancel.cancelled() => {
                let reason = session.close_reason().unwrap_or(CloseReason::Normal);
                let _ = timeout(cfg.write_wait, sink.send(close_frame(reason))).await;
                break;
            }

            next = rx.recv() => match next {
                Some(Outbound::Frame(payload)) => {
                    let mut body = payload;
                    let mut frames = 1u64;
                    let mut pending_close = None;

                    // Coalesce whatever else is already queued.
                    while let Ok(queued) = rx.try_recv() {
                        match queued {
                            Outbound::Frame(payload) => {
                                body.push('\n');
                                body.push_str(&payload);
                                frames += 1;
                            }
                            Outbound::Close(reason) => {
                                pending_close = Some(reason);
                                break;
                            }
                        }
                    }

                    session
                        .counters
                        .bytes_out
                        .fetch_add(body.len() as u64, Ordering::Relaxed);

                    match timeout(cfg.write_wait, sink.send(Message::Text(Utf8Bytes::from(body))))
                        .await
                    {
                        Ok(Ok(())) => {
                            debug!(client_id = %session.id, frames, "flushed outbound frames");
                        }
                        _ => {
                            session.close(CloseReason::TransportError);
                            break;
                        }
                    }

                    if let Some(reason) = pending_close {
                        let _ = timeout(cfg.write_wait, sink.send(close_frame(reason))).await;
                        session.close(reason);
                        break;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let _ = timeout(cfg.write_wait, sink.send(close_frame(reason))).await;
                    session.close(reason);
                    break;
                }
                None => break,
            },

            _ = ping.tick() => {
                let due = session.heartbeat.lock().on_ping_due();
                if due {
                    match timeout(cfg.write_wait, sink.send(Message::Ping(Vec::new().into()))).await
                    {
                        Ok(Ok(())) => session.heartbeat.lock().on_write_ok(),
                        _ => {
                            session.close(CloseReason::TransportError);
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn close_frame(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(limits: SessionLimits) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        Session::new(
            Uuid::new_v4(),
            "127.0.0.1".parse().unwrap(),
            0,
            TokenBucket::new(100.0, 150),
            limits,
            CancellationToken::new(),
        )
    }

    #[test]
    fn enqueue_on_full_queue_reports_client_slow() {
        let limits = SessionLimits {
            queue_capacity: 4,
            slow_drop_threshold: 100,
            slow_drop_window: Duration::from_secs(60),
        };
        let (session, rx) = test_session(limits);

        for i in 0..4 {
            session.enqueue(format!("m{i}")).unwrap();
        }
        assert_eq!(session.enqueue("overflow".into()), Err(FlowError::ClientSlow));

        // The session stays open and the queue keeps its contents.
        assert!(!session.is_closed());
        assert_eq!(session.counters.slow_drops.load(Ordering::Relaxed), 1);
        drop(rx);
    }

    #[test]
    fn repeated_slow_drops_trigger_proactive_close() {
        let limits = SessionLimits {
            queue_capacity: 1,
            slow_drop_threshold: 3,
            slow_drop_window: Duration::from_secs(60),
        };
        let (session, _rx) = test_session(limits);

        session.enqueue("fill".into()).unwrap();
        assert!(session.enqueue("a".into()).is_err());
        assert!(session.enqueue("b".into()).is_err());
        assert!(!session.is_closed());
        assert!(session.enqueue("c".into()).is_err());
        assert!(session.is_closed());
        assert_eq!(session.close_reason(), Some(CloseReason::ClientSlow));
    }

    #[test]
    fn close_is_idempotent() {
        let (session, _rx) = test_session(SessionLimits::default());

        assert!(session.close(CloseReason::HeartbeatTimeout));
        assert!(!session.close(CloseReason::Normal));
        assert_eq!(session.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(session.cancel.is_cancelled());
        assert_eq!(session.enqueue("x".into()), Err(FlowError::SessionClosed));
    }

    #[test]
    fn soft_close_queues_behind_pending_traffic() {
        let (session, mut rx) = test_session(SessionLimits::default());

        session.enqueue("first".into()).unwrap();
        session.soft_close(CloseReason::ServerShutdown);
        assert_eq!(session.enqueue("late".into()), Err(FlowError::SessionClosed));

        match rx.try_recv().unwrap() {
            Outbound::Frame(payload) => assert_eq!(payload, "first"),
            other => panic!("expected frame, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Outbound::Close(reason) => assert_eq!(reason, CloseReason::ServerShutdown),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn heartbeat_follows_the_state_table() {
        let mut hb = Heartbeat::new();
        assert_eq!(hb.state(), HeartbeatState::Idle);

        assert!(hb.on_ping_due());
        assert_eq!(hb.state(), HeartbeatState::SendingPing);

        hb.on_write_ok();
        assert_eq!(hb.state(), HeartbeatState::AwaitingPong);

        // While awaiting a pong, further intervals do not send pings.
        assert!(!hb.on_ping_due());
        assert_eq!(hb.state(), HeartbeatState::AwaitingPong);

        hb.on_pong();
        assert_eq!(hb.state(), HeartbeatState::Idle);
    }

    #[test]
    fn violation_quota() {
        let (session, _rx) = test_session(SessionLimits::default());
        for _ in 0..VIOLATION_QUOTA {
            assert!(!session.record_violation(VIOLATION_QUOTA));
        }
        assert!(session.record_violation(VIOLATION_QUOTA));
    }

    #[test]
    fn identity_is_set_once() {
        let (session, _rx) = test_session(SessionLimits::default());
        assert!(!session.authenticated());

        let identity = Identity {
            user_id: "u1".into(),
            device_id: "d1".into(),
            session_id: "s1".into(),
        };
        assert!(session.set_identity(identity.clone()));
        assert!(!session.set_identity(identity));
        assert_eq!(session.user_id(), Some("u1"));
    }

    #[test]
    fn queue_idle_tracks_drain() {
        let (session, mut rx) = test_session(SessionLimits::default());
        assert!(session.queue_idle());
        session.enqueue("x".into()).unwrap();
        assert!(!session.queue_idle());
        let _ = rx.try_recv().unwrap();
        assert!(session.queue_idle());
    }
}
