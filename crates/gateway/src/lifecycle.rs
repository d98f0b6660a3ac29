//! Coordinated startup/shutdown and cross-layer wiring.
//!
//! Shutdown is deadline-bounded and always completes: stop accepting
//! upgrades, soft-close every session, wait for outbound queues to drain,
//! force-close the remainder, close the bus subscription, stop the metrics
//! endpoint. Exceeding the deadline at any step logs and proceeds.

use crate::protocol::Frame;
use crate::registry::{Registry, SessionHooks};
use crate::router::BusPublisher;
use crate::session::{CloseReason, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default wiring for connect/disconnect notifications: metrics plus a
/// presence `offline` publication for authenticated sessions.
pub struct GatewayHooks {
    bus: Arc<dyn BusPublisher>,
}

impl GatewayHooks {
    pub fn new(bus: Arc<dyn BusPublisher>) -> Self {
        Self { bus }
    }
}

impl SessionHooks for GatewayHooks {
    fn on_connect(&self, session: &Arc<Session>) {
        debug!(client_id = %session.id, ip = %session.ip, "connect hook");
    }

    fn on_disconnect(&self, session: &Arc<Session>, reason: CloseReason) {
        info!(
            client_id = %session.id,
            user_id = session.user_id().unwrap_or(""),
            reason = reason.as_str(),
            "session disconnected"
        );

        if let Some(identity) = session.identity() {
            let mut frame = Frame::presence(
                &identity.user_id,
                "offline",
                Some(identity.device_id.clone()),
            );
            if let Ok(json) = frame.encode() {
                let bus = self.bus.clone();
                tokio::spawn(async move {
                    if let Err(err) = bus.publish(&json).await {
                        warn!(error = %err, "offline presence publish failed");
                    }
                });
            }
        }
    }
}

/// Periodically sweep all shards for sessions idle past `max_idle`.
pub fn spawn_sweeper(
    registry: Arc<Registry>,
    sweep_interval: Duration,
    max_idle: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(sweep_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    registry.cleanup_stale(max_idle);
                }
            }
        }
    })
}

/// Handles and cancellation tokens for everything the process runs.
pub struct Lifecycle {
    pub registry: Arc<Registry>,
    pub deadline: Duration,

    pub accept_cancel: CancellationToken,
    pub sessions_cancel: CancellationToken,
    pub bus_cancel: CancellationToken,
    pub metrics_cancel: CancellationToken,
    pub background_cancel: CancellationToken,

    pub server_task: JoinHandle<()>,
    pub bus_task: JoinHandle<()>,
    pub metrics_task: JoinHandle<()>,
    pub background_tasks: Vec<JoinHandle<()>>,
}

impl Lifecycle {
    /// Run the deadline-bounded shutdown sequence.
    pub async fn shutdown(self) {
        let Lifecycle {
            registry,
            deadline,
            accept_cancel,
            sessions_cancel,
            bus_cancel,
            metrics_cancel,
            background_cancel,
            server_task,
            bus_task,
            metrics_task,
            background_tasks,
        } = self;

        let started = Instant::now();
        let remaining = move || {
            deadline
                .saturating_sub(started.elapsed())
                .max(Duration::from_millis(250))
        };
        info!(?deadline, "graceful shutdown initiated");

        // 1. Stop accepting new upgrades.
        accept_cancel.cancel();
        background_cancel.cancel();

        // 2. Soft-close every session; inbound acceptance flips off.
        registry.begin_drain(CloseReason::ServerShutdown);

        // 3. Wait for outbound queues to drain (sessions remove themselves
        //    once their close frame is flushed).
        while registry.total_active() > 0 && started.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // 4. Force-close whatever is left.
        let forced = registry.force_close_all(CloseReason::ServerShutdown);
        if forced > 0 {
            warn!(forced, "force-closed sessions at shutdown deadline");
        }
        sessions_cancel.cancel();
        await_step(server_task, remaining(), "listener").await;

        // 5. Close the bus subscription; in-flight handlers are bounded by
        //    their own timeout.
        bus_cancel.cancel();
        await_step(bus_task, remaining(), "bus").await;

        for task in background_tasks {
            await_step(task, Duration::from_secs(1), "background").await;
        }

        // 6. Stop the metrics endpoint last.
        metrics_cancel.cancel();
        await_step(metrics_task, remaining(), "metrics").await;

        info!(elapsed = ?started.elapsed(), "shutdown complete");
    }
}

async fn await_step(task: JoinHandle<()>, budget: Duration, name: &str) {
    if timeout(budget, task).await.is_err() {
        warn!(step = name, "shutdown step exceeded its budget, proceeding");
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = terminate => info!("received SIGTERM"),
    }
}
