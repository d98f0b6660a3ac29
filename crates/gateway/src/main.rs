//! Gateway process entry point.
//!
//! Startup order: config → logger → rate-limit structures → shards → bus
//! subscription → WebSocket listener → metrics endpoint. SIGINT/SIGTERM
//! trigger the deadline-bounded graceful shutdown in reverse order.

use anyhow::Result;
use gateway::lifecycle::{self, GatewayHooks, Lifecycle};
use gateway::limiter::RateLimiterTree;
use gateway::router::{NoMembership, Router};
use gateway::server::{app_router, AppState};
use gateway::session::PumpConfig;
use gateway::{Authenticator, GatewayConfig, JwtAuthenticator, Registry};
use pubsub::{BusAdapter, BusConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Arc::new(GatewayConfig::load()?);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.observability.log_level.clone())),
        )
        .init();

    info!(
        node_id = %cfg.cluster.node_id,
        shards = cfg.sharding.effective_shard_count(),
        "starting websocket gateway"
    );

    let prometheus = gateway::observability::install()?;

    let limits = Arc::new(RateLimiterTree::new(
        &cfg.rate_limit,
        cfg.server.max_conns_per_ip,
    ));

    let bus = Arc::new(BusAdapter::new(BusConfig {
        addresses: cfg.bus.addresses.clone(),
        channel_prefix: cfg.bus.pubsub_channel_prefix.clone(),
        node_id: cfg.cluster.node_id.clone(),
    })?);

    let hooks = Arc::new(GatewayHooks::new(bus.clone()));
    let registry = Arc::new(Registry::new(
        cfg.sharding.effective_shard_count(),
        limits,
        hooks,
    ));

    let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(
        cfg.auth.jwt_secret.as_bytes(),
        &cfg.auth.issuer,
        cfg.auth.token_expiry_secs,
    ));

    let router = Arc::new(Router::new(
        registry.clone(),
        bus.clone(),
        authenticator.clone(),
        Arc::new(NoMembership),
        cfg.router.echo_to_origin,
    ));

    // Bus deliveries fan into the router per message type.
    for msg_type in ["message", "group_message", "typing", "presence", "ack"] {
        let router = router.clone();
        bus.register_handler(msg_type, move |payload| {
            let router = router.clone();
            async move {
                router
                    .deliver_remote(&payload)
                    .await
                    .map_err(|e| e.to_string())
            }
        });
    }

    let accept_cancel = CancellationToken::new();
    let sessions_cancel = CancellationToken::new();
    let bus_cancel = CancellationToken::new();
    let metrics_cancel = CancellationToken::new();
    let background_cancel = CancellationToken::new();

    let bus_task = tokio::spawn(bus.clone().run(bus_cancel.clone()));

    let sweeper = lifecycle::spawn_sweeper(
        registry.clone(),
        cfg.server.cleanup_interval(),
        cfg.server.pong_wait() * 2,
        background_cancel.clone(),
    );
    let updater = gateway::observability::spawn_updater(registry.clone(), background_cancel.clone());

    let state = Arc::new(AppState {
        config: cfg.clone(),
        registry: registry.clone(),
        router,
        auth: authenticator,
        pump: PumpConfig::from_config(&cfg),
        sessions_cancel: sessions_cancel.clone(),
    });
    let app = app_router(state);

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");

    let accept = accept_cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(accept.cancelled_owned())
        .await
        {
            error!(error = %err, "websocket listener failed");
        }
    });

    let metrics_addr = format!("{}:{}", cfg.server.host, cfg.observability.metrics_port);
    let metrics_listener = TcpListener::bind(&metrics_addr).await?;
    info!(addr = %metrics_addr, "metrics endpoint listening");
    let metrics_task = tokio::spawn(gateway::observability::serve(
        metrics_listener,
        prometheus,
        registry.clone(),
        metrics_cancel.clone(),
    ));

    lifecycle::shutdown_signal().await;

    Lifecycle {
        registry,
        deadline: cfg.server.graceful_shutdown_wait(),
        accept_cancel,
        sessions_cancel,
        bus_cancel,
        metrics_cancel,
        background_cancel,
        server_task,
        bus_task,
        metrics_task,
        background_tasks: vec![sweeper, updater],
    }
    .shutdown()
    .await;

    info!("gateway stopped");
    Ok(())
}
