//! Layered configuration: `config/default` → `config/{environment}` →
//! `config/local` → environment variables with prefix `GATEWAY` and `__`
//! separator.

use crate::error::{GatewayError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Hard transport cap; `server.max_message_size` may not exceed it.
pub const MAX_MESSAGE_SIZE_CEILING: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub cluster: ClusterConfig,
    pub bus: BusSection,
    pub rate_limit: RateLimitConfig,
    pub sharding: ShardingConfig,
    pub router: RouterSection,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub max_message_size: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    /// 0 means "derive 90% of pong wait".
    pub ping_period_secs: u64,
    pub max_conns_per_ip: u32,
    pub graceful_shutdown_wait_secs: u64,
    /// Trust the first `X-Forwarded-For` hop for the client IP.
    pub trusted_proxy: bool,
    pub cleanup_interval_secs: u64,
}

impl ServerConfig {
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Interval between outgoing pings, 90% of the pong wait by default.
    pub fn ping_period(&self) -> Duration {
        if self.ping_period_secs == 0 {
            self.pong_wait() * 9 / 10
        } else {
            Duration::from_secs(self.ping_period_secs)
        }
    }

    pub fn graceful_shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_wait_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub token_expiry_secs: u64,
    pub auth_timeout_secs: u64,
    pub require_auth_on_connect: bool,
}

impl AuthConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub node_id: String,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusSection {
    pub addresses: Vec<String>,
    pub pubsub_channel_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub messages_per_second: u32,
    pub burst: u32,
    pub connections_per_user: u32,
    pub global_connections: i64,
    pub connections_per_ip_per_sec: u32,
    pub ip_bucket_ttl_secs: u64,
    pub slow_drop_threshold: u32,
    pub slow_drop_window_secs: u64,
}

impl RateLimitConfig {
    pub fn ip_bucket_ttl(&self) -> Duration {
        Duration::from_secs(self.ip_bucket_ttl_secs)
    }

    pub fn slow_drop_window(&self) -> Duration {
        Duration::from_secs(self.slow_drop_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    pub shard_count: u32,
    pub shard_key: String,
}

impl ShardingConfig {
    /// Configured count rounded up to the next power of two.
    pub fn effective_shard_count(&self) -> u32 {
        self.shard_count.max(1).next_power_of_two()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// Deliver a self-addressed message back to the originating session.
    pub echo_to_origin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    pub metrics_port: u16,
    pub log_level: String,
}

impl GatewayConfig {
    pub fn load() -> Result<Self> {
        let env = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("GATEWAY").separator("__"))
            // Server defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.read_buffer_size", 4096)?
            .set_default("server.write_buffer_size", 4096)?
            .set_default("server.max_message_size", 512 * 1024)?
            .set_default("server.write_wait_secs", 10)?
            .set_default("server.pong_wait_secs", 60)?
            .set_default("server.ping_period_secs", 54)?
            .set_default("server.max_conns_per_ip", 10)?
            .set_default("server.graceful_shutdown_wait_secs", 30)?
            .set_default("server.trusted_proxy", false)?
            .set_default("server.cleanup_interval_secs", 60)?
            // Auth defaults
            .set_default("auth.jwt_secret", "")?
            .set_default("auth.issuer", "ws-gateway")?
            .set_default("auth.token_expiry_secs", 24 * 3600)?
            .set_default("auth.auth_timeout_secs", 5)?
            .set_default("auth.require_auth_on_connect", true)?
            // Cluster defaults
            .set_default("cluster.node_id", generate_node_id())?
            .set_default("cluster.heartbeat_interval_secs", 5)?
            // Bus defaults
            .set_default("bus.addresses", vec!["redis://127.0.0.1:6379"])?
            .set_default("bus.pubsub_channel_prefix", "ws-gateway")?
            // Rate limit defaults
            .set_default("rate_limit.messages_per_second", 100)?
            .set_default("rate_limit.burst", 150)?
            .set_default("rate_limit.connections_per_user", 5)?
            .set_default("rate_limit.global_connections", 1_000_000)?
            // 0 means "same as server.max_conns_per_ip".
            .set_default("rate_limit.connections_per_ip_per_sec", 0)?
            .set_default("rate_limit.ip_bucket_ttl_secs", 600)?
            .set_default("rate_limit.slow_drop_threshold", 64)?
            .set_default("rate_limit.slow_drop_window_secs", 60)?
            // Sharding defaults
            .set_default("sharding.shard_count", 64)?
            .set_default("sharding.shard_key", "client_id")?
            // Router defaults
            .set_default("router.echo_to_origin", false)?
            // Observability defaults
            .set_default("observability.metrics_port", 9090)?
            .set_default("observability.log_level", "info")?
            .build()?;

        let cfg: GatewayConfig = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(GatewayError::Fatal("auth.jwt_secret is required".into()));
        }
        if self.server.max_message_size == 0
            || self.server.max_message_size > MAX_MESSAGE_SIZE_CEILING
        {
            return Err(GatewayError::Fatal(
                "server.max_message_size must be between 1 byte and 10MB".into(),
            ));
        }
        if self.server.pong_wait_secs == 0 {
            return Err(GatewayError::Fatal("server.pong_wait_secs must be positive".into()));
        }
        if self.server.ping_period() >= self.server.pong_wait() {
            return Err(GatewayError::Fatal(
                "server.ping_period_secs must be shorter than server.pong_wait_secs".into(),
            ));
        }
        if self.rate_limit.global_connections <= 0 {
            return Err(GatewayError::Fatal(
                "rate_limit.global_connections must be positive".into(),
            ));
        }
        if self.sharding.shard_count == 0 {
            return Err(GatewayError::Fatal("sharding.shard_count must be positive".into()));
        }
        if self.bus.addresses.is_empty() {
            return Err(GatewayError::Fatal("bus.addresses must not be empty".into()));
        }
        Ok(())
    }
}

fn generate_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                read_buffer_size: 4096,
                write_buffer_size: 4096,
                max_message_size: 512 * 1024,
                write_wait_secs: 10,
                pong_wait_secs: 60,
                ping_period_secs: 0,
                max_conns_per_ip: 10,
                graceful_shutdown_wait_secs: 30,
                trusted_proxy: false,
                cleanup_interval_secs: 60,
            },
            auth: AuthConfig {
                jwt_secret: "secret".into(),
                issuer: "ws-gateway".into(),
                token_expiry_secs: 3600,
                auth_timeout_secs: 5,
                require_auth_on_connect: true,
            },
            cluster: ClusterConfig {
                node_id: "node-1".into(),
                heartbeat_interval_secs: 5,
            },
            bus: BusSection {
                addresses: vec!["redis://127.0.0.1:6379".into()],
                pubsub_channel_prefix: "ws-gateway".into(),
            },
            rate_limit: RateLimitConfig {
                messages_per_second: 100,
                burst: 150,
                connections_per_user: 5,
                global_connections: 1_000_000,
                connections_per_ip_per_sec: 10,
                ip_bucket_ttl_secs: 600,
                slow_drop_threshold: 64,
                slow_drop_window_secs: 60,
            },
            sharding: ShardingConfig {
                shard_count: 64,
                shard_key: "client_id".into(),
            },
            router: RouterSection {
                echo_to_origin: false,
            },
            observability: ObservabilityConfig {
                metrics_port: 9090,
                log_level: "info".into(),
            },
        }
    }

    #[test]
    fn ping_period_derives_from_pong_wait() {
        let cfg = base_config();
        assert_eq!(cfg.server.ping_period(), Duration::from_secs(54));

        let mut cfg = base_config();
        cfg.server.ping_period_secs = 30;
        assert_eq!(cfg.server.ping_period(), Duration::from_secs(30));
    }

    #[test]
    fn shard_count_rounds_to_power_of_two() {
        let mut cfg = base_config();
        for (configured, expected) in [(1, 1), (3, 4), (4, 4), (60, 64), (64, 64), (65, 128)] {
            cfg.sharding.shard_count = configured;
            assert_eq!(cfg.sharding.effective_shard_count(), expected);
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = base_config();
        cfg.auth.jwt_secret = String::new();
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.server.max_message_size = 11 * 1024 * 1024;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.server.ping_period_secs = 60;
        assert!(cfg.validate().is_err());

        let mut cfg = base_config();
        cfg.rate_limit.global_connections = 0;
        assert!(cfg.validate().is_err());

        assert!(base_config().validate().is_ok());
    }
}
