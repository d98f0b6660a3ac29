//! Horizontally scalable WebSocket gateway.
//!
//! A long-lived connection termination layer: terminates client
//! WebSockets, authenticates them, enforces flow control at three
//! granularities (IP, user, global), and routes application messages
//! between peers — including peers attached to other nodes — via a shared
//! pub/sub bus.
//!
//! ## Architecture
//!
//! ```text
//! socket ──▶ read pump ──▶ Router ──▶ Registry lookup ──▶ write pump
//!                             │                               ▲
//!                             ▼                               │
//!                        Bus publish ──▶ other nodes ──▶ Router.deliver_remote
//! ```
//!
//! The registry is sharded (`fnv1a(client_id) & mask`) with one
//! reader/writer lock per shard and no global lock. Each session runs two
//! cooperating tasks — a read pump and a write pump — with a bounded
//! outbound queue between the router and the socket. The lifecycle
//! controller owns startup order and the deadline-bounded graceful
//! shutdown.

pub mod auth;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod limiter;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod shard;

pub use auth::{Authenticator, Identity, JwtAuthenticator};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use lifecycle::{GatewayHooks, Lifecycle};
pub use limiter::RateLimiterTree;
pub use protocol::{Body, Frame};
pub use registry::{Registry, SessionHooks};
pub use router::{BusPublisher, GroupMembership, NoMembership, Router, SessionContext};
pub use server::{app_router, AppState};
pub use session::{ClientId, CloseReason, PumpConfig, Session};
