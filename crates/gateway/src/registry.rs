//! Sharded registry of live client sessions.
//!
//! Shard selection is `fnv1a(client_id) & (shards - 1)`; the shard count is
//! always a power of two. The user index lives inside the shard selected by
//! the client id, so one user's devices may land on different shards —
//! `lookup_user` therefore visits every shard. There is no global lock;
//! fleet-wide operations lock each shard independently.

use crate::auth::Identity;
use crate::error::AdmissionError;
use crate::limiter::RateLimiterTree;
use crate::session::{ClientId, CloseReason, Session};
use crate::shard::{Shard, ShardStats};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cross-layer notifications, dependency-injected at construction.
pub trait SessionHooks: Send + Sync {
    fn on_connect(&self, session: &Arc<Session>);
    fn on_disconnect(&self, session: &Arc<Session>, reason: CloseReason);
}

/// Hooks that do nothing; used by tests and tools.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {
    fn on_connect(&self, _session: &Arc<Session>) {}
    fn on_disconnect(&self, _session: &Arc<Session>, _reason: CloseReason) {}
}

pub struct Registry {
    shards: Vec<Shard>,
    mask: u32,
    limits: Arc<RateLimiterTree>,
    hooks: Arc<dyn SessionHooks>,
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl Registry {
    pub fn new(
        shard_count: u32,
        limits: Arc<RateLimiterTree>,
        hooks: Arc<dyn SessionHooks>,
    ) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count).map(Shard::new).collect();

        Self {
            shards,
            mask: shard_count - 1,
            limits,
            hooks,
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    /// Shard index for a client id.
    pub fn shard_index(&self, client_id: &ClientId) -> u32 {
        fnv1a(client_id.as_bytes()) & self.mask
    }

    fn shard_for(&self, client_id: &ClientId) -> &Shard {
        &self.shards[self.shard_index(client_id) as usize]
    }

    /// Register a new session, reserving a global connection slot.
    pub fn add(&self, session: Arc<Session>) -> Result<(), AdmissionError> {
        if !self.limits.global.try_acquire() {
            return Err(AdmissionError::GlobalQuota);
        }

        self.shard_for(&session.id).add(session.clone());
        counter!("gateway_total_connections").increment(1);
        debug!(client_id = %session.id, shard_id = session.shard_id, "session registered");

        self.hooks.on_connect(&session);
        Ok(())
    }

    /// Remove a session, release its quota slots, close it and fire the
    /// disconnect hook. The hook fires exactly once per session because
    /// only one caller wins the map removal.
    pub fn remove(&self, client_id: &ClientId, reason: CloseReason) -> Option<Arc<Session>> {
        let session = self.shard_for(client_id).remove(client_id)?;

        self.limits.global.release();
        if let Some(user_id) = session.user_id() {
            self.limits.users.release(user_id);
        }

        session.close(reason);
        let reason = session.close_reason().unwrap_or(reason);
        self.hooks.on_disconnect(&session, reason);
        Some(session)
    }

    pub fn lookup(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.shard_for(client_id).get(client_id)
    }

    /// All live sessions of a user, across every shard.
    pub fn lookup_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.shards
            .iter()
            .flat_map(|shard| shard.user_sessions(user_id))
            .collect()
    }

    /// Promote a session to authenticated under (user, device).
    ///
    /// An existing session for the same pair is superseded first, so a
    /// same-device reconnect at the user cap still succeeds. A cap
    /// rejection leaves the session unauthenticated; the caller closes it.
    pub fn register_authenticated(
        &self,
        session: &Arc<Session>,
        identity: Identity,
    ) -> Result<(), AdmissionError> {
        if let Some(old) = self.find_device(&identity.user_id, &identity.device_id) {
            if old.id != session.id {
                info!(
                    user_id = %identity.user_id,
                    device_id = %identity.device_id,
                    old_client = %old.id,
                    new_client = %session.id,
                    "superseding existing device session"
                );
                self.remove(&old.id, CloseReason::Superseded);
            }
        }

        let user_id = identity.user_id.clone();
        if !self.limits.users.try_acquire(&user_id) {
            return Err(AdmissionError::UserQuota);
        }

        if !session.set_identity(identity) {
            // Already authenticated; undo the double reservation.
            self.limits.users.release(&user_id);
            return Ok(());
        }

        self.shard_for(&session.id).index_user(session.clone());
        Ok(())
    }

    fn find_device(&self, user_id: &str, device_id: &str) -> Option<Arc<Session>> {
        self.shards
            .iter()
            .find_map(|shard| shard.find_device(user_id, device_id))
    }

    /// Sweep every shard for sessions idle longer than `max_idle`.
    pub fn cleanup_stale(&self, max_idle: Duration) -> Vec<ClientId> {
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let mut removed_ids = Vec::new();

        for shard in &self.shards {
            let removed = shard.cleanup_stale(max_idle, now_ms);
            for session in removed {
                self.limits.global.release();
                if let Some(user_id) = session.user_id() {
                    self.limits.users.release(user_id);
                }
                session.close(CloseReason::Inactive);
                self.hooks.on_disconnect(&session, CloseReason::Inactive);
                removed_ids.push(session.id);
            }
        }

        if !removed_ids.is_empty() {
            info!(count = removed_ids.len(), "cleaned up inactive sessions");
        }
        removed_ids
    }

    /// Soft-close every session and stop accepting inbound frames.
    pub fn begin_drain(&self, reason: CloseReason) {
        for shard in &self.shards {
            for session in shard.snapshot() {
                session.soft_close(reason);
            }
        }
    }

    /// Force-close and remove everything still registered.
    pub fn force_close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for shard in &self.shards {
            for session in shard.snapshot() {
                if self.remove(&session.id, reason).is_some() {
                    closed += 1;
                }
            }
        }
        closed
    }

    pub fn total_active(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn stats(&self) -> Vec<ShardStats> {
        self.shards.iter().map(Shard::stats).collect()
    }

    pub fn limits(&self) -> &RateLimiterTree {
        &self.limits
    }
}
