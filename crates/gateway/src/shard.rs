//! One independently locked partition of the connection registry.
//!
//! Invariants: every session in the user index is also in the primary map,
//! and both maps are only touched under this shard's lock. Locks are never
//! held across I/O; callers enqueue to sessions after the lock is released.

use crate::session::{ClientId, Session};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Point-in-time shard statistics.
#[derive(Debug, Clone, Copy)]
pub struct ShardStats {
    pub shard_id: u32,
    pub active: usize,
    pub total_connections: u64,
    pub disconnections: u64,
}

#[derive(Default)]
struct ShardInner {
    clients: HashMap<ClientId, Arc<Session>>,
    /// user_id → device_id → session.
    users: HashMap<String, HashMap<String, Arc<Session>>>,
    total_connections: u64,
    disconnections: u64,
}

pub struct Shard {
    pub id: u32,
    inner: RwLock<ShardInner>,
}

impl Shard {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            inner: RwLock::new(ShardInner::default()),
        }
    }

    pub fn add(&self, session: Arc<Session>) {
        let mut inner = self.inner.write();
        inner.clients.insert(session.id, session);
        inner.total_connections += 1;
    }

    /// Remove a session from both indexes.
    pub fn remove(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        let mut inner = self.inner.write();
        let session = inner.clients.remove(client_id)?;

        if let Some(identity) = session.identity() {
            if let Some(devices) = inner.users.get_mut(&identity.user_id) {
                devices.remove(&identity.device_id);
                if devices.is_empty() {
                    inner.users.remove(&identity.user_id);
                }
            }
        }

        inner.disconnections += 1;
        debug!(shard_id = self.id, client_id = %client_id, remaining = inner.clients.len(),
            "session removed from shard");
        Some(session)
    }

    pub fn get(&self, client_id: &ClientId) -> Option<Arc<Session>> {
        self.inner.read().clients.get(client_id).cloned()
    }

    /// All of a user's sessions living on this shard.
    pub fn user_sessions(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .users
            .get(user_id)
            .map(|devices| devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Index an authenticated session under its (user, device) pair.
    ///
    /// The session's identity must be set before calling.
    pub fn index_user(&self, session: Arc<Session>) {
        let Some(identity) = session.identity().cloned() else {
            return;
        };
        let mut inner = self.inner.write();
        if !inner.clients.contains_key(&session.id) {
            // Raced with removal; do not resurrect the secondary entry.
            return;
        }
        inner
            .users
            .entry(identity.user_id)
            .or_default()
            .insert(identity.device_id, session);
    }

    /// The session registered for a (user, device) pair, if any.
    pub fn find_device(&self, user_id: &str, device_id: &str) -> Option<Arc<Session>> {
        self.inner
            .read()
            .users
            .get(user_id)
            .and_then(|devices| devices.get(device_id))
            .cloned()
    }

    /// Remove sessions idle longer than `max_idle` and return them.
    pub fn cleanup_stale(&self, max_idle: Duration, now_ms: u64) -> Vec<Arc<Session>> {
        let max_idle_ms = max_idle.as_millis() as u64;
        let mut inner = self.inner.write();

        let stale: Vec<ClientId> = inner
            .clients
            .values()
            .filter(|s| now_ms.saturating_sub(s.last_activity_ms()) > max_idle_ms)
            .map(|s| s.id)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(session) = inner.clients.remove(&id) {
                if let Some(identity) = session.identity() {
                    if let Some(devices) = inner.users.get_mut(&identity.user_id) {
                        devices.remove(&identity.device_id);
                        if devices.is_empty() {
                            inner.users.remove(&identity.user_id);
                        }
                    }
                }
                inner.disconnections += 1;
                removed.push(session);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().clients.is_empty()
    }

    /// Sessions currently on this shard.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.read().clients.values().cloned().collect()
    }

    pub fn stats(&self) -> ShardStats {
        let inner = self.inner.read();
        ShardStats {
            shard_id: self.id,
            active: inner.clients.len(),
            total_connections: inner.total_connections,
            disconnections: inner.disconnections,
        }
    }

    /// Test/debug helper: user-index consistency with the primary map.
    pub fn user_index_consistent(&self) -> bool {
        let inner = self.inner.read();
        inner
            .users
            .values()
            .flat_map(|devices| devices.values())
            .all(|s| inner.clients.contains_key(&s.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::TokenBucket;
    use crate::session::SessionLimits;
    use crate::auth::Identity;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn session() -> Arc<Session> {
        let (session, _rx) = Session::new(
            Uuid::new_v4(),
            "127.0.0.1".parse().unwrap(),
            0,
            TokenBucket::new(100.0, 150),
            SessionLimits::default(),
            CancellationToken::new(),
        );
        session
    }

    fn authenticated(user: &str, device: &str) -> Arc<Session> {
        let s = session();
        s.set_identity(Identity {
            user_id: user.into(),
            device_id: device.into(),
            session_id: "s".into(),
        });
        s
    }

    #[test]
    fn add_then_remove_clears_both_indexes() {
        let shard = Shard::new(0);
        let s = authenticated("u1", "d1");
        shard.add(s.clone());
        shard.index_user(s.clone());

        assert_eq!(shard.len(), 1);
        assert_eq!(shard.user_sessions("u1").len(), 1);
        assert!(shard.user_index_consistent());

        let removed = shard.remove(&s.id).unwrap();
        assert_eq!(removed.id, s.id);
        assert!(shard.is_empty());
        assert!(shard.user_sessions("u1").is_empty());
        assert!(shard.find_device("u1", "d1").is_none());
    }

    #[test]
    fn index_user_refuses_unregistered_sessions() {
        let shard = Shard::new(0);
        let s = authenticated("u1", "d1");
        // Never added to the primary map.
        shard.index_user(s);
        assert!(shard.user_sessions("u1").is_empty());
        assert!(shard.user_index_consistent());
    }

    #[test]
    fn cleanup_removes_only_stale_sessions() {
        let shard = Shard::new(0);
        let fresh = session();
        let stale = authenticated("u1", "d1");
        shard.add(fresh.clone());
        shard.add(stale.clone());
        shard.index_user(stale.clone());

        stale.force_last_activity_ms(0);
        let now_ms = chrono::Utc::now().timestamp_millis() as u64;
        let removed = shard.cleanup_stale(Duration::from_secs(120), now_ms);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, stale.id);
        assert_eq!(shard.len(), 1);
        assert!(shard.user_sessions("u1").is_empty());
        assert!(shard.user_index_consistent());
    }

    #[test]
    fn stats_track_lifecycle() {
        let shard = Shard::new(3);
        let s = session();
        shard.add(s.clone());
        shard.remove(&s.id);

        let stats = shard.stats();
        assert_eq!(stats.shard_id, 3);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.disconnections, 1);
    }
}
