//! Hierarchical admission control: per-IP connection buckets, per-user
//! concurrency caps, the global connection ceiling, and the per-client
//! message bucket.
//!
//! The hot path is non-blocking: every check returns immediately and
//! rejections are reported to the caller, never queued.

use crate::config::RateLimitConfig;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Token bucket with a steady refill rate and a burst capacity.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    burst: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Consume one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.burst);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct IpEntry {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// New-connections-per-second admission, keyed by source IP.
pub struct IpAdmission {
    buckets: DashMap<IpAddr, Mutex<IpEntry>>,
    refill_per_sec: f64,
    burst: u32,
    ttl: Duration,
}

impl IpAdmission {
    pub fn new(connections_per_sec: u32, burst: u32, ttl: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            refill_per_sec: connections_per_sec as f64,
            burst,
            ttl,
        }
    }

    /// Admit or reject one new connection from `ip`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let entry = self.buckets.entry(ip).or_insert_with(|| {
            Mutex::new(IpEntry {
                bucket: TokenBucket::new(self.refill_per_sec, self.burst),
                last_seen: Instant::now(),
            })
        });

        let mut entry = entry.lock();
        entry.last_seen = Instant::now();
        let allowed = entry.bucket.allow();
        if !allowed {
            counter!("gateway_rate_limit_hits_total").increment(1);
        }
        allowed
    }

    /// Drop buckets idle past the TTL to bound memory.
    pub fn prune(&self) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, entry| entry.lock().last_seen.elapsed() < self.ttl);
        before - self.buckets.len()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Cap on concurrently open authenticated sessions per user.
pub struct UserSessions {
    counts: DashMap<String, u32>,
    cap: u32,
}

impl UserSessions {
    pub fn new(cap: u32) -> Self {
        Self {
            counts: DashMap::new(),
            cap,
        }
    }

    /// Reserve a slot for `user_id`; false when the cap is reached.
    pub fn try_acquire(&self, user_id: &str) -> bool {
        let mut count = self.counts.entry(user_id.to_string()).or_insert(0);
        if *count >= self.cap {
            counter!("gateway_rate_limit_hits_total").increment(1);
            false
        } else {
            *count += 1;
            true
        }
    }

    /// Release a previously acquired slot.
    pub fn release(&self, user_id: &str) {
        let empty = if let Some(mut count) = self.counts.get_mut(user_id) {
            *count = count.saturating_sub(1);
            *count == 0
        } else {
            false
        };
        if empty {
            self.counts.remove_if(user_id, |_, count| *count == 0);
        }
    }

    pub fn count(&self, user_id: &str) -> u32 {
        self.counts.get(user_id).map(|c| *c).unwrap_or(0)
    }
}

/// Global live-connection counter with a hard ceiling.
pub struct GlobalGauge {
    current: AtomicI64,
    ceiling: i64,
}

impl GlobalGauge {
    pub fn new(ceiling: i64) -> Self {
        Self {
            current: AtomicI64::new(0),
            ceiling,
        }
    }

    /// Non-reserving capacity check, used before the protocol upgrade.
    pub fn has_capacity(&self) -> bool {
        self.current.load(Ordering::Acquire) < self.ceiling
    }

    /// Reserve one slot; false when the ceiling is reached.
    pub fn try_acquire(&self) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if current >= self.ceiling {
                counter!("gateway_rate_limit_hits_total").increment(1);
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Acquire)
    }
}

/// The three cooperating admission layers plus the per-client bucket
/// factory.
pub struct RateLimiterTree {
    pub ip: IpAdmission,
    pub users: UserSessions,
    pub global: GlobalGauge,
    messages_per_second: u32,
    message_burst: u32,
}

impl RateLimiterTree {
    pub fn new(cfg: &RateLimitConfig, max_conns_per_ip: u32) -> Self {
        let ip_rate = if cfg.connections_per_ip_per_sec == 0 {
            max_conns_per_ip
        } else {
            cfg.connections_per_ip_per_sec
        };
        Self {
            ip: IpAdmission::new(ip_rate, max_conns_per_ip, cfg.ip_bucket_ttl()),
            users: UserSessions::new(cfg.connections_per_user),
            global: GlobalGauge::new(cfg.global_connections),
            messages_per_second: cfg.messages_per_second,
            message_burst: cfg.burst,
        }
    }

    /// Bucket governing one session's inbound frames.
    pub fn message_bucket(&self) -> TokenBucket {
        TokenBucket::new(self.messages_per_second as f64, self.message_burst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_burst_then_refill_boundary() {
        let mut bucket = TokenBucket::new(10.0, 5);
        let start = Instant::now();

        // Exactly the burst is available up front.
        for _ in 0..5 {
            assert!(bucket.allow_at(start));
        }
        assert!(!bucket.allow_at(start));

        // burst + rate * t tokens over t seconds; one more is refused.
        let later = start + Duration::from_secs(2);
        for _ in 0..20 {
            assert!(bucket.allow_at(later));
        }
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn bucket_does_not_exceed_burst() {
        let mut bucket = TokenBucket::new(100.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            assert!(bucket.allow_at(start));
        }
        // A long idle period refills to the burst cap only.
        let later = start + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(bucket.allow_at(later));
        }
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn ip_admission_per_ip_quota() {
        let limiter = IpAdmission::new(1, 2, Duration::from_secs(600));
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        let other: IpAddr = "5.6.7.8".parse().unwrap();

        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
        // Independent bucket per source IP.
        assert!(limiter.allow(other));
    }

    #[test]
    fn ip_admission_prunes_idle_buckets() {
        let limiter = IpAdmission::new(1, 2, Duration::from_millis(0));
        limiter.allow("1.2.3.4".parse().unwrap());
        limiter.allow("5.6.7.8".parse().unwrap());
        assert_eq!(limiter.len(), 2);
        assert_eq!(limiter.prune(), 2);
        assert!(limiter.is_empty());
    }

    #[test]
    fn user_cap_acquire_release() {
        let users = UserSessions::new(2);
        assert!(users.try_acquire("u1"));
        assert!(users.try_acquire("u1"));
        assert!(!users.try_acquire("u1"));

        users.release("u1");
        assert_eq!(users.count("u1"), 1);
        assert!(users.try_acquire("u1"));

        users.release("u1");
        users.release("u1");
        assert_eq!(users.count("u1"), 0);
        // Releasing an unknown user is a no-op.
        users.release("u2");
    }

    #[test]
    fn global_gauge_ceiling() {
        let global = GlobalGauge::new(2);
        assert!(global.has_capacity());
        assert!(global.try_acquire());
        assert!(global.try_acquire());
        assert!(!global.has_capacity());
        assert!(!global.try_acquire());
        assert_eq!(global.current(), 2);

        global.release();
        assert!(global.try_acquire());
        assert_eq!(global.current(), 2);
    }
}
