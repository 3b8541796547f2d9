//! TTL leases shared between objects.
//!
//! Granting one backend lease per object would be far too chatty, so requested
//! expiries are grouped into buckets. All objects whose expiry falls into the
//! same bucket share one lease, granted to live until the end of the bucket.
//! A key therefore never expires earlier than requested, and at most one
//! bucket width later.

use crate::backend::{BackendResult, KvBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lease reuse settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseManagerConfig {
    /// Upper bound of a bucket's width.
    pub bucket_width: Duration,
    /// Maximum number of keys attached to a single lease.
    pub max_object_count: usize,
}

impl Default for LeaseManagerConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(60),
            max_object_count: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
struct BucketKey {
    width_ms: u64,
    end_ms: u64,
}

#[derive(Debug)]
struct Bucket {
    lease_id: i64,
    attached: usize,
    ends_at: Instant,
}

/// Hands out (and reuses) backend leases for TTL'd writes.
pub struct LeaseManager {
    backend: Arc<dyn KvBackend>,
    config: LeaseManagerConfig,
    origin: Instant,
    buckets: Mutex<HashMap<BucketKey, Bucket>>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("config", &self.config)
            .field("buckets", &self.buckets.lock().len())
            .finish()
    }
}

/// Bucket width for a TTL: 5% of the TTL, at least one second, at most `max`.
fn bucket_width(ttl: Duration, max: Duration) -> Duration {
    let width = (ttl / 20).max(Duration::from_secs(1));
    width.min(max).max(Duration::from_millis(1))
}

/// Whole seconds, rounded up.
fn ceil_secs(d: Duration) -> i64 {
    let secs = d.as_secs() as i64;
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl LeaseManager {
    pub fn new(backend: Arc<dyn KvBackend>, config: LeaseManagerConfig) -> Self {
        Self {
            backend,
            config,
            origin: Instant::now(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LeaseManagerConfig {
        &self.config
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    fn bucket_for(&self, now: Instant, ttl: Duration) -> (BucketKey, Instant) {
        let width = bucket_width(ttl, self.config.bucket_width);
        let width_ms = width.as_millis().max(1) as u64;
        let expiry_ms = (now.saturating_duration_since(self.origin) + ttl).as_millis() as u64;
        let end_ms = (expiry_ms / width_ms + 1) * width_ms;
        let key = BucketKey { width_ms, end_ms };
        (key, self.origin + Duration::from_millis(end_ms))
    }

    /// Returns a lease that outlives `ttl_seconds` from now.
    pub async fn get_lease(&self, ttl_seconds: u64) -> BackendResult<i64> {
        let now = Instant::now();
        let ttl = Duration::from_secs(ttl_seconds);
        let (key, ends_at) = self.bucket_for(now, ttl);

        {
            let mut buckets = self.buckets.lock();
            buckets.retain(|_, b| b.ends_at > now);
            if let Some(bucket) = buckets.get_mut(&key) {
                if bucket.attached < self.config.max_object_count {
                    bucket.attached += 1;
                    debug!(lease_id = bucket.lease_id, attached = bucket.attached, "Reusing lease");
                    return Ok(bucket.lease_id);
                }
            }
        }

        let grant_ttl = ceil_secs(ends_at.saturating_duration_since(now)).max(1);
        let lease_id = self.backend.lease_grant(grant_ttl).await?;
        debug!(lease_id, ttl = grant_ttl, "Granted bucket lease");

        self.buckets.lock().insert(
            key,
            Bucket {
                lease_id,
                attached: 1,
                ends_at,
            },
        );
        Ok(lease_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    fn manager(config: LeaseManagerConfig) -> (MemoryBackend, LeaseManager) {
        let backend = MemoryBackend::new();
        let manager = LeaseManager::new(Arc::new(backend.clone()), config);
        (backend, manager)
    }

    #[test]
    fn test_bucket_width() {
        let max = Duration::from_secs(60);
        assert_eq!(bucket_width(Duration::from_secs(10), max), Duration::from_secs(1));
        assert_eq!(bucket_width(Duration::from_secs(600), max), Duration::from_secs(30));
        assert_eq!(bucket_width(Duration::from_secs(7200), max), max);
    }

    #[test]
    fn test_bucket_end_covers_expiry() {
        let (_, manager) = manager(LeaseManagerConfig::default());
        let now = Instant::now();
        for ttl in [1, 7, 59, 600, 86_400] {
            let ttl = Duration::from_secs(ttl);
            let (_, ends_at) = manager.bucket_for(now, ttl);
            assert!(ends_at >= now + ttl);
            assert!(ends_at <= now + ttl + bucket_width(ttl, Duration::from_secs(60)));
        }
    }

    #[tokio::test]
    async fn test_lease_reused_within_bucket() {
        let (backend, manager) = manager(LeaseManagerConfig::default());
        let first = manager.get_lease(3600).await.unwrap();
        let second = manager.get_lease(3600).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.lease_count(), 1);
    }

    #[tokio::test]
    async fn test_full_lease_is_replaced() {
        let (backend, manager) = manager(LeaseManagerConfig {
            bucket_width: Duration::from_secs(60),
            max_object_count: 2,
        });
        let a = manager.get_lease(3600).await.unwrap();
        let b = manager.get_lease(3600).await.unwrap();
        let c = manager.get_lease(3600).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert_eq!(backend.lease_count(), 2);
        assert_eq!(manager.bucket_count(), 1);
    }

    #[tokio::test]
    async fn test_different_ttls_get_different_leases() {
        let (_, manager) = manager(LeaseManagerConfig::default());
        let short = manager.get_lease(60).await.unwrap();
        let long = manager.get_lease(7200).await.unwrap();
        assert_ne!(short, long);
    }
}
