//! Lease bookkeeping for the in-memory backend.
//!
//! Leases expire through a min-heap of deadlines; the backend's background
//! task drains expired leases and deletes the keys attached to them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("invalid TTL: {0}")]
    InvalidTtl(i64),
}

pub type LeaseResult<T> = Result<T, LeaseError>;

#[derive(Clone, Debug)]
pub struct Lease {
    pub id: i64,
    pub granted_ttl: i64,
    pub expires_at: Instant,
    pub keys: HashSet<Vec<u8>>,
}

impl Lease {
    /// Remaining time to live in whole seconds, rounded up.
    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        let remaining = self.expires_at.saturating_duration_since(now);
        let secs = remaining.as_secs() as i64;
        if remaining.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct Deadline {
    expires_at: Instant,
    lease_id: i64,
}

#[derive(Default)]
pub struct LeaseTable {
    leases: HashMap<i64, Lease>,
    deadlines: BinaryHeap<Reverse<Deadline>>,
    next_id: i64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn grant(&mut self, ttl: i64, now: Instant) -> LeaseResult<i64> {
        if ttl <= 0 {
            return Err(LeaseError::InvalidTtl(ttl));
        }
        let id = self.next_id;
        self.next_id += 1;

        let expires_at = now + Duration::from_secs(ttl as u64);
        self.leases.insert(
            id,
            Lease {
                id,
                granted_ttl: ttl,
                expires_at,
                keys: HashSet::new(),
            },
        );
        self.deadlines.push(Reverse(Deadline {
            expires_at,
            lease_id: id,
        }));

        debug!(lease_id = id, ttl, "Lease granted");
        Ok(id)
    }

    /// Removes a lease and returns the keys attached to it.
    pub fn revoke(&mut self, id: i64) -> LeaseResult<Vec<Vec<u8>>> {
        let lease = self.leases.remove(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        debug!(lease_id = id, keys = lease.keys.len(), "Lease revoked");
        Ok(lease.keys.into_iter().collect())
    }

    pub fn contains(&self, id: i64) -> bool {
        self.leases.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&Lease> {
        self.leases.get(&id)
    }

    pub fn attach(&mut self, id: i64, key: &[u8]) -> LeaseResult<()> {
        let lease = self.leases.get_mut(&id).ok_or(LeaseError::LeaseNotFound(id))?;
        lease.keys.insert(key.to_vec());
        Ok(())
    }

    /// Detaching from an unknown lease is a no-op.
    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Pops every lease whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(i64, Vec<Vec<u8>>)> {
        let mut expired = Vec::new();
        while let Some(Reverse(next)) = self.deadlines.peek().copied() {
            if next.expires_at > now {
                break;
            }
            self.deadlines.pop();
            if let Ok(keys) = self.revoke(next.lease_id) {
                expired.push((next.lease_id, keys));
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_revoke() {
        let mut table = LeaseTable::new();
        let now = Instant::now();
        let id = table.grant(30, now).unwrap();
        assert!(id > 0);
        assert_eq!(table.get(id).unwrap().remaining_ttl(now), 30);

        table.attach(id, b"key1").unwrap();
        assert_eq!(table.revoke(id).unwrap(), vec![b"key1".to_vec()]);
        assert_eq!(table.revoke(id), Err(LeaseError::LeaseNotFound(id)));
    }

    #[test]
    fn test_invalid_ttl() {
        let mut table = LeaseTable::new();
        assert_eq!(table.grant(0, Instant::now()), Err(LeaseError::InvalidTtl(0)));
    }

    #[test]
    fn test_attach_detach() {
        let mut table = LeaseTable::new();
        let id = table.grant(30, Instant::now()).unwrap();
        table.attach(id, b"key1").unwrap();
        table.attach(id, b"key2").unwrap();
        table.detach(id, b"key1");
        assert_eq!(table.get(id).unwrap().keys.len(), 1);
        assert!(table.attach(99, b"key").is_err());
    }

    #[test]
    fn test_take_expired() {
        let mut table = LeaseTable::new();
        let now = Instant::now();
        let short = table.grant(1, now).unwrap();
        let long = table.grant(60, now).unwrap();
        table.attach(short, b"key").unwrap();

        assert!(table.take_expired(now).is_empty());

        let expired = table.take_expired(now + Duration::from_secs(2));
        assert_eq!(expired, vec![(short, vec![b"key".to_vec()])]);
        assert!(table.contains(long));
        assert_eq!(table.len(), 1);
    }
}
