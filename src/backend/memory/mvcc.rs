//! Multi-version key-value state for the in-memory backend.
//!
//! Every committed write gets the next store revision. Values are kept per
//! `(revision, key)` so reads at a past revision and watch replay both work
//! until the history is compacted.
//!
//! The store itself is not synchronized: `MemoryBackend` owns it behind a lock
//! and applies each transaction under that lock.

use super::index::{KeyIndex, Revision};
use crate::backend::{BackendError, BackendResult};
use crate::mvccpb::{event::EventType, Event, KeyValue};
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::{debug, info};

/// Outcome of a range read.
#[derive(Clone, Debug, Default)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    pub more: bool,
    pub count: i64,
}

pub struct MvccStore {
    current_revision: i64,
    compact_revision: i64,
    index: KeyIndex,
    /// `(main revision, key)` -> value written at that revision. Deletions are
    /// stored as tombstones with `version == 0`.
    kv_rev: BTreeMap<(i64, Vec<u8>), KeyValue>,
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates an etcd `range_end` into an index bound.
fn effective_range_end(key: &[u8], range_end: &[u8]) -> Vec<u8> {
    if range_end.is_empty() {
        let mut end = key.to_vec();
        end.push(0);
        end
    } else if range_end == [0] {
        Vec::new()
    } else {
        range_end.to_vec()
    }
}

/// True if `key` falls into the etcd-style range `[start, range_end)`.
pub fn range_contains(start: &[u8], range_end: &[u8], key: &[u8]) -> bool {
    if range_end.is_empty() {
        return key == start;
    }
    if key < start {
        return false;
    }
    range_end == [0] || key < range_end
}

impl MvccStore {
    pub fn new() -> Self {
        Self {
            current_revision: 0,
            compact_revision: 0,
            index: KeyIndex::new(),
            kv_rev: BTreeMap::new(),
        }
    }

    pub fn current_revision(&self) -> i64 {
        self.current_revision
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision
    }

    /// Makes a transaction's writes visible at `revision`.
    pub fn commit(&mut self, revision: i64) {
        if revision > self.current_revision {
            self.current_revision = revision;
        }
    }

    fn check_revision(&self, revision: i64) -> BackendResult<()> {
        if revision > self.current_revision {
            return Err(BackendError::FutureRevision);
        }
        if revision > 0 && revision < self.compact_revision {
            return Err(BackendError::Compacted {
                compact_revision: self.compact_revision,
            });
        }
        Ok(())
    }

    /// The latest value of `key`, including writes of an uncommitted transaction.
    pub fn latest(&self, key: &[u8]) -> Option<KeyValue> {
        let rev = self.index.get(key, i64::MAX)?;
        self.kv_rev.get(&(rev.main, key.to_vec())).cloned()
    }

    /// Range read. `revision <= 0` reads the latest state.
    pub fn range(
        &self,
        key: &[u8],
        range_end: &[u8],
        revision: i64,
        limit: i64,
        count_only: bool,
        keys_only: bool,
    ) -> BackendResult<RangeResult> {
        self.check_revision(revision)?;
        let read_at = if revision <= 0 { i64::MAX } else { revision };

        let end = effective_range_end(key, range_end);
        let keys = self.index.range(key, &end, read_at);
        let count = keys.len() as i64;

        if count_only {
            return Ok(RangeResult {
                kvs: Vec::new(),
                more: false,
                count,
            });
        }

        let take = if limit > 0 { limit as usize } else { keys.len() };
        let kvs: Vec<KeyValue> = keys
            .into_iter()
            .take(take)
            .filter_map(|(k, rev)| self.kv_rev.get(&(rev.main, k)).cloned())
            .map(|mut kv| {
                if keys_only {
                    kv.value.clear();
                }
                kv
            })
            .collect();

        Ok(RangeResult {
            more: (kvs.len() as i64) < count,
            kvs,
            count,
        })
    }

    /// Writes `key` at `revision`. Returns the new value and the previous one.
    pub fn put(
        &mut self,
        key: &[u8],
        value: Vec<u8>,
        lease: i64,
        revision: Revision,
    ) -> (KeyValue, Option<KeyValue>) {
        let prev = self.latest(key);
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: prev
                .as_ref()
                .map(|p| p.create_revision)
                .unwrap_or(revision.main),
            mod_revision: revision.main,
            version: prev.as_ref().map(|p| p.version + 1).unwrap_or(1),
            value,
            lease,
        };

        self.kv_rev.insert((revision.main, key.to_vec()), kv.clone());
        self.index.put(key, revision);
        debug!(key = %String::from_utf8_lossy(key), revision = revision.main, "Put");

        (kv, prev)
    }

    /// Deletes every key in the range at `revision`. Returns the deleted values.
    pub fn delete_range(&mut self, key: &[u8], range_end: &[u8], revision: i64) -> Vec<KeyValue> {
        let end = effective_range_end(key, range_end);
        let targets = self.index.range(key, &end, i64::MAX);

        let mut deleted = Vec::with_capacity(targets.len());
        for (sub, (k, rev)) in targets.into_iter().enumerate() {
            if let Some(prev) = self.kv_rev.get(&(rev.main, k.clone())).cloned() {
                let tombstone = KeyValue {
                    key: k.clone(),
                    mod_revision: revision,
                    ..Default::default()
                };
                self.kv_rev.insert((revision, k.clone()), tombstone);
                self.index.tombstone(&k, Revision::new(revision, sub as i64));
                deleted.push(prev);
            }
        }

        debug!(count = deleted.len(), revision, "Delete range");
        deleted
    }

    /// Compacts away history older than `revision`.
    pub fn compact(&mut self, revision: i64) -> BackendResult<()> {
        if revision <= self.compact_revision {
            return Err(BackendError::Compacted {
                compact_revision: self.compact_revision,
            });
        }
        if revision > self.current_revision {
            return Err(BackendError::FutureRevision);
        }

        self.index.compact(revision);
        let index = &self.index;
        self.kv_rev
            .retain(|(main, key), _| *main >= revision || index.references(key, *main));
        self.compact_revision = revision;

        info!(revision, "Compacted in-memory store");
        Ok(())
    }

    /// Events for keys in range with `start_revision <= revision <= current`.
    pub fn events_since(
        &self,
        key: &[u8],
        range_end: &[u8],
        start_revision: i64,
    ) -> BackendResult<Vec<Event>> {
        if start_revision > 0 && start_revision < self.compact_revision {
            return Err(BackendError::Compacted {
                compact_revision: self.compact_revision,
            });
        }

        let lower = Bound::Included((start_revision.max(1), Vec::new()));
        let events = self
            .kv_rev
            .range((lower, Bound::Unbounded))
            .filter(|((main, k), _)| {
                *main <= self.current_revision && range_contains(key, range_end, k)
            })
            .map(|((main, k), kv)| {
                let prev_kv = self
                    .index
                    .get(k, main - 1)
                    .and_then(|rev| self.kv_rev.get(&(rev.main, k.clone())).cloned());
                let kind = if kv.version == 0 {
                    EventType::Delete
                } else {
                    EventType::Put
                };
                Event {
                    r#type: kind as i32,
                    kv: Some(kv.clone()),
                    prev_kv,
                }
            })
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(store: &mut MvccStore, key: &[u8], value: &[u8]) -> i64 {
        let rev = store.current_revision() + 1;
        store.put(key, value.to_vec(), 0, Revision::new(rev, 0));
        store.commit(rev);
        rev
    }

    fn delete(store: &mut MvccStore, key: &[u8]) -> usize {
        let rev = store.current_revision() + 1;
        let deleted = store.delete_range(key, &[], rev);
        if !deleted.is_empty() {
            store.commit(rev);
        }
        deleted.len()
    }

    #[test]
    fn test_put_and_range() {
        let mut store = MvccStore::new();
        let rev = put(&mut store, b"key1", b"value1");
        assert_eq!(rev, 1);

        let result = store.range(b"key1", b"", 0, 0, false, false).unwrap();
        assert_eq!(result.kvs.len(), 1);
        assert_eq!(result.kvs[0].value, b"value1");
        assert_eq!(result.kvs[0].version, 1);
        assert_eq!(result.kvs[0].create_revision, 1);
    }

    #[test]
    fn test_put_update_keeps_create_revision() {
        let mut store = MvccStore::new();
        put(&mut store, b"key1", b"value1");
        let rev2 = put(&mut store, b"key1", b"value2");

        let kv = store.latest(b"key1").unwrap();
        assert_eq!(kv.version, 2);
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, rev2);
    }

    #[test]
    fn test_delete_range_and_recreate() {
        let mut store = MvccStore::new();
        put(&mut store, b"key1", b"v");
        put(&mut store, b"key2", b"v");
        put(&mut store, b"key3", b"v");

        let rev = store.current_revision() + 1;
        let deleted = store.delete_range(b"key1", b"key3", rev);
        store.commit(rev);
        assert_eq!(deleted.len(), 2);

        let result = store.range(b"key", b"kez", 0, 0, false, false).unwrap();
        assert_eq!(result.kvs.len(), 1);

        put(&mut store, b"key1", b"again");
        let kv = store.latest(b"key1").unwrap();
        assert_eq!(kv.version, 1);
        assert_eq!(kv.create_revision, kv.mod_revision);
    }

    #[test]
    fn test_historical_range_read() {
        let mut store = MvccStore::new();
        let rev1 = put(&mut store, b"key1", b"value1");
        let rev2 = put(&mut store, b"key1", b"value2");
        put(&mut store, b"key1", b"value3");

        let at = |rev| store.range(b"key1", b"", rev, 0, false, false).unwrap().kvs[0].value.clone();
        assert_eq!(at(rev1), b"value1");
        assert_eq!(at(rev2), b"value2");
        assert_eq!(at(0), b"value3");
    }

    #[test]
    fn test_range_limit_and_count() {
        let mut store = MvccStore::new();
        for key in [b"/p/a", b"/p/b", b"/p/c"] {
            put(&mut store, key, b"v");
        }

        let result = store.range(b"/p/", b"/p0", 0, 2, false, false).unwrap();
        assert_eq!(result.kvs.len(), 2);
        assert!(result.more);
        assert_eq!(result.count, 3);

        let result = store.range(b"/p/", b"/p0", 0, 0, true, false).unwrap();
        assert!(result.kvs.is_empty());
        assert_eq!(result.count, 3);
    }

    #[test]
    fn test_future_and_compacted_reads() {
        let mut store = MvccStore::new();
        put(&mut store, b"k", b"1");
        put(&mut store, b"k", b"2");
        put(&mut store, b"k", b"3");

        assert_eq!(
            store.range(b"k", b"", 10, 0, false, false).unwrap_err(),
            BackendError::FutureRevision
        );

        store.compact(2).unwrap();
        assert!(matches!(
            store.range(b"k", b"", 1, 0, false, false),
            Err(BackendError::Compacted { compact_revision: 2 })
        ));
        let kvs = store.range(b"k", b"", 2, 0, false, false).unwrap().kvs;
        assert_eq!(kvs[0].value, b"2");

        assert!(store.compact(2).is_err());
    }

    #[test]
    fn test_events_since() {
        let mut store = MvccStore::new();
        put(&mut store, b"key1", b"value1");
        let rev2 = put(&mut store, b"key2", b"value2");
        put(&mut store, b"key1", b"value1b");
        assert_eq!(delete(&mut store, b"key2"), 1);

        let events = store.events_since(b"key", b"kez", rev2).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].r#type, EventType::Put as i32);
        assert_eq!(events[1].prev_kv.as_ref().unwrap().value, b"value1");
        assert_eq!(events[2].r#type, EventType::Delete as i32);
        assert_eq!(events[2].prev_kv.as_ref().unwrap().value, b"value2");

        store.compact(3).unwrap();
        assert!(store.events_since(b"key", b"kez", rev2).is_err());
    }

    #[test]
    fn test_range_contains() {
        assert!(range_contains(b"foo", b"fop", b"foobar"));
        assert!(!range_contains(b"foo", b"fop", b"fop"));
        assert!(range_contains(b"foo", b"", b"foo"));
        assert!(!range_contains(b"foo", b"", b"foo/"));
        assert!(range_contains(b"a", &[0], b"zzz"));
    }
}
