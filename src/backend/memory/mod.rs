//! In-process MVCC backend.
//!
//! Mirrors the etcd behaviour the storage engine relies on:
//! - one revision per committed transaction, starting at 1
//! - point-in-time reads and compaction errors for reads below the compacted revision
//! - leases whose expiry deletes the attached keys
//! - watches with history replay, `prev_kv` and progress notifications
//!
//! All writes and watch registrations happen under one lock, so watchers see
//! every revision exactly once and in order.

mod index;
mod lease;
mod mvcc;
mod watch;

pub use index::{KeyIndex, Revision};
pub use lease::{LeaseError, LeaseTable};
pub use mvcc::MvccStore;
pub use watch::{WatchHub, WatchRange};

use super::{BackendError, BackendResult, KvBackend, WatchResponseStream};
use crate::etcdserverpb::{
    compare::{CompareResult, TargetUnion},
    request_op, response_op,
    watch_create_request::FilterType,
    Compare, DeleteRangeResponse, PutResponse, RangeRequest, RangeResponse, ResponseHeader,
    ResponseOp, TxnRequest, TxnResponse, WatchCreateRequest,
};
use crate::mvccpb::{event::EventType, Event, KeyValue};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use watch::{compacted_response, WatcherOptions};

/// Background maintenance settings.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    /// How often expired leases are collected.
    pub lease_check_interval: Duration,
    /// How often watchers that asked for progress notifications get one.
    pub progress_notify_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lease_check_interval: Duration::from_millis(100),
            progress_notify_interval: Duration::from_secs(10),
        }
    }
}

struct State {
    mvcc: MvccStore,
    leases: LeaseTable,
}

struct Inner {
    state: RwLock<State>,
    hub: WatchHub,
}

/// In-memory [`KvBackend`]. Clones share the same store.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn header(revision: i64) -> Option<ResponseHeader> {
    Some(ResponseHeader {
        revision,
        ..Default::default()
    })
}

fn compare_i64(actual: i64, target: i64, result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == target,
        CompareResult::Greater => actual > target,
        CompareResult::Less => actual < target,
        CompareResult::NotEqual => actual != target,
    }
}

fn compare_bytes(actual: &[u8], target: &[u8], result: CompareResult) -> bool {
    match result {
        CompareResult::Equal => actual == target,
        CompareResult::Greater => actual > target,
        CompareResult::Less => actual < target,
        CompareResult::NotEqual => actual != target,
    }
}

/// Evaluates a compare against the latest value of its key. Absent keys
/// compare as zero revisions, zero version and an empty value.
fn evaluate_compare(store: &MvccStore, cmp: &Compare) -> bool {
    let kv = store.latest(&cmp.key);
    let result = CompareResult::try_from(cmp.result).unwrap_or(CompareResult::Equal);

    match &cmp.target_union {
        Some(TargetUnion::Version(target)) => {
            compare_i64(kv.as_ref().map_or(0, |kv| kv.version), *target, result)
        }
        Some(TargetUnion::CreateRevision(target)) => compare_i64(
            kv.as_ref().map_or(0, |kv| kv.create_revision),
            *target,
            result,
        ),
        Some(TargetUnion::ModRevision(target)) => {
            compare_i64(kv.as_ref().map_or(0, |kv| kv.mod_revision), *target, result)
        }
        Some(TargetUnion::Value(target)) => compare_bytes(
            kv.as_ref().map_or(&[][..], |kv| kv.value.as_slice()),
            target,
            result,
        ),
        Some(TargetUnion::Lease(target)) => {
            compare_i64(kv.as_ref().map_or(0, |kv| kv.lease), *target, result)
        }
        None => true,
    }
}

fn delete_event(prev: KeyValue, revision: i64) -> Event {
    Event {
        r#type: EventType::Delete as i32,
        kv: Some(KeyValue {
            key: prev.key.clone(),
            mod_revision: revision,
            ..Default::default()
        }),
        prev_kv: Some(prev),
    }
}

impl Inner {
    fn apply_txn(&self, req: TxnRequest) -> BackendResult<TxnResponse> {
        let mut state = self.state.write();
        let state = &mut *state;

        let succeeded = req.compare.iter().all(|c| evaluate_compare(&state.mvcc, c));
        let ops = if succeeded { req.success } else { req.failure };

        for op in &ops {
            if let Some(request_op::Request::RequestPut(put)) = &op.request {
                if put.key.is_empty() {
                    return Err(BackendError::InvalidArgument("key is not provided".into()));
                }
                if put.lease != 0 && !state.leases.contains(put.lease) {
                    return Err(BackendError::LeaseNotFound(put.lease));
                }
            }
        }

        let write_revision = state.mvcc.current_revision() + 1;
        let mut sub = 0;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());

        for op in ops {
            let response = match op.request {
                Some(request_op::Request::RequestRange(range)) => {
                    let result = state.mvcc.range(
                        &range.key,
                        &range.range_end,
                        0,
                        range.limit,
                        range.count_only,
                        range.keys_only,
                    )?;
                    response_op::Response::ResponseRange(RangeResponse {
                        header: None,
                        kvs: result.kvs,
                        more: result.more,
                        count: result.count,
                    })
                }
                Some(request_op::Request::RequestPut(put)) => {
                    let (kv, prev) = state.mvcc.put(
                        &put.key,
                        put.value,
                        put.lease,
                        Revision::new(write_revision, sub),
                    );
                    sub += 1;

                    if let Some(old_lease) = prev.as_ref().map(|p| p.lease).filter(|l| *l != 0) {
                        if old_lease != put.lease {
                            state.leases.detach(old_lease, &put.key);
                        }
                    }
                    if put.lease != 0 {
                        state
                            .leases
                            .attach(put.lease, &put.key)
                            .map_err(|_| BackendError::LeaseNotFound(put.lease))?;
                    }

                    events.push(Event {
                        r#type: EventType::Put as i32,
                        kv: Some(kv),
                        prev_kv: prev.clone(),
                    });
                    response_op::Response::ResponsePut(PutResponse {
                        header: None,
                        prev_kv: if put.prev_kv { prev } else { None },
                    })
                }
                Some(request_op::Request::RequestDeleteRange(del)) => {
                    let deleted = state
                        .mvcc
                        .delete_range(&del.key, &del.range_end, write_revision);
                    for prev in &deleted {
                        if prev.lease != 0 {
                            state.leases.detach(prev.lease, &prev.key);
                        }
                        events.push(delete_event(prev.clone(), write_revision));
                    }
                    response_op::Response::ResponseDeleteRange(DeleteRangeResponse {
                        header: None,
                        deleted: deleted.len() as i64,
                        prev_kvs: if del.prev_kv { deleted } else { Vec::new() },
                    })
                }
                None => continue,
            };
            responses.push(ResponseOp {
                response: Some(response),
            });
        }

        if !events.is_empty() {
            state.mvcc.commit(write_revision);
            self.hub.notify(&events, write_revision);
        }
        let revision = state.mvcc.current_revision();

        for resp in &mut responses {
            match &mut resp.response {
                Some(response_op::Response::ResponseRange(r)) => r.header = header(revision),
                Some(response_op::Response::ResponsePut(r)) => r.header = header(revision),
                Some(response_op::Response::ResponseDeleteRange(r)) => r.header = header(revision),
                None => {}
            }
        }

        Ok(TxnResponse {
            header: header(revision),
            succeeded,
            responses,
        })
    }

    /// Deletes the keys of a revoked or expired lease in a single revision.
    fn delete_lease_keys(&self, state: &mut State, lease_id: i64, keys: Vec<Vec<u8>>) {
        let revision = state.mvcc.current_revision() + 1;
        let mut events = Vec::new();
        for key in keys {
            for prev in state.mvcc.delete_range(&key, &[], revision) {
                events.push(delete_event(prev, revision));
            }
        }
        if !events.is_empty() {
            state.mvcc.commit(revision);
            self.hub.notify(&events, revision);
        }
        debug!(lease_id, deleted = events.len(), "Lease keys deleted");
    }

    fn expire_leases(&self) -> usize {
        let mut state = self.state.write();
        let expired = state.leases.take_expired(Instant::now());
        let count = expired.len();
        for (lease_id, keys) in expired {
            info!(lease_id, "Lease expired");
            self.delete_lease_keys(&mut state, lease_id, keys);
        }
        count
    }

    fn progress_notify(&self) {
        // The read lock orders the notification after any in-flight commit.
        let state = self.state.read();
        self.hub.progress_notify(state.mvcc.current_revision());
    }
}

async fn run_maintenance(inner: Weak<Inner>, config: MemoryConfig) {
    let mut lease_ticker = tokio::time::interval(config.lease_check_interval);
    let mut progress_ticker = tokio::time::interval(config.progress_notify_interval);
    progress_ticker.tick().await;

    loop {
        tokio::select! {
            _ = lease_ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.expire_leases();
            }
            _ = progress_ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.progress_notify();
            }
        }
    }
    debug!("In-memory backend maintenance stopped");
}

impl MemoryBackend {
    /// Creates a backend without background maintenance. Leases only expire
    /// through [`MemoryBackend::expire_leases`].
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    mvcc: MvccStore::new(),
                    leases: LeaseTable::new(),
                }),
                hub: WatchHub::new(),
            }),
        }
    }

    /// Creates a backend and spawns its maintenance task on the current tokio
    /// runtime. The task stops once every clone of the backend is dropped.
    pub fn spawn(config: MemoryConfig) -> Self {
        let backend = Self::new();
        tokio::spawn(run_maintenance(Arc::downgrade(&backend.inner), config));
        backend
    }

    pub fn current_revision(&self) -> i64 {
        self.inner.state.read().mvcc.current_revision()
    }

    pub fn compact_revision(&self) -> i64 {
        self.inner.state.read().mvcc.compact_revision()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.hub.watcher_count()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.state.read().leases.len()
    }

    /// Collects expired leases now. Returns how many expired.
    pub fn expire_leases(&self) -> usize {
        self.inner.expire_leases()
    }

    /// Sends a progress notification to watchers that asked for them.
    pub fn progress_notify(&self) {
        self.inner.progress_notify()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn range(&self, req: RangeRequest) -> BackendResult<RangeResponse> {
        if req.key.is_empty() {
            return Err(BackendError::InvalidArgument("key is not provided".into()));
        }
        let state = self.inner.state.read();
        let result = state.mvcc.range(
            &req.key,
            &req.range_end,
            req.revision,
            req.limit,
            req.count_only,
            req.keys_only,
        )?;
        Ok(RangeResponse {
            header: header(state.mvcc.current_revision()),
            kvs: result.kvs,
            more: result.more,
            count: result.count,
        })
    }

    async fn txn(&self, req: TxnRequest) -> BackendResult<TxnResponse> {
        self.inner.apply_txn(req)
    }

    async fn lease_grant(&self, ttl_seconds: i64) -> BackendResult<i64> {
        let mut state = self.inner.state.write();
        state
            .leases
            .grant(ttl_seconds, Instant::now())
            .map_err(|e| BackendError::InvalidArgument(e.to_string()))
    }

    async fn lease_revoke(&self, lease_id: i64) -> BackendResult<()> {
        let mut state = self.inner.state.write();
        let keys = state
            .leases
            .revoke(lease_id)
            .map_err(|_| BackendError::LeaseNotFound(lease_id))?;
        self.inner.delete_lease_keys(&mut state, lease_id, keys);
        Ok(())
    }

    async fn compact(&self, revision: i64) -> BackendResult<()> {
        self.inner.state.write().mvcc.compact(revision)
    }

    async fn watch(&self, req: WatchCreateRequest) -> BackendResult<WatchResponseStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = WatcherOptions {
            start_revision: req.start_revision,
            prev_kv: req.prev_kv,
            no_put: req.filters.contains(&(FilterType::Noput as i32)),
            no_delete: req.filters.contains(&(FilterType::Nodelete as i32)),
            progress_notify: req.progress_notify,
        };
        let range = WatchRange {
            key: req.key.clone(),
            range_end: req.range_end.clone(),
        };

        {
            let state = self.inner.state.read();
            let current = state.mvcc.current_revision();

            if req.start_revision > 0 && req.start_revision <= current {
                let history =
                    match state
                        .mvcc
                        .events_since(&req.key, &req.range_end, req.start_revision)
                    {
                        Ok(history) => history,
                        Err(BackendError::Compacted { compact_revision }) => {
                            let _ = tx.send(Ok(compacted_response(compact_revision, current)));
                            return Ok(Box::pin(UnboundedReceiverStream::new(rx)));
                        }
                        Err(e) => return Err(e),
                    };

                let watch_id = self.inner.hub.register(range, options, tx);
                let mut start = 0;
                while start < history.len() {
                    let revision = history[start].kv.as_ref().map_or(0, |kv| kv.mod_revision);
                    let end = history[start..]
                        .iter()
                        .position(|e| e.kv.as_ref().map_or(0, |kv| kv.mod_revision) != revision)
                        .map_or(history.len(), |offset| start + offset);
                    self.inner.hub.replay(watch_id, &history[start..end], revision);
                    start = end;
                }
            } else {
                self.inner.hub.register(range, options, tx);
            }
        }

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{compare_mod_revision, op_delete, op_get, op_put, txn};
    use futures::StreamExt;

    async fn put(backend: &MemoryBackend, key: &[u8], value: &[u8]) -> i64 {
        let resp = backend
            .txn(txn(vec![], vec![op_put(key, value.to_vec(), 0)], vec![]))
            .await
            .unwrap();
        resp.header.unwrap().revision
    }

    #[tokio::test]
    async fn test_revisions_start_at_one() {
        let backend = MemoryBackend::new();
        assert_eq!(put(&backend, b"/a", b"1").await, 1);
        assert_eq!(put(&backend, b"/b", b"2").await, 2);
        assert_eq!(backend.current_revision(), 2);
    }

    #[tokio::test]
    async fn test_txn_compare_and_swap() {
        let backend = MemoryBackend::new();
        let key = b"/items/a";

        let create = txn(
            vec![compare_mod_revision(key, CompareResult::Equal, 0)],
            vec![op_put(key, b"v1".to_vec(), 0)],
            vec![op_get(key)],
        );
        let resp = backend.txn(create.clone()).await.unwrap();
        assert!(resp.succeeded);

        let resp = backend.txn(create).await.unwrap();
        assert!(!resp.succeeded);
        let current = crate::backend::first_range_response(&resp).unwrap();
        assert_eq!(current.kvs[0].value, b"v1");
        assert_eq!(backend.current_revision(), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_does_not_bump_revision() {
        let backend = MemoryBackend::new();
        put(&backend, b"/a", b"1").await;
        let resp = backend
            .txn(txn(vec![], vec![op_delete(b"/missing")], vec![]))
            .await
            .unwrap();
        assert!(resp.succeeded);
        assert_eq!(backend.current_revision(), 1);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease() {
        let backend = MemoryBackend::new();
        let err = backend
            .txn(txn(vec![], vec![op_put(b"/a", b"1".to_vec(), 42)], vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::LeaseNotFound(42));
    }

    #[tokio::test]
    async fn test_lease_revoke_deletes_keys() {
        let backend = MemoryBackend::new();
        let lease = backend.lease_grant(60).await.unwrap();
        backend
            .txn(txn(vec![], vec![op_put(b"/a", b"1".to_vec(), lease)], vec![]))
            .await
            .unwrap();

        backend.lease_revoke(lease).await.unwrap();
        let resp = backend
            .range(RangeRequest {
                key: b"/a".to_vec(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(resp.kvs.is_empty());
        assert_eq!(backend.current_revision(), 2);
    }

    #[tokio::test]
    async fn test_watch_replays_history() {
        let backend = MemoryBackend::new();
        put(&backend, b"/p/a", b"1").await;
        put(&backend, b"/p/b", b"2").await;
        put(&backend, b"/q/c", b"3").await;

        let mut stream = backend
            .watch(WatchCreateRequest {
                key: b"/p/".to_vec(),
                range_end: b"/p0".to_vec(),
                start_revision: 2,
                ..Default::default()
            })
            .await
            .unwrap();

        let resp = stream.next().await.unwrap().unwrap();
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].kv.as_ref().unwrap().key, b"/p/b");

        put(&backend, b"/p/a", b"4").await;
        let resp = stream.next().await.unwrap().unwrap();
        assert_eq!(resp.events[0].kv.as_ref().unwrap().mod_revision, 4);
    }

    #[tokio::test]
    async fn test_watch_compacted_start() {
        let backend = MemoryBackend::new();
        for i in 0..4 {
            put(&backend, b"/k", format!("{i}").as_bytes()).await;
        }
        backend.compact(3).await.unwrap();

        let mut stream = backend
            .watch(WatchCreateRequest {
                key: b"/k".to_vec(),
                start_revision: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let resp = stream.next().await.unwrap().unwrap();
        assert!(resp.canceled);
        assert_eq!(resp.compact_revision, 3);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_emits_delete() {
        let backend = MemoryBackend::new();
        let lease = backend.lease_grant(1).await.unwrap();
        backend
            .txn(txn(vec![], vec![op_put(b"/ttl", b"x".to_vec(), lease)], vec![]))
            .await
            .unwrap();

        let mut stream = backend
            .watch(WatchCreateRequest {
                key: b"/ttl".to_vec(),
                ..Default::default()
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(backend.expire_leases(), 1);

        let resp = stream.next().await.unwrap().unwrap();
        assert_eq!(resp.events[0].r#type, EventType::Delete as i32);
        assert_eq!(backend.lease_count(), 0);
    }
}
