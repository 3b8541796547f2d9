//! The generic object store.
//!
//! [`Store`] keeps typed objects in a [`KvBackend`] and offers the usual
//! apiserver verbs on top of it:
//!
//! - every write is a single conditional transaction on the object's key
//! - the backend `mod_revision` is the object's resource version
//! - updates and deletes run bounded optimistic read-modify-write loops
//! - lists page with signed continue tokens that survive compaction
//! - watches are typed and honour the selection predicate
//!
//! No lock is held across keys; concurrent writers are serialized by the
//! backend's compare-and-swap alone.

pub mod compact;
mod context;
pub mod continue_token;
pub mod errors;
pub mod keys;
pub mod lease;
mod watcher;

pub use compact::Compactor;
pub use context::Context;
pub use continue_token::{ContinueCodec, ContinueError};
pub use keys::KeyScheme;
pub use lease::{LeaseManager, LeaseManagerConfig};
pub use watcher::{WatchEvent, WatchStream};

use crate::backend::{
    compare_mod_revision, first_range_response, header_revision, op_delete, op_get, op_put,
    prefix_range_end, txn, BackendResult, KvBackend,
};
use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::etcdserverpb::{compare::CompareResult, RangeRequest, RangeResponse, WatchCreateRequest};
use crate::meta::{parse_resource_version, GetOptions, ListOptions, Object, Preconditions};
use crate::selection::{default_attrs, AttrFunc, SelectionPredicate};
use errors::{interpret_error, interpret_list_error, ListRecovery};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use watcher::WatchTask;

/// Largest page requested from the backend while refilling a filtered list.
const MAX_LIMIT: i64 = 10_000;

const FRESHNESS_BACKOFF: Duration = Duration::from_millis(50);
const MAX_FRESHNESS_BACKOFF: Duration = Duration::from_millis(400);

/// What an update function learns about the stored object besides its content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Resource version of the stored object, 0 when it does not exist.
    pub resource_version: i64,
    /// Lease the stored object is attached to, 0 for none.
    pub lease: i64,
}

/// One page of a list.
#[derive(Clone, Debug, PartialEq)]
pub struct ListResult<T> {
    pub items: Vec<T>,
    /// Revision the page was read at.
    pub resource_version: String,
    /// Set when more items remain.
    pub continue_token: Option<String>,
    /// Items left after this page. Only known when the list is unfiltered.
    pub remaining_item_count: Option<i64>,
    /// The continue revision was compacted and the list restarted at the
    /// latest revision. Later pages may not be consistent with earlier ones.
    pub inconsistent: bool,
}

/// Outcome of [`Store::delete_collection`], which is not atomic.
#[derive(Debug)]
pub struct DeleteCollectionResult<T> {
    pub deleted: Vec<T>,
    /// The first error that stopped the deletion, if any.
    pub error: Option<StorageError>,
}

/// A page with the keys of its items, relative to the store's path prefix.
struct Page<T> {
    entries: Vec<(String, T)>,
    resource_version: i64,
    continue_token: Option<String>,
    remaining_item_count: Option<i64>,
    inconsistent: bool,
}

impl<T> Page<T> {
    fn into_result(self) -> ListResult<T> {
        ListResult {
            items: self.entries.into_iter().map(|(_, obj)| obj).collect(),
            resource_version: self.resource_version.to_string(),
            continue_token: self.continue_token,
            remaining_item_count: self.remaining_item_count,
            inconsistent: self.inconsistent,
        }
    }
}

/// Stored state of a key as seen by an update or delete loop.
struct ObjState<T> {
    obj: Option<T>,
    data: Vec<u8>,
    rev: i64,
    lease: i64,
}

/// Decodes stored bytes and stamps the resource version.
pub(crate) fn decode_object<T: Object>(
    codec: &dyn Codec<T>,
    data: &[u8],
    revision: i64,
) -> StorageResult<T> {
    let mut obj = codec
        .decode(data)
        .map_err(|e| StorageError::Internal(e.to_string()))?;
    obj.meta_mut().set_resource_version(revision.to_string());
    Ok(obj)
}

struct StoreInner<T> {
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec<T>>,
    path_prefix: String,
    paging: bool,
    leases: LeaseManager,
    continues: ContinueCodec,
    max_update_attempts: usize,
    freshness_wait: Duration,
}

/// Typed storage for one kind of object. Cheap to clone.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
    attrs: AttrFunc<T>,
    index_labels: Vec<String>,
    index_fields: Vec<String>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            attrs: Arc::clone(&self.attrs),
            index_labels: self.index_labels.clone(),
            index_fields: self.index_fields.clone(),
        }
    }
}

impl<T: Object> Store<T> {
    pub fn new(backend: Arc<dyn KvBackend>, codec: Arc<dyn Codec<T>>, config: &StorageConfig) -> Self {
        let continues = match &config.continue_secret {
            Some(secret) => ContinueCodec::new(secret.as_bytes()),
            None => ContinueCodec::random(),
        };
        Self {
            inner: Arc::new(StoreInner {
                leases: LeaseManager::new(Arc::clone(&backend), config.lease_manager.clone()),
                backend,
                codec,
                path_prefix: config.prefix.clone(),
                paging: config.paging,
                continues,
                max_update_attempts: config.max_update_attempts.max(1),
                freshness_wait: config.freshness_wait,
            }),
            attrs: Arc::new(default_attrs::<T>),
            index_labels: Vec::new(),
            index_fields: Vec::new(),
        }
    }

    /// Replaces the function extracting labels and fields for selection.
    pub fn with_attrs(mut self, attrs: AttrFunc<T>) -> Self {
        self.attrs = attrs;
        self
    }

    /// Declares labels and fields with exact-match index hints.
    pub fn with_indexes(mut self, labels: Vec<String>, fields: Vec<String>) -> Self {
        self.index_labels = labels;
        self.index_fields = fields;
        self
    }

    pub fn path_prefix(&self) -> &str {
        &self.inner.path_prefix
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.inner.backend
    }

    pub fn lease_manager(&self) -> &LeaseManager {
        &self.inner.leases
    }

    /// The predicate a list or watch with `opts` filters by.
    pub fn predicate(&self, opts: &ListOptions) -> SelectionPredicate<T> {
        let mut pred = SelectionPredicate::new(opts.label_selector.clone(), opts.field_selector.clone())
            .with_attrs(Arc::clone(&self.attrs))
            .with_indexes(self.index_labels.clone(), self.index_fields.clone());
        pred.limit = opts.limit;
        pred.continue_token = opts.continue_token.clone();
        pred.allow_watch_bookmarks = opts.allow_watch_bookmarks;
        pred
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.inner.path_prefix, key)
    }

    fn relative_key(&self, key: &[u8]) -> String {
        let key = String::from_utf8_lossy(key);
        key.strip_prefix(self.inner.path_prefix.as_str())
            .unwrap_or(&key)
            .to_string()
    }

    fn encode(&self, obj: &T) -> StorageResult<Vec<u8>> {
        let mut obj = obj.clone();
        obj.meta_mut().set_resource_version("");
        self.inner
            .codec
            .encode(&obj)
            .map_err(|e| StorageError::Internal(e.to_string()))
    }

    fn decode(&self, data: &[u8], revision: i64) -> StorageResult<T> {
        decode_object(self.inner.codec.as_ref(), data, revision)
    }

    async fn call<R>(
        &self,
        ctx: &Context,
        key: &str,
        fut: impl Future<Output = BackendResult<R>>,
    ) -> StorageResult<R> {
        ctx.run(fut).await?.map_err(|e| interpret_error(e, key, 0))
    }

    async fn range(&self, ctx: &Context, key: &str, req: RangeRequest) -> StorageResult<RangeResponse> {
        self.call(ctx, key, self.inner.backend.range(req)).await
    }

    /// Blocks until the backend has reached `min_rv`, polling with back-off for
    /// at most the configured freshness wait.
    async fn wait_for_revision(&self, ctx: &Context, key: &str, min_rv: i64) -> StorageResult<i64> {
        let started = Instant::now();
        let mut backoff = FRESHNESS_BACKOFF;
        loop {
            let req = RangeRequest {
                key: self.full_key(key).into_bytes(),
                count_only: true,
                ..Default::default()
            };
            let current = header_revision(&self.range(ctx, key, req).await?.header);
            if current >= min_rv {
                return Ok(current);
            }
            if started.elapsed() >= self.inner.freshness_wait {
                return Err(StorageError::TooLargeResourceVersion {
                    requested: min_rv,
                    current,
                });
            }
            debug!(key, current, requested = min_rv, "Waiting for resource version");
            ctx.sleep(backoff).await?;
            backoff = (backoff * 2).min(MAX_FRESHNESS_BACKOFF);
        }
    }

    async fn lease_for(&self, ctx: &Context, key: &str, ttl: u64) -> StorageResult<i64> {
        if ttl == 0 {
            return Ok(0);
        }
        self.call(ctx, key, self.inner.leases.get_lease(ttl)).await
    }

    fn state_from_range(
        &self,
        key: &str,
        resp: Option<&RangeResponse>,
        allow_missing: bool,
    ) -> StorageResult<ObjState<T>> {
        match resp.and_then(|r| r.kvs.first()) {
            Some(kv) => Ok(ObjState {
                obj: Some(self.decode(&kv.value, kv.mod_revision)?),
                data: kv.value.clone(),
                rev: kv.mod_revision,
                lease: kv.lease,
            }),
            None if allow_missing => Ok(ObjState {
                obj: None,
                data: Vec::new(),
                rev: 0,
                lease: 0,
            }),
            None => Err(StorageError::not_found(
                key,
                resp.map_or(0, |r| header_revision(&r.header)),
            )),
        }
    }

    async fn get_state(&self, ctx: &Context, key: &str, allow_missing: bool) -> StorageResult<ObjState<T>> {
        let req = RangeRequest {
            key: self.full_key(key).into_bytes(),
            ..Default::default()
        };
        let resp = self.range(ctx, key, req).await?;
        self.state_from_range(key, Some(&resp), allow_missing)
    }

    /// Creates `obj` at `key`. Fails with `KeyExists` if the key is taken.
    ///
    /// A non-zero `ttl` (seconds) attaches the key to a lease.
    pub async fn create(&self, ctx: &Context, key: &str, obj: &T, ttl: u64) -> StorageResult<T> {
        if !obj.meta().resource_version().is_empty() {
            return Err(StorageError::invalid_object(
                key,
                "resourceVersion should not be set on objects to be created",
            ));
        }
        let data = self.encode(obj)?;
        let full = self.full_key(key);
        let lease = self.lease_for(ctx, key, ttl).await?;

        let req = txn(
            vec![compare_mod_revision(full.as_bytes(), CompareResult::Equal, 0)],
            vec![op_put(full.as_bytes(), data.clone(), lease)],
            vec![],
        );
        let resp = self.call(ctx, key, self.inner.backend.txn(req)).await?;
        if !resp.succeeded {
            return Err(StorageError::exists(key, 0));
        }

        let revision = header_revision(&resp.header);
        debug!(key, revision, lease, "Created object");
        self.decode(&data, revision)
    }

    /// Reads the object at `key`.
    ///
    /// Returns `Ok(None)` only when the key is absent and
    /// `opts.ignore_not_found` is set.
    pub async fn get(&self, ctx: &Context, key: &str, opts: &GetOptions) -> StorageResult<Option<T>> {
        let min_rv = parse_resource_version(&opts.resource_version)?;
        if min_rv > 0 {
            self.wait_for_revision(ctx, key, min_rv).await?;
        }

        let req = RangeRequest {
            key: self.full_key(key).into_bytes(),
            serializable: opts.resource_version == "0",
            ..Default::default()
        };
        let resp = self.range(ctx, key, req).await?;
        match resp.kvs.first() {
            Some(kv) => self.decode(&kv.value, kv.mod_revision).map(Some),
            None if opts.ignore_not_found => Ok(None),
            None => Err(StorageError::not_found(key, header_revision(&resp.header))),
        }
    }

    /// Read-modify-write of the object at `key`.
    ///
    /// `try_update` receives the current object (`None` if absent and
    /// `allow_create` is set) and returns the new object plus an optional TTL:
    /// `Some(0)` drops the lease, `None` keeps the current one. When the write
    /// loses a race the loop starts over with the state returned by the failed
    /// transaction, up to the configured attempt budget.
    pub async fn guaranteed_update<F>(
        &self,
        ctx: &Context,
        key: &str,
        preconditions: Option<&Preconditions>,
        allow_create: bool,
        mut try_update: F,
    ) -> StorageResult<T>
    where
        F: FnMut(Option<T>, ResponseMeta) -> StorageResult<(T, Option<u64>)> + Send,
    {
        let full = self.full_key(key);
        let mut state = self.get_state(ctx, key, allow_create).await?;
        let attempts = self.inner.max_update_attempts;

        for attempt in 1..=attempts {
            if let (Some(preconditions), Some(current)) = (preconditions, state.obj.as_ref()) {
                preconditions.check(key, current)?;
            }

            let meta = ResponseMeta {
                resource_version: state.rev,
                lease: state.lease,
            };
            let (updated, ttl) = try_update(state.obj.clone(), meta)?;
            let data = self.encode(&updated)?;

            if let Some(current) = &state.obj {
                if data == state.data {
                    debug!(key, revision = state.rev, "Update is a no-op");
                    return Ok(current.clone());
                }
            }

            let lease = match ttl {
                Some(0) => 0,
                Some(ttl) => self.lease_for(ctx, key, ttl).await?,
                None => state.lease,
            };

            let req = txn(
                vec![compare_mod_revision(full.as_bytes(), CompareResult::Equal, state.rev)],
                vec![op_put(full.as_bytes(), data.clone(), lease)],
                vec![op_get(full.as_bytes())],
            );
            let resp = self.call(ctx, key, self.inner.backend.txn(req)).await?;
            if resp.succeeded {
                let revision = header_revision(&resp.header);
                debug!(key, revision, attempt, "Updated object");
                return self.decode(&data, revision);
            }

            debug!(key, attempt, "Update lost a race, retrying");
            state = self.state_from_range(key, first_range_response(&resp), allow_create)?;
        }

        Err(StorageError::conflict(
            key,
            state.rev,
            format!("the object has been modified; gave up after {attempts} attempts"),
        ))
    }

    /// Deletes the object at `key` and returns its last stored content.
    pub async fn delete(
        &self,
        ctx: &Context,
        key: &str,
        preconditions: Option<&Preconditions>,
    ) -> StorageResult<T> {
        let full = self.full_key(key);
        let mut state = self.get_state(ctx, key, false).await?;
        let attempts = self.inner.max_update_attempts;

        for attempt in 1..=attempts {
            let Some(current) = state.obj.take() else {
                return Err(StorageError::not_found(key, state.rev));
            };
            if let Some(preconditions) = preconditions {
                preconditions.check(key, &current)?;
            }

            let req = txn(
                vec![compare_mod_revision(full.as_bytes(), CompareResult::Equal, state.rev)],
                vec![op_delete(full.as_bytes())],
                vec![op_get(full.as_bytes())],
            );
            let resp = self.call(ctx, key, self.inner.backend.txn(req)).await?;
            if resp.succeeded {
                debug!(key, revision = header_revision(&resp.header), "Deleted object");
                return Ok(current);
            }

            debug!(key, attempt, "Delete lost a race, rechecking");
            state = self.state_from_range(key, first_range_response(&resp), false)?;
        }

        Err(StorageError::conflict(
            key,
            state.rev,
            format!("the object has been modified; gave up after {attempts} attempts"),
        ))
    }

    /// Deletes every object `opts` selects under `key_prefix`, one by one.
    ///
    /// Objects that disappear concurrently are skipped. The first other
    /// failure stops the deletion and is reported with what was deleted so far.
    pub async fn delete_collection(
        &self,
        ctx: &Context,
        key_prefix: &str,
        opts: &ListOptions,
        preconditions: Option<&Preconditions>,
    ) -> DeleteCollectionResult<T> {
        self.delete_collection_with(ctx, key_prefix, opts, preconditions, |_| Ok(()))
            .await
    }

    /// Like [`Store::delete_collection`], running `validate` on each listed
    /// object before deleting it.
    pub async fn delete_collection_with<V>(
        &self,
        ctx: &Context,
        key_prefix: &str,
        opts: &ListOptions,
        preconditions: Option<&Preconditions>,
        validate: V,
    ) -> DeleteCollectionResult<T>
    where
        V: Fn(&T) -> StorageResult<()> + Send + Sync,
    {
        let mut result = DeleteCollectionResult {
            deleted: Vec::new(),
            error: None,
        };

        let mut list_opts = opts.clone();
        let mut entries = Vec::new();
        loop {
            let page = match self.list_page(ctx, key_prefix, &list_opts).await {
                Ok(page) => page,
                Err(e) => {
                    result.error = Some(e);
                    return result;
                }
            };
            entries.extend(page.entries);
            match page.continue_token {
                Some(token) => {
                    list_opts.continue_token = Some(token);
                    list_opts.resource_version.clear();
                }
                None => break,
            }
        }

        for (key, obj) in entries {
            let outcome = match validate(&obj) {
                Ok(()) => self.delete(ctx, &key, preconditions).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(obj) => result.deleted.push(obj),
                Err(e) if e.is_not_found() => debug!(key = %key, "Already deleted"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Delete collection stopped");
                    result.error = Some(e);
                    break;
                }
            }
        }
        result
    }

    /// Lists the objects under `key_prefix` that `opts` selects, in key order.
    pub async fn list(&self, ctx: &Context, key_prefix: &str, opts: &ListOptions) -> StorageResult<ListResult<T>> {
        Ok(self.list_page(ctx, key_prefix, opts).await?.into_result())
    }

    /// Lists the single object at `key` as a zero- or one-item list.
    pub async fn get_to_list(&self, ctx: &Context, key: &str, opts: &ListOptions) -> StorageResult<ListResult<T>> {
        let pred = self.predicate(opts);
        Ok(self.single_page(ctx, key, opts, &pred).await?.into_result())
    }

    /// Number of keys under `key_prefix`.
    pub async fn count(&self, ctx: &Context, key_prefix: &str) -> StorageResult<i64> {
        let mut prefix = self.full_key(key_prefix);
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        let req = RangeRequest {
            range_end: prefix_range_end(prefix.as_bytes()),
            key: prefix.into_bytes(),
            count_only: true,
            ..Default::default()
        };
        Ok(self.range(ctx, key_prefix, req).await?.count)
    }

    async fn single_page(
        &self,
        ctx: &Context,
        key: &str,
        opts: &ListOptions,
        pred: &SelectionPredicate<T>,
    ) -> StorageResult<Page<T>> {
        let min_rv = parse_resource_version(&opts.resource_version)?;
        if min_rv > 0 {
            self.wait_for_revision(ctx, key, min_rv).await?;
        }
        let req = RangeRequest {
            key: self.full_key(key).into_bytes(),
            serializable: opts.resource_version == "0",
            ..Default::default()
        };
        let resp = self.range(ctx, key, req).await?;

        let mut entries = Vec::new();
        if let Some(kv) = resp.kvs.first() {
            let obj = self.decode(&kv.value, kv.mod_revision)?;
            if pred.matches(&obj)? {
                entries.push((key.to_string(), obj));
            }
        }
        Ok(Page {
            entries,
            resource_version: header_revision(&resp.header),
            continue_token: None,
            remaining_item_count: None,
            inconsistent: false,
        })
    }

    async fn list_page(&self, ctx: &Context, key_prefix: &str, opts: &ListOptions) -> StorageResult<Page<T>> {
        let pred = self.predicate(opts);
        let mut key_prefix = key_prefix.to_string();
        if !key_prefix.ends_with('/') {
            key_prefix.push('/');
        }

        if let Some(name) = pred.matches_single() {
            let key = format!("{key_prefix}{name}");
            return self.single_page(ctx, &key, opts, &pred).await;
        }

        let prefix = self.full_key(&key_prefix);
        let range_end = prefix_range_end(prefix.as_bytes());
        let paging = self.inner.paging && opts.limit > 0;
        let limit = if paging { opts.limit } else { 0 };
        let min_rv = parse_resource_version(&opts.resource_version)?;
        let serializable = opts.resource_version == "0";

        let mut start_key = prefix.clone().into_bytes();
        let mut read_rev = 0;
        let continue_token = opts.continue_token.as_deref().filter(|_| self.inner.paging);
        let continuing = continue_token.is_some();

        if let Some(token) = continue_token {
            if min_rv != 0 {
                return Err(StorageError::invalid_object(
                    key_prefix,
                    "specifying resource version is not allowed when using continue",
                ));
            }
            let decoded = self.inner.continues.decode(token, &prefix)?;
            start_key = decoded.start_key.into_bytes();
            if decoded.resource_version > 0 {
                read_rev = decoded.resource_version;
            }
        } else if min_rv > 0 {
            self.wait_for_revision(ctx, &key_prefix, min_rv).await?;
            read_rev = min_rv;
        }

        let mut returned_rev = read_rev;
        let mut fetch_limit = limit;
        let mut entries = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        let mut remaining_item_count = None;

        let has_more = loop {
            let req = RangeRequest {
                key: start_key.clone(),
                range_end: range_end.clone(),
                limit: fetch_limit,
                revision: read_rev,
                serializable,
                ..Default::default()
            };
            let resp = match ctx.run(self.inner.backend.range(req)).await? {
                Ok(resp) => resp,
                Err(err) => {
                    let continue_key = String::from_utf8_lossy(&start_key);
                    return match interpret_list_error(
                        err,
                        continuing,
                        &continue_key,
                        &prefix,
                        &self.inner.continues,
                    ) {
                        ListRecovery::Reanchored { continue_token } => {
                            warn!(prefix = %prefix, "Continue revision compacted, restarting at latest");
                            Ok(Page {
                                entries,
                                resource_version: returned_rev,
                                continue_token: Some(continue_token),
                                remaining_item_count: None,
                                inconsistent: true,
                            })
                        }
                        ListRecovery::Failed(e) => Err(e),
                    };
                }
            };

            if returned_rev == 0 {
                returned_rev = header_revision(&resp.header);
            }
            read_rev = returned_rev;

            if resp.kvs.is_empty() && resp.more {
                return Err(StorageError::Internal(
                    "no results were found, but the backend indicated more values remain".into(),
                ));
            }

            let mut has_more = resp.more;
            let mut consumed = 0;
            for kv in &resp.kvs {
                if paging && entries.len() as i64 >= limit {
                    has_more = true;
                    break;
                }
                consumed += 1;
                last_key = Some(kv.key.clone());
                let obj = self.decode(&kv.value, kv.mod_revision)?;
                if pred.matches(&obj)? {
                    entries.push((self.relative_key(&kv.key), obj));
                }
            }
            if has_more && pred.is_empty() {
                remaining_item_count = Some(resp.count - consumed);
            }

            if !has_more || !paging || entries.len() as i64 >= limit {
                break has_more;
            }

            fetch_limit = (fetch_limit * 2).min(MAX_LIMIT);
            if let Some(last) = &last_key {
                start_key = last.clone();
                start_key.push(0);
            }
        };

        let continue_token = match (has_more, last_key) {
            (true, Some(mut next)) => {
                next.push(0);
                let next = String::from_utf8_lossy(&next);
                let token = self
                    .inner
                    .continues
                    .encode(&next, &prefix, returned_rev)
                    .map_err(|e| StorageError::Internal(e.to_string()))?;
                Some(token)
            }
            _ => None,
        };

        Ok(Page {
            entries,
            resource_version: returned_rev,
            continue_token,
            remaining_item_count: remaining_item_count.filter(|_| has_more),
            inconsistent: false,
        })
    }

    /// Watches `key`, or every key under it when `recursive`.
    ///
    /// `opts.resource_version` unset starts from now, `"0"` first replays the
    /// current state as `Added` events, and `N` delivers changes after `N`.
    pub async fn watch(
        &self,
        ctx: &Context,
        key: &str,
        opts: &ListOptions,
        recursive: bool,
    ) -> StorageResult<WatchStream<T>> {
        let rv = parse_resource_version(&opts.resource_version)?;
        let pred = self.predicate(opts);

        let mut key = key.to_string();
        if recursive && !key.ends_with('/') {
            key.push('/');
        }
        let full = self.full_key(&key);
        let range_end = if recursive {
            prefix_range_end(full.as_bytes())
        } else {
            Vec::new()
        };

        let (initial, start_revision) = if opts.resource_version == "0" {
            let req = RangeRequest {
                key: full.clone().into_bytes(),
                range_end: range_end.clone(),
                ..Default::default()
            };
            let resp = self.range(ctx, &key, req).await?;
            let mut initial = Vec::new();
            for kv in &resp.kvs {
                let obj = self.decode(&kv.value, kv.mod_revision)?;
                if pred.matches(&obj)? {
                    initial.push(WatchEvent::Added(obj));
                }
            }
            (initial, header_revision(&resp.header) + 1)
        } else if rv == 0 {
            let req = RangeRequest {
                key: full.clone().into_bytes(),
                count_only: true,
                ..Default::default()
            };
            let resp = self.range(ctx, &key, req).await?;
            (Vec::new(), header_revision(&resp.header) + 1)
        } else {
            (Vec::new(), rv + 1)
        };

        let req = WatchCreateRequest {
            key: full.into_bytes(),
            range_end,
            start_revision,
            prev_kv: true,
            progress_notify: opts.allow_watch_bookmarks || opts.progress_notify,
            ..Default::default()
        };
        let stream = self.call(ctx, &key, self.inner.backend.watch(req)).await?;
        debug!(key = %key, start_revision, "Watch started");

        let task = WatchTask {
            key,
            codec: Arc::clone(&self.inner.codec),
            predicate: pred,
            start_revision,
            allow_bookmarks: opts.allow_watch_bookmarks,
            initial,
        };
        Ok(task.spawn(ctx, stream))
    }
}
