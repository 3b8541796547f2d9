//! The key-value backend the storage engine runs on.
//!
//! [`KvBackend`] is expressed in etcd v3 wire types so that the etcd client is a
//! thin pass-through. Two implementations are provided:
//!
//! - [`etcd::EtcdBackend`]: a remote etcd cluster over gRPC
//! - [`memory::MemoryBackend`]: an in-process MVCC store with the same semantics

pub mod etcd;
pub mod memory;

use crate::etcdserverpb::{
    compare::{CompareResult, CompareTarget, TargetUnion},
    request_op, response_op, Compare, DeleteRangeRequest, PutRequest, RangeRequest,
    RangeResponse, RequestOp, TxnRequest, TxnResponse, WatchCreateRequest, WatchResponse,
};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

/// The error etcd returns for reads or watches below the compacted revision.
pub const COMPACTED_MESSAGE: &str = "etcdserver: mvcc: required revision has been compacted";

/// The error etcd returns for reads above the current revision.
pub const FUTURE_REVISION_MESSAGE: &str = "etcdserver: mvcc: required revision is a future revision";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("etcdserver: mvcc: required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: i64 },

    #[error("{}", FUTURE_REVISION_MESSAGE)]
    FutureRevision,

    #[error("lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("internal backend error: {0}")]
    Internal(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Stream of watch responses. Progress notifications arrive as responses with no events.
pub type WatchResponseStream = Pin<Box<dyn Stream<Item = BackendResult<WatchResponse>> + Send>>;

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn range(&self, req: RangeRequest) -> BackendResult<RangeResponse>;

    /// A single conditional transaction. Either every success op applies at one
    /// revision, or none do and the failure ops run instead.
    async fn txn(&self, req: TxnRequest) -> BackendResult<TxnResponse>;

    /// Grants a lease and returns its ID.
    async fn lease_grant(&self, ttl_seconds: i64) -> BackendResult<i64>;

    async fn lease_revoke(&self, lease_id: i64) -> BackendResult<()>;

    async fn compact(&self, revision: i64) -> BackendResult<()>;

    /// Opens a watch. If the start revision is compacted, the stream yields a
    /// canceled response carrying the compact revision.
    async fn watch(&self, req: WatchCreateRequest) -> BackendResult<WatchResponseStream>;
}

/// Returns the smallest key greater than every key with the given prefix.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // All 0xff: no upper bound.
    vec![0]
}

pub fn compare_mod_revision(key: &[u8], result: CompareResult, revision: i64) -> Compare {
    Compare {
        result: result as i32,
        target: CompareTarget::Mod as i32,
        key: key.to_vec(),
        target_union: Some(TargetUnion::ModRevision(revision)),
        range_end: Vec::new(),
    }
}

pub fn compare_version(key: &[u8], result: CompareResult, version: i64) -> Compare {
    Compare {
        result: result as i32,
        target: CompareTarget::Version as i32,
        key: key.to_vec(),
        target_union: Some(TargetUnion::Version(version)),
        range_end: Vec::new(),
    }
}

pub fn op_get(key: &[u8]) -> RequestOp {
    RequestOp {
        request: Some(request_op::Request::RequestRange(RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        })),
    }
}

pub fn op_put(key: &[u8], value: Vec<u8>, lease: i64) -> RequestOp {
    RequestOp {
        request: Some(request_op::Request::RequestPut(PutRequest {
            key: key.to_vec(),
            value,
            lease,
            ..Default::default()
        })),
    }
}

pub fn op_delete(key: &[u8]) -> RequestOp {
    RequestOp {
        request: Some(request_op::Request::RequestDeleteRange(DeleteRangeRequest {
            key: key.to_vec(),
            prev_kv: true,
            ..Default::default()
        })),
    }
}

/// Builds `If(compares) Then(success) Else(failure)`.
pub fn txn(compare: Vec<Compare>, success: Vec<RequestOp>, failure: Vec<RequestOp>) -> TxnRequest {
    TxnRequest {
        compare,
        success,
        failure,
    }
}

/// The range response of the first op in a transaction, if it was a range.
pub fn first_range_response(resp: &TxnResponse) -> Option<&RangeResponse> {
    resp.responses.first().and_then(|r| match &r.response {
        Some(response_op::Response::ResponseRange(range)) => Some(range),
        _ => None,
    })
}

/// Revision reported by a response header, 0 when absent.
pub fn header_revision(header: &Option<crate::etcdserverpb::ResponseHeader>) -> i64 {
    header.as_ref().map(|h| h.revision).unwrap_or(0)
}
