//! etcd v3 backend over gRPC.

use super::{
    BackendError, BackendResult, KvBackend, WatchResponseStream, COMPACTED_MESSAGE, FUTURE_REVISION_MESSAGE,
};
use crate::etcdserverpb::{
    kv_client::KvClient, lease_client::LeaseClient, watch_client::WatchClient,
    watch_request::RequestUnion, CompactionRequest, LeaseGrantRequest, LeaseRevokeRequest,
    RangeRequest, RangeResponse, TxnRequest, TxnResponse, WatchCreateRequest, WatchRequest,
};
use crate::transport::{new_etcd3_client, TransportConfig, TransportResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, warn};

impl From<Status> for BackendError {
    fn from(status: Status) -> Self {
        let message = status.message();
        if message.contains(COMPACTED_MESSAGE) {
            return BackendError::Compacted {
                compact_revision: 0,
            };
        }
        if message.contains(FUTURE_REVISION_MESSAGE) {
            return BackendError::FutureRevision;
        }
        match status.code() {
            Code::Unavailable | Code::DeadlineExceeded | Code::Aborted => {
                BackendError::Unavailable(message.to_string())
            }
            Code::Cancelled => BackendError::Cancelled(message.to_string()),
            Code::InvalidArgument | Code::OutOfRange => {
                BackendError::InvalidArgument(message.to_string())
            }
            Code::NotFound if message.contains("lease not found") => BackendError::LeaseNotFound(0),
            _ => BackendError::Internal(format!("{:?}: {}", status.code(), message)),
        }
    }
}

/// A [`KvBackend`] talking to a real etcd cluster.
///
/// Clients are cheap clones over one shared [`Channel`].
#[derive(Clone)]
pub struct EtcdBackend {
    kv: KvClient<Channel>,
    watch: WatchClient<Channel>,
    lease: LeaseClient<Channel>,
}

impl EtcdBackend {
    pub fn new(channel: Channel) -> Self {
        Self {
            kv: KvClient::new(channel.clone()),
            watch: WatchClient::new(channel.clone()),
            lease: LeaseClient::new(channel),
        }
    }

    pub async fn connect(config: &TransportConfig) -> TransportResult<Self> {
        let channel = new_etcd3_client(config).await?;
        Ok(Self::new(channel))
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn range(&self, req: RangeRequest) -> BackendResult<RangeResponse> {
        let mut client = self.kv.clone();
        let resp = client.range(req).await?;
        Ok(resp.into_inner())
    }

    async fn txn(&self, req: TxnRequest) -> BackendResult<TxnResponse> {
        let mut client = self.kv.clone();
        let resp = client.txn(req).await?;
        Ok(resp.into_inner())
    }

    async fn lease_grant(&self, ttl_seconds: i64) -> BackendResult<i64> {
        let mut client = self.lease.clone();
        let resp = client
            .lease_grant(LeaseGrantRequest {
                ttl: ttl_seconds,
                id: 0,
            })
            .await?
            .into_inner();
        if !resp.error.is_empty() {
            return Err(BackendError::Internal(resp.error));
        }
        debug!(lease_id = resp.id, ttl = resp.ttl, "Lease granted");
        Ok(resp.id)
    }

    async fn lease_revoke(&self, lease_id: i64) -> BackendResult<()> {
        let mut client = self.lease.clone();
        match client.lease_revoke(LeaseRevokeRequest { id: lease_id }).await {
            Ok(_) => Ok(()),
            Err(status) => match BackendError::from(status) {
                BackendError::LeaseNotFound(_) => Err(BackendError::LeaseNotFound(lease_id)),
                other => Err(other),
            },
        }
    }

    async fn compact(&self, revision: i64) -> BackendResult<()> {
        let mut client = self.kv.clone();
        client
            .compact(CompactionRequest {
                revision,
                physical: false,
            })
            .await?;
        Ok(())
    }

    async fn watch(&self, req: WatchCreateRequest) -> BackendResult<WatchResponseStream> {
        let (tx, rx) = mpsc::channel(1);
        tx.send(WatchRequest {
            request_union: Some(RequestUnion::CreateRequest(req)),
        })
        .await
        .map_err(|_| BackendError::Internal("watch request channel closed".to_string()))?;

        let mut client = self.watch.clone();
        let inbound = client.watch(ReceiverStream::new(rx)).await?.into_inner();

        // The request sender travels with the stream: dropping it would half-close
        // the bidirectional call and end the watch.
        let stream = futures::stream::unfold((inbound, tx), |(mut inbound, tx)| async move {
            loop {
                match inbound.message().await {
                    Ok(Some(resp)) => {
                        if resp.created && !resp.canceled && resp.events.is_empty() {
                            continue;
                        }
                        return Some((Ok(resp), (inbound, tx)));
                    }
                    Ok(None) => return None,
                    Err(status) => {
                        warn!(error = %status, "Watch stream failed");
                        return Some((Err(BackendError::from(status)), (inbound, tx)));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
