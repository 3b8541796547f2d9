//! Builds stores from configuration.
//!
//! A [`StorageHandle`] owns everything a store needs at runtime besides the
//! store itself (the compactor task). Destroying the handle stops them.

use crate::backend::etcd::EtcdBackend;
use crate::backend::KvBackend;
use crate::codec::Codec;
use crate::config::StorageConfig;
use crate::etcdserverpb::RangeRequest;
use crate::meta::Object;
use crate::storage::{Compactor, Store};
use crate::transport::TransportError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("health check timed out after {0:?}")]
    HealthCheckTimeout(Duration),
}

pub type FactoryResult<T> = Result<T, FactoryError>;

/// A store plus its background tasks.
pub struct StorageHandle<T> {
    pub store: Store<T>,
    cancel: CancellationToken,
    compactor: Option<JoinHandle<()>>,
}

impl<T> StorageHandle<T> {
    /// Stops the background tasks and waits for them to finish.
    pub async fn destroy(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.compactor.take() {
            let _ = handle.await;
        }
    }
}

impl<T> Drop for StorageHandle<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Connects to the configured etcd cluster.
pub async fn new_etcd_backend(config: &StorageConfig) -> FactoryResult<Arc<dyn KvBackend>> {
    let backend = EtcdBackend::connect(&config.transport).await?;
    info!(endpoints = ?config.transport.server_list, "Connected to etcd");
    Ok(Arc::new(backend))
}

/// Builds a store over an existing backend and starts its compactor.
pub fn create_with_backend<T: Object>(
    backend: Arc<dyn KvBackend>,
    codec: Arc<dyn Codec<T>>,
    config: &StorageConfig,
) -> StorageHandle<T> {
    let cancel = CancellationToken::new();
    let compactor = Compactor::new(Arc::clone(&backend), config.compaction_interval).run(cancel.clone());
    StorageHandle {
        store: Store::new(backend, codec, config),
        cancel,
        compactor,
    }
}

/// Connects to etcd and builds a store.
pub async fn create<T: Object>(
    config: &StorageConfig,
    codec: Arc<dyn Codec<T>>,
) -> FactoryResult<StorageHandle<T>> {
    let backend = new_etcd_backend(config).await?;
    Ok(create_with_backend(backend, codec, config))
}

/// Probes the backend with a read of `<prefix>/health`, bounded by `timeout`.
pub async fn health_check(backend: &dyn KvBackend, prefix: &str, timeout: Duration) -> FactoryResult<()> {
    let req = RangeRequest {
        key: format!("{}/health", prefix.trim_end_matches('/')).into_bytes(),
        count_only: true,
        ..Default::default()
    };
    match tokio::time::timeout(timeout, backend.range(req)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(FactoryError::HealthCheck(e.to_string())),
        Err(_) => Err(FactoryError::HealthCheckTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::codec::JsonCodec;
    use crate::meta::ObjectMeta;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Item {
        metadata: ObjectMeta,
    }

    impl Object for Item {
        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    #[tokio::test]
    async fn test_health_check_memory() {
        let backend = MemoryBackend::new();
        health_check(&backend, "/registry", Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_with_backend_and_destroy() {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let config = StorageConfig::new("/registry");
        let handle = create_with_backend::<Item>(backend, Arc::new(JsonCodec::new()), &config);
        assert_eq!(handle.store.path_prefix(), "/registry");
        handle.destroy().await;
    }

    #[tokio::test]
    async fn test_create_without_endpoints() {
        let config = StorageConfig::new("/registry");
        let err = create::<Item>(&config, Arc::new(JsonCodec::new())).await.err().unwrap();
        assert!(matches!(err, FactoryError::Transport(TransportError::NoEndpoints)));
    }
}
