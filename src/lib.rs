//! # apistore: generic object storage with apiserver semantics
//!
//! apistore keeps typed, versioned objects in an etcd v3 style MVCC key-value
//! store and exposes the verbs an API server needs on top of it:
//!
//! - **Create / Get / GuaranteedUpdate / Delete**: single-key conditional
//!   writes with the backend revision as the object's resource version
//! - **List**: label and field selection, paging with signed continue tokens
//!   that survive compaction
//! - **Watch**: typed change streams starting at any retained revision
//! - **Leases**: TTL'd objects share bucketed backend leases
//! - **Compaction**: a coordinated background compactor
//!
//! Two backends are provided: a remote etcd cluster over gRPC and an
//! in-process MVCC store for tests and embedding.
//!
//! ```no_run
//! use apistore::backend::memory::MemoryBackend;
//! use apistore::codec::JsonCodec;
//! use apistore::meta::{Object, ObjectMeta};
//! use apistore::{Context, StorageConfig, Store};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Item {
//!     metadata: ObjectMeta,
//! }
//!
//! impl Object for Item {
//!     fn meta(&self) -> &ObjectMeta { &self.metadata }
//!     fn meta_mut(&mut self) -> &mut ObjectMeta { &mut self.metadata }
//! }
//!
//! # async fn run() -> apistore::StorageResult<()> {
//! let store = Store::<Item>::new(
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(JsonCodec::new()),
//!     &StorageConfig::new("/registry"),
//! );
//! let item = Item { metadata: ObjectMeta::named("a") };
//! let created = store.create(&Context::background(), "/items/a", &item, 0).await?;
//! assert_eq!(created.metadata.resource_version, "1");
//! # Ok(())
//! # }
//! ```

// Generated etcd v3 protobuf types
pub mod mvccpb {
    tonic::include_proto!("mvccpb");
}

pub mod etcdserverpb {
    tonic::include_proto!("etcdserverpb");
}

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod meta;
pub mod rest;
pub mod selection;
pub mod storage;
pub mod transport;

pub use backend::{BackendError, KvBackend};
pub use config::StorageConfig;
pub use error::{ErrorCode, StorageError, StorageResult};
pub use factory::StorageHandle;
pub use meta::{Object, ObjectMeta};
pub use storage::{
    Context, DeleteCollectionResult, KeyScheme, ListResult, ResponseMeta, Store, WatchEvent, WatchStream,
};
