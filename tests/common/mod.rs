//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use apistore::backend::memory::MemoryBackend;
use apistore::codec::JsonCodec;
use apistore::meta::{Object, ObjectMeta};
use apistore::{Context, StorageConfig, Store};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub value: String,
}

impl Object for Item {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub fn item(name: &str, value: &str) -> Item {
    Item {
        metadata: ObjectMeta::named(name),
        value: value.to_string(),
    }
}

pub fn labeled(name: &str, value: &str, labels: &[(&str, &str)]) -> Item {
    let mut obj = item(name, value);
    obj.metadata.labels = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    obj
}

/// Installs a test subscriber once. Honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> StorageConfig {
    let mut config = StorageConfig::new("/registry");
    config.continue_secret = Some("test-secret".to_string());
    config.freshness_wait = Duration::from_millis(200);
    config
}

/// A store over a fresh in-memory backend. The backend is returned for
/// direct inspection and compaction.
pub fn new_store() -> (MemoryBackend, Store<Item>) {
    init_tracing();
    let backend = MemoryBackend::new();
    let store = Store::new(
        Arc::new(backend.clone()),
        Arc::new(JsonCodec::new()),
        &test_config(),
    );
    (backend, store)
}

pub fn ctx() -> Context {
    Context::background()
}

pub fn names(items: &[Item]) -> Vec<&str> {
    items.iter().map(|i| i.metadata.name.as_str()).collect()
}
