//! Storage configuration.

use crate::storage::LeaseManagerConfig;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_UPDATE_ATTEMPTS: usize = 5;
pub const DEFAULT_FRESHNESS_WAIT: Duration = Duration::from_secs(3);

/// Everything needed to build a [`crate::Store`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prepended to every key the store touches.
    pub prefix: String,

    pub transport: TransportConfig,

    /// Honour `limit` and continue tokens on list.
    pub paging: bool,

    /// How often the compactor runs. Zero disables compaction.
    pub compaction_interval: Duration,

    pub healthcheck_timeout: Duration,

    pub lease_manager: LeaseManagerConfig,

    /// Read-transform-write cycles before an update gives up with a conflict.
    pub max_update_attempts: usize,

    /// How long a read waits for the backend to reach a requested resource version.
    pub freshness_wait: Duration,

    /// Secret for signing continue tokens. A random one is generated per store when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_secret: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            transport: TransportConfig::default(),
            paging: true,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            healthcheck_timeout: DEFAULT_HEALTHCHECK_TIMEOUT,
            lease_manager: LeaseManagerConfig::default(),
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
            freshness_wait: DEFAULT_FRESHNESS_WAIT,
            continue_secret: None,
        }
    }
}

impl StorageConfig {
    /// Default configuration rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::new("/registry");
        assert_eq!(config.prefix, "/registry");
        assert!(config.paging);
        assert_eq!(config.compaction_interval, Duration::from_secs(300));
        assert_eq!(config.healthcheck_timeout, Duration::from_secs(2));
        assert_eq!(config.max_update_attempts, 5);
        assert_eq!(config.lease_manager.max_object_count, 1000);
    }

    #[test]
    fn test_partial_json() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"prefix":"/r","paging":false,"transport":{"server_list":["a:2379"]}}"#)
                .unwrap();
        assert_eq!(config.prefix, "/r");
        assert!(!config.paging);
        assert_eq!(config.transport.server_list, vec!["a:2379".to_string()]);
        assert_eq!(config.freshness_wait, DEFAULT_FRESHNESS_WAIT);
    }
}
