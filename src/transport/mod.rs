//! gRPC transport to the etcd cluster.
//!
//! Builds a single [`Channel`] from a [`TransportConfig`]:
//! - plaintext when no TLS file is configured, TLS otherwise
//! - client certificate and key must be given together
//! - a CA bundle alone gives server-authenticated TLS; without one the platform roots are used
//! - endpoints are dialed eagerly, in order, under one overall dial deadline

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("cert_file and key_file must be set together")]
    PartialIdentity,

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid endpoint {endpoint}: {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("failed to connect to any endpoint: {0}")]
    Connect(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Connection settings for the backend cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoints, with or without a scheme (e.g. `127.0.0.1:2379`).
    pub server_list: Vec<String>,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub trusted_ca_file: Option<PathBuf>,
    pub dial_timeout: Duration,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            server_list: Vec::new(),
            key_file: None,
            cert_file: None,
            trusted_ca_file: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            keepalive_time: DEFAULT_KEEPALIVE_TIME,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

impl TransportConfig {
    pub fn new(server_list: Vec<String>) -> Self {
        Self {
            server_list,
            ..Default::default()
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.key_file.is_some() || self.cert_file.is_some() || self.trusted_ca_file.is_some()
    }

    /// Rejects configurations that can never produce a working client.
    pub fn validate(&self) -> TransportResult<()> {
        if self.server_list.is_empty() {
            return Err(TransportError::NoEndpoints);
        }
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(TransportError::PartialIdentity);
        }
        Ok(())
    }

    async fn tls_config(&self) -> TransportResult<Option<ClientTlsConfig>> {
        if !self.tls_enabled() {
            return Ok(None);
        }

        let mut tls = ClientTlsConfig::new();
        match &self.trusted_ca_file {
            Some(ca) => {
                let pem = read_file(ca).await?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            None => tls = tls.with_native_roots(),
        }
        if let (Some(cert), Some(key)) = (&self.cert_file, &self.key_file) {
            let cert = read_file(cert).await?;
            let key = read_file(key).await?;
            tls = tls.identity(Identity::from_pem(cert, key));
        }
        Ok(Some(tls))
    }

    fn endpoint(&self, server: &str, tls: Option<&ClientTlsConfig>) -> TransportResult<Endpoint> {
        let uri = if server.contains("://") {
            server.to_string()
        } else if tls.is_some() {
            format!("https://{server}")
        } else {
            format!("http://{server}")
        };

        let invalid = |message: String| TransportError::InvalidEndpoint {
            endpoint: server.to_string(),
            message,
        };

        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| invalid(e.to_string()))?
            .connect_timeout(self.dial_timeout)
            .http2_keep_alive_interval(self.keepalive_time)
            .keep_alive_timeout(self.keepalive_timeout)
            .keep_alive_while_idle(true);

        if let Some(tls) = tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(endpoint)
    }
}

async fn read_file(path: &PathBuf) -> TransportResult<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| TransportError::ReadFile {
            path: path.clone(),
            source,
        })
}

/// Connects to the first reachable endpoint in `config.server_list`.
///
/// The whole dial, across all endpoints, is bounded by `config.dial_timeout`.
pub async fn new_etcd3_client(config: &TransportConfig) -> TransportResult<Channel> {
    config.validate()?;
    let tls = config.tls_config().await?;

    let endpoints = config
        .server_list
        .iter()
        .map(|server| config.endpoint(server, tls.as_ref()))
        .collect::<TransportResult<Vec<_>>>()?;

    let dial = async {
        let mut last_error = String::new();
        for (server, endpoint) in config.server_list.iter().zip(endpoints) {
            debug!(server = %server, "Dialing etcd endpoint");
            match endpoint.connect().await {
                Ok(channel) => {
                    info!(server = %server, tls = tls.is_some(), "Connected to etcd");
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "Failed to dial etcd endpoint");
                    last_error = format!("{server}: {e}");
                }
            }
        }
        Err(TransportError::Connect(last_error))
    };

    match tokio::time::timeout(config.dial_timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::DialTimeout(config.dial_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.dial_timeout, Duration::from_secs(20));
        assert_eq!(config.keepalive_time, Duration::from_secs(30));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(10));
        assert!(!config.tls_enabled());
    }

    #[test]
    fn test_validate() {
        assert!(matches!(
            TransportConfig::default().validate(),
            Err(TransportError::NoEndpoints)
        ));

        let mut config = TransportConfig::new(vec!["127.0.0.1:2379".into()]);
        assert!(config.validate().is_ok());

        config.cert_file = Some("client.crt".into());
        assert!(matches!(
            config.validate(),
            Err(TransportError::PartialIdentity)
        ));

        config.cert_file = None;
        config.trusted_ca_file = Some("ca.crt".into());
        assert!(config.validate().is_ok());
        assert!(config.tls_enabled());
    }

    #[tokio::test]
    async fn test_missing_ca_file() {
        let mut config = TransportConfig::new(vec!["127.0.0.1:2379".into()]);
        config.trusted_ca_file = Some("/nonexistent/ca.pem".into());
        let err = new_etcd3_client(&config).await.unwrap_err();
        assert!(matches!(err, TransportError::ReadFile { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let mut config = TransportConfig::new(vec!["127.0.0.1:1".into()]);
        config.dial_timeout = Duration::from_millis(500);
        let err = new_etcd3_client(&config).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::DialTimeout(_)
        ));
    }

    #[test]
    fn test_endpoint_scheme() {
        let config = TransportConfig::new(vec!["127.0.0.1:2379".into()]);
        let endpoint = config.endpoint("127.0.0.1:2379", None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));

        let endpoint = config.endpoint("https://etcd:2379", None).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }
}
