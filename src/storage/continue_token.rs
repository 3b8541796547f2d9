//! Opaque pagination tokens.
//!
//! A token records where the next page starts (relative to the listed key
//! prefix) and the revision the first page was read at. The wire form is
//!
//! ```text
//! base64url(json) "." base64url(hmac_sha256(json)[..16])
//! ```
//!
//! The tag keeps clients from forging tokens that point outside the prefix or
//! at arbitrary revisions. A revision of `-1` means "continue at the latest
//! revision" and is produced when the original revision has been compacted.

use crate::error::StorageError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_VERSION: &str = "meta.k8s.io/v1";
const TAG_LEN: usize = 16;

/// Revision marker for a token re-anchored at the latest revision.
pub const LATEST_REVISION: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContinueError {
    #[error("continue key is not valid: {0}")]
    Malformed(String),

    #[error("continue key is not valid: signature mismatch")]
    BadSignature,

    #[error("continue key is not valid: server does not recognize this encoded version {0:?}")]
    UnsupportedVersion(String),

    #[error("continue key is not valid: encoded start key empty")]
    EmptyStart,

    #[error("continue key is not valid: {0:?} escapes the listed prefix")]
    EscapesPrefix(String),

    #[error("continue key is not valid: incorrect encoded start resourceVersion {0}")]
    BadRevision(i64),

    #[error("unable to encode next field: the key {key:?} and key prefix {prefix:?} do not match")]
    PrefixMismatch { key: String, prefix: String },
}

pub type ContinueResult<T> = Result<T, ContinueError>;

impl From<ContinueError> for StorageError {
    fn from(err: ContinueError) -> Self {
        StorageError::invalid_object("", err.to_string())
    }
}

#[derive(Serialize, Deserialize)]
struct Payload {
    #[serde(rename = "v")]
    version: String,
    #[serde(rename = "rv")]
    resource_version: i64,
    start: String,
}

/// A decoded token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Continue {
    /// Absolute key the next page starts at (inclusive).
    pub start_key: String,
    pub resource_version: i64,
}

/// Encodes and verifies continue tokens with a per-store secret.
#[derive(Clone)]
pub struct ContinueCodec {
    secret: Vec<u8>,
}

impl std::fmt::Debug for ContinueCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinueCodec").finish_non_exhaustive()
    }
}

impl ContinueCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// A codec with a fresh 32-byte random secret.
    pub fn random() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self, payload: &[u8]) -> ContinueResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ContinueError::Malformed(e.to_string()))?;
        mac.update(payload);
        Ok(mac)
    }

    /// Encodes a token for a page starting at `key`, which must lie under `key_prefix`.
    pub fn encode(&self, key: &str, key_prefix: &str, resource_version: i64) -> ContinueResult<String> {
        let start = key
            .strip_prefix(key_prefix)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ContinueError::PrefixMismatch {
                key: key.to_string(),
                prefix: key_prefix.to_string(),
            })?;

        let payload = serde_json::to_vec(&Payload {
            version: TOKEN_VERSION.to_string(),
            resource_version,
            start: start.to_string(),
        })
        .map_err(|e| ContinueError::Malformed(e.to_string()))?;

        let tag = self.mac(&payload)?.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(&tag[..TAG_LEN])
        ))
    }

    /// Verifies and decodes a token against the prefix being listed.
    pub fn decode(&self, token: &str, key_prefix: &str) -> ContinueResult<Continue> {
        let (body, tag) = token
            .split_once('.')
            .ok_or_else(|| ContinueError::Malformed("missing signature".into()))?;
        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|e| ContinueError::Malformed(e.to_string()))?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|e| ContinueError::Malformed(e.to_string()))?;
        if tag.len() != TAG_LEN {
            return Err(ContinueError::BadSignature);
        }
        self.mac(&payload)?
            .verify_truncated_left(&tag)
            .map_err(|_| ContinueError::BadSignature)?;

        let decoded: Payload =
            serde_json::from_slice(&payload).map_err(|e| ContinueError::Malformed(e.to_string()))?;
        if decoded.version != TOKEN_VERSION {
            return Err(ContinueError::UnsupportedVersion(decoded.version));
        }
        if decoded.resource_version == 0 || decoded.resource_version < LATEST_REVISION {
            return Err(ContinueError::BadRevision(decoded.resource_version));
        }
        if decoded.start.is_empty() {
            return Err(ContinueError::EmptyStart);
        }
        let escapes = decoded.start.starts_with('/')
            || decoded
                .start
                .split('/')
                .any(|seg| seg.is_empty() || seg == "." || seg == "..");
        if escapes {
            return Err(ContinueError::EscapesPrefix(decoded.start));
        }

        Ok(Continue {
            start_key: format!("{key_prefix}{}", decoded.start),
            resource_version: decoded.resource_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forge(codec: &ContinueCodec, json: &str) -> String {
        let tag = codec.mac(json.as_bytes()).unwrap().finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(json),
            URL_SAFE_NO_PAD.encode(&tag[..TAG_LEN])
        )
    }

    #[test]
    fn test_round_trip() {
        let codec = ContinueCodec::new("secret");
        let token = codec.encode("/items/b\0", "/items/", 7).unwrap();
        let decoded = codec.decode(&token, "/items/").unwrap();
        assert_eq!(decoded.start_key, "/items/b\0");
        assert_eq!(decoded.resource_version, 7);
    }

    #[test]
    fn test_latest_revision_marker() {
        let codec = ContinueCodec::random();
        let token = codec.encode("/items/c", "/items/", LATEST_REVISION).unwrap();
        assert_eq!(codec.decode(&token, "/items/").unwrap().resource_version, -1);
    }

    #[test]
    fn test_tampering_is_detected() {
        let codec = ContinueCodec::new("secret");
        let token = codec.encode("/items/b", "/items/", 7).unwrap();

        let (body, tag) = token.split_once('.').unwrap();
        let mut payload = URL_SAFE_NO_PAD.decode(body).unwrap();
        let last = payload.len() - 2;
        payload[last] = b'8';
        let tampered = format!("{}.{}", URL_SAFE_NO_PAD.encode(&payload), tag);
        assert_eq!(codec.decode(&tampered, "/items/"), Err(ContinueError::BadSignature));

        let other = ContinueCodec::new("other");
        assert_eq!(other.decode(&token, "/items/"), Err(ContinueError::BadSignature));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let codec = ContinueCodec::new("secret");
        for token in ["", "abc", "!!!.???", "e30.AAAA"] {
            assert!(codec.decode(token, "/items/").is_err(), "{token}");
        }
    }

    #[test]
    fn test_path_escapes_are_rejected() {
        let codec = ContinueCodec::new("secret");
        for start in ["../secrets/x", "/etc", "a/../../b", "a//b"] {
            let json = format!(r#"{{"v":"meta.k8s.io/v1","rv":3,"start":"{start}"}}"#);
            let token = forge(&codec, &json);
            assert!(
                matches!(codec.decode(&token, "/items/"), Err(ContinueError::EscapesPrefix(_))),
                "{start}"
            );
        }
    }

    #[test]
    fn test_version_and_revision_checked() {
        let codec = ContinueCodec::new("secret");
        let token = forge(&codec, r#"{"v":"v2","rv":3,"start":"a"}"#);
        assert!(matches!(
            codec.decode(&token, "/items/"),
            Err(ContinueError::UnsupportedVersion(_))
        ));

        let token = forge(&codec, r#"{"v":"meta.k8s.io/v1","rv":0,"start":"a"}"#);
        assert_eq!(codec.decode(&token, "/items/"), Err(ContinueError::BadRevision(0)));

        let token = forge(&codec, r#"{"v":"meta.k8s.io/v1","rv":3,"start":""}"#);
        assert_eq!(codec.decode(&token, "/items/"), Err(ContinueError::EmptyStart));
    }

    #[test]
    fn test_encode_requires_prefix() {
        let codec = ContinueCodec::new("secret");
        assert!(matches!(
            codec.encode("/other/a", "/items/", 3),
            Err(ContinueError::PrefixMismatch { .. })
        ));
        let err: StorageError = ContinueError::EmptyStart.into();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidObject);
    }
}
