//! Translation of backend failures into [`StorageError`]s.

use super::continue_token::{ContinueCodec, LATEST_REVISION};
use crate::backend::BackendError;
use crate::error::{
    StorageError, CONTINUE_EXPIRED, LIST_TOO_OLD, RESOURCE_VERSION_TOO_OLD, WATCH_TOO_OLD,
};
use tracing::warn;

/// Maps a backend failure on `key` to a storage error.
///
/// `requested_revision` is the revision the caller asked for, reported when
/// the backend has not reached it yet.
pub fn interpret_error(err: BackendError, key: &str, requested_revision: i64) -> StorageError {
    match err {
        BackendError::Compacted { .. } => StorageError::expired(RESOURCE_VERSION_TOO_OLD),
        BackendError::FutureRevision => StorageError::TooLargeResourceVersion {
            requested: requested_revision,
            current: 0,
        },
        BackendError::InvalidArgument(message) => StorageError::invalid_object(key, message),
        BackendError::Unavailable(message) => StorageError::unreachable(key, message),
        BackendError::Cancelled(message) => StorageError::Cancelled(message),
        BackendError::LeaseNotFound(_) | BackendError::Internal(_) => {
            StorageError::Internal(err.to_string())
        }
    }
}

/// Maps a failure of the backend watch stream.
pub fn interpret_watch_error(err: BackendError, key: &str) -> StorageError {
    match err {
        BackendError::Compacted { .. } => StorageError::expired(WATCH_TOO_OLD),
        other => interpret_error(other, key, 0),
    }
}

/// What a list should do after a backend failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRecovery {
    /// The continue revision was compacted. The list can go on from the same
    /// start key at the latest revision using this token.
    Reanchored { continue_token: String },
    Failed(StorageError),
}

/// Maps a list failure. When `continuing` and the backend compacted the
/// token's revision, the list is re-anchored at `continue_key` instead of
/// failing.
pub fn interpret_list_error(
    err: BackendError,
    continuing: bool,
    continue_key: &str,
    key_prefix: &str,
    codec: &ContinueCodec,
) -> ListRecovery {
    match err {
        BackendError::Compacted { .. } if continuing => {
            match codec.encode(continue_key, key_prefix, LATEST_REVISION) {
                Ok(continue_token) => ListRecovery::Reanchored { continue_token },
                Err(e) => {
                    warn!(error = %e, "Unable to re-anchor continue token");
                    ListRecovery::Failed(StorageError::expired(CONTINUE_EXPIRED))
                }
            }
        }
        BackendError::Compacted { .. } => ListRecovery::Failed(StorageError::expired(LIST_TOO_OLD)),
        other => ListRecovery::Failed(interpret_error(other, key_prefix, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn compacted() -> BackendError {
        BackendError::Compacted {
            compact_revision: 10,
        }
    }

    #[test]
    fn test_watch_compacted() {
        assert_eq!(
            interpret_watch_error(compacted(), "/items"),
            StorageError::expired(WATCH_TOO_OLD)
        );
    }

    #[test]
    fn test_list_compacted_without_continue() {
        let codec = ContinueCodec::new("s");
        assert_eq!(
            interpret_list_error(compacted(), false, "", "/items/", &codec),
            ListRecovery::Failed(StorageError::expired(LIST_TOO_OLD))
        );
    }

    #[test]
    fn test_list_compacted_while_continuing() {
        let codec = ContinueCodec::new("s");
        let recovery = interpret_list_error(compacted(), true, "/items/c", "/items/", &codec);
        let ListRecovery::Reanchored { continue_token } = recovery else {
            panic!("expected a re-anchored token, got {recovery:?}");
        };
        let decoded = codec.decode(&continue_token, "/items/").unwrap();
        assert_eq!(decoded.start_key, "/items/c");
        assert_eq!(decoded.resource_version, LATEST_REVISION);
    }

    #[test]
    fn test_list_reanchor_failure() {
        let codec = ContinueCodec::new("s");
        assert_eq!(
            interpret_list_error(compacted(), true, "/other/c", "/items/", &codec),
            ListRecovery::Failed(StorageError::expired(CONTINUE_EXPIRED))
        );
    }

    #[test]
    fn test_compacted_read_hides_backend_message() {
        let err = interpret_error(compacted(), "/items/a", 5);
        assert_eq!(err, StorageError::expired(RESOURCE_VERSION_TOO_OLD));
        assert!(!err.to_string().contains("etcdserver"));
    }

    #[test]
    fn test_general_mapping() {
        let cases = [
            (BackendError::Unavailable("down".into()), ErrorCode::Unreachable),
            (BackendError::FutureRevision, ErrorCode::TooLargeResourceVersion),
            (BackendError::Cancelled("stop".into()), ErrorCode::Cancelled),
            (BackendError::InvalidArgument("bad".into()), ErrorCode::InvalidObject),
            (BackendError::Internal("boom".into()), ErrorCode::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(interpret_error(err, "/items/a", 5).code(), code);
        }
    }
}
