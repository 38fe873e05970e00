//! The possible error types when using `fluxframe`.
use crate::kv::Key;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An enumeration of `fluxframe` errors.
///
/// The first five variants are the failures an operation can surface to its
/// caller. `VersionConflict` is the only one that is expected and recoverable
/// by re-reading and retrying, see [`Directory::update`].
///
/// [`Directory::update`]: crate::kv::Directory::update
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key is absent from the `Directory`
    #[error("key {key} not found")]
    NotFound { key: Key },
    /// An optimistic write lost a race with another writer
    #[error("version conflict on {key}: expected version {expected}, found {actual}")]
    VersionConflict { key: Key, expected: u64, actual: u64 },
    /// Row, column or type incompatibility
    #[error("schema mismatch in {op}: {detail}")]
    SchemaMismatch { op: String, detail: String },
    /// A chunk could not be encoded or decoded
    #[error("encoding failure for chunk {key}: {detail}")]
    EncodingFailure { key: Key, detail: String },
    /// The owning node of some data could not be reached
    #[error("node {node} unavailable during {op}")]
    NodeUnavailable { node: usize, op: String },
    /// The job was cancelled before all of its chunk tasks were scheduled
    #[error("job {job} was cancelled")]
    Cancelled { job: Key },
    /// A chunk task of the job panicked
    #[error("a chunk task of job {job} panicked")]
    TaskPanicked { job: Key },
    #[error("row index {0} out of bounds")]
    RowIndexOutOfBounds(u64),
    #[error("column index {0} out of bounds")]
    ColIndexOutOfBounds(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("the stream was closed")]
    StreamClosed,
    #[error("received an unexpected message")]
    UnexpectedMessage,
    #[error("no connection to a node with id {0}")]
    UnknownId(usize),
    #[error("attempted to connect to an already connected node")]
    ReconnectionError,
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A reachable node failed a request for a reason that has no variant of
    /// its own
    #[error("node {node} failed: {reason}")]
    Remote { node: usize, reason: String },
}

impl StoreError {
    pub(crate) fn schema(op: &str, detail: impl Into<String>) -> Self {
        StoreError::SchemaMismatch {
            op: op.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn unavailable(node: usize, op: &str) -> Self {
        StoreError::NodeUnavailable {
            node,
            op: op.to_string(),
        }
    }

    pub(crate) fn encoding(key: &Key, detail: impl Into<String>) -> Self {
        StoreError::EncodingFailure {
            key: key.clone(),
            detail: detail.into(),
        }
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Config(err.to_string())
    }
}

/// A `StoreError` in a form that can be sent to the node that is waiting on
/// the result of a remote request or task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RemoteError {
    NotFound(Key),
    VersionConflict { key: Key, expected: u64, actual: u64 },
    SchemaMismatch { op: String, detail: String },
    EncodingFailure { key: Key, detail: String },
    NodeUnavailable { node: usize, op: String },
    Cancelled(Key),
    TaskPanicked(Key),
    RowIndexOutOfBounds(u64),
    ColIndexOutOfBounds(usize),
    UnexpectedMessage,
    /// The receiver is not the home of the key it was asked about
    NotHome(Key),
    Other(String),
}

impl From<&StoreError> for RemoteError {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => RemoteError::NotFound(key.clone()),
            StoreError::VersionConflict {
                key,
                expected,
                actual,
            } => RemoteError::VersionConflict {
                key: key.clone(),
                expected: *expected,
                actual: *actual,
            },
            StoreError::SchemaMismatch { op, detail } => {
                RemoteError::SchemaMismatch {
                    op: op.clone(),
                    detail: detail.clone(),
                }
            }
            StoreError::EncodingFailure { key, detail } => {
                RemoteError::EncodingFailure {
                    key: key.clone(),
                    detail: detail.clone(),
                }
            }
            StoreError::NodeUnavailable { node, op } => {
                RemoteError::NodeUnavailable {
                    node: *node,
                    op: op.clone(),
                }
            }
            StoreError::Cancelled { job } => RemoteError::Cancelled(job.clone()),
            StoreError::TaskPanicked { job } => {
                RemoteError::TaskPanicked(job.clone())
            }
            StoreError::RowIndexOutOfBounds(i) => {
                RemoteError::RowIndexOutOfBounds(*i)
            }
            StoreError::ColIndexOutOfBounds(i) => {
                RemoteError::ColIndexOutOfBounds(*i)
            }
            StoreError::UnexpectedMessage => RemoteError::UnexpectedMessage,
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl RemoteError {
    /// Rebuilds the typed error. `node` is the node the error came from and
    /// is kept for failures that have no typed counterpart.
    pub(crate) fn into_store_error(self, node: usize) -> StoreError {
        match self {
            RemoteError::NotFound(key) => StoreError::NotFound { key },
            RemoteError::VersionConflict {
                key,
                expected,
                actual,
            } => StoreError::VersionConflict {
                key,
                expected,
                actual,
            },
            RemoteError::SchemaMismatch { op, detail } => {
                StoreError::SchemaMismatch { op, detail }
            }
            RemoteError::EncodingFailure { key, detail } => {
                StoreError::EncodingFailure { key, detail }
            }
            RemoteError::NodeUnavailable { node, op } => {
                StoreError::NodeUnavailable { node, op }
            }
            RemoteError::Cancelled(job) => StoreError::Cancelled { job },
            RemoteError::TaskPanicked(job) => StoreError::TaskPanicked { job },
            RemoteError::RowIndexOutOfBounds(i) => {
                StoreError::RowIndexOutOfBounds(i)
            }
            RemoteError::ColIndexOutOfBounds(i) => {
                StoreError::ColIndexOutOfBounds(i)
            }
            RemoteError::UnexpectedMessage => StoreError::UnexpectedMessage,
            RemoteError::NotHome(key) => StoreError::Remote {
                node,
                reason: format!("not the home of {}", key),
            },
            RemoteError::Other(reason) => StoreError::Remote { node, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyKind;

    #[test]
    fn test_remote_error_keeps_kind() {
        let key = Key::new("frame-a", 2, KeyKind::Frame);
        let err = StoreError::VersionConflict {
            key: key.clone(),
            expected: 3,
            actual: 4,
        };
        let remote = RemoteError::from(&err);
        match remote.into_store_error(2) {
            StoreError::VersionConflict {
                key: k,
                expected,
                actual,
            } => {
                assert_eq!(k, key);
                assert_eq!(expected, 3);
                assert_eq!(actual, 4);
            }
            e => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_untyped_remote_error_names_its_node() {
        let err = StoreError::StreamClosed;
        let remote = RemoteError::from(&err);
        assert!(matches!(
            remote.into_store_error(3),
            StoreError::Remote { node: 3, .. }
        ));
    }

    #[test]
    fn test_failures_of_a_live_node_are_not_unavailable() {
        let job = Key::new("job", 1, KeyKind::Frame);
        let failures = vec![
            StoreError::TaskPanicked { job: job.clone() },
            StoreError::RowIndexOutOfBounds(7),
            StoreError::ColIndexOutOfBounds(2),
            StoreError::UnexpectedMessage,
        ];
        for err in failures {
            let back = RemoteError::from(&err).into_store_error(2);
            assert_eq!(back.to_string(), err.to_string());
            assert!(!matches!(back, StoreError::NodeUnavailable { .. }));
        }
        let not_home = RemoteError::NotHome(job).into_store_error(2);
        assert!(matches!(not_home, StoreError::Remote { node: 2, .. }));
    }
}
