//! Storage capability consumed by the expiry engine, ingestion and archive
//! pipelines. Only the local filesystem implements it today.

use crate::models::object_key::{KeyRejection, ObjectKey};
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Boxed byte source handed out by, and fed into, a store.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(KeyRejection),
    #[error("object `{key}` declared {expected} bytes but received {actual}")]
    LengthMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("metadata record is corrupt: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// True when the object (or its namespace) does not exist.
    ///
    /// Callers branch on this to answer "not found" rather than
    /// "internal error".
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(err) => err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<KeyRejection> for StoreError {
    fn from(rejection: KeyRejection) -> Self {
        StoreError::InvalidKey(rejection)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Size and type of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_type: String,
    pub size: u64,
}

/// An opened object ready for streaming out.
pub struct StoredObject {
    pub reader: ObjectReader,
    pub info: ObjectInfo,
}

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub size: u64,
    /// Hex MD5 of the stored bytes.
    pub etag: String,
}

/// Durable blob storage keyed by `(token, name)`.
///
/// Implementations must allow concurrent reads, and concurrent writes to
/// distinct keys. Serializing writes and deletes of the same key is the
/// caller's job (see `LockRegistry`).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Content type and exact size, without opening the payload.
    async fn head(&self, key: &ObjectKey) -> StoreResult<ObjectInfo>;

    /// Open the payload for reading.
    async fn get(&self, key: &ObjectKey) -> StoreResult<StoredObject>;

    /// Store exactly `size` bytes from `reader` under `key`.
    ///
    /// The length must be known up front; a source yielding a different
    /// number of bytes fails with [`StoreError::LengthMismatch`] and leaves
    /// no object behind.
    async fn put(
        &self,
        key: &ObjectKey,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        content_type: &str,
        size: u64,
    ) -> StoreResult<PutReceipt>;

    /// Delete the object.
    ///
    /// Deletion works at token granularity: every object sharing
    /// `key.token()` (and their metadata) is removed with it. Deleting an
    /// absent namespace succeeds.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Whether anything is stored under `token`.
    async fn namespace_exists(&self, token: &str) -> StoreResult<bool>;
}
