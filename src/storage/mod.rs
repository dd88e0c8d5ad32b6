//! Object storage for notebook archives and outputs
//!
//! [`ObjectStore`] is the seam the scheduler talks to; [`S3Store`] is the
//! real implementation for S3-compatible services such as MinIO.

pub mod s3;
pub mod sigv4;

pub use s3::S3Store;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Bucket '{0}' is already owned by you")]
    BucketAlreadyOwnedByYou(String),

    #[error("Bucket '{0}' already exists")]
    BucketAlreadyExists(String),

    #[error("Storage API error: {status} {code}")]
    Api { status: u16, code: String },

    #[error("Failed to read {0}: {1}")]
    ReadFile(PathBuf, String),

    #[error("Invalid storage endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to sign storage request: {0}")]
    Signing(String),

    #[error("Storage request timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, StorageError>;

    /// Create a bucket. Conflicts surface as
    /// [`StorageError::BucketAlreadyOwnedByYou`] / [`StorageError::BucketAlreadyExists`].
    async fn make_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Upload a local file. Writing an existing key replaces the object.
    async fn put_object(&self, bucket: &str, key: &str, local_path: &Path)
        -> Result<(), StorageError>;
}

/// Make sure `bucket` exists. Safe to call concurrently and repeatedly:
/// losing a creation race to ourselves or to another submission is success.
pub async fn ensure_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<(), StorageError> {
    if store.bucket_exists(bucket).await? {
        debug!(bucket, "bucket already present");
        return Ok(());
    }

    match store.make_bucket(bucket).await {
        Ok(()) => {
            info!(bucket, "bucket created");
            Ok(())
        }
        Err(StorageError::BucketAlreadyOwnedByYou(_)) => {
            warn!(bucket, "bucket already owned by you");
            Ok(())
        }
        Err(StorageError::BucketAlreadyExists(_)) => {
            warn!(bucket, "bucket already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
