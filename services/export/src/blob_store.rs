//! Blob store abstraction: buckets of named, atomically written objects.

use crate::paging::{paginate, Page};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors returned by a blob store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create bucket {bucket}: {message}")]
    CreateBucket { bucket: String, message: String },

    #[error("Failed to write object {key} to bucket {bucket}: {message}")]
    Put {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to read object {key} from bucket {bucket}: {message}")]
    Get {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to list objects in bucket {bucket}: {message}")]
    List { bucket: String, message: String },

    #[error("Bucket {0} does not exist")]
    NoSuchBucket(String),

    #[error("Object {key} does not exist in bucket {bucket}")]
    NoSuchKey { bucket: String, key: String },
}

/// Outcome of an idempotent bucket creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    /// The bucket was created by this call
    Created,
    /// The bucket already existed and belongs to the caller
    AlreadyOwned,
}

/// Listing entry for a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Object key
    pub name: String,
    /// Object size in bytes, when the store reports it
    pub size: Option<u64>,
}

/// Body of an object, delivered in order as it is read
pub type ObjectChunks = BoxStream<'static, Result<Bytes, StoreError>>;

/// Key/value blob store with atomic object writes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create a bucket; a bucket already owned by the caller is not an error
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError>;

    /// Write an object. Readers see either the complete object or nothing.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Read a whole object
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError>;

    /// Read an object chunk by chunk without holding all of it in memory
    async fn stream_object(&self, bucket: &str, key: &str) -> Result<ObjectChunks, StoreError>;

    /// Fetch one page of the bucket listing
    async fn list_objects_page(
        &self,
        bucket: &str,
        page_token: Option<String>,
    ) -> Result<Page<ObjectSummary>, StoreError>;
}

/// Lazy sequence of every object in a bucket
pub fn list_objects<'a>(
    store: &'a dyn BlobStore,
    bucket: &'a str,
) -> BoxStream<'a, Result<ObjectSummary, StoreError>> {
    paginate(move |token| store.list_objects_page(bucket, token))
}

const MEMORY_PAGE_SIZE: usize = 100;
const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

/// Blob store kept entirely in process memory.
///
/// Used for dry runs and tests. Listings are ordered by key.
#[derive(Default)]
pub struct MemoryBlobStore {
    buckets: Mutex<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the objects currently in `bucket`
    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.buckets
            .lock()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Ok(BucketStatus::AlreadyOwned);
        }
        buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(BucketStatus::Created)
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        let mut buckets = self.buckets.lock();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let buckets = self.buckets.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;
        objects.get(key).cloned().ok_or_else(|| StoreError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    async fn stream_object(&self, bucket: &str, key: &str) -> Result<ObjectChunks, StoreError> {
        let body = self.get_object(bucket, key).await?;
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(MEMORY_CHUNK_SIZE)
            .map(|start| body.slice(start..(start + MEMORY_CHUNK_SIZE).min(body.len())))
            .collect();
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn list_objects_page(
        &self,
        bucket: &str,
        page_token: Option<String>,
    ) -> Result<Page<ObjectSummary>, StoreError> {
        let buckets = self.buckets.lock();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::NoSuchBucket(bucket.to_string()))?;

        // The continuation token is the last key of the previous page
        let items: Vec<ObjectSummary> = objects
            .iter()
            .filter(|(key, _)| match &page_token {
                Some(after) => key.as_str() > after.as_str(),
                None => true,
            })
            .take(MEMORY_PAGE_SIZE)
            .map(|(key, body)| ObjectSummary {
                name: key.clone(),
                size: Some(body.len() as u64),
            })
            .collect();

        let next_page_token = if items.len() == MEMORY_PAGE_SIZE {
            items.last().map(|item| item.name.clone())
        } else {
            None
        };

        Ok(Page {
            items,
            next_page_token,
        })
    }
}
