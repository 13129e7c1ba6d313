//! Compress a staged batch directory and upload it as one blob-store object.

use crate::blob_store::{BlobStore, StoreError};
use crate::codec::{ArchiveCodec, CodecError};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Errors from archiving a batch
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Unable to compress staged metrics: {0}")]
    Compress(#[from] CodecError),

    #[error("Compression of {dir} produced zero bytes for object {object}")]
    EmptyArchive { object: String, dir: PathBuf },

    #[error("Unable to upload object {object}: {source}")]
    Upload { object: String, source: StoreError },

    #[error("Object {object} was uploaded but {dir} could not be removed: {source}")]
    Cleanup {
        object: String,
        dir: PathBuf,
        source: io::Error,
    },

    #[error("Compression task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of a successful archive upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedObject {
    /// Blob-store object name
    pub name: String,
    /// Compressed size in bytes
    pub compressed_bytes: u64,
}

/// Uploads compressed batch directories to one bucket
#[derive(Clone)]
pub struct Archiver {
    store: Arc<dyn BlobStore>,
    codec: Arc<dyn ArchiveCodec>,
    bucket: String,
}

impl Archiver {
    pub fn new(store: Arc<dyn BlobStore>, codec: Arc<dyn ArchiveCodec>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            codec,
            bucket: bucket.into(),
        }
    }

    /// Compress `dir`, upload it as `object`, then delete `dir`.
    ///
    /// Local files are only removed once the upload has committed; on any
    /// earlier failure they are left in place and nothing is uploaded.
    #[instrument(skip(self, dir), fields(bucket = %self.bucket, dir = %dir.display()))]
    pub async fn archive(&self, dir: &Path, object: &str) -> Result<ArchivedObject, ArchiveError> {
        let started = Instant::now();

        let codec = self.codec.clone();
        let source_dir = dir.to_path_buf();
        let payload = tokio::task::spawn_blocking(move || codec.compress_directory(&source_dir)).await??;

        if payload.is_empty() {
            return Err(ArchiveError::EmptyArchive {
                object: object.to_string(),
                dir: dir.to_path_buf(),
            });
        }

        let compressed_bytes = payload.len() as u64;
        debug!(object = %object, compressed_bytes, "Writing object to storage");

        self.store
            .put_object(&self.bucket, object, Bytes::from(payload))
            .await
            .map_err(|source| ArchiveError::Upload {
                object: object.to_string(),
                source,
            })?;

        metrics::counter!("exporter.objects.uploaded").increment(1);
        metrics::counter!("exporter.bytes.uploaded").increment(compressed_bytes);
        metrics::histogram!("exporter.archive.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Err(source) = tokio::fs::remove_dir_all(dir).await {
            error!(object = %object, error = %source, "Uploaded object but failed to remove staging directory");
            return Err(ArchiveError::Cleanup {
                object: object.to_string(),
                dir: dir.to_path_buf(),
                source,
            });
        }

        info!(object = %object, compressed_bytes, "Archive uploaded");

        Ok(ArchivedObject {
            name: object.to_string(),
            compressed_bytes,
        })
    }
}
