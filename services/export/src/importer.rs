//! Restore an exported bucket into a local directory.

use crate::blob_store::{list_objects, BlobStore, StoreError};
use crate::codec::{ArchiveCodec, CodecError};
use crate::exporter::{INDEX_OBJECT, RUNNING_INSTANCES_OBJECT};
use futures::TryStreamExt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

/// Objects that are not archives and are never extracted
const RESERVED_OBJECTS: [&str; 2] = [INDEX_OBJECT, RUNNING_INSTANCES_OBJECT];

/// Name prefix of the scratch file an object is downloaded into
const DOWNLOAD_PREFIX: &str = ".download-";

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Bucket {0} contains no objects")]
    EmptyBucket(String),

    #[error("Unable to list objects: {0}")]
    List(StoreError),

    #[error("Unable to download object {object}: {source}")]
    Download { object: String, source: StoreError },

    #[error("Unable to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("Unable to extract object {object}: {source}")]
    Extract { object: String, source: CodecError },

    #[error("Unable to remove {path}: {source}")]
    Cleanup { path: PathBuf, source: io::Error },

    #[error("Extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result of importing one bucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Archive objects extracted
    pub extracted: usize,
    /// Reserved objects skipped
    pub skipped: usize,
}

/// Downloads and unpacks every archive object of a bucket
pub struct Importer {
    store: Arc<dyn BlobStore>,
    codec: Arc<dyn ArchiveCodec>,
}

impl Importer {
    pub fn new(store: Arc<dyn BlobStore>, codec: Arc<dyn ArchiveCodec>) -> Self {
        Self { store, codec }
    }

    /// Extract every archive object of `bucket` into `target_dir`.
    ///
    /// Objects are processed one at a time in listing order; the first
    /// failure aborts the import.
    #[instrument(skip(self, target_dir), fields(target = %target_dir.display()))]
    pub async fn import_bucket(&self, bucket: &str, target_dir: &Path) -> Result<ImportSummary, ImportError> {
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|source| ImportError::Write {
                path: target_dir.to_path_buf(),
                source,
            })?;

        let mut summary = ImportSummary::default();
        let mut objects = list_objects(self.store.as_ref(), bucket);

        while let Some(object) = objects.try_next().await.map_err(ImportError::List)? {
            if RESERVED_OBJECTS.contains(&object.name.as_str()) {
                debug!(object = %object.name, "Skipping reserved object");
                summary.skipped += 1;
                continue;
            }

            self.import_object(bucket, &object.name, target_dir).await?;
            summary.extracted += 1;
        }

        if summary.extracted == 0 && summary.skipped == 0 {
            return Err(ImportError::EmptyBucket(bucket.to_string()));
        }

        info!(
            bucket = %bucket,
            extracted = summary.extracted,
            skipped = summary.skipped,
            "Import complete"
        );
        Ok(summary)
    }

    /// Stream one object into a scratch file, then unpack it.
    ///
    /// The object key is never used as a local path; the scratch file lives
    /// in `target_dir` under a generated name and is removed on every path.
    async fn import_object(&self, bucket: &str, object: &str, target_dir: &Path) -> Result<(), ImportError> {
        let download_error = |source| ImportError::Download {
            object: object.to_string(),
            source,
        };
        let mut chunks = self
            .store
            .stream_object(bucket, object)
            .await
            .map_err(download_error)?;

        let download = tempfile::Builder::new()
            .prefix(DOWNLOAD_PREFIX)
            .tempfile_in(target_dir)
            .map_err(|source| ImportError::Write {
                path: target_dir.to_path_buf(),
                source,
            })?;
        let write_error = |source| ImportError::Write {
            path: download.path().to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::from_std(download.reopen().map_err(write_error)?);
        let mut size_bytes = 0u64;
        while let Some(chunk) = chunks.try_next().await.map_err(download_error)? {
            file.write_all(&chunk).await.map_err(write_error)?;
            size_bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(write_error)?;
        drop(file);
        debug!(object = %object, size_bytes, "Object downloaded");

        let codec = self.codec.clone();
        let target = target_dir.to_path_buf();
        let name = object.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), ImportError> {
            let extract_error = |source| ImportError::Extract {
                object: name.clone(),
                source,
            };
            let mut archive = download.reopen().map_err(|source| {
                extract_error(CodecError::Extract {
                    path: download.path().to_path_buf(),
                    source,
                })
            })?;
            codec
                .decompress_and_extract(&mut archive, &target)
                .map_err(extract_error)?;
            drop(archive);

            let path = download.path().to_path_buf();
            download
                .close()
                .map_err(|source| ImportError::Cleanup { path, source })
        })
        .await??;

        metrics::counter!("importer.objects.extracted").increment(1);
        metrics::counter!("importer.bytes.downloaded").increment(size_bytes);
        info!(object = %object, "Object extracted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{MemoryBlobStore, MockBlobStore, ObjectSummary};
    use crate::codec::TarGzCodec;
    use crate::exporter::tests::{exporter, inventory, round_trip_metrics};
    use crate::paging::Page;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_export_then_import_round_trip() {
        let staging = TempDir::new().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let summary = exporter(round_trip_metrics(), inventory(false), store.clone(), &staging)
            .export_project("acme", "proj")
            .await
            .unwrap();

        let target = TempDir::new().unwrap();
        let importer = Importer::new(store, Arc::new(TarGzCodec::new()));
        let imported = importer
            .import_bucket(&summary.bucket, target.path())
            .await
            .unwrap();

        assert_eq!(imported, ImportSummary { extracted: 1, skipped: 2 });
        assert_eq!(
            file_names(target.path()),
            vec![
                "compute.googleapis.com_instance_cpu_utilization-1".to_string(),
                "compute.googleapis.com_instance_cpu_utilization-2".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_bucket_is_an_error() {
        let store = Arc::new(MemoryBlobStore::new());
        store.create_bucket("empty").await.unwrap();
        let target = TempDir::new().unwrap();

        let result = Importer::new(store, Arc::new(TarGzCodec::new()))
            .import_bucket("empty", target.path())
            .await;

        assert!(matches!(result, Err(ImportError::EmptyBucket(_))));
    }

    #[tokio::test]
    async fn test_reserved_objects_only() {
        let store = Arc::new(MemoryBlobStore::new());
        store.create_bucket("b").await.unwrap();
        store
            .put_object("b", INDEX_OBJECT, Bytes::from_static(b"{\"clusters\":{}}"))
            .await
            .unwrap();
        let target = TempDir::new().unwrap();

        let imported = Importer::new(store, Arc::new(TarGzCodec::new()))
            .import_bucket("b", target.path())
            .await
            .unwrap();

        assert_eq!(imported, ImportSummary { extracted: 0, skipped: 1 });
        assert!(file_names(target.path()).is_empty());
    }

    #[tokio::test]
    async fn test_missing_bucket_fails_listing() {
        let target = TempDir::new().unwrap();
        let result = Importer::new(Arc::new(MemoryBlobStore::new()), Arc::new(TarGzCodec::new()))
            .import_bucket("missing", target.path())
            .await;

        assert!(matches!(
            result,
            Err(ImportError::List(StoreError::NoSuchBucket(_)))
        ));
    }

    #[tokio::test]
    async fn test_download_failure_aborts() {
        let mut store = MockBlobStore::new();
        store.expect_list_objects_page().returning(|_, _| {
            Ok(Page::last(vec![ObjectSummary {
                name: "compute-metric1".to_string(),
                size: Some(10),
            }]))
        });
        store.expect_stream_object().times(1).returning(|bucket, key| {
            Err(StoreError::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "timeout".to_string(),
            })
        });
        let target = TempDir::new().unwrap();

        let result = Importer::new(Arc::new(store), Arc::new(TarGzCodec::new()))
            .import_bucket("b", target.path())
            .await;

        assert!(matches!(result, Err(ImportError::Download { .. })));
    }

    #[tokio::test]
    async fn test_corrupt_archive_aborts_and_leaves_nothing_behind() {
        let store = Arc::new(MemoryBlobStore::new());
        store.create_bucket("b").await.unwrap();
        store
            .put_object("b", "compute-metric1", Bytes::from_static(b"not gzip"))
            .await
            .unwrap();
        let target = TempDir::new().unwrap();

        let result = Importer::new(store, Arc::new(TarGzCodec::new()))
            .import_bucket("b", target.path())
            .await;

        assert!(matches!(result, Err(ImportError::Extract { .. })));
        assert!(file_names(target.path()).is_empty());
    }

    #[tokio::test]
    async fn test_object_keys_never_become_local_paths() {
        let root = TempDir::new().unwrap();
        let victim = root.path().join("escaped");
        std::fs::write(&victim, "precious").unwrap();

        let records = TempDir::new().unwrap();
        std::fs::write(records.path().join("rec-1"), "{}").unwrap();
        let archive = Bytes::from(TarGzCodec::new().compress_directory(records.path()).unwrap());

        let store = Arc::new(MemoryBlobStore::new());
        store.create_bucket("b").await.unwrap();
        for key in ["../escaped", "nested/compute-metric1"] {
            store.put_object("b", key, archive.clone()).await.unwrap();
        }

        let target = root.path().join("target");
        let imported = Importer::new(store, Arc::new(TarGzCodec::new()))
            .import_bucket("b", &target)
            .await
            .unwrap();

        assert_eq!(imported, ImportSummary { extracted: 2, skipped: 0 });
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
        assert_eq!(file_names(&target), vec!["rec-1".to_string()]);
        assert_eq!(
            file_names(root.path()),
            vec!["escaped".to_string(), "target".to_string()]
        );
    }
}
