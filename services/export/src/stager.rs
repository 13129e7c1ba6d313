//! Size-bounded staging of one metric's record stream.
//!
//! Records are written one per file into a batch directory. Once the bytes
//! staged in the current batch reach the threshold, the batch is archived
//! and uploaded before the next record is read; a later record opens a new
//! batch. Whatever is left when the stream ends is flushed as the tail batch.

use crate::archiver::{ArchiveError, ArchivedObject, Archiver};
use crate::index::{IndexBuilder, IndexError};
use crate::record::{object_name, staged_file_name, MetricKind, MetricRecord};
use crate::source::SourceError;
use futures::{Stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors from staging a metric
#[derive(Error, Debug)]
pub enum StageError {
    #[error("Unable to create staging directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Unable to marshal metric into json: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unable to write to file {path}: {source}")]
    WriteFile { path: PathBuf, source: io::Error },

    #[error("Unable to list time series: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("Unable to compress and upload metrics: {0}")]
    Archive(#[from] ArchiveError),
}

/// What staging one metric produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageSummary {
    /// Records read from the source
    pub records: u64,
    /// Serialized bytes staged across all batches
    pub staged_bytes: u64,
    /// Uploaded archives, in flush order
    pub objects: Vec<ArchivedObject>,
}

/// Directory currently receiving staged records
struct Batch {
    dir: PathBuf,
    staged_bytes: u64,
}

/// Stages record streams into threshold-sized archives
pub struct BatchStager {
    archiver: Archiver,
    staging_root: PathBuf,
    threshold_bytes: u64,
}

impl BatchStager {
    pub fn new(archiver: Archiver, staging_root: impl Into<PathBuf>, threshold_bytes: u64) -> Self {
        Self {
            archiver,
            staging_root: staging_root.into(),
            threshold_bytes,
        }
    }

    /// Stage every record of one metric, flushing whenever the threshold is reached.
    ///
    /// Each record is also fed to `index` under its staged file name. Any
    /// error aborts immediately; batches not yet flushed stay on disk.
    #[instrument(skip(self, records, index), fields(kind = %kind, metric = %metric_type))]
    pub async fn stage_metric<S>(
        &self,
        kind: MetricKind,
        metric_type: &str,
        mut records: S,
        index: &mut IndexBuilder,
    ) -> Result<StageSummary, StageError>
    where
        S: Stream<Item = Result<MetricRecord, SourceError>> + Unpin,
    {
        info!("Reading metric");

        let mut summary = StageSummary::default();
        let mut batch: Option<Batch> = None;
        let mut object_count: u64 = 1;

        while let Some(record) = records.next().await {
            let record = record?;
            summary.records += 1;

            let file_name = staged_file_name(metric_type, summary.records);
            index.observe(kind, &record, &file_name)?;

            let mut current = match batch.take() {
                Some(current) => current,
                None => self.open_batch().await?,
            };
            let written = stage_record(&current.dir, &file_name, &record).await?;
            current.staged_bytes += written;
            summary.staged_bytes += written;

            if current.staged_bytes >= self.threshold_bytes {
                let object = object_name(kind, metric_type, object_count);
                summary.objects.push(self.flush(current, &object).await?);
                object_count += 1;
            } else {
                batch = Some(current);
            }
        }

        match batch {
            Some(tail) if tail.staged_bytes > 0 => {
                let object = object_name(kind, metric_type, object_count);
                summary.objects.push(self.flush(tail, &object).await?);
            }
            _ => {}
        }

        if summary.records == 0 {
            info!("No metrics");
        } else {
            info!(
                records = summary.records,
                staged_bytes = summary.staged_bytes,
                objects = summary.objects.len(),
                "Metric staged"
            );
        }

        Ok(summary)
    }

    async fn open_batch(&self) -> Result<Batch, StageError> {
        let dir = self
            .staging_root
            .join(format!("metrics-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StageError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        debug!(dir = %dir.display(), "Opened staging batch");
        Ok(Batch {
            dir,
            staged_bytes: 0,
        })
    }

    async fn flush(&self, batch: Batch, object: &str) -> Result<ArchivedObject, StageError> {
        debug!(
            object = %object,
            staged_bytes = batch.staged_bytes,
            "Flushing staging batch"
        );
        Ok(self.archiver.archive(&batch.dir, object).await?)
    }
}

/// Write `record` as `dir/file_name`, returning the serialized length
async fn stage_record(dir: &Path, file_name: &str, record: &MetricRecord) -> Result<u64, StageError> {
    let body = record.to_canonical_json()?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, &body)
        .await
        .map_err(|source| StageError::WriteFile { path, source })?;

    metrics::counter!("exporter.records.staged").increment(1);
    metrics::counter!("exporter.bytes.staged").increment(body.len() as u64);

    Ok(body.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryBlobStore};
    use crate::codec::{ArchiveCodec, TarGzCodec};
    use crate::source::fixtures::{compute_record, container_record};
    use futures::stream;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CPU: &str = "compute.googleapis.com/instance/cpu/utilization";
    const BUCKET: &str = "bucket";

    struct Harness {
        store: Arc<MemoryBlobStore>,
        staging: TempDir,
        stager: BatchStager,
    }

    async fn harness(threshold_bytes: u64) -> Harness {
        let store = Arc::new(MemoryBlobStore::new());
        store.create_bucket(BUCKET).await.unwrap();
        let staging = TempDir::new().unwrap();
        let archiver = Archiver::new(store.clone(), Arc::new(TarGzCodec::new()), BUCKET);
        let stager = BatchStager::new(archiver, staging.path(), threshold_bytes);
        Harness {
            store,
            staging,
            stager,
        }
    }

    /// Extracted files of an uploaded object, by file name
    async fn extract(store: &MemoryBlobStore, object: &str) -> BTreeMap<String, Vec<u8>> {
        let body = store.get_object(BUCKET, object).await.unwrap();
        let target = TempDir::new().unwrap();
        TarGzCodec::new()
            .decompress_and_extract(&mut body.as_ref(), target.path())
            .unwrap();
        std::fs::read_dir(target.path())
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    entry.file_name().to_string_lossy().into_owned(),
                    std::fs::read(entry.path()).unwrap(),
                )
            })
            .collect()
    }

    /// Compute record whose canonical JSON is exactly `size` bytes
    fn sized_record(size: usize) -> MetricRecord {
        let mut record = compute_record(CPU, "vm-1", "node-a");
        record.metric.labels.insert("pad".to_string(), String::new());
        let base = record.to_canonical_json().unwrap().len();
        assert!(size >= base, "record cannot be smaller than {base} bytes");
        record
            .metric
            .labels
            .insert("pad".to_string(), "x".repeat(size - base));
        record
    }

    fn ok_stream(records: Vec<MetricRecord>) -> impl Stream<Item = Result<MetricRecord, SourceError>> + Unpin {
        stream::iter(records.into_iter().map(Ok))
    }

    fn staging_is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_small_metric_produces_single_object() {
        let h = harness(10_000).await;
        let records = vec![
            compute_record(CPU, "vm-1", "node-a"),
            compute_record(CPU, "vm-1", "node-a"),
        ];
        let mut index = IndexBuilder::new();

        let summary = h
            .stager
            .stage_metric(MetricKind::Compute, CPU, ok_stream(records), &mut index)
            .await
            .unwrap();

        assert_eq!(summary.records, 2);
        assert_eq!(summary.objects.len(), 1);
        assert_eq!(
            summary.objects[0].name,
            "compute-compute.googleapis.com_instance_cpu_utilization1"
        );
        let files = extract(&h.store, &summary.objects[0].name).await;
        assert_eq!(
            files.keys().cloned().collect::<Vec<_>>(),
            vec![
                "compute.googleapis.com_instance_cpu_utilization-1".to_string(),
                "compute.googleapis.com_instance_cpu_utilization-2".to_string(),
            ]
        );
        assert!(staging_is_empty(&h.staging));
        assert_eq!(
            index.staged_nodes().nodes["vm-1"].node_files,
            vec![
                "compute.googleapis.com_instance_cpu_utilization-1",
                "compute.googleapis.com_instance_cpu_utilization-2"
            ]
        );
    }

    #[tokio::test]
    async fn test_multi_flush_numbers_objects() {
        let h = harness(500_000).await;
        let records = vec![sized_record(1_500); 1_000];
        let mut index = IndexBuilder::new();

        let summary = h
            .stager
            .stage_metric(MetricKind::Compute, CPU, ok_stream(records), &mut index)
            .await
            .unwrap();

        assert_eq!(summary.staged_bytes, 1_500_000);
        let names: Vec<_> = summary.objects.iter().map(|o| o.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "compute-compute.googleapis.com_instance_cpu_utilization1",
                "compute-compute.googleapis.com_instance_cpu_utilization2",
                "compute-compute.googleapis.com_instance_cpu_utilization3",
            ]
        );

        let mut sizes: Vec<usize> = Vec::new();
        for name in &names {
            let files = extract(&h.store, name).await;
            sizes.push(files.values().map(Vec::len).sum());
        }
        assert_eq!(sizes, vec![501_000, 501_000, 498_000]);
        assert!(sizes[2] < 500_000);
        assert!(staging_is_empty(&h.staging));
    }

    #[tokio::test]
    async fn test_exact_threshold_flushes_without_tail() {
        let h = harness(3_000).await;
        let records = vec![sized_record(1_500); 4];
        let mut index = IndexBuilder::new();

        let summary = h
            .stager
            .stage_metric(MetricKind::Compute, CPU, ok_stream(records), &mut index)
            .await
            .unwrap();

        assert_eq!(summary.objects.len(), 2);
        assert_eq!(h.store.object_names(BUCKET).len(), 2);
        assert!(staging_is_empty(&h.staging));
    }

    #[tokio::test]
    async fn test_empty_metric_uploads_nothing() {
        let h = harness(1_000).await;
        let mut index = IndexBuilder::new();

        let summary = h
            .stager
            .stage_metric(MetricKind::Compute, CPU, ok_stream(vec![]), &mut index)
            .await
            .unwrap();

        assert_eq!(summary, StageSummary::default());
        assert!(h.store.object_names(BUCKET).is_empty());
        assert!(staging_is_empty(&h.staging));
    }

    #[tokio::test]
    async fn test_source_error_aborts_and_keeps_unflushed_batch() {
        let h = harness(1_000_000).await;
        let records = stream::iter(vec![
            Ok(compute_record(CPU, "vm-1", "node-a")),
            Err(SourceError::Status {
                api: "monitoring",
                status: 503,
                body: "unavailable".to_string(),
            }),
            Ok(compute_record(CPU, "vm-1", "node-a")),
        ]);
        let mut index = IndexBuilder::new();

        let result = h
            .stager
            .stage_metric(MetricKind::Compute, CPU, records, &mut index)
            .await;

        assert!(matches!(result, Err(StageError::Source(_))));
        assert!(h.store.object_names(BUCKET).is_empty());
        assert!(!staging_is_empty(&h.staging));
    }

    #[tokio::test]
    async fn test_missing_label_aborts() {
        let h = harness(1_000).await;
        let mut record = container_record(
            "container.googleapis.com/container/uptime",
            "vm-1",
            "prod",
        );
        record.resource.labels.remove("cluster_name");
        let mut index = IndexBuilder::new();

        let result = h
            .stager
            .stage_metric(
                MetricKind::Container,
                "container.googleapis.com/container/uptime",
                ok_stream(vec![record]),
                &mut index,
            )
            .await;

        assert!(matches!(result, Err(StageError::Index(_))));
        assert!(h.store.object_names(BUCKET).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_batches_respect_threshold_and_cover_every_record(
            sizes in prop::collection::vec(600usize..2_000, 0..40),
            threshold in 500u64..6_000,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let h = harness(threshold).await;
                let records: Vec<MetricRecord> = sizes.iter().map(|&size| sized_record(size)).collect();
                let mut index = IndexBuilder::new();

                let summary = h
                    .stager
                    .stage_metric(MetricKind::Compute, CPU, ok_stream(records.clone()), &mut index)
                    .await
                    .unwrap();

                let mut seen = BTreeMap::new();
                let object_count = summary.objects.len();
                for (position, object) in summary.objects.iter().enumerate() {
                    let files = extract(&h.store, &object.name).await;
                    let staged: u64 = files.values().map(|body| body.len() as u64).sum();
                    let largest = files.values().map(|body| body.len() as u64).max().unwrap();
                    if position + 1 < object_count {
                        assert!(staged >= threshold);
                    }
                    // Flushed as soon as the threshold was crossed
                    assert!(staged - largest < threshold);
                    for (name, body) in files {
                        assert!(seen.insert(name, body).is_none(), "record staged twice");
                    }
                }

                assert_eq!(seen.len(), records.len());
                for (i, record) in records.iter().enumerate() {
                    let name = staged_file_name(CPU, i as u64 + 1);
                    assert_eq!(seen[&name], record.to_canonical_json().unwrap());
                }
            });
        }
    }
}
