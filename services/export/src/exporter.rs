//! End-to-end export of one project into one bucket.
//!
//! The run is strictly sequential: create the bucket, discover and classify
//! metric types, stage every container metric and then every compute metric
//! through a single [`IndexBuilder`], upload the merged index, and finally
//! write the running-instance inventory snapshot.

use crate::archiver::Archiver;
use crate::blob_store::{BlobStore, BucketStatus, StoreError};
use crate::codec::ArchiveCodec;
use crate::config::ExportConfig;
use crate::index::{IndexBuilder, IndexError};
use crate::record::{MetricKind, TimeInterval};
use crate::source::{metric_descriptors, running_instances, time_series, InventorySource, MetricsSource, SourceError};
use crate::stager::{BatchStager, StageError};
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Object holding the serialized index
pub const INDEX_OBJECT: &str = "index";
/// Object holding the running-instance inventory snapshot
pub const RUNNING_INSTANCES_OBJECT: &str = "runningInstances";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unable to create bucket {bucket}: {source}")]
    Bucket { bucket: String, source: StoreError },

    #[error("Unable to list metric descriptors: {0}")]
    Discover(SourceError),

    #[error("Unable to export metric {metric}: {source}")]
    Metric { metric: String, source: StageError },

    #[error("Unable to merge index: {0}")]
    Index(#[from] IndexError),

    #[error("Unable to marshal index: {0}")]
    SerializeIndex(serde_json::Error),

    #[error("Unable to upload index: {0}")]
    UploadIndex(StoreError),
}

/// Errors from the inventory snapshot; reported, never fatal to the export
#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Unable to list running instances: {0}")]
    Source(#[from] SourceError),

    #[error("Unable to marshal running instances: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Unable to upload running instances: {0}")]
    Upload(#[from] StoreError),
}

/// What happened to the inventory snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryOutcome {
    Written { instances: usize },
    Failed(String),
}

/// Result of exporting one project
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bucket: String,
    pub bucket_status: BucketStatus,
    /// Metric types exported, container first
    pub metrics: Vec<String>,
    pub records: u64,
    pub staged_bytes: u64,
    /// Archive objects uploaded, in upload order
    pub objects: Vec<String>,
    /// Nodes left out of the index because no cluster claimed them
    pub unassigned_nodes: Vec<String>,
    pub inventory: InventoryOutcome,
}

/// Destination bucket of a company's project export
pub fn bucket_name(prefix: &str, company: &str, project: &str) -> String {
    format!("{}-{}-{}", prefix, company.to_lowercase(), project)
}

/// Drives the export of a project
pub struct Exporter {
    metrics: Arc<dyn MetricsSource>,
    inventory: Arc<dyn InventorySource>,
    store: Arc<dyn BlobStore>,
    codec: Arc<dyn ArchiveCodec>,
    settings: ExportConfig,
}

impl Exporter {
    pub fn new(
        metrics: Arc<dyn MetricsSource>,
        inventory: Arc<dyn InventorySource>,
        store: Arc<dyn BlobStore>,
        codec: Arc<dyn ArchiveCodec>,
        settings: ExportConfig,
    ) -> Self {
        Self {
            metrics,
            inventory,
            store,
            codec,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn export_project(&self, company: &str, project: &str) -> Result<ExportSummary, ExportError> {
        let bucket = bucket_name(&self.settings.bucket_prefix, company, project);

        let bucket_status = self
            .store
            .create_bucket(&bucket)
            .await
            .map_err(|source| ExportError::Bucket {
                bucket: bucket.clone(),
                source,
            })?;
        match bucket_status {
            BucketStatus::Created => info!(bucket = %bucket, "Bucket created"),
            BucketStatus::AlreadyOwned => info!(bucket = %bucket, "Bucket already exists and is owned by us"),
        }

        let (container, compute) = self.discover(project).await?;
        info!(
            container = container.len(),
            compute = compute.len(),
            "Discovered metric types"
        );

        let interval = TimeInterval::lookback(Utc::now(), self.settings.lookback());
        debug!(interval = %interval, "Query window");

        let archiver = Archiver::new(self.store.clone(), self.codec.clone(), bucket.clone());
        let stager = BatchStager::new(
            archiver,
            &self.settings.staging_dir,
            self.settings.threshold_bytes,
        );

        let mut index = IndexBuilder::new();
        let mut summary = ExportSummary {
            bucket: bucket.clone(),
            bucket_status,
            metrics: Vec::new(),
            records: 0,
            staged_bytes: 0,
            objects: Vec::new(),
            unassigned_nodes: Vec::new(),
            inventory: InventoryOutcome::Written { instances: 0 },
        };

        for (kind, metric_types) in [(MetricKind::Container, container), (MetricKind::Compute, compute)] {
            for metric_type in metric_types {
                let records = time_series(self.metrics.as_ref(), project, &metric_type, &interval);
                let staged = stager
                    .stage_metric(kind, &metric_type, records, &mut index)
                    .await
                    .map_err(|source| ExportError::Metric {
                        metric: metric_type.clone(),
                        source,
                    })?;

                summary.records += staged.records;
                summary.staged_bytes += staged.staged_bytes;
                summary
                    .objects
                    .extend(staged.objects.into_iter().map(|object| object.name));
                summary.metrics.push(metric_type);
            }
        }

        let finished = index.finish()?;
        let body = finished
            .index
            .to_json()
            .map_err(ExportError::SerializeIndex)?;
        self.store
            .put_object(&bucket, INDEX_OBJECT, Bytes::from(body))
            .await
            .map_err(ExportError::UploadIndex)?;
        info!(
            clusters = finished.index.clusters.len(),
            unassigned = finished.unassigned.len(),
            "Index uploaded"
        );
        summary.unassigned_nodes = finished.unassigned;

        summary.inventory = match self.write_inventory(&bucket, project).await {
            Ok(instances) => InventoryOutcome::Written { instances },
            Err(e) => {
                warn!(bucket = %bucket, error = %e, "Unable to write running instances");
                InventoryOutcome::Failed(e.to_string())
            }
        };

        info!(
            bucket = %bucket,
            records = summary.records,
            objects = summary.objects.len(),
            "Export complete"
        );

        Ok(summary)
    }

    /// Metric types of the project, split into container and compute families
    async fn discover(&self, project: &str) -> Result<(Vec<String>, Vec<String>), ExportError> {
        let mut container = Vec::new();
        let mut compute = Vec::new();

        let mut descriptors = metric_descriptors(self.metrics.as_ref(), project);
        while let Some(descriptor) = descriptors.try_next().await.map_err(ExportError::Discover)? {
            match MetricKind::classify(&descriptor.metric_type) {
                Some(MetricKind::Container) => container.push(descriptor.metric_type),
                Some(MetricKind::Compute) => compute.push(descriptor.metric_type),
                None => debug!(metric = %descriptor.metric_type, "Ignoring metric type"),
            }
        }

        Ok((container, compute))
    }

    async fn write_inventory(&self, bucket: &str, project: &str) -> Result<usize, InventoryError> {
        let instances: Vec<serde_json::Value> = running_instances(self.inventory.as_ref(), project)
            .try_collect()
            .await?;
        let body = serde_json::to_vec(&instances)?;
        self.store
            .put_object(bucket, RUNNING_INSTANCES_OBJECT, Bytes::from(body))
            .await?;

        debug!(instances = instances.len(), "Running instances written");
        Ok(instances.len())
    }
}
