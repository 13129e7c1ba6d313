//! Telemetry Export
//!
//! Copies Cloud Monitoring time series of a GCP project into a blob-store
//! bucket as size-bounded compressed archives, together with an index that
//! correlates clusters, nodes and the files holding their metrics. The
//! importer reverses the process into a local directory.
//!
//! ## Architecture
//!
//! ```text
//! Cloud Monitoring         BatchStager            Blob Store Bucket
//! ┌──────────────┐        ┌──────────────┐       ┌──────────────────────┐
//! │ descriptors  │        │ metrics-{id}/│       │ container-...1       │
//! │ time series  │───────▶│   {metric}-1 │──────▶│ compute-...1         │
//! └──────────────┘        │   {metric}-2 │       │ compute-...2         │
//!                         └──────────────┘       │ index                │
//!                                │   Archiver    │ runningInstances     │
//!                                ▼               └──────────────────────┘
//!                         ┌──────────────┐                  │
//!                         │ IndexBuilder │─────────────────▶│
//!                         └──────────────┘                  ▼
//!                                                 ┌──────────────────────┐
//!                                                 │ Importer → target/   │
//!                                                 └──────────────────────┘
//! ```

pub mod archiver;
pub mod blob_store;
pub mod codec;
pub mod config;
pub mod exporter;
pub mod gcp;
pub mod importer;
pub mod index;
pub mod paging;
pub mod record;
pub mod s3_store;
pub mod source;
pub mod stager;

pub use archiver::{ArchiveError, ArchivedObject, Archiver};
pub use blob_store::{BlobStore, BucketStatus, MemoryBlobStore, ObjectChunks, StoreError};
pub use codec::{ArchiveCodec, CodecError, TarGzCodec};
pub use config::Config;
pub use exporter::{bucket_name, ExportError, ExportSummary, Exporter, InventoryOutcome};
pub use gcp::{AccessToken, GoogleCloudClient};
pub use importer::{ImportError, ImportSummary, Importer};
pub use index::{Index, IndexBuilder, IndexError};
pub use record::{MetricKind, MetricRecord};
pub use s3_store::S3BlobStore;
pub use source::{InventorySource, MetricsSource, Project, SourceError};
pub use stager::{BatchStager, StageError, StageSummary};
