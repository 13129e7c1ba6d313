//! Remote metric and inventory sources.
//!
//! Both sources are page-oriented at the trait boundary; the free functions in
//! this module wrap them into lazy streams with [`paginate`].

use crate::paging::{paginate, Page};
use crate::record::{MetricDescriptor, MetricRecord, TimeInterval};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a metrics or inventory source
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{api} returned {status}: {body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid credentials: {0}")]
    Credentials(String),
}

/// A project visible to the inventory source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Project id used in API paths
    #[serde(default)]
    pub project_id: String,
}

/// Source of metric descriptors and time series
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch one page of the project's metric descriptors
    async fn list_metric_descriptors_page(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> Result<Page<MetricDescriptor>, SourceError>;

    /// Fetch one page of time series for a single metric type
    async fn list_time_series_page(
        &self,
        project: &str,
        metric_type: &str,
        interval: &TimeInterval,
        page_token: Option<String>,
    ) -> Result<Page<MetricRecord>, SourceError>;
}

/// Source of the informational resource inventory
#[async_trait]
pub trait InventorySource: Send + Sync {
    /// Fetch one page of accessible projects
    async fn list_projects_page(
        &self,
        page_token: Option<String>,
    ) -> Result<Page<Project>, SourceError>;

    /// Fetch one page of running compute instances, as opaque JSON descriptors
    async fn list_running_instances_page(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> Result<Page<serde_json::Value>, SourceError>;
}

/// Lazy sequence of every metric descriptor of a project
pub fn metric_descriptors<'a>(
    source: &'a dyn MetricsSource,
    project: &'a str,
) -> BoxStream<'a, Result<MetricDescriptor, SourceError>> {
    paginate(move |token| source.list_metric_descriptors_page(project, token))
}

/// Lazy sequence of the time series of one metric type within `interval`
pub fn time_series<'a>(
    source: &'a dyn MetricsSource,
    project: &'a str,
    metric_type: &'a str,
    interval: &'a TimeInterval,
) -> BoxStream<'a, Result<MetricRecord, SourceError>> {
    paginate(move |token| source.list_time_series_page(project, metric_type, interval, token))
}

/// Lazy sequence of accessible projects
pub fn projects(source: &dyn InventorySource) -> BoxStream<'_, Result<Project, SourceError>> {
    paginate(move |token| source.list_projects_page(token))
}

/// Lazy sequence of the running instances of a project
pub fn running_instances<'a>(
    source: &'a dyn InventorySource,
    project: &'a str,
) -> BoxStream<'a, Result<serde_json::Value, SourceError>> {
    paginate(move |token| source.list_running_instances_page(project, token))
}
